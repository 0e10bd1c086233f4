//! Kernel command line parsing.
//!
//! Boot parameters are read once at startup; lookups are pure. Value lookup
//! follows kernel semantics: when a key appears more than once, the last
//! occurrence wins. Key comparison treats dashes and underscores as
//! equivalent.

use std::borrow::Cow;

use anyhow::{Context, Result};
use camino::Utf8Path;

const PROC_CMDLINE: &str = "/proc/cmdline";

/// A parsed kernel command line.
///
/// Wraps the raw command line bytes. Uses copy-on-write semantics so that
/// borrowed test input avoids allocation.
#[derive(Debug)]
pub struct Cmdline<'a>(Cow<'a, [u8]>);

impl<'a, T: AsRef<[u8]> + ?Sized> From<&'a T> for Cmdline<'a> {
    fn from(input: &'a T) -> Self {
        Self(Cow::Borrowed(input.as_ref()))
    }
}

impl<'a> Cmdline<'a> {
    /// Read the kernel command line from `/proc/cmdline`.
    ///
    /// In the embedded pid-1 arrangement nothing has mounted `/proc` yet; in
    /// that case procfs is mounted, read, and unmounted again, leaving the
    /// filesystem in the state we found it.
    pub fn from_proc() -> Result<Self> {
        let path = Utf8Path::new(PROC_CMDLINE);
        if path.try_exists().unwrap_or(false) {
            let contents =
                std::fs::read(path).with_context(|| format!("Reading {PROC_CMDLINE}"))?;
            return Ok(Self(Cow::Owned(contents)));
        }
        let proc = Utf8Path::new("/proc");
        initroot_mount::mount_proc(proc)?;
        let contents = std::fs::read(path);
        initroot_mount::unmount(proc)?;
        Ok(Self(Cow::Owned(
            contents.with_context(|| format!("Reading {PROC_CMDLINE}"))?,
        )))
    }

    /// Returns an iterator over all parameters in the command line.
    ///
    /// Splits on unquoted whitespace; quoted values may contain whitespace.
    pub fn iter(&'a self) -> impl Iterator<Item = Parameter<'a>> {
        let mut in_quotes = false;

        self.0
            .split(move |c| {
                if *c == b'"' {
                    in_quotes = !in_quotes;
                }
                !in_quotes && c.is_ascii_whitespace()
            })
            .filter(|raw| !raw.is_empty())
            .map(Parameter::from)
    }

    /// Locate the value of the argument named `key`, if present.
    ///
    /// The kernel lets later arguments override earlier ones, so the last
    /// occurrence wins. A key-only switch yields `None` just like an absent
    /// key.
    pub fn value_of(&'a self, key: &str) -> Option<&'a [u8]> {
        let wanted = Parameter::from(key);
        self.iter()
            .filter(|p| p.key_matches(&wanted))
            .last()
            .and_then(|p| p.value)
    }

    /// Like [`Self::value_of`], but the value must be UTF-8.
    pub fn value_of_utf8(&'a self, key: &str) -> Result<Option<&'a str>> {
        self.value_of(key)
            .map(|v| {
                std::str::from_utf8(v)
                    .with_context(|| format!("Non-UTF8 value for kernel argument '{key}'"))
            })
            .transpose()
    }

    /// Like [`Self::value_of_utf8`], but absence of the argument is an
    /// error.
    pub fn require_value_of_utf8(&'a self, key: &str) -> Result<&'a str> {
        self.value_of_utf8(key)?
            .ok_or_else(|| anyhow::anyhow!("No {key}= kernel argument"))
    }
}

/// A single kernel command line parameter.
#[derive(Debug, Eq)]
pub struct Parameter<'a> {
    /// The parameter key as raw bytes.
    pub key: &'a [u8],
    /// The parameter value as raw bytes, for `key=value` form.
    pub value: Option<&'a [u8]>,
}

impl<'a> Parameter<'a> {
    /// Whether this parameter's key names the same argument as `other`'s,
    /// with dashes and underscores treated as equivalent.
    pub fn key_matches(&self, other: &Parameter<'_>) -> bool {
        let dedashed = |&c: &u8| if c == b'-' { b'_' } else { c };

        // We can't just zip() because leading substrings would match:
        // "foo" would compare equal to "foobar" since the zipped iterator
        // only visits the first three bytes.
        let ours = self.key.iter().map(dedashed);
        let theirs = other.key.iter().map(dedashed);
        ours.eq(theirs)
    }
}

impl<'a, T: AsRef<[u8]> + ?Sized> From<&'a T> for Parameter<'a> {
    /// Parses a parameter from raw bytes.
    ///
    /// Splits on the first `=`; without one the whole input is a key-only
    /// switch. *Only* the outermost pair of double quotes is stripped from
    /// the value.
    fn from(input: &'a T) -> Self {
        let input = input.as_ref();
        let equals = input.iter().position(|b| *b == b'=');

        match equals {
            None => Self {
                key: input,
                value: None,
            },
            Some(i) => {
                let (key, mut value) = input.split_at(i);

                // skip `=`, we know it's the first byte because we
                // found it above
                value = &value[1..];

                value = value
                    .strip_prefix(b"\"")
                    .unwrap_or(value)
                    .strip_suffix(b"\"")
                    .unwrap_or(value);

                Self {
                    key,
                    value: Some(value),
                }
            }
        }
    }
}

impl PartialEq for Parameter<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.key_matches(other) && self.value == other.value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parameter_simple() {
        let switch = Parameter::from("foo");
        assert_eq!(switch.key, b"foo");
        assert_eq!(switch.value, None);

        let kv = Parameter::from("bar=baz");
        assert_eq!(kv.key, b"bar");
        assert_eq!(kv.value, Some(b"baz".as_slice()));
    }

    #[test]
    fn test_parameter_quoted() {
        let p = Parameter::from("foo=\"quoted value\"");
        assert_eq!(p.value, Some(b"quoted value".as_slice()));

        // quotes only get stripped from the absolute ends of values
        let p = Parameter::from("foo=\"internal \" quotes \" are ok\"");
        assert_eq!(p.value, Some(b"internal \" quotes \" are ok".as_slice()));
    }

    #[test]
    fn test_parameter_equality() {
        // substrings are not equal
        assert_ne!(Parameter::from("foo"), Parameter::from("foobar"));
        assert_ne!(Parameter::from("foobar"), Parameter::from("foo"));

        // dashes and underscores are treated equally
        assert_eq!(
            Parameter::from("a-delimited-param"),
            Parameter::from("a_delimited_param")
        );

        // same key, different values is not equal
        assert_ne!(
            Parameter::from("a-param=one_value"),
            Parameter::from("a_param=another_value")
        );

        // mixed variants are never equal
        assert_ne!(
            Parameter::from("same_key"),
            Parameter::from("same_key=but_with_a_value")
        );
    }

    #[test]
    fn test_iter() {
        // example taken lovingly from:
        // https://git.kernel.org/pub/scm/linux/kernel/git/torvalds/linux.git/tree/kernel/params.c?id=89748acdf226fd1a8775ff6fa2703f8412b286c8#n160
        let kargs = Cmdline::from(b"foo=bar,bar2 baz=fuz wiz".as_slice());
        let mut iter = kargs.iter();

        assert_eq!(iter.next(), Some(Parameter::from("foo=bar,bar2")));
        assert_eq!(iter.next(), Some(Parameter::from("baz=fuz")));
        assert_eq!(iter.next(), Some(Parameter::from("wiz")));
        assert_eq!(iter.next(), None);
    }

    #[test]
    fn test_iter_skips_blank_runs() {
        // A trailing newline is what /proc/cmdline actually contains.
        let kargs = Cmdline::from(b"foo=bar  baz\n".as_slice());
        assert_eq!(kargs.iter().count(), 2);
    }

    #[test]
    fn test_value_of_last_wins() {
        let kargs = Cmdline::from(b"root=a root=b other=c".as_slice());
        assert_eq!(kargs.value_of("root"), Some(b"b".as_slice()));

        let kargs = Cmdline::from(b"a-b=1 a_b=2".as_slice());
        assert_eq!(kargs.value_of("a-b"), Some(b"2".as_slice()));
        assert_eq!(kargs.value_of("a_b"), Some(b"2".as_slice()));
    }

    #[test]
    fn test_value_of_absent() {
        let kargs = Cmdline::from(b"foo=bar switch".as_slice());
        assert_eq!(kargs.value_of("missing"), None);
        // a key-only switch has no value
        assert_eq!(kargs.value_of("switch"), None);
    }

    #[test]
    fn test_value_of_utf8() {
        let kargs = Cmdline::from(b"foo=bar".as_slice());
        assert_eq!(kargs.value_of_utf8("foo").unwrap(), Some("bar"));
        assert_eq!(kargs.value_of_utf8("missing").unwrap(), None);

        let mut invalid = b"key=".to_vec();
        invalid.push(0xff);
        let kargs = Cmdline::from(&invalid);
        assert!(kargs.value_of_utf8("key").is_err());
    }

    #[test]
    fn test_require_value_of_utf8() {
        let kargs = Cmdline::from(b"foo=bar".as_slice());
        assert_eq!(kargs.require_value_of_utf8("foo").unwrap(), "bar");
        let err = kargs.require_value_of_utf8("missing").unwrap_err();
        assert!(err.to_string().contains("No missing= kernel argument"));
    }
}
