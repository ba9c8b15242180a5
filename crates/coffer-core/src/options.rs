use secrecy::SecretString;
use serde::Deserialize;

use crate::{FsError, FsResult};

pub const DEFAULT_CACHE_CAPACITY: u32 = 256;

/// Mount-time options. Unknown keys fail volume open, whether they arrive
/// through serde or through the `-o`-style option string.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MountOptions {
    /// Master-key material. Required for open/create; kept out of logs
    /// and `Debug` output.
    pub passphrase: Option<SecretString>,
    /// Block cache size in pages.
    pub cache_capacity: u32,
    /// Reject every mutating operation with EROFS.
    pub read_only: bool,
    /// Passed through to the kernel bridge; the core does not act on it.
    pub allow_other: bool,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            passphrase: None,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            read_only: false,
            allow_other: false,
        }
    }
}

impl MountOptions {
    /// Parse a comma-separated `key=value` option string as handed over by
    /// a mount wrapper, e.g. `"cache_capacity=512,read_only"`.
    pub fn parse(opts: &str) -> FsResult<Self> {
        let mut parsed = Self::default();
        for item in opts.split(',') {
            let item = item.trim();
            if item.is_empty() {
                continue;
            }
            let (key, value) = match item.split_once('=') {
                Some((k, v)) => (k, Some(v)),
                None => (item, None),
            };
            match key {
                "passphrase" => {
                    let v = value.ok_or(FsError::InvalidArgument)?;
                    parsed.passphrase = Some(SecretString::from(v.to_owned()));
                }
                "cache_capacity" => {
                    let v = value.ok_or(FsError::InvalidArgument)?;
                    parsed.cache_capacity =
                        v.parse().map_err(|_| FsError::InvalidArgument)?;
                }
                "read_only" => parsed.read_only = parse_flag(value)?,
                "allow_other" => parsed.allow_other = parse_flag(value)?,
                other => return Err(FsError::UnknownOption(other.to_owned())),
            }
        }
        Ok(parsed)
    }
}

fn parse_flag(value: Option<&str>) -> FsResult<bool> {
    match value {
        None | Some("true") | Some("1") => Ok(true),
        Some("false") | Some("0") => Ok(false),
        Some(_) => Err(FsError::InvalidArgument),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    #[test]
    fn parse_defaults() {
        let opts = MountOptions::parse("").unwrap();
        assert!(opts.passphrase.is_none());
        assert_eq!(opts.cache_capacity, DEFAULT_CACHE_CAPACITY);
        assert!(!opts.read_only);
        assert!(!opts.allow_other);
    }

    #[test]
    fn parse_full_option_string() {
        let opts =
            MountOptions::parse("passphrase=hunter2,cache_capacity=512,read_only,allow_other")
                .unwrap();
        assert_eq!(opts.passphrase.unwrap().expose_secret(), "hunter2");
        assert_eq!(opts.cache_capacity, 512);
        assert!(opts.read_only);
        assert!(opts.allow_other);
    }

    #[test]
    fn unknown_option_fails() {
        let err = MountOptions::parse("cache_capacity=128,journal=1").unwrap_err();
        assert!(matches!(err, FsError::UnknownOption(ref k) if k == "journal"));
    }

    #[test]
    fn bad_value_fails() {
        assert!(MountOptions::parse("cache_capacity=lots").is_err());
        assert!(MountOptions::parse("read_only=maybe").is_err());
    }

    #[test]
    fn deserialize_rejects_unknown_fields() {
        let ok: MountOptions = toml::from_str("cache_capacity = 64").unwrap();
        assert_eq!(ok.cache_capacity, 64);

        let err = toml::from_str::<MountOptions>("wal = true");
        assert!(err.is_err());
    }
}
