//! Typed environment lookups.
//!
//! Configuration knobs (`KRING_BANDWIDTH`, `KRING_LOG_LEVEL`, ...) are read
//! through these helpers so a malformed value silently falls back to the
//! compiled-in default instead of aborting startup.
//!
//! ```ignore
//! use kring_core::env::{env_get, env_get_bool};
//!
//! let bandwidth: u32 = env_get("KRING_BANDWIDTH", 256);
//! let sq_array = env_get_bool("KRING_SQ_ARRAY", false);
//! ```

use std::str::FromStr;

/// Parse `key` as `T`, or return `default` when unset or unparsable.
#[inline]
pub fn env_get<T: FromStr>(key: &str, default: T) -> T {
    env_get_opt(key).unwrap_or(default)
}

/// Parse `key` as `T`; `None` when unset or unparsable.
#[inline]
pub fn env_get_opt<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// `1`, `true`, `yes`, `on` (any case) are true; any other set value is
/// false; unset returns `default`.
#[inline]
pub fn env_get_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(v) => matches!(
            v.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unset_returns_default() {
        let v: u32 = env_get("__KRING_TEST_UNSET__", 64);
        assert_eq!(v, 64);
        assert!(env_get_bool("__KRING_TEST_UNSET__", true));
        assert_eq!(env_get_opt::<u32>("__KRING_TEST_UNSET__"), None);
    }

    #[test]
    fn test_parse_set_value() {
        std::env::set_var("__KRING_TEST_NUM__", " 512 ");
        assert_eq!(env_get::<u32>("__KRING_TEST_NUM__", 0), 512);
        std::env::set_var("__KRING_TEST_NUM__", "lots");
        assert_eq!(env_get::<u32>("__KRING_TEST_NUM__", 7), 7);
        std::env::remove_var("__KRING_TEST_NUM__");
    }

    #[test]
    fn test_bool_variants() {
        for (raw, want) in [("1", true), ("ON", true), ("yes", true), ("0", false), ("nah", false)] {
            std::env::set_var("__KRING_TEST_BOOL__", raw);
            assert_eq!(env_get_bool("__KRING_TEST_BOOL__", !want), want, "value {:?}", raw);
        }
        std::env::remove_var("__KRING_TEST_BOOL__");
    }
}
