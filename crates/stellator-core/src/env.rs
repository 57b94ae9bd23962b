//! `STELLATOR_*` environment lookups
//!
//! Every knob read from the environment goes through these helpers, so a
//! malformed value always degrades to the compiled-in default instead of
//! failing startup. Values are trimmed before parsing.

use std::str::FromStr;

/// `key` parsed as `T`, or `default` when unset or unparseable.
#[inline]
pub fn env_get<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    env_get_opt(key).unwrap_or(default)
}

/// `key` as a switch: `1|true|yes|on` and `0|false|no|off`, any case.
/// Anything else, or an unset variable, gives `default`.
pub fn env_get_bool(key: &str, default: bool) -> bool {
    match env_get_opt::<String>(key).map(|v| v.to_ascii_lowercase()) {
        Some(v) if matches!(v.as_str(), "1" | "true" | "yes" | "on") => true,
        Some(v) if matches!(v.as_str(), "0" | "false" | "no" | "off") => false,
        _ => default,
    }
}

/// `key` parsed as `T`; `None` when unset or unparseable.
#[inline]
pub fn env_get_opt<T>(key: &str) -> Option<T>
where
    T: FromStr,
{
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// `key` verbatim, or `default` when unset.
pub fn env_get_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_get_default() {
        let val: usize = env_get("__STELLATOR_UNSET_VAR__", 42);
        assert_eq!(val, 42);
    }

    #[test]
    fn test_env_get_opt_none() {
        let val: Option<u16> = env_get_opt("__STELLATOR_UNSET_VAR__");
        assert!(val.is_none());
    }

    #[test]
    fn test_env_get_str_default() {
        assert_eq!(env_get_str("__STELLATOR_UNSET_VAR__", "127.0.0.1"), "127.0.0.1");
    }

    #[test]
    fn test_env_get_with_set_var() {
        std::env::set_var("__STELLATOR_TEST_PORT__", " 9090 ");
        let val: u16 = env_get("__STELLATOR_TEST_PORT__", 0);
        assert_eq!(val, 9090);
        std::env::remove_var("__STELLATOR_TEST_PORT__");
    }

    #[test]
    fn test_env_get_invalid_parse() {
        std::env::set_var("__STELLATOR_TEST_INVALID__", "many");
        let val: usize = env_get("__STELLATOR_TEST_INVALID__", 99);
        assert_eq!(val, 99);
        std::env::remove_var("__STELLATOR_TEST_INVALID__");
    }

    #[test]
    fn test_env_get_bool_variants() {
        for v in ["1", "true", "TRUE", " yes ", "on"] {
            std::env::set_var("__STELLATOR_TEST_BOOL__", v);
            assert!(env_get_bool("__STELLATOR_TEST_BOOL__", false), "{v}");
        }
        for v in ["0", "false", "No", "off"] {
            std::env::set_var("__STELLATOR_TEST_BOOL__", v);
            assert!(!env_get_bool("__STELLATOR_TEST_BOOL__", true), "{v}");
        }
        // unrecognised values keep the default either way
        std::env::set_var("__STELLATOR_TEST_BOOL__", "garbage");
        assert!(env_get_bool("__STELLATOR_TEST_BOOL__", true));
        assert!(!env_get_bool("__STELLATOR_TEST_BOOL__", false));
        std::env::remove_var("__STELLATOR_TEST_BOOL__");
        assert!(env_get_bool("__STELLATOR_TEST_BOOL__", true));
    }
}
