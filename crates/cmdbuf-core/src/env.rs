//! Environment variable utilities
//!
//! Generic `env_get<T>` for parsing `CMDBUF_*` overrides with defaults.
//!
//! # Usage
//!
//! ```ignore
//! use cmdbuf_core::env::{env_get, env_get_bool};
//!
//! let entries: u32 = env_get("CMDBUF_RING_ENTRIES", 1024);
//! let flush: bool = env_get_bool("CMDBUF_FLUSH_EPRINT", false);
//! ```

use std::str::FromStr;

/// Get environment variable parsed as type T, or return default
///
/// Unset and unparsable values both fall back to `default`.
#[inline]
pub fn env_get<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

/// Get environment variable as boolean
///
/// Accepts: "1", "true", "yes", "on" (case-insensitive) as true.
/// Any other value is false; unset returns the default.
#[inline]
pub fn env_get_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => matches!(val.to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

/// Get environment variable as optional value
#[inline]
pub fn env_get_opt<T>(key: &str) -> Option<T>
where
    T: FromStr,
{
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// Get environment variable as string, or return default
#[inline]
pub fn env_get_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_get_default() {
        let val: u32 = env_get("__CMDBUF_TEST_UNSET__", 42);
        assert_eq!(val, 42);
    }

    #[test]
    fn test_env_get_with_set_var() {
        std::env::set_var("__CMDBUF_TEST_NUM__", " 123 ");
        let val: usize = env_get("__CMDBUF_TEST_NUM__", 0);
        assert_eq!(val, 123);
        std::env::remove_var("__CMDBUF_TEST_NUM__");
    }

    #[test]
    fn test_env_get_invalid_parse() {
        std::env::set_var("__CMDBUF_TEST_INVALID__", "lots");
        let val: u64 = env_get("__CMDBUF_TEST_INVALID__", 99);
        assert_eq!(val, 99);
        let opt: Option<u64> = env_get_opt("__CMDBUF_TEST_INVALID__");
        assert!(opt.is_none());
        std::env::remove_var("__CMDBUF_TEST_INVALID__");
    }

    #[test]
    fn test_env_get_bool_variants() {
        for v in ["1", "true", "TRUE", "yes", "on"] {
            std::env::set_var("__CMDBUF_TEST_BOOL__", v);
            assert!(env_get_bool("__CMDBUF_TEST_BOOL__", false), "{}", v);
        }
        for v in ["0", "false", "garbage"] {
            std::env::set_var("__CMDBUF_TEST_BOOL__", v);
            assert!(!env_get_bool("__CMDBUF_TEST_BOOL__", true), "{}", v);
        }
        std::env::remove_var("__CMDBUF_TEST_BOOL__");
        assert!(env_get_bool("__CMDBUF_TEST_BOOL__", true));
    }

    #[test]
    fn test_env_get_str_default() {
        assert_eq!(env_get_str("__CMDBUF_TEST_UNSET__", "ring"), "ring");
    }
}
