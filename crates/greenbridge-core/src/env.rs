//! Typed environment lookups
//!
//! Every `*Config::from_env()` in the workspace reads through these.
//!
//! # Usage
//!
//! ```ignore
//! use greenbridge_core::env::{env_get, env_get_bool, env_get_size};
//!
//! let port: u16 = env_get("GB_PORT", 9090);
//! let stack = env_get_size("GB_STACK_SIZE", 256 * 1024); // accepts "512k", "1m"
//! let debug = env_get_bool("GB_DEBUG", false);
//! ```

use std::str::FromStr;
use std::time::Duration;

/// Parse `key` as `T`, falling back to `default`
///
/// Unset variables and values that fail to parse both yield `default`.
#[inline]
pub fn env_get<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    env_get_opt(key).unwrap_or(default)
}

/// Parse `key` as `T`; `None` when unset or unparsable
#[inline]
pub fn env_get_opt<T>(key: &str) -> Option<T>
where
    T: FromStr,
{
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// Boolean flag
///
/// `1/true/yes/on` are true, `0/false/no/off` are false (case-insensitive).
/// Anything else, including unset, returns the default.
pub fn env_get_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => match val.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            _ => default,
        },
        Err(_) => default,
    }
}

/// Raw string value, or `default` when unset
#[inline]
pub fn env_get_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// True when `key` is present, even if empty
#[inline]
pub fn env_is_set(key: &str) -> bool {
    std::env::var_os(key).is_some()
}

/// Get a byte size, accepting an optional `k`/`m`/`g` suffix
pub fn env_get_size(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| parse_size(&v))
        .unwrap_or(default)
}

/// Get a duration expressed in milliseconds
pub fn env_get_millis(key: &str, default: Duration) -> Duration {
    env_get_opt::<u64>(key)
        .map(Duration::from_millis)
        .unwrap_or(default)
}

/// Parse "4096", "256k", "1M", "2g"
fn parse_size(raw: &str) -> Option<usize> {
    let raw = raw.trim();
    let (digits, shift) = match raw.chars().last()? {
        'k' | 'K' => (&raw[..raw.len() - 1], 10),
        'm' | 'M' => (&raw[..raw.len() - 1], 20),
        'g' | 'G' => (&raw[..raw.len() - 1], 30),
        _ => (raw, 0),
    };
    let base: usize = digits.trim().parse().ok()?;
    base.checked_mul(1usize << shift)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_get_default_when_unset() {
        let val: u16 = env_get("__GB_TEST_UNSET_7731__", 9090);
        assert_eq!(val, 9090);
        assert!(env_get_opt::<u16>("__GB_TEST_UNSET_7731__").is_none());
        assert!(!env_is_set("__GB_TEST_UNSET_7731__"));
        assert_eq!(env_get_str("__GB_TEST_UNSET_7731__", "foobar"), "foobar");
    }

    #[test]
    fn test_env_get_parses_trimmed_value() {
        std::env::set_var("__GB_TEST_PORT__", " 8080 ");
        assert_eq!(env_get::<u16>("__GB_TEST_PORT__", 1), 8080);
        std::env::set_var("__GB_TEST_PORT__", "not-a-port");
        assert_eq!(env_get::<u16>("__GB_TEST_PORT__", 1), 1);
        std::env::remove_var("__GB_TEST_PORT__");
    }

    #[test]
    fn test_env_get_bool_keeps_default_on_garbage() {
        std::env::set_var("__GB_TEST_FLAG__", "ON");
        assert!(env_get_bool("__GB_TEST_FLAG__", false));
        std::env::set_var("__GB_TEST_FLAG__", "off");
        assert!(!env_get_bool("__GB_TEST_FLAG__", true));
        std::env::set_var("__GB_TEST_FLAG__", "maybe");
        assert!(env_get_bool("__GB_TEST_FLAG__", true));
        assert!(!env_get_bool("__GB_TEST_FLAG__", false));
        std::env::remove_var("__GB_TEST_FLAG__");
    }

    #[test]
    fn test_parse_size_suffixes() {
        assert_eq!(parse_size("4096"), Some(4096));
        assert_eq!(parse_size("256k"), Some(256 * 1024));
        assert_eq!(parse_size("1M"), Some(1024 * 1024));
        assert_eq!(parse_size("2g"), Some(2 << 30));
        assert_eq!(parse_size("k"), None);
        assert_eq!(parse_size(""), None);
    }

    #[test]
    fn test_env_get_millis() {
        std::env::set_var("__GB_TEST_MS__", "250");
        assert_eq!(
            env_get_millis("__GB_TEST_MS__", Duration::from_secs(1)),
            Duration::from_millis(250)
        );
        std::env::remove_var("__GB_TEST_MS__");
        assert_eq!(
            env_get_millis("__GB_TEST_MS__", Duration::from_secs(1)),
            Duration::from_secs(1)
        );
    }
}
