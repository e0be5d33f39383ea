//! Environment variable parsing utilities
//!
//! Every ballot service reads its settings once at startup through these
//! helpers, so a malformed value falls back to the default instead of
//! panicking in the middle of a config struct literal.

use std::str::FromStr;

/// Parse an environment variable with a default fallback
///
/// # Example
/// ```ignore
/// let interval_ms: u64 = parse_env_with_default("FLUSH_INTERVAL_MS", 1000);
/// ```
pub fn parse_env_with_default<T: FromStr>(key: &str, default: T) -> T {
    parse_env_optional(key).unwrap_or(default)
}

/// Parse an environment variable, `None` if missing, empty or invalid
pub fn parse_env_optional<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .and_then(|v| v.trim().parse().ok())
}

/// Read a string variable that must be present and non-empty
pub fn require_env(key: &str) -> Result<String, String> {
    match std::env::var(key) {
        Ok(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(format!("{} environment variable not set", key)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[serial_test::serial]
    fn test_parse_with_default() {
        std::env::remove_var("DB_POOL_TEST_VALUE");
        assert_eq!(parse_env_with_default("DB_POOL_TEST_VALUE", 7u32), 7);

        std::env::set_var("DB_POOL_TEST_VALUE", " 42 ");
        assert_eq!(parse_env_with_default("DB_POOL_TEST_VALUE", 7u32), 42);

        std::env::set_var("DB_POOL_TEST_VALUE", "not-a-number");
        assert_eq!(parse_env_with_default("DB_POOL_TEST_VALUE", 7u32), 7);

        std::env::remove_var("DB_POOL_TEST_VALUE");
    }

    #[test]
    #[serial_test::serial]
    fn test_require_env_rejects_blank() {
        std::env::set_var("DB_POOL_TEST_REQUIRED", "   ");
        assert!(require_env("DB_POOL_TEST_REQUIRED").is_err());

        std::env::set_var("DB_POOL_TEST_REQUIRED", "postgres://localhost/ballots");
        assert_eq!(
            require_env("DB_POOL_TEST_REQUIRED").unwrap(),
            "postgres://localhost/ballots"
        );

        std::env::remove_var("DB_POOL_TEST_REQUIRED");
    }
}
