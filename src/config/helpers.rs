//! Env-var parsing helpers shared by the config resolvers.

use std::str::FromStr;

use crate::error::ConfigError;

/// Read an env var, treating unset and empty as `None`.
pub(crate) fn optional_env(key: &str) -> Result<Option<String>, ConfigError> {
    match std::env::var(key) {
        Ok(v) if v.trim().is_empty() => Ok(None),
        Ok(v) => Ok(Some(v)),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(std::env::VarError::NotUnicode(_)) => Err(ConfigError::Invalid {
            key: key.to_string(),
            reason: "value is not valid unicode".to_string(),
        }),
    }
}

/// Read a string env var with a default.
pub(crate) fn parse_string_env(key: &str, default: &str) -> Result<String, ConfigError> {
    Ok(optional_env(key)?.unwrap_or_else(|| default.to_string()))
}

/// Read a boolean env var ("true"/"false"/"1"/"0", case-insensitive).
pub(crate) fn parse_bool_env(key: &str, default: bool) -> Result<bool, ConfigError> {
    match optional_env(key)? {
        None => Ok(default),
        Some(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Ok(true),
            "false" | "0" | "no" => Ok(false),
            other => Err(ConfigError::Invalid {
                key: key.to_string(),
                reason: format!("expected a boolean, got {other:?}"),
            }),
        },
    }
}

/// Read and parse an env var of any `FromStr` type, with a default.
pub(crate) fn parse_optional_env<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match optional_env(key)? {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|e| ConfigError::Invalid {
            key: key.to_string(),
            reason: format!("{e}"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_optional_env_empty_is_none() {
        std::env::set_var("DRYDOCK_TEST_EMPTY", "");
        assert_eq!(optional_env("DRYDOCK_TEST_EMPTY").unwrap(), None);
        std::env::remove_var("DRYDOCK_TEST_EMPTY");
    }

    #[test]
    fn test_parse_bool_env_variants() {
        std::env::set_var("DRYDOCK_TEST_BOOL", "YES");
        assert!(parse_bool_env("DRYDOCK_TEST_BOOL", false).unwrap());
        std::env::set_var("DRYDOCK_TEST_BOOL", "0");
        assert!(!parse_bool_env("DRYDOCK_TEST_BOOL", true).unwrap());
        std::env::set_var("DRYDOCK_TEST_BOOL", "maybe");
        assert!(parse_bool_env("DRYDOCK_TEST_BOOL", true).is_err());
        std::env::remove_var("DRYDOCK_TEST_BOOL");
    }

    #[test]
    fn test_parse_optional_env_default_and_parse() {
        assert_eq!(
            parse_optional_env("DRYDOCK_TEST_UNSET_U64", 42u64).unwrap(),
            42
        );
        std::env::set_var("DRYDOCK_TEST_U64", "128");
        assert_eq!(parse_optional_env("DRYDOCK_TEST_U64", 42u64).unwrap(), 128);
        std::env::set_var("DRYDOCK_TEST_U64", "not-a-number");
        assert!(parse_optional_env("DRYDOCK_TEST_U64", 42u64).is_err());
        std::env::remove_var("DRYDOCK_TEST_U64");
    }
}
