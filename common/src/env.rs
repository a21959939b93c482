//! Environment variable helpers shared by every service's `Config::from_env()`.
//!
//! Each getter falls back to a default when the variable is unset and fails
//! with a named error when the value is present but unparseable, so a typo in
//! `.env` surfaces at startup instead of silently using a default.

use anyhow::{Context, Result};
use std::env;
use std::str::FromStr;

/// Read a string variable, falling back to `default` when unset.
pub fn get_env_string(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Read an optional string variable (empty string counts as unset).
pub fn get_env_opt(key: &str) -> Option<String> {
    match env::var(key) {
        Ok(v) if !v.trim().is_empty() => Some(v),
        _ => None,
    }
}

fn get_env_parsed<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .with_context(|| format!("invalid value for {key}: {raw:?}")),
        Err(_) => Ok(default),
    }
}

pub fn get_env_u16(key: &str, default: u16) -> Result<u16> {
    get_env_parsed(key, default)
}

pub fn get_env_u32(key: &str, default: u32) -> Result<u32> {
    get_env_parsed(key, default)
}

pub fn get_env_u64(key: &str, default: u64) -> Result<u64> {
    get_env_parsed(key, default)
}

pub fn get_env_usize(key: &str, default: usize) -> Result<usize> {
    get_env_parsed(key, default)
}

pub fn get_env_f64(key: &str, default: f64) -> Result<f64> {
    get_env_parsed(key, default)
}

/// Booleans accept `1/0`, `true/false`, `yes/no` (case-insensitive).
pub fn get_env_bool(key: &str, default: bool) -> Result<bool> {
    match env::var(key) {
        Ok(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            other => anyhow::bail!("invalid boolean for {key}: {other:?}"),
        },
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_when_unset() {
        assert_eq!(get_env_u64("SIGMA_TEST_UNSET_U64", 42).unwrap(), 42);
        assert_eq!(get_env_f64("SIGMA_TEST_UNSET_F64", 0.25).unwrap(), 0.25);
        assert!(get_env_bool("SIGMA_TEST_UNSET_BOOL", true).unwrap());
        assert_eq!(get_env_string("SIGMA_TEST_UNSET_STR", "x"), "x");
    }

    #[test]
    fn invalid_values_error_out() {
        std::env::set_var("SIGMA_TEST_BAD_U64", "not-a-number");
        assert!(get_env_u64("SIGMA_TEST_BAD_U64", 1).is_err());
        std::env::set_var("SIGMA_TEST_BAD_BOOL", "maybe");
        assert!(get_env_bool("SIGMA_TEST_BAD_BOOL", false).is_err());
    }

    #[test]
    fn bool_spellings() {
        std::env::set_var("SIGMA_TEST_BOOL_YES", "YES");
        assert!(get_env_bool("SIGMA_TEST_BOOL_YES", false).unwrap());
        std::env::set_var("SIGMA_TEST_BOOL_OFF", "off");
        assert!(!get_env_bool("SIGMA_TEST_BOOL_OFF", true).unwrap());
    }
}
