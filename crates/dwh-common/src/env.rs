//! Typed access to environment variables
//!
//! Unset variables fall back to a default; variables that are set but do not
//! parse are reported as [`ConfigError::Invalid`] instead of being ignored.

use std::fmt::Display;
use std::str::FromStr;

use crate::error::{ConfigError, ConfigResult};

/// Read a variable, treating an empty value as unset.
pub fn var(name: &str) -> Option<String> {
    match std::env::var(name) {
        Ok(value) if !value.trim().is_empty() => Some(value),
        _ => None,
    }
}

/// Read a string variable or fall back to `default`.
pub fn string_or(name: &str, default: &str) -> String {
    var(name).unwrap_or_else(|| default.to_string())
}

/// Parse an optional variable.
pub fn parse_opt<T>(name: &str) -> ConfigResult<Option<T>>
where
    T: FromStr,
    T::Err: Display,
{
    match var(name) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::invalid(name, &raw, e.to_string())),
        None => Ok(None),
    }
}

/// Parse a variable or fall back to `default`.
pub fn parse_or<T>(name: &str, default: T) -> ConfigResult<T>
where
    T: FromStr,
    T::Err: Display,
{
    Ok(parse_opt(name)?.unwrap_or(default))
}
