// ABOUTME: Environment variable parsing utilities
// ABOUTME: Typed, range-checked reads of RUNBOX_* overrides with logged fallbacks

use std::str::FromStr;
use std::time::Duration;

/// Parse an environment variable, returning `default` when it is unset or unparseable.
pub fn parse_env_or_default<T>(var_name: &str, default: T) -> T
where
    T: FromStr,
{
    std::env::var(var_name)
        .ok()
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}

/// Parse an environment variable and accept it only if `validator` passes.
///
/// A variable that is set but unparseable or rejected by the validator is
/// reported with `tracing::warn!` and replaced by `default`. An unset variable
/// falls back silently.
pub fn parse_env_or_default_with_validation<T, F>(var_name: &str, default: T, validator: F) -> T
where
    T: FromStr + Copy + std::fmt::Display,
    F: Fn(T) -> bool,
{
    let Ok(raw_value) = std::env::var(var_name) else {
        return default;
    };

    match raw_value.trim().parse::<T>() {
        Ok(parsed) if validator(parsed) => parsed,
        Ok(_) => {
            tracing::warn!(
                "Environment variable {} has out-of-range value '{}', using default: {}",
                var_name,
                raw_value,
                default
            );
            default
        }
        Err(_) => {
            tracing::warn!(
                "Environment variable {} has unparseable value '{}', using default: {}",
                var_name,
                raw_value,
                default
            );
            default
        }
    }
}

/// Parse an environment variable with fallback to a legacy name.
///
/// Tries `primary_var`, then `fallback_var`, then returns `default`.
pub fn parse_env_with_fallback<T>(primary_var: &str, fallback_var: &str, default: T) -> T
where
    T: FromStr,
{
    std::env::var(primary_var)
        .or_else(|_| std::env::var(fallback_var))
        .ok()
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}

/// Read a duration expressed in milliseconds, bounded to `min..=max`.
pub fn parse_millis_env(var_name: &str, default: Duration, min: Duration, max: Duration) -> Duration {
    let default_ms = default.as_millis() as u64;
    let min_ms = min.as_millis() as u64;
    let max_ms = max.as_millis() as u64;
    let ms = parse_env_or_default_with_validation(var_name, default_ms, |v| {
        (min_ms..=max_ms).contains(&v)
    });
    Duration::from_millis(ms)
}
