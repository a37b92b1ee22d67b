// ABOUTME: Configuration helpers shared by the Runbox crates
// ABOUTME: Exposes environment variable names and validated env parsing

pub mod constants;
pub mod env;

pub use env::{
    parse_env_or_default, parse_env_or_default_with_validation, parse_env_with_fallback,
    parse_millis_env,
};
