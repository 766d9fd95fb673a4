//! Environment variable expansion in configuration text
//!
//! `${NAME}` is replaced by the variable's value and `${NAME:-fallback}`
//! by the value or, when unset or empty, the fallback. Expansion happens
//! on the raw file before YAML parsing, so credentials and endpoints can
//! come from the environment.

use std::env;

use once_cell::sync::Lazy;
use regex::{Captures, Regex};

use crate::config::ConfigError;

static REFERENCE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}").expect("static pattern")
});

/// Expand every variable reference in `input`.
///
/// All unset variables without a fallback are reported together.
pub fn expand(input: &str) -> Result<String, ConfigError> {
    expand_with(input, |name| env::var(name).ok())
}

/// Expansion against an arbitrary lookup
pub fn expand_with<F>(input: &str, lookup: F) -> Result<String, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut missing: Vec<String> = Vec::new();

    let expanded = REFERENCE.replace_all(input, |caps: &Captures<'_>| {
        let name = &caps[1];
        let value = lookup(name).filter(|v| !v.is_empty() || caps.get(2).is_none());
        match (value, caps.get(2)) {
            (Some(value), _) => value,
            (None, Some(fallback)) => fallback.as_str().to_string(),
            (None, None) => {
                if !missing.iter().any(|m| m == name) {
                    missing.push(name.to_string());
                }
                String::new()
            }
        }
    });

    if !missing.is_empty() {
        return Err(ConfigError::ValidationError(format!(
            "Missing environment variables: {}",
            missing.join(", ")
        )));
    }
    Ok(expanded.into_owned())
}
