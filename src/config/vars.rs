//! Environment variable interpolation for config files.
//!
//! Supports the following syntax:
//! - `$VAR` or `${VAR}` - substitute with env var value, error if missing
//! - `${VAR:-default}` - use default if VAR is unset OR empty
//! - `${VAR-default}` - use default only if VAR is unset (empty is OK)
//! - `$$` - escape sequence for literal `$`

use regex::Regex;
use std::env;
use std::sync::LazyLock;

/// Regex pattern for environment variable interpolation.
/// Matches:
/// - `$$` (escape sequence)
/// - `${VAR:-default}` or `${VAR-default}` (with optional default)
/// - `${VAR}` (braced variable)
/// - `$VAR` (unbraced variable)
static ENV_VAR_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?x)
        \$\$                           # Escape sequence $$
        |
        \$\{                           # Opening ${
            ([A-Za-z_][A-Za-z0-9_]*)   # Variable name (capture group 1)
            (?:                        # Optional default value group
                (:?-)                  # :- or just - (capture group 2)
                ([^}]*)                # Default value (capture group 3)
            )?
        \}                             # Closing }
        |
        \$([A-Za-z_][A-Za-z0-9_]*)     # Unbraced $VAR (capture group 4)
        ",
    )
    .expect("Invalid regex pattern")
});

/// Interpolated text plus every problem found along the way.
#[derive(Debug)]
pub struct Interpolated {
    pub text: String,
    /// One message per unresolvable reference, so all of them can be reported at once.
    pub errors: Vec<String>,
}

impl Interpolated {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Interpolate environment variables in the given text.
pub fn interpolate(input: &str) -> Interpolated {
    let mut errors = Vec::new();

    let text = ENV_VAR_PATTERN
        .replace_all(input, |caps: &regex::Captures| {
            let full_match = &caps[0];
            if full_match == "$$" {
                return "$".to_string();
            }

            let name = caps
                .get(1)
                .or_else(|| caps.get(4))
                .map(|m| m.as_str())
                .unwrap_or_default();
            let colon_default = caps.get(2).is_some_and(|m| m.as_str() == ":-");
            let default = caps.get(3).map(|m| m.as_str());

            match resolve(name, colon_default, default) {
                Ok(value) => value,
                Err(message) => {
                    errors.push(message);
                    full_match.to_string()
                }
            }
        })
        .into_owned();

    Interpolated { text, errors }
}

/// Resolve a single reference against the process environment.
fn resolve(name: &str, colon_default: bool, default: Option<&str>) -> Result<String, String> {
    match env::var(name) {
        Ok(value) if value.contains('\n') || value.contains('\r') => Err(format!(
            "environment variable '{name}' contains newlines, which is not allowed"
        )),
        Ok(value) if value.is_empty() && colon_default => Ok(default.unwrap_or_default().to_string()),
        Ok(value) => Ok(value),
        Err(_) => default
            .map(str::to_string)
            .ok_or_else(|| format!("environment variable '{name}' is not set")),
    }
}
