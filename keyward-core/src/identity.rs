//! Identity types for keyward scopes and lease holders

use std::fmt;
use uuid::Uuid;

use crate::error::ConfigError;

/// Characters a scope name may not contain.
///
/// `:` is the key grammar's separator and the rest are glob metacharacters
/// that would corrupt the purge pattern `<scope>:*`.
const FORBIDDEN_SCOPE_CHARS: [char; 6] = [':', '*', '?', '[', ']', '\\'];

/// Validated name of one logical cache instance.
///
/// Every key a cache touches starts with `<scope>:`, so two scopes can never
/// alias each other's keys and a purge of one scope never reaches another.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ScopeName(String);

impl ScopeName {
    pub fn new(name: impl Into<String>) -> Result<Self, ConfigError> {
        let name = name.into();
        if name.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "scope".to_string(),
                value: name,
                reason: "must not be empty".to_string(),
            });
        }
        if let Some(c) = name.chars().find(|c| FORBIDDEN_SCOPE_CHARS.contains(c)) {
            return Err(ConfigError::InvalidValue {
                field: "scope".to_string(),
                value: name,
                reason: format!("must not contain '{}'", c),
            });
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ScopeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ScopeName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Render a UUID as a key segment, with `_` in place of `-`.
pub fn uuid_key_segment(id: Uuid) -> String {
    id.to_string().replace('-', "_")
}

/// Generate a unique token identifying one lease holder.
pub fn new_holder_token() -> String {
    Uuid::now_v7().to_string()
}
