//! Deterministic, collision-free key construction.
//!
//! Every key has the shape `<scope>:<category>[:<discriminator>]`. The
//! category is one of the reserved names below or a caller-chosen token.
//!
//! Caller-supplied text is escaped before it is placed in a key:
//!
//! | input          | encoded  |
//! |----------------|----------|
//! | `%`            | `%25`    |
//! | `:`            | `%3A`    |
//! | `\|`           | `%7C`    |
//! | empty string   | `%0`     |
//!
//! and a custom category equal to a reserved name is written as `%<name>`.
//! Escaped text therefore never contains a separator, which makes every
//! `key_for_*` function injective over arbitrary string inputs.

use uuid::Uuid;

use crate::error::ConfigError;
use crate::identity::{uuid_key_segment, ScopeName};
use crate::page::PageQuery;

pub const ALL_CATEGORY: &str = "ALL";
pub const ONE_CATEGORY: &str = "ONE";
pub const PAGE_CATEGORY: &str = "PAGE";
pub const NOT_FOUND_CATEGORY: &str = "NOT_FOUND";
pub const SYSTEM_CATEGORY: &str = "SYS";

const RESERVED_CATEGORIES: [&str; 5] = [
    ALL_CATEGORY,
    ONE_CATEGORY,
    PAGE_CATEGORY,
    NOT_FOUND_CATEGORY,
    SYSTEM_CATEGORY,
];

const KEY_SEPARATOR: char = ':';
const VALUE_SEPARATOR: char = '|';

/// Key namer for one cache scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Keyspace {
    scope: ScopeName,
}

impl Keyspace {
    pub fn new(scope: impl Into<String>) -> Result<Self, ConfigError> {
        Ok(Self {
            scope: ScopeName::new(scope)?,
        })
    }

    pub fn from_scope(scope: ScopeName) -> Self {
        Self { scope }
    }

    pub fn scope(&self) -> &ScopeName {
        &self.scope
    }

    /// Key holding the complete collection.
    pub fn key_for_all(&self) -> String {
        format!("{}:{}", self.scope, ALL_CATEGORY)
    }

    /// Key for a single entity.
    pub fn key_for_one(&self, id: Uuid) -> String {
        format!("{}:{}:{}", self.scope, ONE_CATEGORY, uuid_key_segment(id))
    }

    /// Key for one page of a paginated listing.
    pub fn key_for_page(&self, page: &PageQuery) -> String {
        format!(
            "{}:{}:{}{sep}{}{sep}{}{sep}{}",
            self.scope,
            PAGE_CATEGORY,
            page.page_size,
            page.page,
            escape_segment(&page.direction),
            escape_segment(&page.sort),
            sep = VALUE_SEPARATOR,
        )
    }

    /// Key for one page of a listing further narrowed by a custom token.
    pub fn key_for_custom_page(&self, page: &PageQuery, custom: &str) -> String {
        format!(
            "{}{}{}",
            self.key_for_page(page),
            KEY_SEPARATOR,
            escape_segment(custom)
        )
    }

    /// Key under a caller-chosen category.
    pub fn key_for_custom(&self, custom: &str) -> String {
        format!("{}:{}", self.scope, escape_category(custom))
    }

    /// Key under a caller-chosen category, discriminated by a list of values.
    pub fn key_for_valued_custom<S: AsRef<str>>(&self, name: &str, values: &[S]) -> String {
        let joined = values
            .iter()
            .map(|v| escape_segment(v.as_ref()))
            .collect::<Vec<_>>()
            .join(&VALUE_SEPARATOR.to_string());
        format!("{}:{}:{}", self.scope, escape_category(name), joined)
    }

    /// Key recording that a lookup found nothing upstream.
    pub fn key_for_not_found(&self) -> String {
        format!("{}:{}", self.scope, NOT_FOUND_CATEGORY)
    }

    /// Key for internal coordination state (validity flag, rebuild lease).
    pub fn key_for_system(&self, name: &str) -> String {
        format!("{}:{}:{}", self.scope, SYSTEM_CATEGORY, escape_segment(name))
    }

    /// SCAN pattern matching every key of this scope.
    pub fn scan_pattern(&self) -> String {
        format!("{}:*", self.scope)
    }

    /// Prefix shared by every system key of this scope.
    pub fn system_prefix(&self) -> String {
        format!("{}:{}:", self.scope, SYSTEM_CATEGORY)
    }

    pub fn is_system_key(&self, key: &str) -> bool {
        key.starts_with(&self.system_prefix())
    }

    /// Whether the key lives inside this scope.
    pub fn owns(&self, key: &str) -> bool {
        key.strip_prefix(self.scope.as_str())
            .is_some_and(|rest| rest.starts_with(KEY_SEPARATOR))
    }
}

/// Escape caller text so it contains no key or value separator.
pub fn escape_segment(raw: &str) -> String {
    if raw.is_empty() {
        return "%0".to_string();
    }
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '%' => out.push_str("%25"),
            ':' => out.push_str("%3A"),
            '|' => out.push_str("%7C"),
            other => out.push(other),
        }
    }
    out
}

fn escape_category(raw: &str) -> String {
    if RESERVED_CATEGORIES.contains(&raw) {
        format!("%{}", raw)
    } else {
        escape_segment(raw)
    }
}
