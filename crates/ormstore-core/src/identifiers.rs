//! SQL identifier quoting and validation.
//!
//! Prototype names, relation table names and column names all end up as SQL
//! identifiers, so they are validated when a type is attached.

use std::sync::LazyLock;

use regex::Regex;

static IDENTIFIER_PATTERN: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").ok());

/// Quote a SQL identifier using ANSI double-quoting.
///
/// Embedded double-quotes are escaped by doubling them (`"` → `""`).
#[inline]
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Whether `name` is a plain SQL identifier: a letter or underscore followed
/// by letters, digits or underscores.
pub fn is_valid_identifier(name: &str) -> bool {
    match IDENTIFIER_PATTERN.as_ref() {
        Some(pattern) => pattern.is_match(name),
        None => false,
    }
}
