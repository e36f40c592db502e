//! Migration script metadata.
//!
//! A migration script starts with a header comment:
//!
//! ```sql
//! -- changeset jdoe:create-users endDelimiter:\$\$ context:prod
//! CREATE TABLE users (id INT);
//! ```
//!
//! `author:id` is required. `endDelimiter:` overrides the statement
//! delimiter (`;` by default) and `context:` tags the migration when the
//! changelog entry carries no context of its own.
//!
//! Comment stripping is purely textual: every line whose first non-blank
//! characters are `--` is removed before the body is split on the
//! delimiter, including such lines inside multi-line string literals.

use std::sync::LazyLock;

use regex::Regex;

use crate::error::{MigrateError, Result};

/// Statement delimiter used when the header declares none.
pub const DEFAULT_DELIMITER: &str = ";";

static CHANGESET_HEADER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^[ \t]*--[ \t]*changeset[ \t]+([^:\s]+):(\S+)([^\r\n]*)")
        .expect("changeset header regex is valid")
});

/// Metadata parsed from a migration script header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationMetadata {
    /// Changeset author.
    pub author: String,
    /// Changeset identifier.
    pub id: String,
    /// Statement delimiter.
    pub delimiter: String,
    /// Context declared in the header.
    pub context: Option<String>,
}

impl MigrationMetadata {
    /// Parses the header of a script.
    ///
    /// `file` is only used to name the script in the error.
    pub fn extract(file: &str, script: &str) -> Result<Self> {
        let caps = CHANGESET_HEADER
            .captures(script)
            .ok_or_else(|| MigrateError::MalformedMigration(file.to_string()))?;

        let mut metadata = Self {
            author: caps[1].to_string(),
            id: caps[2].to_string(),
            delimiter: DEFAULT_DELIMITER.to_string(),
            context: None,
        };

        for option in caps[3].split_whitespace() {
            if let Some(delimiter) = option.strip_prefix("endDelimiter:") {
                let delimiter = delimiter.replace('\\', "");
                if !delimiter.is_empty() {
                    metadata.delimiter = delimiter;
                }
            } else if let Some(context) = option.strip_prefix("context:") {
                if !context.is_empty() {
                    metadata.context = Some(context.to_string());
                }
            }
        }

        Ok(metadata)
    }

    /// Splits a script into the statements to execute.
    #[must_use]
    pub fn statements(&self, script: &str) -> Vec<String> {
        split_statements(&strip_comments(script), &self.delimiter)
    }
}

/// Removes `--` comment lines from a script.
#[must_use]
pub fn strip_comments(script: &str) -> String {
    script
        .lines()
        .filter(|line| !line.trim_start().starts_with("--"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Splits a comment-free body on `delimiter`, dropping empty statements.
#[must_use]
pub fn split_statements(body: &str, delimiter: &str) -> Vec<String> {
    body.split(delimiter)
        .map(str::trim)
        .filter(|statement| !statement.is_empty())
        .map(str::to_string)
        .collect()
}
