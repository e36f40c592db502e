//! Error types for the migration runner.

use std::path::PathBuf;

/// Errors that can occur while running a changelog.
#[derive(Debug, thiserror::Error)]
pub enum MigrateError {
    /// The connection configuration cannot be used.
    #[error("Configuration error: {0}")]
    Config(String),

    /// No changelog descriptor was found in the changelog directory.
    #[error("Changelog not found in {0} (looked for changelog.xml, changelog.yaml, changelog.yml)")]
    NotFound(PathBuf),

    /// The changelog descriptor exists but cannot be parsed.
    #[error("Failed to parse changelog '{path}': {message}")]
    Changelog {
        /// Path to the changelog descriptor.
        path: PathBuf,
        /// Error message.
        message: String,
    },

    /// A migration script has no `-- changeset author:id` header.
    #[error("Migration '{0}' has no '-- changeset <author>:<id>' header")]
    MalformedMigration(String),

    /// A migration referenced by the changelog does not exist on disk.
    #[error("Migration script not found: {0}")]
    MissingScript(PathBuf),

    /// An already applied migration was modified afterwards.
    #[error(
        "Migration {author}:{id} ({file}) has been modified after being applied \
         (stored checksum: {stored}, current checksum: {current})"
    )]
    Drift {
        /// Migration identifier.
        id: String,
        /// Migration author.
        author: String,
        /// Script file name as listed in the changelog.
        file: String,
        /// Checksum recorded in `DATABASECHANGELOG`.
        stored: String,
        /// Checksum of the script on disk.
        current: String,
    },

    /// A statement of a migration failed; the migration was rolled back.
    #[error("Migration '{file}' failed: {source}")]
    Sql {
        /// Script file name as listed in the changelog.
        file: String,
        /// The driver error.
        #[source]
        source: sqlx::Error,
    },

    /// The changelog lock could not be acquired in time.
    ///
    /// Never returned from a run: the runner logs it and proceeds unlocked.
    #[error("Waited {0:?} for the changelog lock but it was not released")]
    LockTimeout(std::time::Duration),

    /// Database error outside of a migration script.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// IO error (reading the changelog or scripts).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for migration operations.
pub type Result<T> = std::result::Result<T, MigrateError>;
