//! Changelog-driven SQL migrations for Rust.
//!
//! `oxide-changelog` applies plain SQL scripts listed in a changelog, in
//! order, and records each one in the database so it never runs twice:
//! - The changelog is `changelog.xml`, `changelog.yaml` or `changelog.yml`
//!   in the changelog directory
//! - Every script starts with a `-- changeset author:id` header
//! - Each script runs in its own transaction together with its history row
//! - A script modified after being applied aborts the run
//! - Concurrent runners serialize on a lock row in the database
//!
//! # Architecture
//!
//! - **Changelog** - Lazily reads the ordered list of scripts
//! - **Metadata** - Parses the changeset header and splits statements
//! - **Database** - The connection and scoped transactions
//! - **Lock** - The `DATABASECHANGELOGLOCK` protocol
//! - **History** - The `DATABASECHANGELOG` table
//! - **Executor** - Applies a changelog
//! - **Dialect** - MySQL, PostgreSQL and SQLite specific SQL
//!
//! # Example
//!
//! ```rust,ignore
//! use oxide_changelog::prelude::*;
//!
//! let config = ConnectionConfig {
//!     dialect: DialectKind::Postgres,
//!     ..ConnectionConfig::default()
//! };
//! let report = oxide_changelog::migrate(&config, "db/changelog", Some("prod")).await?;
//! println!("{} migrations applied", report.applied.len());
//! ```
//!
//! A changelog:
//!
//! ```yaml
//! - file: 001_init.sql
//! - file: 002_seed.sql
//!   context: test
//! ```
//!
//! # CLI Usage
//!
//! ```bash
//! # Apply the changelog of db/changelog
//! oxide-changelog --dialect postgres migrate --changelog db/changelog --context prod
//!
//! # List applied migrations
//! oxide-changelog status
//!
//! # Clear the lock left by a crashed runner
//! oxide-changelog release-lock
//! ```

use std::path::Path;

pub mod changelog;
pub mod checksum;
pub mod config;
pub mod database;
pub mod dialect;
pub mod error;
pub mod executor;
pub mod history;
pub mod lock;
pub mod metadata;

pub use error::{MigrateError, Result};

use config::{ConnectionConfig, MigratorOptions};
use database::Database;
use executor::{MigrationExecutor, MigrationReport};

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::changelog::{Changelog, ChangelogFormat, MigrationRef};
    pub use crate::checksum::checksum;
    pub use crate::config::{ConnectionConfig, LockPolicy, MigratorOptions, MissingScriptPolicy};
    pub use crate::database::Database;
    pub use crate::dialect::{DialectKind, MigrationDialect};
    pub use crate::error::{MigrateError, Result};
    pub use crate::executor::{MigrationExecutor, MigrationReport, SkipReason};
    pub use crate::history::{MigrationHistory, MigrationRecord};
    pub use crate::lock::{ChangelogLock, LockStatus};
    pub use crate::metadata::MigrationMetadata;
}

/// Applies the changelog of `changelog_dir` with the default options.
///
/// Migrations tagged with a context only run when it matches `context`.
/// The connection is closed before returning.
pub async fn migrate(
    config: &ConnectionConfig,
    changelog_dir: impl AsRef<Path>,
    context: Option<&str>,
) -> Result<MigrationReport> {
    migrate_with(config, changelog_dir, context, MigratorOptions::default()).await
}

/// Like [`migrate`], with explicit lock and missing script policies.
pub async fn migrate_with(
    config: &ConnectionConfig,
    changelog_dir: impl AsRef<Path>,
    context: Option<&str>,
    options: MigratorOptions,
) -> Result<MigrationReport> {
    let mut executor = MigrationExecutor::new(Database::new(config.clone()), options);
    let result = executor.run(changelog_dir, context).await;
    let closed = executor.close().await;
    let report = result?;
    closed?;
    Ok(report)
}
