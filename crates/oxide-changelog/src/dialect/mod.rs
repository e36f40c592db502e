//! Database dialect implementations.
//!
//! Each dialect knows the DDL of the two bookkeeping tables, how to create
//! the lock row at most once and how to read the lock flag back. The
//! dialect is chosen from configuration, never by probing drivers.

mod mysql;
mod postgres;
mod sqlite;

use std::fmt;
use std::str::FromStr;

use sqlx::any::AnyRow;

pub use mysql::{decode_bit_field, MySqlDialect};
pub use postgres::PostgresDialect;
pub use sqlite::SqliteDialect;

use crate::error::MigrateError;

/// Name of the table recording applied migrations.
pub const CHANGELOG_TABLE: &str = "DATABASECHANGELOG";

/// Name of the singleton lock table.
pub const LOCK_TABLE: &str = "DATABASECHANGELOGLOCK";

/// Trait for database-specific SQL.
pub trait MigrationDialect: fmt::Debug + Send + Sync {
    /// Returns the dialect name.
    fn name(&self) -> &'static str;

    /// Returns the `CREATE TABLE IF NOT EXISTS` statements of the
    /// changelog table and the lock table.
    fn create_tables_sql(&self) -> [&'static str; 2];

    /// Returns the statement inserting the unlocked lock row with `ID = 1`
    /// unless it already exists.
    fn insert_lock_row_sql(&self) -> &'static str;

    /// Expression selecting the lock flag, decoded by [`Self::decode_lock_flag`].
    ///
    /// The `Any` driver cannot decode every native boolean type, so the flag
    /// is selected as a 0/1 integer.
    fn lock_flag_expr(&self) -> &'static str {
        "CAST(CASE WHEN LOCKED THEN 1 ELSE 0 END AS BIGINT)"
    }

    /// Decodes the lock flag selected with [`Self::lock_flag_expr`].
    fn decode_lock_flag(&self, row: &AnyRow, index: usize) -> Result<bool, sqlx::Error> {
        use sqlx::Row;
        Ok(row.try_get::<i64, _>(index)? != 0)
    }

    /// Returns the bind placeholder for the `n`-th (1-based) parameter.
    fn placeholder(&self, _n: usize) -> String {
        "?".to_string()
    }

    /// Wraps an integer expression so that it decodes as `i64`.
    fn bigint(&self, expr: &str) -> String;

    /// Wraps a timestamp expression so that it decodes as
    /// `YYYY-MM-DD HH:MM:SS` text.
    fn timestamp_text(&self, expr: &str) -> String;

    /// Statement silencing "already exists" notices for the current
    /// transaction, if the dialect emits them.
    fn quiet_notices_sql(&self) -> Option<&'static str> {
        None
    }
}

/// The dialects this crate can drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DialectKind {
    /// MySQL / MariaDB.
    #[default]
    #[serde(alias = "mariadb")]
    Mysql,
    /// PostgreSQL.
    #[serde(alias = "postgresql")]
    Postgres,
    /// SQLite, the database is a file path.
    Sqlite,
}

impl DialectKind {
    /// Returns the dialect implementation.
    #[must_use]
    pub fn dialect(self) -> &'static dyn MigrationDialect {
        static MYSQL: MySqlDialect = MySqlDialect::new();
        static POSTGRES: PostgresDialect = PostgresDialect::new();
        static SQLITE: SqliteDialect = SqliteDialect::new();

        match self {
            Self::Mysql => &MYSQL,
            Self::Postgres => &POSTGRES,
            Self::Sqlite => &SQLITE,
        }
    }

    /// Returns the connection URL scheme.
    #[must_use]
    pub const fn scheme(self) -> &'static str {
        match self {
            Self::Mysql => "mysql",
            Self::Postgres => "postgres",
            Self::Sqlite => "sqlite",
        }
    }

    /// Returns the default server port, `None` for file databases.
    #[must_use]
    pub const fn default_port(self) -> Option<u16> {
        match self {
            Self::Mysql => Some(3306),
            Self::Postgres => Some(5432),
            Self::Sqlite => None,
        }
    }
}

impl FromStr for DialectKind {
    type Err = MigrateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "mysql" | "mariadb" => Ok(Self::Mysql),
            "postgres" | "postgresql" => Ok(Self::Postgres),
            "sqlite" => Ok(Self::Sqlite),
            other => Err(MigrateError::Config(format!(
                "unsupported dialect '{other}' (expected mysql, postgres or sqlite)"
            ))),
        }
    }
}

impl fmt::Display for DialectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.scheme())
    }
}
