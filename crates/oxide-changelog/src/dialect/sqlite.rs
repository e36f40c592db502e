//! SQLite dialect.
//!
//! Used for embedded deployments and by the test-suite. SQLite runs DDL
//! inside transactions, so a failing migration leaves no trace at all.

use super::MigrationDialect;

const CREATE_CHANGELOG_TABLE_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS DATABASECHANGELOG (
    ID VARCHAR(255) NOT NULL,
    AUTHOR VARCHAR(255) NOT NULL,
    FILENAME VARCHAR(255) NOT NULL,
    DATEEXECUTED TIMESTAMP NOT NULL,
    ORDEREXECUTED INTEGER NOT NULL,
    EXECTYPE VARCHAR(10) NOT NULL,
    MD5SUM VARCHAR(35),
    DESCRIPTION VARCHAR(255),
    COMMENTS VARCHAR(255),
    TAG VARCHAR(255),
    LIQUIBASE VARCHAR(20),
    CONTEXTS VARCHAR(255),
    LABELS VARCHAR(255),
    DEPLOYMENT_ID VARCHAR(10),
    UNIQUE (ID, AUTHOR)
)
"#;

const CREATE_LOCK_TABLE_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS DATABASECHANGELOGLOCK (
    ID INTEGER NOT NULL,
    LOCKED BOOLEAN NOT NULL,
    LOCKGRANTED TIMESTAMP,
    LOCKEDBY VARCHAR(255),
    PRIMARY KEY (ID)
)
"#;

const INSERT_LOCK_ROW_SQL: &str = r#"
INSERT INTO DATABASECHANGELOGLOCK (ID, LOCKED, LOCKGRANTED, LOCKEDBY)
VALUES (1, FALSE, NULL, NULL)
ON CONFLICT DO NOTHING
"#;

/// SQLite migration dialect.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteDialect;

impl SqliteDialect {
    /// Creates a new SQLite dialect.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl MigrationDialect for SqliteDialect {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn create_tables_sql(&self) -> [&'static str; 2] {
        [CREATE_CHANGELOG_TABLE_SQL, CREATE_LOCK_TABLE_SQL]
    }

    fn insert_lock_row_sql(&self) -> &'static str {
        INSERT_LOCK_ROW_SQL
    }

    // BOOLEAN columns are stored as integers but typed as booleans by the
    // driver, which the `Any` driver rejects.
    fn lock_flag_expr(&self) -> &'static str {
        "CAST(LOCKED AS INTEGER)"
    }

    fn bigint(&self, expr: &str) -> String {
        format!("CAST({expr} AS INTEGER)")
    }

    // Columns declared TIMESTAMP are typed as datetimes by the driver; the
    // cast keeps them plain text.
    fn timestamp_text(&self, expr: &str) -> String {
        format!("CAST({expr} AS TEXT)")
    }
}
