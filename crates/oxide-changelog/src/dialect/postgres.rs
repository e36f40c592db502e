//! PostgreSQL dialect.

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

/// PostgreSQL migration dialect.
#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresDialect;

impl PostgresDialect {
    /// Creates a new PostgreSQL dialect.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl MigrationDialect for PostgresDialect {
    fn name(&self) -> &'static str {
        "postgresql"
    }

    fn create_tables_sql(&self) -> [&'static str; 2] {
        [CREATE_CHANGELOG_TABLE_SQL, CREATE_LOCK_TABLE_SQL]
    }

    fn insert_lock_row_sql(&self) -> &'static str {
        INSERT_LOCK_ROW_SQL
    }

    fn placeholder(&self, n: usize) -> String {
        format!("${n}")
    }

    fn bigint(&self, expr: &str) -> String {
        format!("CAST({expr} AS BIGINT)")
    }

    fn timestamp_text(&self, expr: &str) -> String {
        format!("TO_CHAR({expr}, 'YYYY-MM-DD HH24:MI:SS')")
    }

    fn quiet_notices_sql(&self) -> Option<&'static str> {
        Some("SET LOCAL client_min_messages = warning")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::{AnyConnection, Connection};

    fn dialect() -> PostgresDialect {
        PostgresDialect::new()
    }

    #[test]
    fn test_insert_lock_row_on_conflict() {
        let sql = dialect().insert_lock_row_sql();
        assert!(sql.contains("ON CONFLICT DO NOTHING"));
        assert!(!sql.contains("IGNORE"));
    }

    #[test]
    fn test_lock_flag_is_boolean() {
        let [_, lock] = dialect().create_tables_sql();
        assert!(lock.contains("LOCKED BOOLEAN NOT NULL"));
        assert!(dialect().lock_flag_expr().contains("AS BIGINT"));
    }

    // The flag expression is plain SQL, so its decoding through `AnyRow` is
    // checked against an in-memory SQLite table of the same shape.
    #[tokio::test]
    async fn test_lock_flag_decodes_through_any_row() {
        sqlx::any::install_default_drivers();
        let mut conn = AnyConnection::connect("sqlite::memory:").await.unwrap();
        sqlx::raw_sql(
            "CREATE TABLE DATABASECHANGELOGLOCK (ID INTEGER, LOCKED BOOLEAN NOT NULL); \
             INSERT INTO DATABASECHANGELOGLOCK VALUES (1, FALSE), (2, TRUE);",
        )
        .execute(&mut conn)
        .await
        .unwrap();

        let sql = format!(
            "SELECT {} FROM DATABASECHANGELOGLOCK ORDER BY ID",
            dialect().lock_flag_expr()
        );
        let rows = sqlx::query(&sql).fetch_all(&mut conn).await.unwrap();
        let flags: Vec<bool> = rows
            .iter()
            .map(|row| dialect().decode_lock_flag(row, 0).unwrap())
            .collect();
        assert_eq!(flags, vec![false, true]);
    }

    #[test]
    fn test_numbered_placeholders() {
        assert_eq!(dialect().placeholder(1), "$1");
        assert_eq!(dialect().placeholder(8), "$8");
    }

    #[test]
    fn test_notices_are_silenced() {
        assert!(dialect().quiet_notices_sql().is_some());
    }
}
