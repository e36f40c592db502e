//! MySQL dialect.
//!
//! The lock flag is a `BIT(1)` column. Bit columns have no portable
//! decoding, so the flag is selected through `HEX()` and the low nibble of
//! the returned text decides whether the row is locked.

use sqlx::any::AnyRow;
use sqlx::Row;

use super::MigrationDialect;

const CREATE_CHANGELOG_TABLE_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS DATABASECHANGELOG (
    ID varchar(255) NOT NULL,
    AUTHOR varchar(255) NOT NULL,
    FILENAME varchar(255) NOT NULL,
    DATEEXECUTED datetime NOT NULL,
    ORDEREXECUTED int(11) NOT NULL,
    EXECTYPE varchar(10) NOT NULL,
    MD5SUM varchar(35) DEFAULT NULL,
    DESCRIPTION varchar(255) DEFAULT NULL,
    COMMENTS varchar(255) DEFAULT NULL,
    TAG varchar(255) DEFAULT NULL,
    LIQUIBASE varchar(20) DEFAULT NULL,
    CONTEXTS varchar(255) DEFAULT NULL,
    LABELS varchar(255) DEFAULT NULL,
    DEPLOYMENT_ID varchar(10) DEFAULT NULL,
    UNIQUE (ID, AUTHOR)
)
"#;

const CREATE_LOCK_TABLE_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS DATABASECHANGELOGLOCK (
    ID int(11) NOT NULL,
    LOCKED bit(1) NOT NULL,
    LOCKGRANTED datetime DEFAULT NULL,
    LOCKEDBY varchar(255) DEFAULT NULL,
    PRIMARY KEY (ID)
)
"#;

const INSERT_LOCK_ROW_SQL: &str = r#"
INSERT IGNORE INTO DATABASECHANGELOGLOCK (ID, LOCKED, LOCKGRANTED, LOCKEDBY)
VALUES (1, FALSE, NULL, NULL)
"#;

/// MySQL migration dialect.
#[derive(Debug, Clone, Copy, Default)]
pub struct MySqlDialect;

impl MySqlDialect {
    /// Creates a new MySQL dialect.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

/// Decodes the hex text of a `BIT(1)` value.
#[must_use]
pub fn decode_bit_field(hex: &str) -> bool {
    hex.trim().ends_with('1')
}

impl MigrationDialect for MySqlDialect {
    fn name(&self) -> &'static str {
        "mysql"
    }

    fn create_tables_sql(&self) -> [&'static str; 2] {
        [CREATE_CHANGELOG_TABLE_SQL, CREATE_LOCK_TABLE_SQL]
    }

    fn insert_lock_row_sql(&self) -> &'static str {
        INSERT_LOCK_ROW_SQL
    }

    fn lock_flag_expr(&self) -> &'static str {
        "HEX(LOCKED)"
    }

    fn decode_lock_flag(&self, row: &AnyRow, index: usize) -> Result<bool, sqlx::Error> {
        let hex: String = row.try_get(index)?;
        Ok(decode_bit_field(&hex))
    }

    fn bigint(&self, expr: &str) -> String {
        format!("CAST({expr} AS SIGNED)")
    }

    fn timestamp_text(&self, expr: &str) -> String {
        format!("DATE_FORMAT({expr}, '%Y-%m-%d %H:%i:%s')")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dialect() -> MySqlDialect {
        MySqlDialect::new()
    }

    #[test]
    fn test_decode_bit_field() {
        assert!(decode_bit_field("1"));
        assert!(decode_bit_field("01"));
        assert!(!decode_bit_field("0"));
        assert!(!decode_bit_field("00"));
        assert!(!decode_bit_field(""));
    }

    #[test]
    fn test_insert_lock_row_is_insert_ignore() {
        assert!(dialect()
            .insert_lock_row_sql()
            .contains("INSERT IGNORE INTO DATABASECHANGELOGLOCK"));
    }

    #[test]
    fn test_lock_flag_is_bit_column() {
        let [_, lock] = dialect().create_tables_sql();
        assert!(lock.contains("LOCKED bit(1) NOT NULL"));
        assert_eq!(dialect().lock_flag_expr(), "HEX(LOCKED)");
    }

    #[test]
    fn test_placeholders() {
        assert_eq!(dialect().placeholder(1), "?");
        assert_eq!(dialect().placeholder(3), "?");
    }

    #[test]
    fn test_casts() {
        assert_eq!(
            dialect().bigint("MAX(ORDEREXECUTED)"),
            "CAST(MAX(ORDEREXECUTED) AS SIGNED)"
        );
        assert_eq!(
            dialect().timestamp_text("DATEEXECUTED"),
            "DATE_FORMAT(DATEEXECUTED, '%Y-%m-%d %H:%i:%s')"
        );
    }
}
