//! Migration history tracking.
//!
//! This module manages the `DATABASECHANGELOG` table that records every
//! applied migration, and the in-memory index of applied checksums used to
//! decide whether a migration runs.

use std::collections::HashMap;

use chrono::NaiveDateTime;
use sqlx::any::AnyRow;
use sqlx::{AnyConnection, Row};

use crate::dialect::{MigrationDialect, CHANGELOG_TABLE};
use crate::error::Result;

/// `EXECTYPE` of an applied migration.
pub const EXEC_TYPE_EXECUTED: &str = "EXECUTED";

/// `DESCRIPTION` of a migration applied from a SQL script.
pub const DESCRIPTION_SQL: &str = "sql";

/// A row of `DATABASECHANGELOG`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationRecord {
    /// Changeset identifier.
    pub id: String,
    /// Changeset author.
    pub author: String,
    /// Script path as listed in the changelog.
    pub filename: String,
    /// When the migration was applied.
    pub executed_at: NaiveDateTime,
    /// 1-based application order.
    pub order_executed: i64,
    /// Execution type, always `EXECUTED` for rows written by this crate.
    pub exec_type: String,
    /// Checksum of the script when it was applied.
    pub md5sum: Option<String>,
    /// Free-form description.
    pub description: Option<String>,
    /// Context the migration was tagged with.
    pub contexts: Option<String>,
    /// Identifier of the run that applied the migration.
    pub deployment_id: Option<String>,
}

/// Values of a record about to be inserted.
#[derive(Debug, Clone)]
pub struct NewRecord<'a> {
    /// Changeset identifier.
    pub id: &'a str,
    /// Changeset author.
    pub author: &'a str,
    /// Script path as listed in the changelog.
    pub filename: &'a str,
    /// Checksum of the script.
    pub md5sum: &'a str,
    /// Effective context of the migration.
    pub contexts: Option<&'a str>,
    /// Identifier of the current run.
    pub deployment_id: &'a str,
}

/// Reads and writes `DATABASECHANGELOG`.
#[derive(Debug, Clone, Copy)]
pub struct MigrationHistory {
    dialect: &'static dyn MigrationDialect,
}

impl MigrationHistory {
    /// Creates a new migration history manager.
    #[must_use]
    pub fn new(dialect: &'static dyn MigrationDialect) -> Self {
        Self { dialect }
    }

    /// Gets all applied migrations, in application order.
    pub async fn get_applied(&self, conn: &mut AnyConnection) -> Result<Vec<MigrationRecord>> {
        let d = self.dialect;
        let sql = format!(
            "SELECT ID, AUTHOR, FILENAME, {}, {}, EXECTYPE, MD5SUM, DESCRIPTION, CONTEXTS, DEPLOYMENT_ID \
             FROM {CHANGELOG_TABLE} ORDER BY ORDEREXECUTED",
            d.timestamp_text("DATEEXECUTED"),
            d.bigint("ORDEREXECUTED"),
        );

        let rows = sqlx::query(&sql).fetch_all(&mut *conn).await?;
        rows.iter().map(record_from_row).collect()
    }

    /// Counts applied migrations.
    pub async fn count_applied(&self, conn: &mut AnyConnection) -> Result<i64> {
        let sql = format!("SELECT COUNT(*) FROM {CHANGELOG_TABLE}");
        let row = sqlx::query(&sql).fetch_one(&mut *conn).await?;
        Ok(row.try_get(0)?)
    }

    /// Returns the `ORDEREXECUTED` the next record receives: one more than
    /// the current maximum, or 1 for an empty table.
    pub async fn next_order(&self, conn: &mut AnyConnection) -> Result<i64> {
        let sql = format!(
            "SELECT {} FROM {CHANGELOG_TABLE}",
            self.dialect.bigint("COALESCE(MAX(ORDEREXECUTED), 0) + 1")
        );
        let row = sqlx::query(&sql).fetch_one(&mut *conn).await?;
        Ok(row.try_get(0)?)
    }

    /// Records a migration as applied and returns its `ORDEREXECUTED`.
    pub async fn record_applied(
        &self,
        conn: &mut AnyConnection,
        record: &NewRecord<'_>,
    ) -> Result<i64> {
        let order = self.next_order(conn).await?;
        let p = |n| self.dialect.placeholder(n);
        let sql = format!(
            "INSERT INTO {CHANGELOG_TABLE} (ID, AUTHOR, FILENAME, DATEEXECUTED, ORDEREXECUTED, \
             EXECTYPE, MD5SUM, DESCRIPTION, CONTEXTS, DEPLOYMENT_ID) \
             VALUES ({}, {}, {}, CURRENT_TIMESTAMP, {}, '{EXEC_TYPE_EXECUTED}', {}, '{DESCRIPTION_SQL}', {}, {})",
            p(1),
            p(2),
            p(3),
            p(4),
            p(5),
            p(6),
            p(7),
        );

        sqlx::query(&sql)
            .bind(record.id)
            .bind(record.author)
            .bind(record.filename)
            .bind(order)
            .bind(record.md5sum)
            .bind(record.contexts)
            .bind(record.deployment_id)
            .execute(&mut *conn)
            .await?;

        Ok(order)
    }

    /// Loads the checksums of every applied migration.
    pub async fn load_index(&self, conn: &mut AnyConnection) -> Result<AppliedIndex> {
        let sql = format!("SELECT AUTHOR, ID, MD5SUM FROM {CHANGELOG_TABLE}");
        let rows = sqlx::query(&sql).fetch_all(&mut *conn).await?;

        let mut index = AppliedIndex::default();
        for row in rows {
            let author: String = row.try_get(0)?;
            let id: String = row.try_get(1)?;
            let md5sum: Option<String> = row.try_get(2)?;
            index.insert(author, id, md5sum);
        }
        Ok(index)
    }
}

fn record_from_row(row: &AnyRow) -> Result<MigrationRecord> {
    let executed_at: String = row.try_get(3)?;
    let executed_at = parse_timestamp(&executed_at).map_err(|e| sqlx::Error::ColumnDecode {
        index: "DATEEXECUTED".to_string(),
        source: Box::new(e),
    })?;

    Ok(MigrationRecord {
        id: row.try_get(0)?,
        author: row.try_get(1)?,
        filename: row.try_get(2)?,
        executed_at,
        order_executed: row.try_get(4)?,
        exec_type: row.try_get(5)?,
        md5sum: row.try_get(6)?,
        description: row.try_get(7)?,
        contexts: row.try_get(8)?,
        deployment_id: row.try_get(9)?,
    })
}

fn parse_timestamp(text: &str) -> std::result::Result<NaiveDateTime, chrono::ParseError> {
    NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S")
        .or_else(|_| NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f"))
}

/// Checksums of applied migrations keyed by `(author, id)`.
///
/// Loaded once per run and kept current as the run applies migrations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppliedIndex {
    checksums: HashMap<(String, String), Option<String>>,
}

impl AppliedIndex {
    /// Looks up a migration. `Some(None)` means applied without a recorded
    /// checksum.
    #[must_use]
    pub fn get(&self, author: &str, id: &str) -> Option<Option<&str>> {
        self.checksums
            .get(&(author.to_string(), id.to_string()))
            .map(Option::as_deref)
    }

    /// Adds an applied migration.
    pub fn insert(&mut self, author: String, id: String, md5sum: Option<String>) {
        self.checksums.insert((author, id), md5sum);
    }

    /// Returns the number of applied migrations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.checksums.len()
    }

    /// Returns whether no migration has been applied.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.checksums.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionConfig;
    use crate::database::Database;
    use tempfile::TempDir;

    async fn create_test_database(dir: &TempDir) -> Database {
        let path = dir.path().join("history.db");
        let mut db = Database::new(ConnectionConfig::sqlite(path.to_string_lossy()));
        db.init().await.unwrap();
        db
    }

    fn new_record<'a>(id: &'a str, md5sum: &'a str) -> NewRecord<'a> {
        NewRecord {
            id,
            author: "jdoe",
            filename: "changes.sql",
            md5sum,
            contexts: None,
            deployment_id: "0000000001",
        }
    }

    #[tokio::test]
    async fn test_record_and_get_applied() {
        let dir = TempDir::new().unwrap();
        let mut db = create_test_database(&dir).await;
        let history = MigrationHistory::new(db.dialect());
        let conn = db.connect().await.unwrap();

        assert_eq!(history.next_order(conn).await.unwrap(), 1);

        let first = history.record_applied(conn, &new_record("001", "aaa")).await.unwrap();
        let second = history
            .record_applied(
                conn,
                &NewRecord {
                    contexts: Some("seed"),
                    ..new_record("002", "bbb")
                },
            )
            .await
            .unwrap();
        assert_eq!((first, second), (1, 2));

        let applied = history.get_applied(conn).await.unwrap();
        assert_eq!(applied.len(), 2);
        assert_eq!(applied[0].id, "001");
        assert_eq!(applied[0].exec_type, EXEC_TYPE_EXECUTED);
        assert_eq!(applied[0].description.as_deref(), Some(DESCRIPTION_SQL));
        assert_eq!(applied[0].contexts, None);
        assert_eq!(applied[1].order_executed, 2);
        assert_eq!(applied[1].md5sum.as_deref(), Some("bbb"));
        assert_eq!(applied[1].contexts.as_deref(), Some("seed"));
        assert_eq!(applied[1].deployment_id.as_deref(), Some("0000000001"));

        assert_eq!(history.count_applied(conn).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_load_index() {
        let dir = TempDir::new().unwrap();
        let mut db = create_test_database(&dir).await;
        let history = MigrationHistory::new(db.dialect());
        let conn = db.connect().await.unwrap();

        assert!(history.load_index(conn).await.unwrap().is_empty());

        history.record_applied(conn, &new_record("001", "aaa")).await.unwrap();

        let index = history.load_index(conn).await.unwrap();
        assert_eq!(index.len(), 1);
        assert_eq!(index.get("jdoe", "001"), Some(Some("aaa")));
        assert_eq!(index.get("someone-else", "001"), None);
    }

    #[test]
    fn test_index_insert() {
        let mut index = AppliedIndex::default();
        index.insert("jdoe".into(), "001".into(), None);
        assert_eq!(index.get("jdoe", "001"), Some(None));
    }

    #[test]
    fn test_parse_timestamp() {
        assert!(parse_timestamp("2024-01-20 12:00:00").is_ok());
        assert!(parse_timestamp("2024-01-20 12:00:00.123").is_ok());
        assert!(parse_timestamp("yesterday").is_err());
    }
}
