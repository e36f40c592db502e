//! Connection and transaction management.
//!
//! A [`Database`] owns the single connection of the process and the
//! dialect selected by configuration. Work that must be atomic runs in a
//! scoped transaction:
//!
//! ```rust,ignore
//! let mut tx = db.begin().await?;
//! let result = do_work(&mut tx).await;
//! Database::settle(tx, result).await?;
//! ```
//!
//! [`Database::settle`] commits when the block succeeded and rolls back
//! otherwise, handing the original error back to the caller.

use sqlx::{Any, AnyConnection, Connection, Transaction};
use tracing::{debug, info, warn};

use crate::config::ConnectionConfig;
use crate::dialect::MigrationDialect;
use crate::error::{MigrateError, Result};

/// The process-wide database connection.
pub struct Database {
    config: ConnectionConfig,
    dialect: &'static dyn MigrationDialect,
    conn: Option<AnyConnection>,
}

impl Database {
    /// Creates a manager for the configured database. No connection is
    /// opened until one is needed.
    #[must_use]
    pub fn new(config: ConnectionConfig) -> Self {
        sqlx::any::install_default_drivers();
        let dialect = config.dialect.dialect();
        Self {
            config,
            dialect,
            conn: None,
        }
    }

    /// Returns the connection configuration.
    #[must_use]
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Returns the dialect.
    #[must_use]
    pub fn dialect(&self) -> &'static dyn MigrationDialect {
        self.dialect
    }

    /// Returns whether a connection is currently held.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    /// Returns the open connection, opening it first if needed.
    ///
    /// An existing connection is pinged and transparently reopened when it
    /// has gone stale.
    pub async fn connect(&mut self) -> Result<&mut AnyConnection> {
        let alive = match self.conn.as_mut() {
            Some(conn) => conn.ping().await.is_ok(),
            None => false,
        };

        if !alive {
            if self.conn.take().is_some() {
                warn!("Database connection went stale, reconnecting");
            }
            info!(
                url = %self.config.redacted_url(),
                dialect = self.dialect.name(),
                "Connecting to database"
            );
            self.conn = Some(AnyConnection::connect(&self.config.url()).await?);
        }

        self.conn
            .as_mut()
            .ok_or_else(|| MigrateError::Config("database connection is not open".to_string()))
    }

    /// Opens the connection and creates the bookkeeping tables and the
    /// lock row if they do not exist yet.
    pub async fn init(&mut self) -> Result<()> {
        let dialect = self.dialect;
        let mut tx = self.begin().await?;
        let result = bootstrap(&mut tx, dialect).await;
        Self::settle(tx, result).await
    }

    /// Begins a transaction on the connection.
    pub async fn begin(&mut self) -> Result<Transaction<'_, Any>> {
        let conn = self.connect().await?;
        Ok(conn.begin().await?)
    }

    /// Ends a transaction scope: commits on `Ok`, rolls back on `Err` and
    /// returns the original error.
    pub async fn settle<T>(tx: Transaction<'_, Any>, result: Result<T>) -> Result<T> {
        match result {
            Ok(value) => {
                tx.commit().await?;
                Ok(value)
            }
            Err(err) => {
                debug!(error = %err, "Rolling back transaction");
                if let Err(rollback) = tx.rollback().await {
                    warn!(error = %rollback, "Rollback failed");
                }
                Err(err)
            }
        }
    }

    /// Closes the connection, if any.
    pub async fn close(&mut self) -> Result<()> {
        if let Some(conn) = self.conn.take() {
            conn.close().await?;
            debug!("Database connection closed");
        }
        Ok(())
    }
}

async fn bootstrap(conn: &mut AnyConnection, dialect: &dyn MigrationDialect) -> Result<()> {
    if let Some(sql) = dialect.quiet_notices_sql() {
        sqlx::raw_sql(sql).execute(&mut *conn).await?;
    }
    for sql in dialect.create_tables_sql() {
        sqlx::raw_sql(sql).execute(&mut *conn).await?;
    }
    sqlx::raw_sql(dialect.insert_lock_row_sql())
        .execute(&mut *conn)
        .await?;
    Ok(())
}
