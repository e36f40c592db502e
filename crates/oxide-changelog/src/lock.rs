//! Changelog lock.
//!
//! Runners serialize on the singleton row of `DATABASECHANGELOGLOCK`. The
//! lock is advisory: the database does not enforce it, so it only protects
//! runners that follow this protocol.
//!
//! Acquisition polls the row, each attempt in its own short transaction,
//! until the row is claimed or the [`LockPolicy`] budget runs out. Running
//! out is not an error: a warning is logged and the caller proceeds
//! without the lock.

use std::time::Duration;

use sqlx::{AnyConnection, Row};
use tracing::{debug, info, warn};

use crate::config::LockPolicy;
use crate::database::Database;
use crate::dialect::{MigrationDialect, LOCK_TABLE};
use crate::error::{MigrateError, Result};

/// State of the lock row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockStatus {
    /// Whether a runner holds the lock.
    pub locked: bool,
    /// When the lock was granted.
    pub lock_granted: Option<String>,
    /// Who holds the lock.
    pub locked_by: Option<String>,
}

enum Attempt {
    Acquired,
    Busy { locked_by: Option<String> },
}

/// The changelog lock as seen by one runner.
#[derive(Debug)]
pub struct ChangelogLock {
    dialect: &'static dyn MigrationDialect,
    policy: LockPolicy,
    owner: String,
    held: bool,
}

impl ChangelogLock {
    /// Creates a lock handle identified by this host and process.
    #[must_use]
    pub fn new(dialect: &'static dyn MigrationDialect, policy: LockPolicy) -> Self {
        Self::with_owner(dialect, policy, runner_identity())
    }

    /// Creates a lock handle with an explicit owner name.
    #[must_use]
    pub fn with_owner(
        dialect: &'static dyn MigrationDialect,
        policy: LockPolicy,
        owner: impl Into<String>,
    ) -> Self {
        Self {
            dialect,
            policy,
            owner: owner.into(),
            held: false,
        }
    }

    /// Returns the name written to `LOCKEDBY`.
    #[must_use]
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Returns whether this handle holds the lock.
    #[must_use]
    pub fn is_held(&self) -> bool {
        self.held
    }

    /// Tries to acquire the lock within the policy budget.
    ///
    /// Returns `false` when the budget ran out; the timeout is logged, not
    /// raised.
    pub async fn acquire(&mut self, db: &mut Database) -> Result<bool> {
        if self.held {
            return Ok(true);
        }

        let step = self.policy.step.max(Duration::from_millis(1));
        let mut remaining = self.policy.budget;

        loop {
            let mut tx = db.begin().await?;
            let attempt = try_acquire(&mut tx, self.dialect, &self.owner).await;
            match Database::settle(tx, attempt).await? {
                Attempt::Acquired => {
                    info!(owner = %self.owner, "Successfully acquired change log lock");
                    self.held = true;
                    return Ok(true);
                }
                Attempt::Busy { locked_by } => {
                    warn!(
                        locked_by = locked_by.as_deref().unwrap_or("unknown"),
                        "Database is currently locked! Waiting {step:?} to try again..."
                    );
                    tokio::time::sleep(step).await;
                    remaining = remaining.saturating_sub(step);
                }
            }
            if remaining.is_zero() {
                break;
            }
        }

        warn!("{}, given up!", MigrateError::LockTimeout(self.policy.budget));
        Ok(false)
    }

    /// Releases the lock.
    ///
    /// The lock row is cleared even when this handle never acquired it, so a
    /// runner that gave up waiting also frees the lock of the runner it
    /// waited for.
    pub async fn release(&mut self, db: &mut Database) -> Result<()> {
        let mut tx = db.begin().await?;
        let result = clear_lock(&mut tx).await;
        Database::settle(tx, result).await?;

        if self.held {
            self.held = false;
            info!("Successfully released change log lock");
        } else {
            debug!("Change log lock cleared without having been acquired");
        }
        Ok(())
    }
}

async fn try_acquire(
    conn: &mut AnyConnection,
    dialect: &dyn MigrationDialect,
    owner: &str,
) -> Result<Attempt> {
    // Claim first so the transaction starts with a write.
    let sql = format!(
        "UPDATE {LOCK_TABLE} SET LOCKED = TRUE, LOCKGRANTED = CURRENT_TIMESTAMP, LOCKEDBY = {} \
         WHERE ID = 1 AND LOCKED = FALSE",
        dialect.placeholder(1)
    );
    let claimed = sqlx::query(&sql)
        .bind(owner)
        .execute(&mut *conn)
        .await?
        .rows_affected();

    if claimed == 1 {
        return Ok(Attempt::Acquired);
    }

    let status = read_status(conn, dialect).await?;
    Ok(Attempt::Busy {
        locked_by: status.locked_by,
    })
}

async fn clear_lock(conn: &mut AnyConnection) -> Result<()> {
    let sql = format!(
        "UPDATE {LOCK_TABLE} SET LOCKED = FALSE, LOCKGRANTED = NULL, LOCKEDBY = NULL WHERE ID = 1"
    );
    sqlx::query(&sql).execute(&mut *conn).await?;
    Ok(())
}

async fn read_status(conn: &mut AnyConnection, dialect: &dyn MigrationDialect) -> Result<LockStatus> {
    let sql = format!(
        "SELECT {}, {}, LOCKEDBY FROM {LOCK_TABLE} WHERE ID = 1",
        dialect.lock_flag_expr(),
        dialect.timestamp_text("LOCKGRANTED"),
    );
    let row = sqlx::query(&sql).fetch_one(&mut *conn).await?;

    Ok(LockStatus {
        locked: dialect.decode_lock_flag(&row, 0)?,
        lock_granted: row.try_get(1)?,
        locked_by: row.try_get(2)?,
    })
}

/// Reads the lock row.
pub async fn lock_status(db: &mut Database) -> Result<LockStatus> {
    let dialect = db.dialect();
    read_status(db.connect().await?, dialect).await
}

/// Unconditionally clears the lock row, whoever holds it.
///
/// Meant for operators recovering from a runner that died while holding
/// the lock.
pub async fn force_release(db: &mut Database) -> Result<()> {
    let mut tx = db.begin().await?;
    let result = clear_lock(&mut tx).await;
    Database::settle(tx, result).await?;
    warn!("Change log lock forcibly released");
    Ok(())
}

fn runner_identity() -> String {
    let host = std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "localhost".to_string());
    format!("{host} ({})", std::process::id())
}
