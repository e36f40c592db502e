//! Migration executor.
//!
//! This module applies a changelog against a database: it takes the
//! changelog lock, walks the migrations in changelog order and applies
//! each one that has not run yet, every migration inside its own
//! transaction together with its `DATABASECHANGELOG` record.
//!
//! A migration is skipped when its context does not match the run, or when
//! it was already applied with the same checksum. An applied migration
//! whose script changed since aborts the run with
//! [`MigrateError::Drift`].

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use regex::Regex;
use sqlx::AnyConnection;
use tracing::{debug, info, warn};

use crate::changelog::{self, MigrationRef};
use crate::checksum::checksum;
use crate::config::{MigratorOptions, MissingScriptPolicy};
use crate::database::Database;
use crate::error::{MigrateError, Result};
use crate::history::{AppliedIndex, MigrationHistory, MigrationRecord, NewRecord};
use crate::lock::{self, ChangelogLock, LockStatus};
use crate::metadata::MigrationMetadata;

/// Why a migration was not applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// The migration's context does not match the run.
    ContextMismatch,
    /// The migration was applied before with the same checksum.
    AlreadyApplied,
    /// The script file does not exist and the policy is
    /// [`MissingScriptPolicy::Skip`].
    MissingScript,
}

/// A migration applied by a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedMigration {
    /// Script path as listed in the changelog.
    pub file: String,
    /// Changeset author.
    pub author: String,
    /// Changeset identifier.
    pub id: String,
    /// `ORDEREXECUTED` of the new record.
    pub order_executed: i64,
}

/// A migration skipped by a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedMigration {
    /// Script path as listed in the changelog.
    pub file: String,
    /// Why it was skipped.
    pub reason: SkipReason,
}

/// Outcome of a successful run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationReport {
    /// Migrations applied, in order.
    pub applied: Vec<AppliedMigration>,
    /// Migrations skipped, in order.
    pub skipped: Vec<SkippedMigration>,
    /// Whether the run held the changelog lock.
    pub locked: bool,
}

impl MigrationReport {
    fn skip(&mut self, file: &str, reason: SkipReason) {
        debug!(file = %file, reason = ?reason, "Skipping migration");
        self.skipped.push(SkippedMigration {
            file: file.to_string(),
            reason,
        });
    }
}

/// State of one run: the active context and the applied index.
#[derive(Debug)]
pub struct RunContext {
    context: Option<String>,
    context_pattern: Option<Regex>,
    deployment_id: String,
    applied: Option<AppliedIndex>,
    report: MigrationReport,
}

impl RunContext {
    /// Creates the state of a run filtering on `context`.
    pub fn new(context: Option<&str>) -> Result<Self> {
        let context = context
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(str::to_string);
        let context_pattern = context
            .as_deref()
            .map(|c| Regex::new(&format!(r"\b{}\b", regex::escape(c))))
            .transpose()
            .map_err(|e| MigrateError::Config(format!("invalid context: {e}")))?;

        Ok(Self {
            context,
            context_pattern,
            deployment_id: deployment_id(),
            applied: None,
            report: MigrationReport::default(),
        })
    }

    /// Returns whether a migration tagged `tag` runs under the active
    /// context.
    ///
    /// The active context must appear in the tag as a whole word, so `prod`
    /// matches `prod` and `seed, prod` but not `production`. Without an
    /// active context no tagged migration runs.
    #[must_use]
    pub fn matches(&self, tag: &str) -> bool {
        self.context_pattern
            .as_ref()
            .is_some_and(|re| re.is_match(tag))
    }

    /// Returns the active context.
    #[must_use]
    pub fn context(&self) -> Option<&str> {
        self.context.as_deref()
    }

    /// Returns the identifier written to `DEPLOYMENT_ID`.
    #[must_use]
    pub fn deployment_id(&self) -> &str {
        &self.deployment_id
    }
}

fn deployment_id() -> String {
    let millis = chrono::Utc::now().timestamp_millis().rem_euclid(10_000_000_000);
    format!("{millis:010}")
}

/// Applies changelogs against one database.
pub struct MigrationExecutor {
    db: Database,
    options: MigratorOptions,
}

impl MigrationExecutor {
    /// Creates a new migration executor.
    #[must_use]
    pub fn new(db: Database, options: MigratorOptions) -> Self {
        Self { db, options }
    }

    /// Returns the database.
    pub fn database(&mut self) -> &mut Database {
        &mut self.db
    }

    /// Returns the options.
    #[must_use]
    pub fn options(&self) -> &MigratorOptions {
        &self.options
    }

    /// Ensures the bookkeeping tables exist.
    pub async fn init(&mut self) -> Result<()> {
        self.db.init().await
    }

    /// Gets all applied migrations, in application order.
    pub async fn applied_migrations(&mut self) -> Result<Vec<MigrationRecord>> {
        self.db.init().await?;
        let history = MigrationHistory::new(self.db.dialect());
        history.get_applied(self.db.connect().await?).await
    }

    /// Reads the lock row.
    pub async fn lock_status(&mut self) -> Result<LockStatus> {
        self.db.init().await?;
        lock::lock_status(&mut self.db).await
    }

    /// Clears the lock row, whoever holds it.
    pub async fn release_lock(&mut self) -> Result<()> {
        self.db.init().await?;
        lock::force_release(&mut self.db).await
    }

    /// Applies the changelog of `changelog_dir`.
    ///
    /// The lock is released before returning, whether the run succeeded or
    /// not. The connection stays open; see [`Self::close`].
    pub async fn run(
        &mut self,
        changelog_dir: impl AsRef<Path>,
        context: Option<&str>,
    ) -> Result<MigrationReport> {
        let changelog_dir = changelog_dir.as_ref();
        info!(changelog = %changelog_dir.display(), context = ?context, "Executing update");

        self.db.init().await?;

        let mut run = RunContext::new(context)?;
        let mut lock = ChangelogLock::new(self.db.dialect(), self.options.lock);

        let result = match lock.acquire(&mut self.db).await {
            Ok(locked) => {
                run.report.locked = locked;
                self.apply_changelog(changelog_dir, &mut run).await
            }
            Err(e) => Err(e),
        };

        let released = lock.release(&mut self.db).await;

        match (result, released) {
            (Ok(()), Ok(())) => {
                info!(
                    applied = run.report.applied.len(),
                    skipped = run.report.skipped.len(),
                    "Update successful"
                );
                Ok(run.report)
            }
            (Ok(()), Err(e)) => Err(e),
            (Err(e), released) => {
                if let Err(release_err) = released {
                    warn!(error = %release_err, "Failed to release change log lock");
                }
                Err(e)
            }
        }
    }

    /// Closes the connection.
    pub async fn close(mut self) -> Result<()> {
        self.db.close().await
    }

    async fn apply_changelog(&mut self, dir: &Path, run: &mut RunContext) -> Result<()> {
        let changelog = changelog::read(dir)?;
        info!(changelog = %changelog.path().display(), "Reading changelog");

        for migration in changelog {
            self.apply_migration(dir, &migration?, run).await?;
        }
        Ok(())
    }

    async fn apply_migration(
        &mut self,
        dir: &Path,
        migration: &MigrationRef,
        run: &mut RunContext,
    ) -> Result<()> {
        let file = migration.file.as_str();
        let Some(script) = self.read_script(&dir.join(file)).await? else {
            run.report.skip(file, SkipReason::MissingScript);
            return Ok(());
        };
        let md5sum = checksum(&script);

        // The changelog context wins; the header context is only consulted
        // when the changelog entry has none.
        if let Some(tag) = migration.context.as_deref() {
            if !run.matches(tag) {
                run.report.skip(file, SkipReason::ContextMismatch);
                return Ok(());
            }
        }

        let metadata = MigrationMetadata::extract(file, &script)?;
        let tag = migration.context.as_deref().or(metadata.context.as_deref());
        if let Some(tag) = tag {
            if !run.matches(tag) {
                run.report.skip(file, SkipReason::ContextMismatch);
                return Ok(());
            }
        }

        let history = MigrationHistory::new(self.db.dialect());
        if run.applied.is_none() {
            let mut tx = self.db.begin().await?;
            let loaded = history.load_index(&mut tx).await;
            run.applied = Some(Database::settle(tx, loaded).await?);
        }
        let applied = run.applied.get_or_insert_with(AppliedIndex::default);

        match applied.get(&metadata.author, &metadata.id) {
            Some(Some(stored)) if stored != md5sum => {
                return Err(MigrateError::Drift {
                    id: metadata.id,
                    author: metadata.author,
                    file: file.to_string(),
                    stored: stored.to_string(),
                    current: md5sum,
                });
            }
            Some(stored) => {
                if stored.is_none() {
                    warn!(file = %file, "Applied migration has no recorded checksum");
                }
                run.report.skip(file, SkipReason::AlreadyApplied);
                return Ok(());
            }
            None => {}
        }

        info!(file = %file, author = %metadata.author, id = %metadata.id, "Applying migration");

        let statements = metadata.statements(&script);
        let record = NewRecord {
            id: &metadata.id,
            author: &metadata.author,
            filename: file,
            md5sum: &md5sum,
            contexts: tag,
            deployment_id: &run.deployment_id,
        };

        let mut tx = self.db.begin().await?;
        let result = apply_in_transaction(&mut tx, &history, &statements, &record).await;
        let order_executed = Database::settle(tx, result).await?;

        applied.insert(
            metadata.author.clone(),
            metadata.id.clone(),
            Some(md5sum.clone()),
        );
        run.report.applied.push(AppliedMigration {
            file: file.to_string(),
            author: metadata.author,
            id: metadata.id,
            order_executed,
        });

        info!(file = %file, order_executed, "Migration ran successfully");
        Ok(())
    }

    async fn read_script(&self, path: &Path) -> Result<Option<String>> {
        match tokio::fs::read_to_string(path).await {
            Ok(script) => Ok(Some(script)),
            Err(e) if e.kind() == ErrorKind::NotFound => match self.options.missing_script {
                MissingScriptPolicy::Fail => Err(MigrateError::MissingScript(PathBuf::from(path))),
                MissingScriptPolicy::Skip => {
                    warn!(file = %path.display(), "Migration script not found, skipping");
                    Ok(None)
                }
            },
            Err(e) => Err(e.into()),
        }
    }
}

async fn apply_in_transaction(
    conn: &mut AnyConnection,
    history: &MigrationHistory,
    statements: &[String],
    record: &NewRecord<'_>,
) -> Result<i64> {
    for statement in statements {
        debug!(sql = %statement, "Executing SQL");
        sqlx::raw_sql(statement)
            .execute(&mut *conn)
            .await
            .map_err(|source| MigrateError::Sql {
                file: record.filename.to_string(),
                source,
            })?;
    }
    history.record_applied(conn, record).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConnectionConfig, LockPolicy};
    use std::time::Duration;
    use tempfile::TempDir;

    struct Fixture {
        dir: TempDir,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                dir: TempDir::new().unwrap(),
            }
        }

        fn changelog(&self) -> PathBuf {
            self.dir.path().join("changelog")
        }

        fn write(&self, name: &str, content: &str) {
            let dir = self.changelog();
            std::fs::create_dir_all(&dir).unwrap();
            std::fs::write(dir.join(name), content).unwrap();
        }

        fn executor(&self, options: MigratorOptions) -> MigrationExecutor {
            let path = self.dir.path().join("app.db");
            let config = ConnectionConfig::sqlite(path.to_string_lossy());
            MigrationExecutor::new(Database::new(config), options)
        }
    }

    const INIT_SQL: &str =
        "-- changeset jdoe:001\nCREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT);\n";

    fn options() -> MigratorOptions {
        MigratorOptions {
            lock: LockPolicy {
                budget: Duration::from_millis(50),
                step: Duration::from_millis(10),
            },
            ..MigratorOptions::default()
        }
    }

    fn matches(tag: &str, active: Option<&str>) -> bool {
        RunContext::new(active).unwrap().matches(tag)
    }

    #[test]
    fn test_context_matches_whole_words() {
        assert!(matches("prod", Some("prod")));
        assert!(matches("seed, prod", Some("prod")));
        assert!(matches("seed,prod", Some("seed")));
        assert!(!matches("production", Some("prod")));
        assert!(!matches("prod", Some("staging")));
        assert!(!matches("prod", None));
    }

    #[test]
    fn test_context_is_escaped() {
        assert!(!matches("aXb", Some("a.b")));
        assert!(matches("a.b", Some("a.b")));
    }

    #[test]
    fn test_run_context_ignores_blank_context() {
        let blank = RunContext::new(Some("  ")).unwrap();
        assert_eq!(blank.context(), None);
        assert!(!blank.matches("seed"));
        assert_eq!(
            RunContext::new(Some("seed")).unwrap().context(),
            Some("seed")
        );
        assert_eq!(RunContext::new(None).unwrap().deployment_id().len(), 10);
    }

    #[tokio::test]
    async fn test_apply_changelog() {
        let fx = Fixture::new();
        fx.write(
            "changelog.yaml",
            "- file: 001_init.sql\n- file: 002_data.sql\n",
        );
        fx.write("001_init.sql", INIT_SQL);
        fx.write(
            "002_data.sql",
            "-- changeset jdoe:002\nINSERT INTO users (name) VALUES ('a');\nINSERT INTO users (name) VALUES ('b');\n",
        );

        let mut executor = fx.executor(options());
        let report = executor.run(fx.changelog(), None).await.unwrap();

        assert!(report.locked);
        assert_eq!(report.applied.len(), 2);
        assert_eq!(report.applied[0].order_executed, 1);
        assert_eq!(report.applied[1].order_executed, 2);
        assert!(report.skipped.is_empty());

        let records = executor.applied_migrations().await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].filename, "001_init.sql");
        assert_eq!(
            records[0].md5sum.as_deref(),
            Some(checksum(INIT_SQL).as_str())
        );
        assert_eq!(records[0].deployment_id, records[1].deployment_id);

        assert!(!executor.lock_status().await.unwrap().locked);
        executor.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_script_fails_by_default() {
        let fx = Fixture::new();
        fx.write("changelog.yaml", "- file: absent.sql\n");

        let mut executor = fx.executor(options());
        let result = executor.run(fx.changelog(), None).await;

        assert!(matches!(result, Err(MigrateError::MissingScript(_))));
        assert!(!executor.lock_status().await.unwrap().locked);
    }

    #[tokio::test]
    async fn test_missing_script_skip_policy() {
        let fx = Fixture::new();
        fx.write("changelog.yaml", "- file: absent.sql\n- file: 001.sql\n");
        fx.write("001.sql", "-- changeset jdoe:001\nCREATE TABLE t (id INTEGER);\n");

        let mut executor = fx.executor(MigratorOptions {
            missing_script: MissingScriptPolicy::Skip,
            ..options()
        });
        let report = executor.run(fx.changelog(), None).await.unwrap();

        assert_eq!(
            report.skipped,
            vec![SkippedMigration {
                file: "absent.sql".to_string(),
                reason: SkipReason::MissingScript,
            }]
        );
        assert_eq!(report.applied.len(), 1);
    }

    #[tokio::test]
    async fn test_malformed_header_aborts() {
        let fx = Fixture::new();
        fx.write("changelog.yaml", "- file: 001.sql\n");
        fx.write("001.sql", "CREATE TABLE t (id INTEGER);\n");

        let mut executor = fx.executor(options());
        let result = executor.run(fx.changelog(), None).await;

        assert!(matches!(result, Err(MigrateError::MalformedMigration(f)) if f == "001.sql"));
        assert!(executor.applied_migrations().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_context_skipped_script_header_not_parsed() {
        let fx = Fixture::new();
        fx.write("changelog.yaml", "- file: 001.sql\n  context: seed\n");
        fx.write("001.sql", "no header at all");

        let mut executor = fx.executor(options());
        let report = executor.run(fx.changelog(), None).await.unwrap();

        assert_eq!(report.skipped[0].reason, SkipReason::ContextMismatch);
    }

    #[tokio::test]
    async fn test_header_context_filters() {
        let fx = Fixture::new();
        fx.write("changelog.yaml", "- file: 001.sql\n");
        fx.write(
            "001.sql",
            "-- changeset jdoe:001 context:test\nCREATE TABLE t (id INTEGER);\n",
        );

        let mut executor = fx.executor(options());
        let report = executor.run(fx.changelog(), None).await.unwrap();
        assert_eq!(report.skipped[0].reason, SkipReason::ContextMismatch);

        let report = executor.run(fx.changelog(), Some("test")).await.unwrap();
        assert_eq!(report.applied.len(), 1);

        let records = executor.applied_migrations().await.unwrap();
        assert_eq!(records[0].contexts.as_deref(), Some("test"));
    }

    #[tokio::test]
    async fn test_failed_statement_reports_file() {
        let fx = Fixture::new();
        fx.write("changelog.yaml", "- file: 001.sql\n");
        fx.write("001.sql", "-- changeset jdoe:001\nNOT VALID SQL;\n");

        let mut executor = fx.executor(options());
        let result = executor.run(fx.changelog(), None).await;

        assert!(matches!(result, Err(MigrateError::Sql { file, .. }) if file == "001.sql"));
        assert!(!executor.lock_status().await.unwrap().locked);
    }

    #[tokio::test]
    async fn test_runs_unlocked_after_lock_timeout() {
        let fx = Fixture::new();
        fx.write("changelog.yaml", "- file: 001.sql\n");
        fx.write("001.sql", "-- changeset jdoe:001\nCREATE TABLE t (id INTEGER);\n");

        let mut holder = fx.executor(options());
        holder.init().await.unwrap();
        let mut held = ChangelogLock::with_owner(
            holder.database().dialect(),
            options().lock,
            "other-runner",
        );
        assert!(held.acquire(holder.database()).await.unwrap());

        let mut executor = fx.executor(options());
        let report = executor.run(fx.changelog(), None).await.unwrap();

        assert!(!report.locked);
        assert_eq!(report.applied.len(), 1);

        // Releasing after a timeout clears the other runner's lock too.
        let status = executor.lock_status().await.unwrap();
        assert!(!status.locked);
        assert_eq!(status.locked_by, None);
    }
}
