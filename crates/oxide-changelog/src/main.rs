//! oxide-changelog CLI
//!
//! Command-line tool for applying SQL changelogs.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::{Level, info};
use tracing_subscriber::FmtSubscriber;

use oxide_changelog::prelude::*;

/// Changelog-driven SQL migrations.
#[derive(Parser)]
#[command(name = "oxide-changelog")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Database dialect (mysql, postgres or sqlite).
    #[arg(long, env = "DB_DIALECT", default_value = "mysql")]
    dialect: DialectKind,

    /// Database host.
    #[arg(long, env = "DB_HOST", default_value = "localhost")]
    host: String,

    /// Database port (dialect default if not specified).
    #[arg(long, env = "DB_PORT")]
    port: Option<u16>,

    /// Database user.
    #[arg(short, long, env = "DB_USER", default_value = "cwi")]
    user: String,

    /// Database password.
    #[arg(long, env = "DB_PASSWORD", default_value = "cwi", hide_env_values = true)]
    password: String,

    /// Database name, or the database file for SQLite.
    #[arg(short, long, env = "DB_DATABASE", default_value = "hub")]
    database: String,

    /// Enable verbose output.
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

impl Cli {
    fn connection(&self) -> ConnectionConfig {
        ConnectionConfig {
            dialect: self.dialect,
            host: self.host.clone(),
            port: self.port,
            user: self.user.clone(),
            password: self.password.clone(),
            database: self.database.clone(),
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Apply the changelog.
    Migrate {
        /// Changelog directory.
        #[arg(short, long, default_value = "changelog")]
        changelog: PathBuf,

        /// Run migrations tagged with this context.
        #[arg(long)]
        context: Option<String>,

        /// Seconds to wait for the changelog lock.
        #[arg(long, default_value_t = 10)]
        lock_budget: u64,

        /// Seconds between two lock attempts.
        #[arg(long, default_value_t = 5)]
        lock_step: u64,

        /// Skip scripts missing on disk instead of failing.
        #[arg(long)]
        skip_missing: bool,
    },

    /// Show applied migrations and the lock state.
    Status,

    /// Create the changelog and lock tables.
    Init,

    /// Clear the changelog lock left by a crashed runner.
    ReleaseLock,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .without_time()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = cli.connection();

    match cli.command {
        Commands::Migrate {
            changelog,
            context,
            lock_budget,
            lock_step,
            skip_missing,
        } => {
            let options = MigratorOptions {
                lock: LockPolicy {
                    budget: Duration::from_secs(lock_budget),
                    step: Duration::from_secs(lock_step),
                },
                missing_script: if skip_missing {
                    MissingScriptPolicy::Skip
                } else {
                    MissingScriptPolicy::Fail
                },
            };

            let report =
                oxide_changelog::migrate_with(&config, &changelog, context.as_deref(), options)
                    .await?;

            for applied in &report.applied {
                println!(
                    " [X] {} ({}:{})",
                    applied.file, applied.author, applied.id
                );
            }
            for skipped in &report.skipped {
                println!(" [ ] {} ({:?})", skipped.file, skipped.reason);
            }
            info!(
                "{} migration(s) applied, {} skipped",
                report.applied.len(),
                report.skipped.len()
            );
        }

        Commands::Status => {
            let mut executor =
                MigrationExecutor::new(Database::new(config), MigratorOptions::default());
            let applied = executor.applied_migrations().await?;
            let lock = executor.lock_status().await?;
            executor.close().await?;

            if applied.is_empty() {
                info!("No migrations have been applied yet.");
            } else {
                println!("\nApplied migrations:");
                println!("{:-<60}", "");

                for record in &applied {
                    println!(
                        " {:>4} {} ({}:{}) {}",
                        record.order_executed,
                        record.filename,
                        record.author,
                        record.id,
                        record.executed_at.format("%Y-%m-%d %H:%M:%S")
                    );
                }
                println!();
            }

            if lock.locked {
                println!(
                    "Locked by {} since {}",
                    lock.locked_by.as_deref().unwrap_or("unknown"),
                    lock.lock_granted.as_deref().unwrap_or("unknown")
                );
            } else {
                println!("Not locked");
            }
        }

        Commands::Init => {
            info!("Initializing changelog tables...");
            let mut db = Database::new(config);
            db.init().await?;
            db.close().await?;
            info!("Changelog tables created successfully.");
        }

        Commands::ReleaseLock => {
            let mut executor =
                MigrationExecutor::new(Database::new(config), MigratorOptions::default());
            executor.release_lock().await?;
            executor.close().await?;
        }
    }

    Ok(())
}
