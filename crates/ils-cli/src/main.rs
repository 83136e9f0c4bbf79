use std::collections::HashSet;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use ils_core::IncidentRecord;
use ils_storage::IncidentStore;
use ils_sync::{ReobservationPolicy, SyncConfig, SyncPipeline};

#[derive(Debug, Parser)]
#[command(name = "ils-cli")]
#[command(about = "Incident Ledger Sync command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one synchronization pass against the upstream working copy.
    ///
    /// Flags override the `ILS_*` environment defaults.
    Sync {
        /// Path to the upstream repository working copy.
        #[arg(long)]
        repo: Option<PathBuf>,
        /// Changelog document path, relative to the repository root.
        #[arg(long)]
        changelog: Option<String>,
        /// Incident database file.
        #[arg(long)]
        database: Option<PathBuf>,
        /// Last-synchronized commit pointer file.
        #[arg(long)]
        pointer: Option<PathBuf>,
        /// Update source_commit on records that reappear in a later diff.
        #[arg(long)]
        refresh_source_commit: bool,
    },
    /// Validate database invariants without touching the upstream repository.
    Check {
        /// Incident database file.
        #[arg(long, default_value = "incidents.json")]
        database: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Sync {
            repo,
            changelog,
            database,
            pointer,
            refresh_source_commit,
        } => {
            let mut config = SyncConfig::from_env();
            if let Some(repo) = repo {
                config.repo_path = repo;
            }
            if let Some(changelog) = changelog {
                config.changelog_path = changelog;
            }
            if let Some(database) = database {
                config.database_path = database;
            }
            if let Some(pointer) = pointer {
                config.pointer_path = pointer;
            }
            if refresh_source_commit {
                config.reobservation = ReobservationPolicy::RefreshSourceCommit;
            }

            let summary = SyncPipeline::new(config).run_once().await?;
            println!(
                "sync complete: run_id={} changed={} appended={} refreshed={} total={} head={}",
                summary.run_id,
                summary.changed,
                summary.appended,
                summary.refreshed,
                summary.total_records,
                summary.to_commit
            );
        }
        Commands::Check { database } => {
            let records = IncidentStore::new(&database)
                .load()
                .await
                .with_context(|| format!("loading {}", database.display()))?;
            check_invariants(&records)?;
            println!("check complete: {} records, invariants hold", records.len());
        }
    }

    Ok(())
}

fn check_invariants(records: &[IncidentRecord]) -> Result<()> {
    let mut seen = HashSet::new();
    for record in records {
        if !seen.insert(record.identity_key.as_str()) {
            bail!("duplicate identity key {}", record.identity_key);
        }
        if record.raw_text.trim().is_empty() {
            bail!("record {} has empty raw_text", record.identity_key);
        }
        if record.source_commit.trim().is_empty() {
            bail!("record {} has empty source_commit", record.identity_key);
        }
    }
    Ok(())
}
