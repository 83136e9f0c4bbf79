//! Changelog diff extraction, database merge, and sync orchestration.

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use ils_changelog::{AddedLine, ChangelogParser};
use ils_core::IncidentRecord;
use ils_storage::{CommitPointerFile, IncidentStore, StorageError};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::process::Command;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "ils-sync";

#[derive(Debug, Error)]
pub enum GitError {
    #[error("spawning git {args}: {source}")]
    Spawn {
        args: String,
        #[source]
        source: std::io::Error,
    },
    #[error("git {args} failed: {stderr}")]
    Command { args: String, stderr: String },
    #[error("revision {revision} not found in repository history")]
    UnknownRevision { revision: String },
    #[error("git {args} produced output that is not valid UTF-8")]
    Encoding { args: String },
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Git(#[from] GitError),
}

/// Read-only view of the changelog document inside the upstream working
/// copy. All access goes through `git` subprocesses so the document can be
/// rendered at any commit, not just the checked-out one.
#[derive(Debug, Clone)]
pub struct ChangelogRepo {
    repo_path: PathBuf,
    changelog_path: String,
}

impl ChangelogRepo {
    pub fn new(repo_path: impl Into<PathBuf>, changelog_path: impl Into<String>) -> Self {
        Self {
            repo_path: repo_path.into(),
            changelog_path: changelog_path.into(),
        }
    }

    async fn git(&self, args: &[&str]) -> Result<std::process::Output, GitError> {
        Command::new("git")
            .arg("-C")
            .arg(&self.repo_path)
            .args(args)
            .output()
            .await
            .map_err(|source| GitError::Spawn {
                args: args.join(" "),
                source,
            })
    }

    async fn git_stdout(&self, args: &[&str]) -> Result<String, GitError> {
        let output = self.git(args).await?;
        if !output.status.success() {
            return Err(GitError::Command {
                args: args.join(" "),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        String::from_utf8(output.stdout).map_err(|_| GitError::Encoding {
            args: args.join(" "),
        })
    }

    /// Current upstream HEAD commit hash.
    pub async fn head_commit(&self) -> Result<String, GitError> {
        Ok(self.git_stdout(&["rev-parse", "HEAD"]).await?.trim().to_string())
    }

    /// Whether `revision` resolves to a commit in this repository.
    pub async fn is_known_commit(&self, revision: &str) -> Result<bool, GitError> {
        let spec = format!("{revision}^{{commit}}");
        let output = self
            .git(&["rev-parse", "--verify", "--quiet", &spec])
            .await?;
        Ok(output.status.success())
    }

    /// Added changelog lines between `from` and `to`, in file order, each
    /// tagged with its diff position. `from == to` is an idempotent no-op;
    /// a `from` outside history fails with [`GitError::UnknownRevision`] so
    /// the orchestrator can fall back to a full-document parse.
    pub async fn added_lines(&self, from: &str, to: &str) -> Result<Vec<AddedLine>, GitError> {
        if from == to {
            return Ok(Vec::new());
        }
        if !self.is_known_commit(from).await? {
            return Err(GitError::UnknownRevision {
                revision: from.to_string(),
            });
        }
        let range = format!("{from}..{to}");
        let diff = self
            .git_stdout(&["diff", &range, "--", &self.changelog_path])
            .await?;

        let mut lines = Vec::new();
        for line in diff.lines() {
            if line.starts_with("+++") {
                continue;
            }
            if let Some(added) = line.strip_prefix('+') {
                let text = added.strip_suffix('\r').unwrap_or(added);
                lines.push(AddedLine::new(lines.len(), text));
            }
        }
        Ok(lines)
    }

    /// The whole changelog document as it exists at `revision` — the diff
    /// against the document's empty state, used for first runs and the
    /// unknown-pointer fallback.
    pub async fn full_document(&self, revision: &str) -> Result<Vec<AddedLine>, GitError> {
        let spec = format!("{revision}:{}", self.changelog_path);
        let document = self.git_stdout(&["show", &spec]).await?;
        Ok(document
            .lines()
            .enumerate()
            .map(|(index, text)| AddedLine::new(index, text.strip_suffix('\r').unwrap_or(text)))
            .collect())
    }
}

/// What to do when an incoming record's identity key already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ReobservationPolicy {
    /// Leave the existing record byte-identical (default): the upstream
    /// entry was already captured and curated fields win.
    #[default]
    KeepExisting,
    /// Update only `source_commit` to record the latest observation.
    RefreshSourceCommit,
}

#[derive(Debug, Clone)]
pub struct MergeOutcome {
    pub records: Vec<IncidentRecord>,
    pub appended: usize,
    pub refreshed: usize,
}

impl MergeOutcome {
    pub fn changed(&self) -> bool {
        self.appended > 0 || self.refreshed > 0
    }
}

/// Merge `incoming` into `existing` by identity key. Pure and order
/// preserving: existing records keep their positions, new records append in
/// diff order, nothing is ever removed.
pub fn merge_incidents(
    existing: &[IncidentRecord],
    incoming: Vec<IncidentRecord>,
    policy: ReobservationPolicy,
) -> MergeOutcome {
    let mut records = existing.to_vec();
    let mut by_key: HashMap<String, usize> = records
        .iter()
        .enumerate()
        .map(|(i, r)| (r.identity_key.clone(), i))
        .collect();

    let mut appended = 0;
    let mut refreshed = 0;
    for record in incoming {
        match by_key.get(&record.identity_key) {
            Some(&slot) => {
                if policy == ReobservationPolicy::RefreshSourceCommit
                    && records[slot].source_commit != record.source_commit
                {
                    records[slot].source_commit = record.source_commit;
                    refreshed += 1;
                }
            }
            None => {
                by_key.insert(record.identity_key.clone(), records.len());
                records.push(record);
                appended += 1;
            }
        }
    }

    MergeOutcome {
        records,
        appended,
        refreshed,
    }
}

/// Invocation contract of one sync run: where the upstream working copy
/// lives, which document to watch, and where the two output files go.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub repo_path: PathBuf,
    pub changelog_path: String,
    pub database_path: PathBuf,
    pub pointer_path: PathBuf,
    pub reobservation: ReobservationPolicy,
}

impl SyncConfig {
    pub fn new(repo_path: impl Into<PathBuf>) -> Self {
        Self {
            repo_path: repo_path.into(),
            changelog_path: "README.md".to_string(),
            database_path: PathBuf::from("incidents.json"),
            pointer_path: PathBuf::from(".last_sync_commit"),
            reobservation: ReobservationPolicy::default(),
        }
    }

    pub fn from_env() -> Self {
        let mut config = Self::new(
            std::env::var("ILS_REPO_PATH").unwrap_or_else(|_| ".".to_string()),
        );
        if let Ok(path) = std::env::var("ILS_CHANGELOG_PATH") {
            config.changelog_path = path;
        }
        if let Ok(path) = std::env::var("ILS_DATABASE_PATH") {
            config.database_path = PathBuf::from(path);
        }
        if let Ok(path) = std::env::var("ILS_POINTER_PATH") {
            config.pointer_path = PathBuf::from(path);
        }
        if std::env::var("ILS_REFRESH_SOURCE_COMMIT")
            .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
            .unwrap_or(false)
        {
            config.reobservation = ReobservationPolicy::RefreshSourceCommit;
        }
        config
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub changed: bool,
    pub from_commit: Option<String>,
    pub to_commit: String,
    pub added_lines: usize,
    pub parsed_records: usize,
    pub appended: usize,
    pub refreshed: usize,
    pub total_records: usize,
}

/// One full synchronization pass: pointer → diff → parse → merge → write.
/// Strictly sequential; state comes in through [`SyncConfig`] and goes out
/// through [`SyncRunSummary`], with the two files as the only side effects.
pub struct SyncPipeline {
    config: SyncConfig,
    repo: ChangelogRepo,
    store: IncidentStore,
    pointer: CommitPointerFile,
    parser: ChangelogParser,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig) -> Self {
        let repo = ChangelogRepo::new(&config.repo_path, config.changelog_path.clone());
        let store = IncidentStore::new(&config.database_path);
        let pointer = CommitPointerFile::new(&config.pointer_path);
        Self {
            config,
            repo,
            store,
            pointer,
            parser: ChangelogParser::new(),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub async fn run_once(&self) -> Result<SyncRunSummary, SyncError> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();

        let from_commit = self.pointer.read().await?;
        let to_commit = self.repo.head_commit().await?;

        if from_commit.as_deref() == Some(to_commit.as_str()) {
            info!(commit = %to_commit, "changelog already synchronized, nothing to do");
            let existing = self.store.load().await?;
            return Ok(SyncRunSummary {
                run_id,
                started_at,
                finished_at: Utc::now(),
                changed: false,
                from_commit,
                to_commit,
                added_lines: 0,
                parsed_records: 0,
                appended: 0,
                refreshed: 0,
                total_records: existing.len(),
            });
        }

        let added = match &from_commit {
            None => {
                info!("no prior sync point, parsing the full changelog");
                self.repo.full_document(&to_commit).await?
            }
            Some(from) => match self.repo.added_lines(from, &to_commit).await {
                Ok(lines) => lines,
                Err(GitError::UnknownRevision { revision }) => {
                    warn!(
                        commit = %revision,
                        "stored sync point not in repository history, reparsing the full changelog"
                    );
                    self.repo.full_document(&to_commit).await?
                }
                Err(err) => return Err(err.into()),
            },
        };

        let drafts = self.parser.parse(&added);
        let incoming: Vec<IncidentRecord> = drafts
            .into_iter()
            .map(|draft| draft.into_record(&to_commit))
            .collect();
        let parsed_records = incoming.len();

        let existing = self.store.load().await?;
        let outcome = merge_incidents(&existing, incoming, self.config.reobservation);
        let changed = outcome.changed();

        // Database before pointer: a crash between the two renames leaves the
        // pointer behind and the next run re-merges (a no-op), instead of a
        // pointer that skips entries the database never received.
        if changed {
            self.store.save(&outcome.records).await?;
            self.pointer.write(&to_commit).await?;
        }

        info!(
            changed,
            appended = outcome.appended,
            refreshed = outcome.refreshed,
            total = outcome.records.len(),
            "sync run complete"
        );

        Ok(SyncRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            changed,
            from_commit,
            to_commit,
            added_lines: added.len(),
            parsed_records,
            appended: outcome.appended,
            refreshed: outcome.refreshed,
            total_records: outcome.records.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use ils_core::derive_identity_key;

    fn record(date: &str, title: &str, commit: &str) -> IncidentRecord {
        let date = NaiveDate::parse_from_str(date, "%Y-%m-%d").ok();
        IncidentRecord {
            identity_key: derive_identity_key(date, Some(title), title),
            date,
            title: Some(title.to_string()),
            attack_type: None,
            loss: None,
            contract: None,
            links: Vec::new(),
            raw_text: format!("{title} raw"),
            source_commit: commit.to_string(),
        }
    }

    #[test]
    fn env_config_defaults_match_the_invocation_contract() {
        for var in [
            "ILS_REPO_PATH",
            "ILS_CHANGELOG_PATH",
            "ILS_DATABASE_PATH",
            "ILS_POINTER_PATH",
            "ILS_REFRESH_SOURCE_COMMIT",
        ] {
            std::env::remove_var(var);
        }
        let config = SyncConfig::from_env();
        assert_eq!(config.repo_path, PathBuf::from("."));
        assert_eq!(config.changelog_path, "README.md");
        assert_eq!(config.database_path, PathBuf::from("incidents.json"));
        assert_eq!(config.pointer_path, PathBuf::from(".last_sync_commit"));
        assert_eq!(config.reobservation, ReobservationPolicy::KeepExisting);
    }

    #[test]
    fn new_records_append_in_diff_order() {
        let existing = vec![record("2024-01-05", "Alpha", "c1")];
        let incoming = vec![
            record("2024-01-09", "Beta", "c2"),
            record("2024-02-01", "Gamma", "c2"),
        ];
        let outcome = merge_incidents(&existing, incoming, ReobservationPolicy::KeepExisting);
        assert!(outcome.changed());
        assert_eq!(outcome.appended, 2);
        assert_eq!(outcome.refreshed, 0);
        let titles: Vec<_> = outcome
            .records
            .iter()
            .map(|r| r.title.as_deref().unwrap())
            .collect();
        assert_eq!(titles, vec!["Alpha", "Beta", "Gamma"]);
    }

    #[test]
    fn duplicate_keys_leave_existing_records_untouched() {
        let existing = vec![record("2024-01-05", "Alpha", "c1")];
        let mut reobserved = record("2024-01-05", "Alpha", "c9");
        reobserved.attack_type = Some("Reentrancy Attack".into());
        let outcome = merge_incidents(
            &existing,
            vec![reobserved],
            ReobservationPolicy::KeepExisting,
        );
        assert!(!outcome.changed());
        assert_eq!(outcome.records, existing);
    }

    #[test]
    fn refresh_policy_updates_only_source_commit() {
        let existing = vec![record("2024-01-05", "Alpha", "c1")];
        let mut reobserved = record("2024-01-05", "Alpha", "c9");
        reobserved.attack_type = Some("Reentrancy Attack".into());
        let outcome = merge_incidents(
            &existing,
            vec![reobserved],
            ReobservationPolicy::RefreshSourceCommit,
        );
        assert!(outcome.changed());
        assert_eq!(outcome.refreshed, 1);
        assert_eq!(outcome.records[0].source_commit, "c9");
        // Curated fields untouched.
        assert_eq!(outcome.records[0].attack_type, None);
        assert_eq!(outcome.records[0].title.as_deref(), Some("Alpha"));
    }

    #[test]
    fn refresh_policy_with_same_commit_is_a_no_op() {
        let existing = vec![record("2024-01-05", "Alpha", "c1")];
        let outcome = merge_incidents(
            &existing,
            vec![record("2024-01-05", "Alpha", "c1")],
            ReobservationPolicy::RefreshSourceCommit,
        );
        assert!(!outcome.changed());
        assert_eq!(outcome.records, existing);
    }

    #[test]
    fn merge_never_loses_records() {
        let existing = vec![
            record("2024-01-05", "Alpha", "c1"),
            record("2024-01-09", "Beta", "c1"),
        ];
        let outcome = merge_incidents(
            &existing,
            vec![record("2024-02-01", "Gamma", "c2")],
            ReobservationPolicy::KeepExisting,
        );
        for old in &existing {
            assert!(outcome
                .records
                .iter()
                .any(|r| r.identity_key == old.identity_key));
        }
    }

    #[test]
    fn duplicate_keys_within_incoming_collapse_to_one() {
        let outcome = merge_incidents(
            &[],
            vec![
                record("2024-01-05", "Alpha", "c1"),
                record("2024-01-05", "Alpha", "c1"),
            ],
            ReobservationPolicy::KeepExisting,
        );
        assert_eq!(outcome.appended, 1);
        assert_eq!(outcome.records.len(), 1);
    }

    #[test]
    fn merging_twice_is_idempotent() {
        let incoming = vec![
            record("2024-01-05", "Alpha", "c1"),
            record("2024-01-09", "Beta", "c1"),
        ];
        let first = merge_incidents(&[], incoming.clone(), ReobservationPolicy::KeepExisting);
        let second = merge_incidents(
            &first.records,
            incoming,
            ReobservationPolicy::KeepExisting,
        );
        assert!(!second.changed());
        assert_eq!(second.records, first.records);
    }
}
