//! Build orchestration engine.
//!
//! One cycle for a project:
//! 1. take the project's build lock, or skip the project if it is held
//! 2. clone/fetch the working directory
//! 3. list commits on the branch that storage has never recorded
//! 4. for each, oldest first: insert a `building` row, check out the sha,
//!    run the build command, refine the row to `passed`/`failed`
//!
//! Failures are contained at the level they happen: a VCS failure skips the
//! project for this cycle, a checkout or spawn failure fails only that commit.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use tokio::sync::OwnedMutexGuard;

use crate::errors::{StorageError, VcsError};
use crate::model::{CommitInfo, CommitStatus, Project};
use crate::process::CommandRunner;
use crate::repo::Repository;
use crate::state::{BuildEvent, transition};
use crate::storage::Storage;

/// How often a finalized build result is written before giving up.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_millis(200),
        }
    }
}

/// What happened to one commit during a cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildRecord {
    pub sha: String,
    pub status: CommitStatus,
    /// False when the row could not be written; the result only exists in the log.
    pub persisted: bool,
}

#[derive(Debug)]
pub enum CycleOutcome {
    /// Another cycle holds this project's lock.
    Skipped,
    /// No commits to build.
    UpToDate,
    Built(Vec<BuildRecord>),
    Unavailable(VcsError),
    Storage(StorageError),
    /// A forced rebuild named a sha storage has never seen.
    NotRecorded(String),
}

#[derive(Debug)]
pub struct ProjectReport {
    pub slug: String,
    pub outcome: CycleOutcome,
}

impl ProjectReport {
    fn new(project: &Project, outcome: CycleOutcome) -> Self {
        Self {
            slug: project.slug.clone(),
            outcome,
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(
            self.outcome,
            CycleOutcome::Unavailable(_) | CycleOutcome::Storage(_) | CycleOutcome::NotRecorded(_)
        )
    }
}

pub struct Orchestrator {
    storage: Storage,
    repo: Arc<dyn Repository>,
    runner: Arc<dyn CommandRunner>,
    timeout: Duration,
    retry: RetryPolicy,
    /// One lock per slug, created on first use.
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl Orchestrator {
    pub fn new(
        storage: Storage,
        repo: Arc<dyn Repository>,
        runner: Arc<dyn CommandRunner>,
        timeout: Duration,
    ) -> Self {
        Self {
            storage,
            repo,
            runner,
            timeout,
            retry: RetryPolicy::default(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Take the project's lock without waiting. `None` means a cycle is running.
    fn try_lock(&self, slug: &str) -> Option<OwnedMutexGuard<()>> {
        let lock = {
            let mut locks = match self.locks.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            locks
                .entry(slug.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        lock.try_lock_owned().ok()
    }

    /// Run one cycle for every project concurrently.
    pub async fn run_cycle(&self, projects: &[Project]) -> Vec<ProjectReport> {
        join_all(projects.iter().map(|p| self.run_project(p))).await
    }

    /// Run one cycle for a single project.
    pub async fn run_project(&self, project: &Project) -> ProjectReport {
        let Some(_guard) = self.try_lock(&project.slug) else {
            tracing::info!(slug = %project.slug, "build already in progress, skipping");
            return ProjectReport::new(project, CycleOutcome::Skipped);
        };

        if let Err(e) = self.repo.ensure_checkout(project).await {
            tracing::warn!(slug = %project.slug, error = %e, "repository unavailable");
            return ProjectReport::new(project, CycleOutcome::Unavailable(e));
        }

        let known = match self.storage.known_shas(&project.slug).await {
            Ok(known) => known,
            Err(e) => {
                tracing::error!(slug = %project.slug, error = %e, "failed to read recorded commits");
                return ProjectReport::new(project, CycleOutcome::Storage(e));
            }
        };

        let new_commits = match self.repo.list_new_commits(project, &known).await {
            Ok(commits) => commits,
            Err(e) => {
                tracing::warn!(slug = %project.slug, error = %e, "failed to list commits");
                return ProjectReport::new(project, CycleOutcome::Unavailable(e));
            }
        };

        if new_commits.is_empty() {
            tracing::debug!(slug = %project.slug, "no new commits");
            return ProjectReport::new(project, CycleOutcome::UpToDate);
        }

        tracing::info!(slug = %project.slug, count = new_commits.len(), "building new commits");
        let mut records = Vec::with_capacity(new_commits.len());
        let mut last_build_date = None;
        for info in &new_commits {
            let build_date = next_build_date(last_build_date);
            last_build_date = Some(build_date);

            match self.storage.insert_building(&project.slug, info, build_date).await {
                Ok(_) => {}
                Err(StorageError::Duplicate { .. }) => {
                    // Another process recorded it between our read and this insert.
                    tracing::warn!(slug = %project.slug, sha = %info.sha, "commit already recorded, skipping");
                    continue;
                }
                Err(e) => {
                    tracing::error!(slug = %project.slug, sha = %info.sha, error = %e, "failed to record commit");
                    records.push(BuildRecord {
                        sha: info.sha.clone(),
                        status: CommitStatus::Unknown,
                        persisted: false,
                    });
                    continue;
                }
            }

            records.push(self.build_commit(project, info).await);
        }

        ProjectReport::new(project, CycleOutcome::Built(records))
    }

    /// Rebuild an already recorded commit, overwriting its previous result.
    pub async fn rebuild(&self, project: &Project, sha: &str) -> ProjectReport {
        let Some(_guard) = self.try_lock(&project.slug) else {
            tracing::info!(slug = %project.slug, "build already in progress, skipping rebuild");
            return ProjectReport::new(project, CycleOutcome::Skipped);
        };

        let existing = match self.storage.get_commit(&project.slug, sha).await {
            Ok(Some(commit)) => commit,
            Ok(None) => {
                return ProjectReport::new(project, CycleOutcome::NotRecorded(sha.to_string()));
            }
            Err(e) => return ProjectReport::new(project, CycleOutcome::Storage(e)),
        };

        if let Err(e) = transition(existing.status, BuildEvent::Restart) {
            tracing::warn!(slug = %project.slug, sha, error = %e, "rebuilding commit from unexpected state");
        }

        if let Err(e) = self.repo.ensure_checkout(project).await {
            tracing::warn!(slug = %project.slug, error = %e, "repository unavailable");
            return ProjectReport::new(project, CycleOutcome::Unavailable(e));
        }

        let info = CommitInfo {
            sha: existing.sha.clone(),
            date: existing.date,
            message: existing.message.clone(),
            author: existing.author.clone(),
        };
        if let Err(e) = self.storage.restart(&project.slug, &info, Utc::now()).await {
            tracing::error!(slug = %project.slug, sha, error = %e, "failed to reset commit for rebuild");
            return ProjectReport::new(project, CycleOutcome::Storage(e));
        }

        tracing::info!(slug = %project.slug, sha, "rebuilding commit");
        let record = self.build_commit(project, &info).await;
        ProjectReport::new(project, CycleOutcome::Built(vec![record]))
    }

    /// Check out, build and finalize one commit whose row is already `building`.
    async fn build_commit(&self, project: &Project, info: &CommitInfo) -> BuildRecord {
        let (event, output) = self.execute(project, &info.sha).await;
        let status = match transition(CommitStatus::Building, event) {
            Ok(status) => status,
            Err(e) => {
                tracing::error!(slug = %project.slug, sha = %info.sha, error = %e, "unexpected build event");
                CommitStatus::Failed
            }
        };

        tracing::info!(
            slug = %project.slug,
            sha = %info.sha,
            status = %status,
            "build finished"
        );

        let persisted = self.persist(project, &info.sha, status, output).await;
        BuildRecord {
            sha: info.sha.clone(),
            status,
            persisted,
        }
    }

    /// Run the build for `sha` in the project's working directory.
    async fn execute(&self, project: &Project, sha: &str) -> (BuildEvent, Vec<u8>) {
        if let Err(e) = self.repo.checkout_at(project, sha).await {
            tracing::warn!(slug = %project.slug, sha, error = %e, "checkout failed");
            let output = format!("[vigil] checkout of {} failed: {}\n", sha, e);
            return (BuildEvent::CheckoutFailed, output.into_bytes());
        }

        let working_dir = self.repo.working_dir(project);
        match self
            .runner
            .run(&project.command, &working_dir, self.timeout)
            .await
        {
            Ok(run) if run.timed_out => (BuildEvent::TimedOut, run.output),
            Ok(run) => (BuildEvent::Exited(run.exit_code), run.output),
            Err(e) => {
                tracing::warn!(slug = %project.slug, sha, error = %e, "build command could not start");
                let output = format!("[vigil] failed to start build command: {}\n", e);
                (BuildEvent::SpawnFailed, output.into_bytes())
            }
        }
    }

    /// Write the final status, retrying transient storage failures.
    async fn persist(
        &self,
        project: &Project,
        sha: &str,
        status: CommitStatus,
        output: Vec<u8>,
    ) -> bool {
        let attempts = self.retry.attempts.max(1);
        for attempt in 1..=attempts {
            match self
                .storage
                .finalize(&project.slug, sha, status, output.clone())
                .await
            {
                Ok(()) => return true,
                Err(e @ StorageError::MissingRow { .. }) => {
                    tracing::error!(slug = %project.slug, sha, error = %e, "building row vanished");
                    break;
                }
                Err(e) if attempt < attempts => {
                    tracing::warn!(slug = %project.slug, sha, attempt, error = %e, "failed to persist build result, retrying");
                    tokio::time::sleep(self.retry.backoff * attempt).await;
                }
                Err(e) => {
                    tracing::warn!(slug = %project.slug, sha, attempt, error = %e, "failed to persist build result");
                }
            }
        }

        tracing::error!(
            slug = %project.slug,
            sha,
            status = %status,
            output_bytes = output.len(),
            output = %String::from_utf8_lossy(&output),
            "build result unpersisted"
        );
        false
    }
}

/// `now`, nudged forward so build dates within a cycle strictly increase.
fn next_build_date(previous: Option<DateTime<Utc>>) -> DateTime<Utc> {
    let now = Utc::now();
    match previous {
        Some(prev) if now <= prev => prev + chrono::Duration::microseconds(1),
        _ => now,
    }
}
