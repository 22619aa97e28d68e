//! Version-control access for project working directories.
//!
//! Network and working-tree operations (clone, fetch, checkout, clean) shell
//! out to the configured git binary so that credentials, ssh config and any
//! extra arguments behave exactly as they do for the user. History is read
//! with `git2` from the local clone once it is up to date.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use git2::{Oid, Repository as GitRepo, Sort};
use tokio::process::Command;

use crate::errors::VcsError;
use crate::model::{CommitInfo, Project};

/// Capability interface over one remote repository per project and its
/// single shared working directory.
#[async_trait]
pub trait Repository: Send + Sync {
    /// Local working directory used for builds of `project`.
    fn working_dir(&self, project: &Project) -> PathBuf;

    /// Clone the repository if the working directory is absent, otherwise
    /// fetch the watched branch.
    async fn ensure_checkout(&self, project: &Project) -> Result<(), VcsError>;

    /// Commits on the watched branch whose sha is not in `known`, oldest first.
    async fn list_new_commits(
        &self,
        project: &Project,
        known: &HashSet<String>,
    ) -> Result<Vec<CommitInfo>, VcsError>;

    /// Force the working directory to exactly match `sha`.
    async fn checkout_at(&self, project: &Project, sha: &str) -> Result<(), VcsError>;
}

/// `Repository` backed by the git command line and libgit2.
pub struct GitRepository {
    build_dir: PathBuf,
    git_path: String,
    git_args: Vec<String>,
}

impl GitRepository {
    pub fn new(build_dir: impl Into<PathBuf>, git_path: impl Into<String>, git_args: Vec<String>) -> Self {
        Self {
            build_dir: build_dir.into(),
            git_path: git_path.into(),
            git_args,
        }
    }

    fn remote_ref(branch: &str) -> String {
        format!("refs/remotes/origin/{}", branch)
    }

    /// Run git with the configured global arguments. Returns stderr on failure.
    async fn git(
        &self,
        project: &Project,
        operation: &'static str,
        cwd: &Path,
        args: &[&str],
    ) -> Result<(), VcsError> {
        tracing::debug!(slug = %project.slug, operation, ?args, "running git");
        let output = Command::new(&self.git_path)
            .args(&self.git_args)
            .args(args)
            .current_dir(cwd)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(VcsError::Io)?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(VcsError::Unavailable {
                slug: project.slug.clone(),
                operation,
                message: stderr.trim().to_string(),
            });
        }
        Ok(())
    }

    async fn clone_fresh(&self, project: &Project, dir: &Path) -> Result<(), VcsError> {
        std::fs::create_dir_all(&self.build_dir).map_err(VcsError::Io)?;
        let dir_str = dir.to_string_lossy();
        self.git(
            project,
            "clone",
            &self.build_dir,
            &[
                "clone",
                "--quiet",
                "--no-checkout",
                "--branch",
                &project.branch,
                &project.repository,
                &dir_str,
            ],
        )
        .await
    }
}

#[async_trait]
impl Repository for GitRepository {
    fn working_dir(&self, project: &Project) -> PathBuf {
        self.build_dir.join(&project.slug)
    }

    async fn ensure_checkout(&self, project: &Project) -> Result<(), VcsError> {
        let dir = self.working_dir(project);

        if dir.exists() && GitRepo::open(&dir).is_err() {
            tracing::warn!(slug = %project.slug, dir = %dir.display(), "working directory is not a git repository, recloning");
            std::fs::remove_dir_all(&dir).map_err(VcsError::Io)?;
        }

        if !dir.exists() {
            tracing::info!(slug = %project.slug, repository = %project.repository, "cloning");
            return self.clone_fresh(project, &dir).await;
        }

        // The configured repository may have moved since the clone.
        self.git(
            project,
            "remote",
            &dir,
            &["remote", "set-url", "origin", &project.repository],
        )
        .await?;

        // Forced refspec so rewritten history replaces the remote-tracking ref.
        let refspec = format!(
            "+refs/heads/{}:{}",
            project.branch,
            Self::remote_ref(&project.branch)
        );
        self.git(
            project,
            "fetch",
            &dir,
            &["fetch", "--quiet", "--force", "origin", &refspec],
        )
        .await
    }

    async fn list_new_commits(
        &self,
        project: &Project,
        known: &HashSet<String>,
    ) -> Result<Vec<CommitInfo>, VcsError> {
        let dir = self.working_dir(project);
        let slug = project.slug.clone();
        let branch = project.branch.clone();
        let known = known.clone();

        tokio::task::spawn_blocking(move || walk_new_commits(&dir, &slug, &branch, &known))
            .await
            .map_err(|e| VcsError::Unavailable {
                slug: project.slug.clone(),
                operation: "log",
                message: format!("history walk panicked: {}", e),
            })?
    }

    async fn checkout_at(&self, project: &Project, sha: &str) -> Result<(), VcsError> {
        let dir = self.working_dir(project);

        let resolves = {
            let repo = GitRepo::open(&dir).map_err(|e| git2_unavailable(project, "open", e))?;
            Oid::from_str(sha)
                .ok()
                .and_then(|oid| repo.find_commit(oid).ok())
                .is_some()
        };
        if !resolves {
            return Err(VcsError::UnknownCommit {
                slug: project.slug.clone(),
                sha: sha.to_string(),
            });
        }

        self.git(
            project,
            "checkout",
            &dir,
            &["checkout", "--quiet", "--force", "--detach", sha],
        )
        .await?;
        self.git(project, "clean", &dir, &["clean", "-ffdxq"]).await
    }
}

fn git2_unavailable(project: &Project, operation: &'static str, err: git2::Error) -> VcsError {
    VcsError::Unavailable {
        slug: project.slug.clone(),
        operation,
        message: err.message().to_string(),
    }
}

/// Walk everything reachable from the remote-tracking branch, oldest first,
/// keeping commits that were never recorded. Rewritten history is handled
/// naturally: shas that disappeared are simply no longer reachable.
fn walk_new_commits(
    dir: &Path,
    slug: &str,
    branch: &str,
    known: &HashSet<String>,
) -> Result<Vec<CommitInfo>, VcsError> {
    let unavailable = |operation: &'static str, e: git2::Error| VcsError::Unavailable {
        slug: slug.to_string(),
        operation,
        message: e.message().to_string(),
    };

    let repo = GitRepo::open(dir).map_err(|e| unavailable("open", e))?;
    let tip = repo
        .refname_to_id(&GitRepository::remote_ref(branch))
        .map_err(|_| VcsError::BranchNotFound {
            slug: slug.to_string(),
            branch: branch.to_string(),
        })?;

    let mut walk = repo.revwalk().map_err(|e| unavailable("log", e))?;
    walk.set_sorting(Sort::TOPOLOGICAL | Sort::TIME | Sort::REVERSE)
        .map_err(|e| unavailable("log", e))?;
    walk.push(tip).map_err(|e| unavailable("log", e))?;

    let mut commits = Vec::new();
    for oid in walk {
        let oid = oid.map_err(|e| unavailable("log", e))?;
        let sha = oid.to_string();
        if known.contains(&sha) {
            continue;
        }
        let commit = repo.find_commit(oid).map_err(|e| unavailable("log", e))?;
        let author = commit.author();
        commits.push(CommitInfo {
            sha,
            date: DateTime::<Utc>::from_timestamp(commit.time().seconds(), 0).unwrap_or_default(),
            message: String::from_utf8_lossy(commit.message_bytes()).trim_end().to_string(),
            author: format!(
                "{} <{}>",
                String::from_utf8_lossy(author.name_bytes()),
                String::from_utf8_lossy(author.email_bytes())
            ),
        });
    }
    Ok(commits)
}
