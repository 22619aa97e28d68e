//! Project registry and the entry point the CLI talks to.

use std::collections::HashSet;
use std::sync::Arc;

use crate::errors::CoordinatorError;
use crate::model::{Commit, Project, SortOrder};
use crate::orchestrator::{Orchestrator, ProjectReport};
use crate::storage::Storage;

pub struct Coordinator {
    projects: Vec<Project>,
    orchestrator: Arc<Orchestrator>,
    storage: Storage,
}

impl Coordinator {
    /// Register `projects`. Slugs must be unique.
    pub fn new(
        projects: Vec<Project>,
        orchestrator: Arc<Orchestrator>,
        storage: Storage,
    ) -> Result<Self, CoordinatorError> {
        let mut seen = HashSet::new();
        for project in &projects {
            if !seen.insert(project.slug.as_str()) {
                return Err(CoordinatorError::DuplicateSlug {
                    slug: project.slug.clone(),
                });
            }
        }
        Ok(Self {
            projects,
            orchestrator,
            storage,
        })
    }

    /// Write every configured project to storage, updating changed settings.
    pub async fn sync_projects(&self) -> Result<(), CoordinatorError> {
        for project in &self.projects {
            self.storage.upsert_project(project).await?;
        }
        tracing::debug!(count = self.projects.len(), "projects synced");
        Ok(())
    }

    pub fn list_projects(&self) -> &[Project] {
        &self.projects
    }

    pub fn get_project(&self, slug: &str) -> Result<&Project, CoordinatorError> {
        self.projects
            .iter()
            .find(|p| p.slug == slug)
            .ok_or_else(|| CoordinatorError::NotFound {
                slug: slug.to_string(),
            })
    }

    /// One orchestration cycle over every registered project.
    pub async fn run_cycle(&self) -> Vec<ProjectReport> {
        self.orchestrator.run_cycle(&self.projects).await
    }

    /// One cycle for a single project.
    pub async fn build(&self, slug: &str) -> Result<ProjectReport, CoordinatorError> {
        let project = self.get_project(slug)?;
        Ok(self.orchestrator.run_project(project).await)
    }

    pub async fn rebuild(&self, slug: &str, sha: &str) -> Result<ProjectReport, CoordinatorError> {
        let project = self.get_project(slug)?;
        Ok(self.orchestrator.rebuild(project, sha).await)
    }

    pub async fn commits(
        &self,
        slug: &str,
        limit: Option<usize>,
        order: SortOrder,
    ) -> Result<Vec<Commit>, CoordinatorError> {
        self.get_project(slug)?;
        Ok(self.storage.list_commits(slug, limit, order).await?)
    }

    pub async fn commit(&self, slug: &str, sha: &str) -> Result<Option<Commit>, CoordinatorError> {
        self.get_project(slug)?;
        Ok(self.storage.get_commit(slug, sha).await?)
    }

    /// Most recently built commit for a project, if any.
    pub async fn latest_status(&self, slug: &str) -> Result<Option<Commit>, CoordinatorError> {
        self.get_project(slug)?;
        Ok(self.storage.latest_commit(slug).await?)
    }

    pub async fn latest_statuses(
        &self,
    ) -> Result<Vec<(&Project, Option<Commit>)>, CoordinatorError> {
        let mut statuses = Vec::with_capacity(self.projects.len());
        for project in &self.projects {
            let latest = self.storage.latest_commit(&project.slug).await?;
            statuses.push((project, latest));
        }
        Ok(statuses)
    }

    /// Drop a project and its stored history, returning the removed project
    /// as it was stored. `None` when nothing was stored under `slug`.
    ///
    /// Works for slugs no longer in the configuration, so stale history can be removed.
    pub async fn forget(&self, slug: &str) -> Result<Option<Project>, CoordinatorError> {
        let Some(stored) = self.storage.get_project(slug).await? else {
            return Ok(None);
        };
        self.storage.delete_project(slug).await?;
        tracing::info!(slug, "project forgotten");
        Ok(Some(stored))
    }
}
