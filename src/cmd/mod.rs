//! CLI command implementations.
//!
//! | Module    | Commands handled                          |
//! |-----------|-------------------------------------------|
//! | `build`   | `Build`, `Watch`                          |
//! | `history` | `Projects`, `Commits`, `Status`, `Output` |
//! | `forget`  | `Forget`                                  |

pub mod build;
pub mod forget;
pub mod history;

pub use build::{cmd_build, cmd_watch};
pub use forget::cmd_forget;
pub use history::{cmd_commits, cmd_output, cmd_projects, cmd_status};

use std::sync::Arc;

use anyhow::{Context, Result};
use vigil::config::{Config, GitCheck, Paths};
use vigil::coordinator::Coordinator;
use vigil::model::CommitStatus;
use vigil::orchestrator::Orchestrator;
use vigil::process::ShellRunner;
use vigil::repo::GitRepository;
use vigil::storage::Storage;

use super::Cli;

/// Load configuration and wire up storage, the orchestrator and the registry.
///
/// Any configuration problem is returned before a single project is touched.
pub(crate) async fn open_coordinator(cli: &Cli, git_check: GitCheck) -> Result<Coordinator> {
    let paths = Paths::resolve(cli.config.clone(), cli.data_dir.clone());
    let config = Config::load_with(&paths.config_file, git_check)?;

    let build_dir = paths.build_dir();
    std::fs::create_dir_all(&build_dir)
        .with_context(|| format!("Failed to create data directory {}", build_dir.display()))?;
    let db_path = paths.db_path();
    let storage = Storage::open(&db_path)
        .with_context(|| format!("Failed to open build database {}", db_path.display()))?;

    let repo = Arc::new(GitRepository::new(
        build_dir,
        config.git.path.clone(),
        config.git.args.clone(),
    ));
    let runner = Arc::new(ShellRunner::new(config.build.shell.clone()));
    let orchestrator = Arc::new(Orchestrator::new(
        storage.clone(),
        repo,
        runner,
        config.build.timeout(),
    ));

    let coordinator = Coordinator::new(config.projects, orchestrator, storage)?;
    coordinator
        .sync_projects()
        .await
        .context("Failed to register projects")?;
    tracing::debug!(
        config = %paths.config_file.display(),
        data = %paths.data_dir.display(),
        "coordinator ready"
    );
    Ok(coordinator)
}

pub(crate) fn styled_status(status: CommitStatus) -> console::StyledObject<&'static str> {
    let label = console::style(status.as_str());
    match status {
        CommitStatus::Passed => label.green(),
        CommitStatus::Failed => label.red().bold(),
        CommitStatus::Building => label.yellow(),
        CommitStatus::Unknown => label.dim(),
    }
}
