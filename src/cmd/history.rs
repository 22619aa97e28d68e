//! Read-only views over recorded builds.

use std::io::Write;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use vigil::config::GitCheck;
use vigil::model::{Commit, CommitStatus, Project, SortOrder};

use super::super::Cli;
use super::{open_coordinator, styled_status};

pub async fn cmd_projects(cli: &Cli) -> Result<()> {
    let coordinator = open_coordinator(cli, GitCheck::Skip).await?;
    let statuses = coordinator.latest_statuses().await?;

    println!();
    println!("{:<20} {:<24} {:<16} {:<8} Commit", "Slug", "Name", "Branch", "Status");
    println!(
        "{:<20} {:<24} {:<16} {:<8} -------",
        "--------------------", "------------------------", "----------------", "--------"
    );
    for (project, latest) in statuses {
        match latest {
            Some(commit) => println!(
                "{:<20} {:<24} {:<16} {:<8} {}",
                project.slug,
                project.name,
                project.branch,
                styled_status(commit.status),
                commit.short_sha()
            ),
            None => println!(
                "{:<20} {:<24} {:<16} {:<8}",
                project.slug,
                project.name,
                project.branch,
                console::style("never").dim()
            ),
        }
    }
    println!();
    Ok(())
}

pub async fn cmd_commits(
    cli: &Cli,
    slug: &str,
    limit: Option<usize>,
    asc: bool,
    json: bool,
) -> Result<()> {
    let coordinator = open_coordinator(cli, GitCheck::Skip).await?;
    let project = coordinator.get_project(slug)?.clone();
    let order = if asc {
        SortOrder::Ascending
    } else {
        SortOrder::Descending
    };
    let commits = coordinator.commits(slug, limit, order).await?;

    if json {
        let rows: Vec<_> = commits.iter().map(|c| CommitView::new(&project, c)).collect();
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    if commits.is_empty() {
        println!("No builds recorded for {}.", slug);
        return Ok(());
    }
    for commit in &commits {
        println!(
            "{} {:<8} {} {}",
            commit.short_sha(),
            styled_status(commit.status),
            console::style(commit.build_date.format("%Y-%m-%d %H:%M:%S")).dim(),
            commit.title()
        );
    }
    Ok(())
}

pub async fn cmd_status(cli: &Cli, slug: Option<&str>, json: bool) -> Result<()> {
    let coordinator = open_coordinator(cli, GitCheck::Skip).await?;
    let statuses: Vec<(Project, Option<Commit>)> = match slug {
        Some(slug) => {
            let project = coordinator.get_project(slug)?.clone();
            let latest = coordinator.latest_status(slug).await?;
            vec![(project, latest)]
        }
        None => coordinator
            .latest_statuses()
            .await?
            .into_iter()
            .map(|(p, c)| (p.clone(), c))
            .collect(),
    };

    if json {
        let rows: Vec<_> = statuses
            .iter()
            .map(|(project, latest)| StatusView {
                slug: &project.slug,
                name: &project.name,
                latest: latest.as_ref().map(|c| CommitView::new(project, c)),
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    for (project, latest) in &statuses {
        match latest {
            Some(commit) => {
                println!(
                    "{} {} {} {}",
                    console::style(&project.slug).bold(),
                    styled_status(commit.status),
                    commit.short_sha(),
                    commit.title()
                );
                println!("  by {} at {}", commit.author, commit.build_date.to_rfc3339());
                if let Some(url) = project.commit_url(&commit.sha) {
                    println!("  {}", console::style(url).dim());
                }
            }
            None => println!(
                "{} {}",
                console::style(&project.slug).bold(),
                console::style("no builds yet").dim()
            ),
        }
    }
    Ok(())
}

pub async fn cmd_output(cli: &Cli, slug: &str, sha: Option<&str>) -> Result<()> {
    let coordinator = open_coordinator(cli, GitCheck::Skip).await?;
    let commit = match sha {
        Some(sha) => coordinator.commit(slug, sha).await?,
        None => coordinator.latest_status(slug).await?,
    };
    let Some(commit) = commit else {
        anyhow::bail!("No build recorded for {}{}", slug, sha.map(|s| format!(" at {}", s)).unwrap_or_default());
    };

    let mut stdout = std::io::stdout().lock();
    stdout
        .write_all(&commit.output)
        .context("Failed to write build output")?;
    stdout.flush()?;
    Ok(())
}

#[derive(Serialize)]
struct CommitView<'a> {
    sha: &'a str,
    status: CommitStatus,
    date: DateTime<Utc>,
    build_date: DateTime<Utc>,
    author: &'a str,
    message: &'a str,
    url: Option<String>,
}

impl<'a> CommitView<'a> {
    fn new(project: &Project, commit: &'a Commit) -> Self {
        Self {
            sha: &commit.sha,
            status: commit.status,
            date: commit.date,
            build_date: commit.build_date,
            author: &commit.author,
            message: &commit.message,
            url: project.commit_url(&commit.sha),
        }
    }
}

#[derive(Serialize)]
struct StatusView<'a> {
    slug: &'a str,
    name: &'a str,
    latest: Option<CommitView<'a>>,
}
