//! Build and watch commands.

use std::time::Duration;

use anyhow::Result;
use vigil::config::GitCheck;
use vigil::coordinator::Coordinator;
use vigil::model::short_sha;
use vigil::orchestrator::{CycleOutcome, ProjectReport};

use super::super::Cli;
use super::{open_coordinator, styled_status};

pub async fn cmd_build(cli: &Cli, slug: Option<&str>, force: Option<&str>) -> Result<()> {
    let coordinator = open_coordinator(cli, GitCheck::Require).await?;

    let reports = match (slug, force) {
        (Some(slug), Some(sha)) => vec![coordinator.rebuild(slug, sha).await?],
        (Some(slug), None) => vec![coordinator.build(slug).await?],
        (None, _) => coordinator.run_cycle().await,
    };

    print_reports(&coordinator, &reports);

    let failed = reports.iter().filter(|r| r.is_failure()).count();
    if failed > 0 {
        anyhow::bail!("{} project(s) could not be built", failed);
    }
    Ok(())
}

pub async fn cmd_watch(cli: &Cli, interval: u64) -> Result<()> {
    let coordinator = open_coordinator(cli, GitCheck::Require).await?;
    let interval = Duration::from_secs(interval.max(1));

    // Ctrl-C is only honoured between cycles so no build is cut short.
    let (stop_tx, mut stop_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = stop_tx.send(true);
        }
    });

    println!(
        "{} {} project(s) every {}s, Ctrl-C to stop",
        console::style("Watching").bold().cyan(),
        coordinator.list_projects().len(),
        interval.as_secs()
    );

    loop {
        let reports = coordinator.run_cycle().await;
        print_reports(&coordinator, &reports);

        if *stop_rx.borrow() {
            break;
        }
        tokio::select! {
            _ = stop_rx.changed() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }

    println!("{}", console::style("Stopped.").yellow());
    Ok(())
}

fn print_reports(coordinator: &Coordinator, reports: &[ProjectReport]) {
    for report in reports {
        let slug = console::style(&report.slug).bold();
        match &report.outcome {
            CycleOutcome::Skipped => {
                println!("{}: {}", slug, console::style("build in progress, skipped").yellow())
            }
            CycleOutcome::UpToDate => println!("{}: {}", slug, console::style("up to date").dim()),
            CycleOutcome::Built(records) => {
                println!("{}: {} commit(s)", slug, records.len());
                for record in records {
                    let url = coordinator
                        .get_project(&report.slug)
                        .ok()
                        .and_then(|p| p.commit_url(&record.sha))
                        .unwrap_or_default();
                    let unsaved = if record.persisted {
                        String::new()
                    } else {
                        format!(" {}", console::style("(not saved)").red())
                    };
                    println!(
                        "  {} {:<8}{} {}",
                        short_sha(&record.sha),
                        styled_status(record.status),
                        unsaved,
                        console::style(url).dim()
                    );
                }
            }
            CycleOutcome::Unavailable(e) => {
                println!("{}: {} {}", slug, console::style("unavailable:").red().bold(), e)
            }
            CycleOutcome::Storage(e) => {
                println!("{}: {} {}", slug, console::style("storage error:").red().bold(), e)
            }
            CycleOutcome::NotRecorded(sha) => println!(
                "{}: {} commit {} has never been built",
                slug,
                console::style("Error:").red().bold(),
                sha
            ),
        }
    }
}
