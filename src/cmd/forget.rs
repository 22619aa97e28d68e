use anyhow::Result;
use vigil::config::GitCheck;

use super::super::Cli;
use super::open_coordinator;

pub async fn cmd_forget(cli: &Cli, slug: &str) -> Result<()> {
    let coordinator = open_coordinator(cli, GitCheck::Skip).await?;
    match coordinator.forget(slug).await? {
        Some(removed) => {
            println!(
                "Removed {} ({}) and its recorded builds.",
                removed.name, removed.slug
            );
            if coordinator.get_project(slug).is_ok() {
                println!(
                    "{}",
                    console::style("The project is still configured and will be registered again on the next run.").dim()
                );
            }
        }
        None => println!("Nothing recorded for {}.", slug),
    }
    Ok(())
}
