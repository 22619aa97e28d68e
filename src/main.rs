use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use vigil::logging::{LogFormat, init_tracing};

mod cmd;

#[derive(Parser)]
#[command(name = "vigil")]
#[command(version, about = "Continuous integration for git repositories")]
pub struct Cli {
    /// Configuration file (defaults to ~/.vigil/config.toml)
    #[arg(long, global = true, env = "VIGIL_CONFIG_PATH")]
    pub config: Option<PathBuf>,

    /// Directory holding the database and working copies (defaults to ~/.vigil/data)
    #[arg(long, global = true, env = "VIGIL_DATA_PATH")]
    pub data_dir: Option<PathBuf>,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Build new commits of every project, or of one project
    Build {
        slug: Option<String>,

        /// Rebuild this sha, overwriting its previous result
        #[arg(long, requires = "slug")]
        force: Option<String>,
    },
    /// Run a build cycle every interval until interrupted
    Watch {
        /// Seconds between cycles
        #[arg(long, default_value = "60")]
        interval: u64,
    },
    /// List configured projects with their latest status
    Projects,
    /// List recorded commits of a project, most recent build first
    Commits {
        slug: String,

        #[arg(short, long)]
        limit: Option<usize>,

        /// Oldest build first
        #[arg(long)]
        asc: bool,

        #[arg(long)]
        json: bool,
    },
    /// Show the latest status of every project, or of one
    Status {
        slug: Option<String>,

        #[arg(long)]
        json: bool,
    },
    /// Print the stored output of a build (latest when no sha is given)
    Output { slug: String, sha: Option<String> },
    /// Delete a project and its recorded commits
    Forget { slug: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let _guard = init_tracing(cli.verbose, cli.log_format);

    match &cli.command {
        Commands::Build { slug, force } => {
            cmd::cmd_build(&cli, slug.as_deref(), force.as_deref()).await?
        }
        Commands::Watch { interval } => cmd::cmd_watch(&cli, *interval).await?,
        Commands::Projects => cmd::cmd_projects(&cli).await?,
        Commands::Commits {
            slug,
            limit,
            asc,
            json,
        } => cmd::cmd_commits(&cli, slug, *limit, *asc, *json).await?,
        Commands::Status { slug, json } => cmd::cmd_status(&cli, slug.as_deref(), *json).await?,
        Commands::Output { slug, sha } => cmd::cmd_output(&cli, slug, sha.as_deref()).await?,
        Commands::Forget { slug } => cmd::cmd_forget(&cli, slug).await?,
    }

    Ok(())
}
