//! Try job integrator CLI.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;
mod git;

#[derive(Parser)]
#[command(name = "tryjobs")]
#[command(about = "Try job integrator for the remote build service", long_about = None)]
struct Cli {
    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the integrator loops until interrupted
    Run {
        /// Path to the configuration file
        #[arg(long, default_value = "tryjobs.kdl")]
        config: PathBuf,
        /// Overrides `database-url` from the configuration
        #[arg(long, env = "DATABASE_URL")]
        database_url: Option<String>,
        /// OAuth token sent to the remote build service and Pub/Sub
        #[arg(long, env = "TRYJOBS_ACCESS_TOKEN", hide_env_values = true)]
        access_token: Option<String>,
    },
    /// Validate a configuration file
    Validate {
        /// Path to the configuration file
        #[arg(default_value = "tryjobs.kdl")]
        path: PathBuf,
    },
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    match cli.command {
        Commands::Run {
            config,
            database_url,
            access_token,
        } => {
            commands::run(&config, database_url, access_token).await?;
        }
        Commands::Validate { path } => {
            commands::validate(&path)?;
        }
    }

    Ok(())
}
