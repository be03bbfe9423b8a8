//! pushbuild CLI tool.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "pushbuild")]
#[command(about = "pushbuild push synchronization and build CLI", long_about = None)]
struct Cli {
    /// Emit logs as JSON
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a worker configuration
    Validate {
        /// Path to the configuration file
        #[arg(default_value = "pushbuild.kdl")]
        path: PathBuf,
    },
    /// List pushes from the pushlog
    Pushes {
        /// Branch to query
        branch: String,
        /// Only pushes after this changeset
        #[arg(long)]
        after: Option<String>,
        /// Last changeset to include (requires --after)
        #[arg(long)]
        to: Option<String>,
        /// Pushlog base URL
        #[arg(long, default_value = "https://hg.mozilla.org")]
        base_url: url::Url,
    },
    /// Catch up on the configured branches and print pushes as JSON lines
    Watch {
        #[arg(short, long, env = "PUSHBUILD_CONFIG", default_value = "pushbuild.kdl")]
        config: PathBuf,
    },
    /// Build a recorded range of pushes at their original pace
    Replay {
        /// Branch to replay
        branch: String,
        /// Changeset after which to start
        #[arg(long)]
        after: String,
        /// Last changeset (defaults to the tip)
        #[arg(long)]
        to: Option<String>,
        #[arg(short, long, env = "PUSHBUILD_CONFIG", default_value = "pushbuild.kdl")]
        config: PathBuf,
    },
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Commands::Validate { path } => {
            commands::validate(&path)?;
        }
        Commands::Pushes {
            branch,
            after,
            to,
            base_url,
        } => {
            commands::pushes::list(base_url, &branch, after, to).await?;
        }
        Commands::Watch { config } => {
            commands::watch::run(&config).await?;
        }
        Commands::Replay {
            branch,
            after,
            to,
            config,
        } => {
            commands::replay::run(&config, &branch, &after, to.as_deref()).await?;
        }
    }

    Ok(())
}
