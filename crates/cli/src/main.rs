//! contextloop CLI: the main entry point.
//!
//! Commands:
//! - `chat`: Answer one message or run an interactive session
//! - `extract`: Run long-term memory extraction over a transcript
//! - `config`: Print the default configuration

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(
    name = "contextloop",
    about = "contextloop: memory-aware, tool-calling chat",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    log_json: bool,

    /// Config file (defaults to ~/.contextloop/config.toml)
    #[arg(short, long, global = true, env = "CONTEXTLOOP_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Chat with the agent
    Chat {
        /// Session id; turns and long-term memory are kept per session
        #[arg(short, long, default_value = "default")]
        session: String,

        /// Send a single message instead of entering interactive mode
        #[arg(short, long)]
        message: Option<String>,

        /// Print the agent trace after each answer
        #[arg(long)]
        trace: bool,
    },

    /// Extract long-term memory from a transcript
    Extract {
        #[arg(short, long, default_value = "default")]
        session: String,

        /// Transcript file with one `role: content` line per turn
        #[arg(short, long)]
        transcript: PathBuf,

        /// Re-read every turn instead of only new ones
        #[arg(long)]
        full: bool,
    },

    /// Print the default configuration
    Config,
}

fn init_tracing(verbose: bool, json: bool) {
    let default = if verbose { "contextloop=debug" } else { "contextloop=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
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
    init_tracing(cli.verbose, cli.log_json);

    match cli.command {
        Commands::Chat { session, message, trace } => {
            commands::chat::run(cli.config.as_deref(), &session, message, trace).await?
        }
        Commands::Extract {
            session,
            transcript,
            full,
        } => commands::extract::run(cli.config.as_deref(), &session, &transcript, full).await?,
        Commands::Config => commands::config_cmd::show(),
    }

    Ok(())
}
