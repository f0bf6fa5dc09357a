//! Parley CLI — the main entry point.
//!
//! Commands:
//! - `serve`   — Start the HTTP gateway
//! - `chat`    — Interactive or single-message chat against a running gateway
//! - `config`  — Print the effective configuration

use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(name = "parley", about = "Parley — tool-augmented streaming conversations", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP gateway server
    Serve {
        /// Override the port
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Chat through a running gateway
    Chat {
        /// Resume an existing thread
        #[arg(long)]
        thread: Option<String>,

        /// Organization scope
        #[arg(long, env = "PARLEY_ORG", default_value = "default")]
        org: String,

        /// User id sent with each turn
        #[arg(long, env = "PARLEY_USER", default_value = "local")]
        user: String,

        /// Send a single message instead of entering interactive mode
        #[arg(short, long)]
        message: Option<String>,
    },

    /// Print the effective configuration (API key redacted)
    Config {
        /// Print the built-in defaults as TOML instead
        #[arg(long)]
        default: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Serve { port } => commands::serve::run(port).await?,
        Commands::Chat {
            thread,
            org,
            user,
            message,
        } => commands::chat::run(thread, org, user, message).await?,
        Commands::Config { default } => commands::config_cmd::run(default)?,
    }

    Ok(())
}
