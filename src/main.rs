use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "kanban-relay")]
#[command(version, about = "Command supervisor and live-update relay for the kanban issue board")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Path to the relay configuration file
    #[arg(long, global = true, default_value = kanban_relay::relay_config::DEFAULT_CONFIG_FILE)]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the command supervisor, file watcher and live server
    Serve {
        /// Port for HTTP and the /ws live channel (overrides relay.toml)
        #[arg(short, long)]
        port: Option<u16>,
        /// Directory to watch for issue store changes
        #[arg(long)]
        watch_dir: Option<PathBuf>,
        /// Issue tracker binary to supervise
        #[arg(long)]
        binary: Option<String>,
        /// Do not watch the issue store directory
        #[arg(long)]
        no_watch: bool,
    },
    /// Print every envelope received from a live server as one JSON line
    Tail {
        /// Live channel URL (defaults to the configured server)
        #[arg(long)]
        url: Option<String>,
        /// Only print envelopes of this type (repeatable)
        #[arg(long = "type")]
        kinds: Vec<String>,
    },
    /// View, validate or create relay.toml
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Validate the configuration file
    Validate,
    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    kanban_relay::telemetry::init_logging(cli.verbose, cli.log_json);

    match &cli.command {
        Commands::Serve {
            port,
            watch_dir,
            binary,
            no_watch,
        } => {
            cmd::cmd_serve(
                &cli.config,
                cmd::ServeOptions {
                    port: *port,
                    watch_dir: watch_dir.clone(),
                    binary: binary.clone(),
                    no_watch: *no_watch,
                },
            )
            .await?
        }
        Commands::Tail { url, kinds } => cmd::cmd_tail(&cli.config, url.as_deref(), kinds).await?,
        Commands::Config { command } => cmd::cmd_config(&cli.config, command.clone())?,
    }

    Ok(())
}
