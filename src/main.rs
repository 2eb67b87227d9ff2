use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use dockhand::config::{DEFAULT_CONFIG_FILE, LogFormat};

mod cmd;

#[derive(Parser)]
#[command(name = "dockhand")]
#[command(version, about = "Push-to-deploy: build and run pushed branches behind a reverse proxy")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to the configuration file
    #[arg(long, global = true, env = "DOCKHAND_CONFIG", default_value = DEFAULT_CONFIG_FILE)]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the webhook server and deployment pipeline
    Serve {
        /// Port to listen on (overrides config and PORT)
        #[arg(short, long)]
        port: Option<u16>,

        /// Enable dev mode (CORS permissive)
        #[arg(long)]
        dev: bool,

        /// Log output format
        #[arg(long, value_enum)]
        log_format: Option<LogFormat>,
    },
    /// Detect a checkout's project type and Dockerfile status
    Detect {
        /// Project directory
        path: PathBuf,

        /// Print the Dockerfile that would be generated
        #[arg(long)]
        dockerfile: bool,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Write a default dockhand.toml
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Commands::Serve {
            port,
            dev,
            log_format,
        } => {
            cmd::cmd_serve(&cli.config, *port, *dev, *log_format, cli.verbose).await?;
        }
        Commands::Detect { path, dockerfile } => cmd::cmd_detect(path, *dockerfile)?,
        Commands::Config { command } => cmd::cmd_config(&cli.config, command.clone())?,
    }

    Ok(())
}
