use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use propyield::config::{AppConfig, DEFAULT_DATA_DIR};
use propyield::logging::{self, LogFormat};

mod cmd;

#[derive(Parser)]
#[command(name = "propyield")]
#[command(version, about = "Find the earning assets of a property and route owners to partners")]
pub struct Cli {
    /// Directory holding propyield.toml and the default database
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Only log errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Log output format on stderr
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Pretty)]
    pub log_format: LogFormat,

    /// Also write JSON logs to a daily rolling file in this directory
    #[arg(long, global = true)]
    pub log_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the HTTP API and WebSocket feed
    Serve {
        /// Port to serve on (overrides [server].port)
        #[arg(short, long)]
        port: Option<u16>,

        /// Database path (overrides [server].db_path)
        #[arg(long)]
        db_path: Option<PathBuf>,

        /// Enable dev mode (permissive CORS, bind on all interfaces)
        #[arg(long)]
        dev: bool,
    },
    /// Create the database and its tables
    InitDb,
    /// Reconcile the built-in partner catalog into the database
    SyncPartners,
    /// Analyse an address and print the report without saving it
    Analyze {
        address: String,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Initialize a default propyield.toml file
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let _log_guard = logging::init(cli.quiet, cli.verbose, cli.log_format, cli.log_dir.as_deref())?;

    let data_dir = cli
        .data_dir
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR));

    match &cli.command {
        Commands::Config { command } => cmd::cmd_config(&data_dir, command.clone())?,
        Commands::Serve { port, db_path, dev } => {
            let config = AppConfig::new(data_dir)?;
            cmd::cmd_serve(config, *port, db_path.clone(), *dev).await?;
        }
        Commands::InitDb => cmd::cmd_init_db(&AppConfig::new(data_dir)?)?,
        Commands::SyncPartners => cmd::cmd_sync_partners(&AppConfig::new(data_dir)?)?,
        Commands::Analyze { address, json } => {
            cmd::cmd_analyze(&AppConfig::new(data_dir)?, address, *json).await?
        }
    }

    Ok(())
}
