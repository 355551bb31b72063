//! Backup agent entry point.

use anyhow::Result;
use clap::{Parser, Subcommand};
use dbbackup_agent::{agent::Agent, config::Config, utils};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(
        short,
        long,
        value_name = "FILE",
        global = true,
        default_value = "/etc/dbbackup-agent/config.toml"
    )]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the agent daemon
    Start,
    /// Ask the dispatcher to schedule a backup of this host
    Backup,
    /// Execute one job order in this process (spawned by the daemon)
    #[command(hide = true)]
    RunJob {
        /// Job order as received from the dispatcher, JSON
        order: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = Config::from_file(&args.config)?;
    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    utils::logger::init(log_level)?;

    tracing::info!(
        "Starting dbbackup-agent v{} (server_id: {})",
        env!("CARGO_PKG_VERSION"),
        config.agent.server_id
    );

    let agent = Agent::new(config, args.config);
    match args.command {
        Command::Start => agent.run().await,
        Command::Backup => agent.schedule_backup().await,
        Command::RunJob { order } => {
            let ret_code = agent.run_job(&order).await;
            std::process::exit(if ret_code == 0 { 0 } else { 1 });
        }
    }
}
