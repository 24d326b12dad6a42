use std::path::PathBuf;
use std::process::ExitCode;

use chrono::Utc;
use clap::Parser;
use tracing::{error, info};

use signal_trader::config::MasterConfig;
use signal_trader::logging::init_tracing;
use signal_trader::signal::parse_signal;
use signal_trader::store::Store;

#[derive(Parser, Debug)]
#[command(name = "enqueue")]
#[command(about = "Queue a signal such as 1&2_BTCUSDT_take-profit-long-2_5%")]
struct Args {
    /// Signal payload: botid[&botid...]_PAIR_COMMAND[_PERCENT%]
    payload: String,

    /// Master config path (default: $SIGNAL_TRADER_CONFIG or master.yaml)
    #[arg(long)]
    config: Option<PathBuf>,
}

fn main() -> ExitCode {
    init_tracing("signal_trader=info");
    let args = Args::parse();

    let config_path = args.config.unwrap_or_else(MasterConfig::path_from_env);
    let master = match MasterConfig::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    let commands = match parse_signal(&args.payload, Utc::now()) {
        Ok(commands) => commands,
        Err(e) => {
            error!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    let store = match Store::open(&master.db_path) {
        Ok(store) => store,
        Err(e) => {
            error!("Failed to open database {}: {}", master.db_path, e);
            return ExitCode::FAILURE;
        }
    };

    for command in &commands {
        match store.enqueue(command) {
            Ok(id) => info!(
                "Queued command {}: bot={} pair={} command={} percent={:?}",
                id, command.bot_id, command.pair, command.command, command.percent
            ),
            Err(e) => {
                error!("Failed to queue command for bot {}: {}", command.bot_id, e);
                return ExitCode::FAILURE;
            }
        }
    }
    ExitCode::SUCCESS
}
