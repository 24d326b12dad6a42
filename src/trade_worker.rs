use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tokio::runtime::Builder;
use tracing::{error, info};

use signal_trader::config::MasterConfig;
use signal_trader::error::WorkerError;
use signal_trader::logging::audit_logger::AuditLogger;
use signal_trader::logging::init_tracing;
use signal_trader::store::{LockGuard, Store};
use signal_trader::worker::{run_worker, WorkerContext};

const FATAL_EXIT_CODE: u8 = 255;

#[derive(Parser, Debug)]
#[command(name = "trade_worker")]
#[command(about = "Process the pending commands of one bot")]
struct Args {
    /// Bot id whose commands are processed
    bot_id: String,

    /// Only log warnings and errors
    #[arg(long)]
    silent: bool,

    /// Master config path (default: $SIGNAL_TRADER_CONFIG or master.yaml)
    #[arg(long)]
    config: Option<PathBuf>,
}

async fn run(master: MasterConfig, bot_id: &str) -> Result<(), WorkerError> {
    let store = Store::open(&master.db_path)?;
    let (audit, audit_writer) = AuditLogger::from_config(master.audit_log_enabled, &master.log_dir);
    let lock = LockGuard::adopt(store.clone(), bot_id, master.lock_lease());
    let ctx = WorkerContext {
        master,
        store,
        audit,
    };

    let result = run_worker(&ctx, lock).await;
    drop(ctx);
    audit_writer.finish().await;
    result.map(|_| ())
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(if args.silent {
        "signal_trader=warn"
    } else {
        "signal_trader=info"
    });

    let config_path = args.config.unwrap_or_else(MasterConfig::path_from_env);
    let master = match MasterConfig::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            return ExitCode::from(FATAL_EXIT_CODE);
        }
    };

    let runtime = match Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to build tokio runtime: {}", e);
            return ExitCode::from(FATAL_EXIT_CODE);
        }
    };

    match runtime.block_on(run(master, &args.bot_id)) {
        Ok(()) => {
            info!("Worker for bot {} finished", args.bot_id);
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Worker for bot {} stopped: {}", args.bot_id, e);
            ExitCode::from(e.exit_code())
        }
    }
}
