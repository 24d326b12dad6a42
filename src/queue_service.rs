use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::runtime::Builder;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use signal_trader::config::MasterConfig;
use signal_trader::logging::audit_logger::AuditLogger;
use signal_trader::logging::{init_tracing, shutdown_signal};
use signal_trader::scheduler::{Scheduler, SchedulerSettings, WorkerDispatch};
use signal_trader::store::Store;
use signal_trader::worker::WorkerContext;

const AUDIT_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(name = "queue_service")]
#[command(about = "Dispatch queued commands to one trade worker per bot")]
struct Args {
    /// Master config path (default: $SIGNAL_TRADER_CONFIG or master.yaml)
    #[arg(long)]
    config: Option<PathBuf>,
}

async fn run(master: MasterConfig) -> ExitCode {
    let store = match Store::open(&master.db_path) {
        Ok(store) => store,
        Err(e) => {
            error!("Failed to open database {}: {}", master.db_path, e);
            return ExitCode::FAILURE;
        }
    };

    let (audit, audit_writer) = AuditLogger::from_config(master.audit_log_enabled, &master.log_dir);
    let settings = SchedulerSettings {
        poll_interval: master.poll_interval(),
        lock_lease: master.lock_lease(),
    };
    let ctx = Arc::new(WorkerContext {
        master,
        store: store.clone(),
        audit,
    });
    let scheduler = Scheduler::new(store, WorkerDispatch::new(ctx), settings);

    let token = CancellationToken::new();
    tokio::spawn(shutdown_signal(token.clone()));

    info!("QueueService running... press Ctrl+C to stop");
    scheduler.run(token).await;

    if tokio::time::timeout(AUDIT_FLUSH_TIMEOUT, audit_writer.finish())
        .await
        .is_err()
    {
        warn!("Workers still running, audit log not fully flushed");
    }
    info!("Bye!");
    ExitCode::SUCCESS
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
    info!("Config loaded: {:?}", master);

    let runtime = match Builder::new_multi_thread().worker_threads(4).enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to build tokio runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };
    runtime.block_on(run(master))
}
