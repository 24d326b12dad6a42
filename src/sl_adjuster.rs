use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio::runtime::Builder;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use signal_trader::config::{load_tier_entries, AdjusterConfig, ConfigError, MasterConfig};
use signal_trader::credentials::CredentialBook;
use signal_trader::logging::audit_logger::AuditLogger;
use signal_trader::logging::{init_tracing, shutdown_signal};
use signal_trader::trailing_stop::{connect_entries, StopLossController};

#[derive(Parser, Debug)]
#[command(name = "sl_adjuster")]
#[command(about = "Trail the stop-loss of open positions using tier tables")]
struct Args {
    /// Master config path (default: $SIGNAL_TRADER_CONFIG or master.yaml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Controller settings
    #[arg(long, default_value = "sl_adjuster.yaml")]
    adjuster: PathBuf,
}

async fn run(master: MasterConfig, adjuster: AdjusterConfig) -> Result<(), ConfigError> {
    let credentials = CredentialBook::load(
        Path::new(&master.keys_path),
        Path::new(&master.proxies_path),
    )?;
    let tiers = load_tier_entries(Path::new(&adjuster.tiers_path))?;
    info!("Loaded {} tier table(s) from {}", tiers.len(), adjuster.tiers_path);

    let entries = connect_entries(&master, &credentials, tiers);
    let (audit, audit_writer) = AuditLogger::from_config(master.audit_log_enabled, &master.log_dir);
    let controller = Arc::new(StopLossController::new(entries, audit));

    let token = CancellationToken::new();
    tokio::spawn(shutdown_signal(token.clone()));

    controller
        .run(adjuster.slow_delay(), adjuster.fast_delay(), token)
        .await;
    audit_writer.finish().await;
    info!("Bye!");
    Ok(())
}

fn main() -> ExitCode {
    init_tracing("signal_trader=info");
    let args = Args::parse();

    let config_path = args.config.unwrap_or_else(MasterConfig::path_from_env);
    let configs = MasterConfig::load(&config_path)
        .and_then(|master| AdjusterConfig::load(&args.adjuster).map(|adjuster| (master, adjuster)));
    let (master, adjuster) = match configs {
        Ok(configs) => configs,
        Err(e) => {
            error!("{}", e);
            return ExitCode::FAILURE;
        }
    };
    info!("Config loaded: {:?}", adjuster);

    let runtime = match Builder::new_multi_thread().worker_threads(4).enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to build tokio runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(master, adjuster)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
