pub mod audit_logger;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::filter::Directive;
use tracing_subscriber::EnvFilter;

/// Installs the global subscriber. `RUST_LOG` is honoured; `directive`
/// (e.g. `signal_trader=info`) is added on top.
pub fn init_tracing(directive: &str) {
    let mut filter = EnvFilter::from_default_env();
    match directive.parse::<Directive>() {
        Ok(d) => filter = filter.add_directive(d),
        Err(e) => eprintln!("Ignoring log directive {}: {}", directive, e),
    }
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Cancels `token` on Ctrl+C or SIGTERM.
pub async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => warn!("Received Ctrl+C, shutting down..."),
        _ = terminate => warn!("Received SIGTERM, shutting down..."),
    }

    token.cancel();
    info!("Shutdown signal propagated");
}
