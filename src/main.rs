//! # CDP Relay Core server entry point
//!
//! Entry point for the relay: a Chrome DevTools Protocol proxy that lets a
//! driver (e.g. a Playwright client) control browser tabs through a browser
//! extension rather than through an automation-launched browser.
//!
//! ## Environment variables
//! See `config::Config` for the full list (`RELAY_HOST`, `RELAY_PORT`, and
//! friends).

use cdp_relay_core::config::Config;
use cdp_relay_core::relay::Relay;
use cdp_relay_core::server;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

/// Initialize tracing subscriber with configurable log level.
fn init_tracing(log_level: &str) {
    let level = log_level.parse::<Level>().unwrap_or(Level::INFO);

    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();

    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");
}

/// Setup graceful shutdown signal handler.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).unwrap();
        let mut sigint = signal(SignalKind::interrupt()).unwrap();

        tokio::select! {
            _ = sigterm.recv() => {
                info!("received SIGTERM signal");
            }
            _ = sigint.recv() => {
                info!("received SIGINT signal");
            }
        }
    }

    #[cfg(windows)]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("received Ctrl+C signal");
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration first so tracing picks up the configured level.
    let config = Config::from_env()?;
    init_tracing(&config.log_level);
    info!("cdp relay core v{}", cdp_relay_core::VERSION);
    info!(host = %config.host, port = config.port, "configuration loaded");

    let relay = Relay::new(config);

    tokio::select! {
        result = server::serve(relay.clone()) => {
            if let Err(err) = result {
                warn!(%err, "server exited with error");
            }
        }
        _ = shutdown_signal() => {
            info!("shutdown signal received, stopping server");
        }
    }

    info!("server shutdown complete");
    Ok(())
}
