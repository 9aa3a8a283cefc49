//! weft-gateway – entry point.
//!
//! Startup order:
//! 1. Parse configuration from environment variables.
//! 2. Initialise structured tracing.
//! 3. Connect the broker producer.
//! 4. Build the Axum router and serve (TLS when credentials are set).

mod config;
mod error;
mod routes;

use std::net::SocketAddr;
use std::sync::Arc;

use tracing::{info, warn};

use weft_broker::{BrokerKind, MemBroker, NsqProducer, Producer};

use crate::config::Config;
use crate::routes::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Configuration ─────────────────────────────────────────────────────
    let cfg = Config::from_env();

    // ── 2. Tracing ───────────────────────────────────────────────────────────
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| cfg.log_level.parse::<tracing_subscriber::EnvFilter>())
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt().with_env_filter(env_filter);
    if cfg.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    info!(version = env!("CARGO_PKG_VERSION"), "weft-gateway starting");

    // ── 3. Broker producer ───────────────────────────────────────────────────
    let producer: Arc<dyn Producer> = match cfg.broker {
        BrokerKind::Nsq => {
            let producer = NsqProducer::connect(&cfg.broker_host, cfg.broker_port)?;
            info!(host = %cfg.broker_host, port = cfg.broker_port, "publishing to NSQ");
            Arc::new(producer)
        }
        BrokerKind::Mem => {
            // Accepted tasks go nowhere outside this process; only useful
            // for development and smoke tests.
            warn!("using in-process broker; accepted tasks are not distributed");
            MemBroker::new()
        }
    };

    // ── 4. HTTP server ───────────────────────────────────────────────────────
    let state = Arc::new(AppState { producer });
    let app = routes::build(state);
    let addr: SocketAddr = cfg.bind_address.parse()?;

    if let Some((cert, key)) = cfg.tls() {
        let tls = axum_server::tls_rustls::RustlsConfig::from_pem_file(cert, key).await?;
        info!(%addr, "HTTPS server listening");
        axum_server::bind_rustls(addr, tls)
            .serve(app.into_make_service())
            .await?;
    } else {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        info!(%addr, "HTTP server listening");
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await?;
    }

    info!("weft-gateway stopped");
    Ok(())
}

/// Resolves when SIGINT (Ctrl-C) or SIGTERM is received.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to install CTRL+C signal handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => warn!(error = %e, "failed to install SIGTERM handler"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received; starting graceful shutdown");
}
