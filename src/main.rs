//! quic-demo-server: serves the demo routes on every configured address.

use std::sync::Arc;

use anyhow::Context;
use tracing::{error, info, warn};

use quic_demo::config::Config;
use quic_demo::orchestrator::{ListenerEvent, Orchestrator};
use quic_demo::router::demo_routes;
use quic_demo::server::Server;
use quic_demo::transport::tls::{CertifiedPair, TlsSource};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let _log_guard = quic_demo::logging::init(&config.log_level, config.log_file.as_deref())
        .context("failed to initialize logging")?;

    info!(
        binds = config.binds.len(),
        www = ?config.www,
        max_concurrent_requests = config.transport.max_concurrent_requests,
        request_timeout_secs = config.transport.request_timeout.as_secs(),
        "Starting quic-demo server"
    );

    let tls = match &config.tls {
        Some(files) => TlsSource::Files(files.clone()),
        None => {
            warn!("No certificate configured, using an ephemeral self-signed one for localhost");
            TlsSource::Pair(Arc::new(CertifiedPair::self_signed(&["localhost"])?))
        }
    };

    let routes = demo_routes(config.www.clone())?;
    let server = Server::new(routes, &config.transport);
    let orchestrator = Orchestrator::new(config.binds.clone(), server, tls, config.transport.clone());
    let shutdown = orchestrator.shutdown_token();
    let mut running = orchestrator.start();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutting down");
            shutdown.cancel();
        }
    });

    let mut ready = 0;
    while let Some(event) = running.next_event().await {
        match event {
            ListenerEvent::Ready { .. } => ready += 1,
            ListenerEvent::Failed { bind, error } => {
                error!(bind = %bind, error = %error, "Listener did not start")
            }
        }
    }

    let reports = running.join().await;
    let failed = reports.iter().filter(|r| r.result.is_err()).count();
    info!(ready, failed, "All listeners stopped");

    if failed == reports.len() {
        anyhow::bail!("no listener could be started");
    }
    Ok(())
}
