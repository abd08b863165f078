//! QUIC listener.
//!
//! Every accepted connection runs in its own task, and so does every
//! bidirectional stream on it. A stream carries exactly one request, read
//! and answered as HTTP/1.1.

use std::net::SocketAddr;
use std::sync::Arc;

use quinn::{ConnectionError, Endpoint, EndpointConfig};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, trace, Instrument};

use crate::error::{ConfigError, TransportError};
use crate::server::Server;
use crate::transport::{create_udp_socket, TransportSettings};

/// Bind a server endpoint on `addr`.
pub fn bind(
    addr: SocketAddr,
    server_config: quinn::ServerConfig,
    settings: &TransportSettings,
) -> Result<Endpoint, ConfigError> {
    let bind_error = |source| ConfigError::Bind {
        addr: addr.to_string(),
        source,
    };
    let socket = create_udp_socket(addr, settings).map_err(bind_error)?;
    Endpoint::new(
        EndpointConfig::default(),
        Some(server_config),
        socket,
        Arc::new(quinn::TokioRuntime),
    )
    .map_err(bind_error)
}

/// Accept connections until `shutdown` fires or the endpoint closes.
pub async fn run(endpoint: Endpoint, server: Arc<Server>, shutdown: CancellationToken) {
    loop {
        let incoming = tokio::select! {
            _ = shutdown.cancelled() => break,
            incoming = endpoint.accept() => match incoming {
                Some(incoming) => incoming,
                None => break,
            },
        };

        let peer = incoming.remote_address();
        let server = Arc::clone(&server);
        tokio::spawn(
            async move {
                if let Err(e) = handle_connection(incoming, server).await {
                    debug!(error = %e, "Connection error");
                }
            }
            .instrument(info_span!("connection", peer = %peer)),
        );
    }

    endpoint.close(0u32.into(), b"server shutting down");
    endpoint.wait_idle().await;
}

/// Handle a single client connection
async fn handle_connection(
    incoming: quinn::Incoming,
    server: Arc<Server>,
) -> Result<(), TransportError> {
    let connection = incoming.accept()?.await?;
    debug!("New connection");

    loop {
        let (send, recv) = match connection.accept_bi().await {
            Ok(stream) => stream,
            Err(
                ConnectionError::ApplicationClosed(_)
                | ConnectionError::ConnectionClosed(_)
                | ConnectionError::LocallyClosed,
            ) => {
                trace!("Connection closed");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        let server = Arc::clone(&server);
        let stream_id = send.id();
        tokio::spawn(
            async move {
                if let Err(e) = server.serve_stream(tokio::io::join(recv, send)).await {
                    debug!(error = %e, "Stream error");
                }
            }
            .instrument(info_span!("stream", id = %stream_id)),
        );
    }
}
