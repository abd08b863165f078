//! TLS over TCP fallback listener.
//!
//! One request per connection: the server reads a request, writes the
//! response, and shuts the connection down.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info_span, Instrument};

use crate::error::{ConfigError, TransportError};
use crate::server::Server;
use crate::transport::{create_tcp_listener, TransportSettings};

/// Bind a listening socket on `addr`.
pub fn bind(addr: SocketAddr, settings: &TransportSettings) -> Result<TcpListener, ConfigError> {
    let bind_error = |source| ConfigError::Bind {
        addr: addr.to_string(),
        source,
    };
    let listener = create_tcp_listener(addr, settings).map_err(bind_error)?;
    TcpListener::from_std(listener).map_err(bind_error)
}

/// Accept connections until `shutdown` fires.
pub async fn run(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    server: Arc<Server>,
    shutdown: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer)) => {
                let acceptor = acceptor.clone();
                let server = Arc::clone(&server);
                tokio::spawn(
                    async move {
                        if let Err(e) = handle_connection(stream, acceptor, server).await {
                            debug!(error = %e, "Connection error");
                        }
                    }
                    .instrument(info_span!("connection", peer = %peer)),
                );
            }
            Err(e) => {
                error!(error = %e, "Failed to accept connection");
            }
        }
    }
}

/// Handle a single client connection
async fn handle_connection(
    stream: TcpStream,
    acceptor: TlsAcceptor,
    server: Arc<Server>,
) -> Result<(), TransportError> {
    let tls = tokio::time::timeout(server.request_timeout(), acceptor.accept(stream))
        .await
        .map_err(|_| TransportError::Timeout("tls handshake"))??;
    debug!("New connection");

    server.serve_stream(tls).await
}
