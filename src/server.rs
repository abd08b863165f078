//! Request serving shared by both transports.
//!
//! A transport hands over one byte stream per request (a QUIC bidirectional
//! stream or a TLS connection). hyper reads the request off it, the route
//! table answers it, and the stream is shut down after the response.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use http::{Method, Request, Response, StatusCode};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::{TokioIo, TokioTimer};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::body::{self, Body, BoxError};
use crate::error::TransportError;
use crate::router::RouteTable;
use crate::transport::TransportSettings;

/// Largest request head accepted
const MAX_HEAD_SIZE: usize = 16 * 1024;

/// Server instance
pub struct Server {
    routes: Arc<RouteTable>,
    request_limit: Arc<Semaphore>,
    request_timeout: Duration,
}

impl Server {
    /// Create a new server over `routes`.
    pub fn new(routes: RouteTable, settings: &TransportSettings) -> Self {
        Server {
            routes: Arc::new(routes),
            request_limit: Arc::new(Semaphore::new(settings.max_concurrent_requests.max(1))),
            request_timeout: settings.request_timeout,
        }
    }

    /// Deadline for reading a request head and for handling it. Also used
    /// for the TLS handshake.
    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// Serve one request on `io` and shut it down afterwards.
    pub async fn serve_stream<I>(&self, io: I) -> Result<(), TransportError>
    where
        I: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        // Wait for a request slot
        let _permit = self
            .request_limit
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| TransportError::Timeout("request slot"))?;

        let routes = Arc::clone(&self.routes);
        let timeout = self.request_timeout;
        let service = service_fn(move |request: Request<Incoming>| {
            let routes = Arc::clone(&routes);
            async move { Ok::<_, Infallible>(answer(&routes, request, timeout).await) }
        });

        let mut builder = http1::Builder::new();
        builder
            .timer(TokioTimer::new())
            .header_read_timeout(timeout)
            .max_buf_size(MAX_HEAD_SIZE)
            .half_close(true)
            .keep_alive(false);
        builder.serve_connection(TokioIo::new(io), service).await?;
        Ok(())
    }
}

/// Dispatch one request under `timeout`.
async fn answer(routes: &RouteTable, request: Request<Incoming>, timeout: Duration) -> Response<Body> {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let request = request.map(|incoming| incoming.map_err(BoxError::from).boxed_unsync());

    let mut response = match tokio::time::timeout(timeout, routes.dispatch(request)).await {
        Ok(response) => response,
        Err(_) => {
            warn!(method = %method, path = %path, "Request timed out");
            body::status(StatusCode::REQUEST_TIMEOUT)
        }
    };

    if method == Method::HEAD {
        *response.body_mut() = body::empty();
    }

    debug!(method = %method, path = %path, status = response.status().as_u16(), "Served");
    response
}
