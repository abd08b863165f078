//! Concurrent fetch client.
//!
//! Each target is fetched by its own task over its own connection. QUIC
//! targets share one client endpoint; TCP targets dial a fresh TLS
//! connection. The batch call returns one result slot per target, in
//! target order.

use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures::FutureExt;
use http::header::HOST;
use http::Request;
use http_body_util::{BodyExt, Empty};
use hyper::client::conn::http1;
use hyper_util::rt::TokioIo;
use quinn::Endpoint;
use rustls::pki_types::ServerName;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_rustls::TlsConnector;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::error::{ConfigError, TransportError};
use crate::transport::tls::{self, Trust, QUIC_ALPN, TCP_ALPN};

const DEFAULT_PORT: u16 = 443;

/// Transport a target is fetched over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Quic,
    Tcp,
}

/// A parsed fetch target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    raw: String,
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
    pub path: String,
}

impl Target {
    /// `host:port` as sent in the `Host` header.
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl FromStr for Target {
    type Err = FetchError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let invalid = || FetchError::InvalidTarget(raw.to_string());

        let (scheme, rest) = if let Some(rest) = raw.strip_prefix("https://") {
            (Scheme::Quic, rest)
        } else if let Some(rest) = raw.strip_prefix("quic://") {
            (Scheme::Quic, rest)
        } else if let Some(rest) = raw.strip_prefix("tcp://") {
            (Scheme::Tcp, rest)
        } else if raw.contains("://") {
            return Err(invalid());
        } else {
            (Scheme::Quic, raw)
        };

        let (authority, path) = match rest.find('/') {
            Some(idx) => (&rest[..idx], &rest[idx..]),
            None => (rest, "/"),
        };

        let (host, port) = if let Some(v6) = authority.strip_prefix('[') {
            let (host, after) = v6.split_once(']').ok_or_else(invalid)?;
            match after.strip_prefix(':') {
                Some(port) => (host, port.parse().map_err(|_| invalid())?),
                None if after.is_empty() => (host, DEFAULT_PORT),
                None => return Err(invalid()),
            }
        } else {
            match authority.rsplit_once(':') {
                Some((host, port)) => (host, port.parse().map_err(|_| invalid())?),
                None => (authority, DEFAULT_PORT),
            }
        };

        if host.is_empty() {
            return Err(invalid());
        }

        Ok(Target {
            raw: raw.to_string(),
            scheme,
            host: host.to_string(),
            port,
            path: path.to_string(),
        })
    }
}

/// A completed response.
#[derive(Debug, Clone)]
pub struct FetchedBody {
    pub status: u16,
    /// Body length in bytes
    pub len: u64,
    /// Body contents, unless the fetcher was told to discard them
    pub body: Option<Bytes>,
}

/// Outcome for one target.
#[derive(Debug)]
pub struct FetchResult {
    pub target: String,
    pub outcome: Result<FetchedBody, FetchError>,
}

/// Why a fetch failed.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("invalid target {0:?}")]
    InvalidTarget(String),
    #[error("could not resolve {0:?}")]
    Resolve(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("invalid request: {0}")]
    Request(#[from] http::Error),
    #[error("request timed out")]
    Timeout,
    #[error("fetch task failed: {0}")]
    Task(String),
    #[error("{target}: {source}")]
    Aborted {
        target: String,
        #[source]
        source: Box<FetchError>,
    },
}

impl From<std::io::Error> for FetchError {
    fn from(e: std::io::Error) -> Self {
        FetchError::Transport(TransportError::Io(e))
    }
}

impl From<hyper::Error> for FetchError {
    fn from(e: hyper::Error) -> Self {
        FetchError::Transport(TransportError::Http(e))
    }
}

/// What the batch does when a target fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BatchPolicy {
    /// Fill every slot, successful or not.
    #[default]
    ContinueOnError,
    /// Abort the remaining tasks on the first error.
    AbortOnError,
}

/// Fetcher settings.
#[derive(Debug, Clone)]
pub struct FetchOptions {
    /// Keep response bodies in the results
    pub keep_bodies: bool,
    pub policy: BatchPolicy,
    /// Cap on concurrent fetches; `None` is unbounded
    pub max_in_flight: Option<usize>,
    pub timeout: Duration,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            keep_bodies: true,
            policy: BatchPolicy::default(),
            max_in_flight: None,
            timeout: Duration::from_secs(30),
        }
    }
}

/// Fetches targets over QUIC or TLS over TCP.
#[derive(Clone)]
pub struct Fetcher {
    endpoint: Endpoint,
    connector: TlsConnector,
    options: FetchOptions,
    limit: Option<Arc<Semaphore>>,
}

impl Fetcher {
    /// Create a fetcher with one shared client endpoint.
    pub fn new(
        trust: &Trust,
        keylog: Option<&Path>,
        options: FetchOptions,
    ) -> Result<Self, ConfigError> {
        let quic_tls = tls::client_config(trust, &[QUIC_ALPN], keylog)?;
        let mut tcp_tls = quic_tls.clone();
        tcp_tls.alpn_protocols = vec![TCP_ALPN.to_vec()];

        let mut endpoint = client_endpoint()?;
        endpoint.set_default_client_config(tls::quic_client_config(quic_tls)?);

        let limit = options
            .max_in_flight
            .map(|n| Arc::new(Semaphore::new(n.max(1))));

        Ok(Self {
            endpoint,
            connector: TlsConnector::from(Arc::new(tcp_tls)),
            options,
            limit,
        })
    }

    /// Fetch one target.
    pub async fn fetch(&self, target: &Target) -> Result<FetchedBody, FetchError> {
        let _permit = match &self.limit {
            Some(limit) => Some(
                Arc::clone(limit)
                    .acquire_owned()
                    .await
                    .map_err(|e| FetchError::Task(e.to_string()))?,
            ),
            None => None,
        };

        tokio::time::timeout(self.options.timeout, self.fetch_inner(target))
            .await
            .map_err(|_| FetchError::Timeout)?
    }

    async fn fetch_inner(&self, target: &Target) -> Result<FetchedBody, FetchError> {
        let addr = resolve(&target.host, target.port).await?;
        let keep_body = self.options.keep_bodies;

        match target.scheme {
            Scheme::Quic => {
                let connection = self
                    .endpoint
                    .connect(addr, &target.host)
                    .map_err(TransportError::from)?
                    .await
                    .map_err(TransportError::from)?;
                debug!(peer = %addr, "Connected");

                let (send, recv) = connection.open_bi().await.map_err(TransportError::from)?;
                let result = exchange(tokio::io::join(recv, send), target, keep_body).await;
                connection.close(0u32.into(), b"done");
                result
            }
            Scheme::Tcp => {
                let stream = TcpStream::connect(addr).await?;
                let name = ServerName::try_from(target.host.clone())
                    .map_err(|_| FetchError::InvalidTarget(target.to_string()))?;
                let stream = self.connector.connect(name, stream).await?;
                debug!(peer = %addr, "Connected");
                exchange(stream, target, keep_body).await
            }
        }
    }

    /// Fetch every target concurrently, one task each.
    ///
    /// With [`BatchPolicy::ContinueOnError`] this returns one result per
    /// target, in input order. With [`BatchPolicy::AbortOnError`] the first
    /// failure cancels the rest and is returned as the error.
    pub async fn fetch_all(&self, targets: Vec<Target>) -> Result<Vec<FetchResult>, FetchError> {
        run_batch(targets, self.options.policy, |target| {
            let fetcher = self.clone();
            async move { fetcher.fetch(&target).await }
        })
        .await
    }

    /// Close the shared endpoint and wait for connections to drain.
    pub async fn close(&self) {
        self.endpoint.close(0u32.into(), b"done");
        self.endpoint.wait_idle().await;
    }
}

/// A dual-stack client endpoint, or IPv4 only where IPv6 is unavailable.
fn client_endpoint() -> Result<Endpoint, ConfigError> {
    let v6: SocketAddr = (std::net::Ipv6Addr::UNSPECIFIED, 0).into();
    let v4: SocketAddr = (std::net::Ipv4Addr::UNSPECIFIED, 0).into();
    Endpoint::client(v6)
        .or_else(|_| Endpoint::client(v4))
        .map_err(|source| ConfigError::Bind {
            addr: v4.to_string(),
            source,
        })
}

async fn resolve(host: &str, port: u16) -> Result<SocketAddr, FetchError> {
    tokio::net::lookup_host((host, port))
        .await
        .ok()
        .and_then(|mut addrs| addrs.next())
        .ok_or_else(|| FetchError::Resolve(host.to_string()))
}

/// Run one task per target and collect the outcomes in target order.
///
/// A task that panics fills its slot with [`FetchError::Task`].
async fn run_batch<F, Fut>(
    targets: Vec<Target>,
    policy: BatchPolicy,
    fetch: F,
) -> Result<Vec<FetchResult>, FetchError>
where
    F: Fn(Target) -> Fut,
    Fut: Future<Output = Result<FetchedBody, FetchError>> + Send + 'static,
{
    let mut tasks = JoinSet::new();
    let names: Vec<String> = targets.iter().map(Target::to_string).collect();

    for (index, target) in targets.into_iter().enumerate() {
        info!(target = %target, "GET");
        let span = info_span!("fetch", target = %target);
        let fetching = AssertUnwindSafe(fetch(target)).catch_unwind();
        tasks.spawn(
            async move {
                let outcome = fetching
                    .await
                    .unwrap_or_else(|panic| Err(FetchError::Task(panic_message(panic.as_ref()))));
                match &outcome {
                    Ok(body) => debug!(status = body.status, bytes = body.len, "Fetched"),
                    Err(e) => debug!(error = %e, "Fetch failed"),
                }
                (index, outcome)
            }
            .instrument(span),
        );
    }

    let mut slots: Vec<Option<Result<FetchedBody, FetchError>>> =
        (0..names.len()).map(|_| None).collect();
    while let Some(joined) = tasks.join_next().await {
        let (index, outcome) = match joined {
            Ok(done) => done,
            Err(e) => {
                warn!(error = %e, "Fetch task did not complete");
                continue;
            }
        };

        match (policy, outcome) {
            (BatchPolicy::AbortOnError, Err(source)) => {
                tasks.abort_all();
                return Err(FetchError::Aborted {
                    target: names[index].clone(),
                    source: Box::new(source),
                });
            }
            (_, outcome) => slots[index] = Some(outcome),
        }
    }

    Ok(names
        .into_iter()
        .zip(slots)
        .map(|(target, slot)| FetchResult {
            target,
            outcome: slot
                .unwrap_or_else(|| Err(FetchError::Task("task did not complete".to_string()))),
        })
        .collect())
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "task panicked".to_string())
}

/// Send a GET for `target` over `io` and read the response.
async fn exchange<I>(io: I, target: &Target, keep_body: bool) -> Result<FetchedBody, FetchError>
where
    I: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (mut sender, connection) = http1::handshake(TokioIo::new(io)).await?;
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            debug!(error = %e, "Connection error");
        }
    });

    let request = Request::get(target.path.as_str())
        .header(HOST, target.authority())
        .body(Empty::<Bytes>::new())?;
    let response = sender.send_request(request).await?;
    let status = response.status().as_u16();
    let (len, body) = read_body(response.into_body(), keep_body).await?;

    Ok(FetchedBody { status, len, body })
}

/// Drain a response body, counting its bytes and keeping them if asked.
async fn read_body<B>(mut body: B, keep: bool) -> Result<(u64, Option<Bytes>), B::Error>
where
    B: hyper::body::Body<Data = Bytes> + Unpin,
{
    let mut kept = keep.then(BytesMut::new);
    let mut len = 0u64;
    while let Some(frame) = body.frame().await {
        if let Ok(data) = frame?.into_data() {
            len += data.len() as u64;
            if let Some(kept) = kept.as_mut() {
                kept.extend_from_slice(&data);
            }
        }
    }
    Ok((len, kept.map(BytesMut::freeze)))
}
