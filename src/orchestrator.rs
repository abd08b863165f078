//! Listener orchestration.
//!
//! One task per bind address. Each task resolves its address, loads TLS
//! material, binds, reports readiness, and serves until cancelled. A task
//! that fails does so alone: the failure is reported as an event and as
//! that task's outcome, and its siblings keep serving.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, Instrument};

use crate::error::ConfigError;
use crate::server::Server;
use crate::transport::tls::{self, TlsSource, QUIC_ALPN, TCP_ALPN};
use crate::transport::{quic, tcp, TransportSettings};

/// Which transport a bind address is served over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportMode {
    Quic,
    Tcp,
}

impl fmt::Display for TransportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportMode::Quic => write!(f, "quic"),
            TransportMode::Tcp => write!(f, "tcp"),
        }
    }
}

/// One bind address and the transport it uses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bind {
    pub addr: String,
    pub mode: TransportMode,
}

impl fmt::Display for Bind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.mode, self.addr)
    }
}

/// Ordered, duplicate-free list of bind addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindSet(Vec<Bind>);

impl BindSet {
    pub const DEFAULT_ADDR: &'static str = "localhost:6121";

    /// Parse a comma-separated list. Entries may carry a `quic://` or
    /// `tcp://` prefix; unprefixed entries use `default_mode`.
    pub fn parse(list: &str, default_mode: TransportMode) -> Result<Self, ConfigError> {
        Self::from_entries(list.split(','), default_mode)
    }

    /// Build from individual entries. An empty input gives the default address.
    pub fn from_entries<I, S>(entries: I, default_mode: TransportMode) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut binds: Vec<Bind> = Vec::new();
        for entry in entries {
            let entry = entry.as_ref().trim();
            if entry.is_empty() {
                continue;
            }
            let bind = parse_entry(entry, default_mode)?;
            // First occurrence wins.
            if !binds.contains(&bind) {
                binds.push(bind);
            }
        }

        if binds.is_empty() {
            binds.push(Bind {
                addr: Self::DEFAULT_ADDR.to_string(),
                mode: default_mode,
            });
        }
        Ok(BindSet(binds))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Bind> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

fn parse_entry(entry: &str, default_mode: TransportMode) -> Result<Bind, ConfigError> {
    let (mode, addr) = if let Some(rest) = entry.strip_prefix("quic://") {
        (TransportMode::Quic, rest)
    } else if let Some(rest) = entry.strip_prefix("tcp://") {
        (TransportMode::Tcp, rest)
    } else if entry.contains("://") {
        return Err(ConfigError::InvalidBind(entry.to_string()));
    } else {
        (default_mode, entry)
    };

    // host:port, with the port required
    let port = match addr.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() => port,
        _ => return Err(ConfigError::InvalidBind(entry.to_string())),
    };
    if port.parse::<u16>().is_err() {
        return Err(ConfigError::InvalidBind(entry.to_string()));
    }

    Ok(Bind {
        addr: addr.to_string(),
        mode,
    })
}

/// Progress notifications from listener tasks.
#[derive(Debug, Clone)]
pub enum ListenerEvent {
    /// The listener is bound and accepting.
    Ready { bind: Bind, local_addr: SocketAddr },
    /// The listener could not start.
    Failed { bind: Bind, error: String },
}

/// Why a listener task ended early.
#[derive(Debug, Error)]
pub enum ListenerError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("listener task panicked or was aborted: {0}")]
    Task(String),
}

/// Final outcome of one listener task.
#[derive(Debug)]
pub struct ListenerReport {
    pub bind: Bind,
    pub result: Result<(), ListenerError>,
}

/// Starts one listener task per bind address.
pub struct Orchestrator {
    binds: BindSet,
    server: Arc<Server>,
    tls: TlsSource,
    settings: TransportSettings,
    shutdown: CancellationToken,
}

impl Orchestrator {
    pub fn new(binds: BindSet, server: Server, tls: TlsSource, settings: TransportSettings) -> Self {
        Self {
            binds,
            server: Arc::new(server),
            tls,
            settings,
            shutdown: CancellationToken::new(),
        }
    }

    /// Token that stops every listener when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Spawn all listener tasks.
    pub fn start(self) -> Running {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let mut tasks = JoinSet::new();
        let binds: Vec<Bind> = self.binds.iter().cloned().collect();

        for (index, bind) in binds.iter().cloned().enumerate() {
            let listener = Listener {
                bind: bind.clone(),
                server: Arc::clone(&self.server),
                tls: self.tls.clone(),
                settings: self.settings.clone(),
                shutdown: self.shutdown.clone(),
                events: events_tx.clone(),
            };
            let span = info_span!("listener", bind = %bind);
            tasks.spawn(async move { (index, listener.run().await) }.instrument(span));
        }

        Running {
            binds,
            tasks,
            events: events_rx,
            shutdown: self.shutdown,
        }
    }
}

/// Handle to the running listeners.
pub struct Running {
    binds: Vec<Bind>,
    tasks: JoinSet<(usize, Result<(), ListenerError>)>,
    events: mpsc::UnboundedReceiver<ListenerEvent>,
    shutdown: CancellationToken,
}

impl Running {
    /// Next readiness or failure event. `None` once every listener has
    /// reported and exited.
    pub async fn next_event(&mut self) -> Option<ListenerEvent> {
        self.events.recv().await
    }

    /// Stop every listener.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Wait for every listener to exit. Reports come back in bind order.
    pub async fn join(mut self) -> Vec<ListenerReport> {
        let mut results: Vec<Option<Result<(), ListenerError>>> =
            self.binds.iter().map(|_| None).collect();

        while let Some(joined) = self.tasks.join_next().await {
            match joined {
                Ok((index, result)) => results[index] = Some(result),
                Err(e) => error!(error = %e, "Listener task failed"),
            }
        }

        self.binds
            .into_iter()
            .zip(results)
            .map(|(bind, result)| ListenerReport {
                bind,
                result: result.unwrap_or_else(|| {
                    Err(ListenerError::Task("no outcome reported".to_string()))
                }),
            })
            .collect()
    }
}

struct Listener {
    bind: Bind,
    server: Arc<Server>,
    tls: TlsSource,
    settings: TransportSettings,
    shutdown: CancellationToken,
    events: mpsc::UnboundedSender<ListenerEvent>,
}

impl Listener {
    async fn run(self) -> Result<(), ListenerError> {
        let result = self.serve().await;
        if let Err(e) = &result {
            error!(error = %e, "Listener failed");
            let _ = self.events.send(ListenerEvent::Failed {
                bind: self.bind.clone(),
                error: e.to_string(),
            });
        }
        result.map_err(ListenerError::from)
    }

    async fn serve(&self) -> Result<(), ConfigError> {
        let addr = resolve(&self.bind.addr).await?;
        let pair = self.tls.load()?;

        match self.bind.mode {
            TransportMode::Quic => {
                let config =
                    tls::quic_server_config(&pair, &[QUIC_ALPN], self.settings.idle_timeout)?;
                let endpoint = quic::bind(addr, config, &self.settings)?;
                let local_addr = endpoint.local_addr().map_err(|source| ConfigError::Bind {
                    addr: addr.to_string(),
                    source,
                })?;
                self.ready(local_addr);
                quic::run(endpoint, Arc::clone(&self.server), self.shutdown.clone()).await;
            }
            TransportMode::Tcp => {
                let config = tls::server_config(&pair, &[TCP_ALPN])?;
                let acceptor = TlsAcceptor::from(Arc::new(config));
                let listener = tcp::bind(addr, &self.settings)?;
                let local_addr = listener.local_addr().map_err(|source| ConfigError::Bind {
                    addr: addr.to_string(),
                    source,
                })?;
                self.ready(local_addr);
                tcp::run(
                    listener,
                    acceptor,
                    Arc::clone(&self.server),
                    self.shutdown.clone(),
                )
                .await;
            }
        }

        info!("Listener stopped");
        Ok(())
    }

    fn ready(&self, local_addr: SocketAddr) {
        info!(address = %local_addr, mode = %self.bind.mode, "Listening");
        let _ = self.events.send(ListenerEvent::Ready {
            bind: self.bind.clone(),
            local_addr,
        });
    }
}

async fn resolve(addr: &str) -> Result<SocketAddr, ConfigError> {
    tokio::net::lookup_host(addr)
        .await
        .ok()
        .and_then(|mut addrs| addrs.next())
        .ok_or_else(|| ConfigError::Unresolvable(addr.to_string()))
}
