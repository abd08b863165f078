//! quic-echo: send a message over QUIC and check it comes back unchanged.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use tracing::info;

use quic_demo::echo::{self, EchoClient, EchoServer, Framing};
use quic_demo::transport::tls::{self, CertifiedPair, TlsFiles, Trust};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Role {
    /// Run a server and a client against it in one process
    Both,
    Server,
    Client,
}

/// Command-line arguments for the echo tool
#[derive(Parser, Debug)]
#[command(name = "quic-echo")]
#[command(version)]
#[command(about = "QUIC stream echo server and client", long_about = None)]
struct Args {
    #[arg(long, value_enum, default_value = "both")]
    role: Role,

    /// Address to listen on or connect to
    #[arg(long, default_value = echo::DEFAULT_ADDR)]
    addr: String,

    /// Message to send
    #[arg(long, default_value = echo::DEFAULT_MESSAGE)]
    message: String,

    /// Use length-prefixed frames instead of raw bytes
    #[arg(long)]
    framed: bool,

    /// Path to TLS certificate file (server role, required with --key)
    #[arg(long, requires = "key")]
    cert: Option<PathBuf>,

    /// Path to TLS key file (server role)
    #[arg(long, requires = "cert")]
    key: Option<PathBuf>,

    /// PEM file with the CA certificates to trust (client role)
    #[arg(long)]
    ca: Option<PathBuf>,

    /// Skip server certificate verification (client role)
    #[arg(long)]
    insecure: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let _log_guard =
        quic_demo::logging::init(&args.log_level, None).context("failed to initialize logging")?;

    let framing = if args.framed {
        Framing::LengthPrefixed
    } else {
        Framing::Raw
    };
    let addr = resolve(&args.addr).await?;
    let server_name = args
        .addr
        .rsplit_once(':')
        .map_or("localhost", |(host, _)| host.trim_start_matches('[').trim_end_matches(']'));

    match args.role {
        Role::Server => {
            let pair = match (args.cert, args.key) {
                (Some(cert), Some(key)) => CertifiedPair::load(&TlsFiles { cert, key })?,
                _ => CertifiedPair::self_signed(&[server_name])?,
            };
            let mut server = EchoServer::bind(addr, &pair, framing)?;
            info!(address = %server.local_addr()?, "Echo server listening");
            let echoed = server
                .serve_one(|chunk| info!("Server: Got '{}'", String::from_utf8_lossy(chunk)))
                .await?;
            info!(bytes = echoed, "Echo complete");
            server.close().await;
        }
        Role::Client => {
            let trust = match (&args.ca, args.insecure) {
                (Some(ca), _) => Trust::from_ca_file(ca)?,
                (None, true) => Trust::Insecure,
                (None, false) => anyhow::bail!("either --ca or --insecure is required"),
            };
            run_client(addr, server_name, &trust, framing, &args.message).await?;
        }
        Role::Both => {
            let pair = CertifiedPair::self_signed(&["localhost"])?;
            let mut server = EchoServer::bind(addr, &pair, framing)?;
            let server_addr = server.local_addr()?;
            let server_task = tokio::spawn(async move {
                let result = server
                    .serve_one(|chunk| info!("Server: Got '{}'", String::from_utf8_lossy(chunk)))
                    .await;
                server.close().await;
                result
            });

            let trust = Trust::Roots(pair.root_store()?);
            run_client(server_addr, "localhost", &trust, framing, &args.message).await?;
            server_task.await??;
        }
    }
    Ok(())
}

async fn run_client(
    addr: SocketAddr,
    server_name: &str,
    trust: &Trust,
    framing: Framing,
    message: &str,
) -> anyhow::Result<()> {
    let config = tls::client_config(trust, &[], None)?;
    let local: SocketAddr = if addr.is_ipv6() {
        "[::]:0".parse()?
    } else {
        "0.0.0.0:0".parse()?
    };
    let mut client = EchoClient::new(local, config, framing)?;

    info!("Client: Sending '{message}'");
    let echoed = client.send(addr, server_name, message.as_bytes()).await?;
    info!("Client: Got '{}'", String::from_utf8_lossy(&echoed));
    client.close().await;
    Ok(())
}

async fn resolve(addr: &str) -> anyhow::Result<SocketAddr> {
    tokio::net::lookup_host(addr)
        .await?
        .next()
        .with_context(|| format!("could not resolve {addr}"))
}
