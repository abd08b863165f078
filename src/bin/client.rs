//! quic-demo-client: fetch several URLs concurrently.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};

use quic_demo::fetch::{BatchPolicy, FetchOptions, Fetcher, Target};
use quic_demo::transport::tls::Trust;

/// Command-line arguments for the fetch client
#[derive(Parser, Debug)]
#[command(name = "quic-demo-client")]
#[command(version)]
#[command(about = "Fetch URLs over QUIC (or tcp:// over TLS) concurrently", long_about = None)]
struct Args {
    /// Don't print response bodies
    #[arg(short, long)]
    quiet: bool,

    /// Skip server certificate verification
    #[arg(long)]
    insecure: bool,

    /// PEM file with the CA certificates to trust
    #[arg(long, conflicts_with = "insecure")]
    ca: Option<PathBuf>,

    /// Write TLS session secrets to this file
    #[arg(long)]
    keylog: Option<PathBuf>,

    /// Maximum number of concurrent fetches
    #[arg(long)]
    max_in_flight: Option<usize>,

    /// Stop at the first failed fetch
    #[arg(long)]
    fail_fast: bool,

    /// Per-request timeout in seconds
    #[arg(long, default_value_t = 30)]
    timeout_secs: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Targets: https://host[:port]/path, tcp://host[:port]/path or host:port/path
    #[arg(required = true)]
    targets: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let _log_guard =
        quic_demo::logging::init(&args.log_level, None).context("failed to initialize logging")?;

    let targets = args
        .targets
        .iter()
        .map(|t| t.parse::<Target>())
        .collect::<Result<Vec<_>, _>>()?;

    let trust = match (&args.ca, args.insecure) {
        (Some(ca), _) => Trust::from_ca_file(ca)?,
        (None, true) => Trust::Insecure,
        (None, false) => anyhow::bail!("either --ca or --insecure is required"),
    };

    let options = FetchOptions {
        keep_bodies: !args.quiet,
        policy: if args.fail_fast {
            BatchPolicy::AbortOnError
        } else {
            BatchPolicy::ContinueOnError
        },
        max_in_flight: args.max_in_flight,
        timeout: Duration::from_secs(args.timeout_secs),
    };
    let fetcher = Fetcher::new(&trust, args.keylog.as_deref(), options)?;

    let results = fetcher.fetch_all(targets).await?;
    let mut failures = 0;
    for result in &results {
        match &result.outcome {
            Ok(fetched) => {
                info!(target = %result.target, status = fetched.status, bytes = fetched.len, "Got response");
                if let Some(body) = &fetched.body {
                    println!("Response Body:\n{}", String::from_utf8_lossy(body));
                }
            }
            Err(e) => {
                failures += 1;
                warn!(target = %result.target, error = %e, "Fetch failed");
            }
        }
    }
    fetcher.close().await;

    if failures > 0 {
        anyhow::bail!("{failures} of {} fetches failed", results.len());
    }
    Ok(())
}
