//! quic-demo: a QUIC demo server, echo protocol and fan-out client
//!
//! The server answers one HTTP/1.1 request per QUIC stream or TLS connection:
//! - `/<n>` streams `n` bytes of a deterministic payload
//! - `/demo/upload` hashes a multipart upload
//! - `/demo/tile`, `/demo/tiles` and `/demo/echo` serve small demo pages
//! - a static directory can replace the payload route
//!
//! Features:
//! - Several bind addresses at once, each QUIC or TLS over TCP
//! - Bounded request concurrency and request deadlines
//! - Configuration via CLI arguments or TOML file

pub mod body;
pub mod config;
pub mod echo;
pub mod error;
pub mod fetch;
pub mod handlers;
pub mod logging;
pub mod orchestrator;
pub mod payload;
pub mod router;
pub mod server;
pub mod transport;
pub mod upload;
