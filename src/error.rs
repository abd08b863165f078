//! Error taxonomy shared by the server, the echo protocol and the client.
//!
//! Each error kind has a fixed blast radius:
//! - [`ClientInputError`]: one request, answered with a 4xx status or the
//!   upload form
//! - [`TransportError`]: one stream, connection or listener task
//! - [`ConfigError`]: the whole process at startup, or a single listener loop
//! - [`ProtocolViolation`]: one echo exchange

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Bad input supplied by a client. Never fatal to the server.
#[derive(Debug, Error)]
pub enum ClientInputError {
    #[error("invalid payload size {0:?}")]
    InvalidSize(String),
    #[error("missing multipart boundary")]
    MissingBoundary,
    #[error("multipart field {0:?} not found")]
    MissingField(String),
    #[error("upload size is not available")]
    SizeUnavailable,
    #[error("upload exceeds {limit} bytes")]
    TooLarge { limit: u64 },
    #[error("upload truncated: expected {expected} bytes, got {actual}")]
    Truncated { expected: u64, actual: u64 },
}

/// Failure on a connection or stream.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("http error: {0}")]
    Http(#[from] hyper::Error),
    #[error("connection error: {0}")]
    Connection(#[from] quinn::ConnectionError),
    #[error("connect error: {0}")]
    Connect(#[from] quinn::ConnectError),
    #[error("stream already closed")]
    ClosedStream(#[from] quinn::ClosedStream),
    #[error("{0} timed out")]
    Timeout(&'static str),
}

/// Invalid or unusable configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {}", .0.display(), .1)]
    FileRead(PathBuf, #[source] io::Error),
    #[error("Failed to parse config file '{}': {}", .0.display(), .1)]
    TomlParse(PathBuf, #[source] toml::de::Error),
    #[error("invalid bind address {0:?}")]
    InvalidBind(String),
    #[error("could not resolve {0:?}")]
    Unresolvable(String),
    #[error("could not bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("Failed to read {what} '{}': {source}", .path.display())]
    TlsMaterial {
        what: &'static str,
        path: PathBuf,
        #[source]
        source: rustls_pki_types::pem::Error,
    },
    #[error("Failed to create key log '{}': {}", .0.display(), .1)]
    KeyLog(PathBuf, #[source] io::Error),
    #[error("--cert and --key must be given together")]
    IncompleteTlsPair,
    #[error("tls configuration: {0}")]
    Tls(#[from] rustls::Error),
    #[error("quic crypto configuration: {0}")]
    QuicCrypto(#[from] quinn::crypto::rustls::NoInitialCipherSuite),
    #[error("certificate generation: {0}")]
    CertGen(#[from] rcgen::Error),
    #[error("duplicate route pattern {0:?}")]
    DuplicateRoute(String),
    #[error("invalid route pattern {0:?}")]
    InvalidRoute(String),
}

/// The echo peer did not hand back what was sent.
#[derive(Debug, Error)]
pub enum ProtocolViolation {
    #[error("stream ended after {received} of {expected} echoed bytes")]
    ShortEcho { expected: usize, received: usize },
    #[error("echoed bytes differ from the message sent")]
    Mismatch,
    #[error("invalid frame length")]
    InvalidLength,
    #[error("frame of {0} bytes exceeds the limit")]
    FrameTooLarge(usize),
}

/// Errors ending one echo exchange.
#[derive(Debug, Error)]
pub enum EchoError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Protocol(#[from] ProtocolViolation),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl From<io::Error> for EchoError {
    fn from(e: io::Error) -> Self {
        EchoError::Transport(TransportError::Io(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_input_message() {
        let e = ClientInputError::TooLarge { limit: 8 };
        assert_eq!(e.to_string(), "upload exceeds 8 bytes");
    }

    #[test]
    fn test_short_echo_message() {
        let e = ProtocolViolation::ShortEcho {
            expected: 9,
            received: 4,
        };
        assert_eq!(e.to_string(), "stream ended after 4 of 9 echoed bytes");
    }
}
