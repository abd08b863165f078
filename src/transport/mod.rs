//! Listener transports.
//!
//! - `quic`: the primary mode, one request per bidirectional stream
//! - `tcp`: TLS over TCP fallback, one request per connection
//! - `tls`: certificate material and rustls configs for both

pub mod quic;
pub mod tcp;
pub mod tls;

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

/// Socket and deadline settings shared by every listener.
#[derive(Debug, Clone)]
pub struct TransportSettings {
    /// Requests served at once across all listeners
    pub max_concurrent_requests: usize,
    /// Deadline for a request head and for the TLS handshake
    pub request_timeout: Duration,
    /// QUIC connection idle timeout
    pub idle_timeout: Duration,
    pub udp_recv_buffer: Option<usize>,
    pub udp_send_buffer: Option<usize>,
    pub tcp_backlog: i32,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            max_concurrent_requests: 10_000,
            request_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(30),
            udp_recv_buffer: None,
            udp_send_buffer: None,
            tcp_backlog: 1024,
        }
    }
}

fn domain_for(addr: &SocketAddr) -> socket2::Domain {
    match addr {
        SocketAddr::V4(_) => socket2::Domain::IPV4,
        SocketAddr::V6(_) => socket2::Domain::IPV6,
    }
}

/// Create a bound, non-blocking UDP socket for a QUIC endpoint.
pub fn create_udp_socket(
    addr: SocketAddr,
    settings: &TransportSettings,
) -> io::Result<std::net::UdpSocket> {
    let socket = socket2::Socket::new(
        domain_for(&addr),
        socket2::Type::DGRAM,
        Some(socket2::Protocol::UDP),
    )?;

    if let Some(size) = settings.udp_recv_buffer {
        socket.set_recv_buffer_size(size)?;
    }
    if let Some(size) = settings.udp_send_buffer {
        socket.set_send_buffer_size(size)?;
    }
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;

    Ok(socket.into())
}

/// Create a listening, non-blocking TCP socket.
pub fn create_tcp_listener(
    addr: SocketAddr,
    settings: &TransportSettings,
) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        domain_for(&addr),
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(settings.tcp_backlog)?;

    Ok(socket.into())
}
