//! Echo protocol over a single QUIC stream.
//!
//! The server accepts one connection and one bidirectional stream, then
//! writes back every byte it reads. The client sends one message and must
//! get exactly that message back.
//!
//! Two wire modes:
//! - raw: no framing, the echo ends at end of stream
//! - length-prefixed: `<length>\r\n<data>` in both directions, several
//!   messages per stream

use std::io;
use std::net::SocketAddr;

use bytes::{Buf, Bytes, BytesMut};
use quinn::{ConnectionError, Endpoint};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

use crate::error::{EchoError, ProtocolViolation, TransportError};
use crate::transport::tls::{self, CertifiedPair, ECHO_ALPN};
use crate::transport::{quic, TransportSettings};

pub const DEFAULT_ADDR: &str = "localhost:4242";
pub const DEFAULT_MESSAGE: &str = "afa papa!";

/// Largest frame accepted in length-prefixed mode.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Longest length line that can still be valid.
const MAX_HEADER_LEN: usize = 24;

const READ_CHUNK: usize = 8 * 1024;

/// Wire mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Framing {
    #[default]
    Raw,
    LengthPrefixed,
}

/// Server progress through one interaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Listening,
    ConnectionAccepted,
    StreamAccepted,
    Echoing,
    Closed,
}

/// Client progress through one interaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Idle,
    Connected,
    StreamOpened,
    MessageSent,
    AwaitingExactEcho,
    Verified,
}

/// Result of parsing a frame header.
#[derive(Debug, PartialEq, Eq)]
pub enum FrameHeader {
    /// Length of the data and bytes used by the header line.
    Complete { length: usize, header_len: usize },
    /// Need more data for header.
    Incomplete,
    InvalidLength,
}

/// Parse a `<length>\r\n` frame header from the input buffer.
pub fn parse_frame_header(input: &[u8]) -> FrameHeader {
    let line_end = match find_crlf(input) {
        Some(pos) => pos,
        None if input.len() > MAX_HEADER_LEN => return FrameHeader::InvalidLength,
        None => return FrameHeader::Incomplete,
    };

    let length = match std::str::from_utf8(&input[..line_end])
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
    {
        Some(len) => len,
        None => return FrameHeader::InvalidLength,
    };

    FrameHeader::Complete {
        length,
        header_len: line_end + 2,
    }
}

/// Format a frame header.
pub fn frame_header(length: usize) -> Vec<u8> {
    format!("{length}\r\n").into_bytes()
}

/// Find \r\n in buffer, returning the position of \r.
fn find_crlf(buffer: &[u8]) -> Option<usize> {
    buffer.windows(2).position(|w| w == b"\r\n")
}

/// Copy `reader` to `writer` until end of stream. Each chunk is shown to
/// `observe` before it is written back.
pub async fn echo_raw<R, W, F>(reader: &mut R, writer: &mut W, mut observe: F) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    F: FnMut(&[u8]),
{
    let mut buf = vec![0u8; READ_CHUNK];
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        observe(&buf[..n]);
        writer.write_all(&buf[..n]).await?;
        total += n as u64;
    }
    writer.flush().await?;
    Ok(total)
}

/// Echo length-prefixed frames until end of stream. `observe` sees each
/// frame's data before it is written back.
pub async fn echo_framed<R, W, F>(
    reader: &mut R,
    writer: &mut W,
    mut observe: F,
) -> Result<u64, EchoError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    F: FnMut(&[u8]),
{
    let mut buffer = BytesMut::with_capacity(READ_CHUNK);
    let mut total = 0u64;

    loop {
        match parse_frame_header(&buffer) {
            FrameHeader::Complete { length, header_len } => {
                if length > MAX_FRAME_SIZE {
                    return Err(ProtocolViolation::FrameTooLarge(length).into());
                }
                buffer.advance(header_len);

                // Read exactly `length` bytes of data
                while buffer.len() < length {
                    buffer.reserve(length - buffer.len());
                    if reader.read_buf(&mut buffer).await? == 0 {
                        return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
                    }
                }
                let data = buffer.split_to(length);
                observe(&data);

                writer.write_all(&frame_header(length)).await?;
                writer.write_all(&data).await?;
                total += length as u64;
            }
            FrameHeader::Incomplete => {
                buffer.reserve(READ_CHUNK);
                if reader.read_buf(&mut buffer).await? == 0 {
                    if buffer.is_empty() {
                        break;
                    }
                    return Err(ProtocolViolation::InvalidLength.into());
                }
            }
            FrameHeader::InvalidLength => return Err(ProtocolViolation::InvalidLength.into()),
        }
    }

    writer.flush().await?;
    Ok(total)
}

/// Client side: write the whole message.
pub async fn send_message<W>(writer: &mut W, message: &[u8], framing: Framing) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    if framing == Framing::LengthPrefixed {
        writer.write_all(&frame_header(message.len())).await?;
    }
    writer.write_all(message).await?;
    writer.flush().await
}

/// Client side: read back exactly `message` or fail.
pub async fn await_echo<R>(reader: &mut R, message: &[u8], framing: Framing) -> Result<Bytes, EchoError>
where
    R: AsyncRead + Unpin,
{
    let expected = message.len();
    let mut buffer = BytesMut::with_capacity(expected.min(MAX_FRAME_SIZE) + MAX_HEADER_LEN);

    if framing == Framing::LengthPrefixed {
        loop {
            match parse_frame_header(&buffer) {
                FrameHeader::Complete { length, header_len } => {
                    if length != expected {
                        return Err(ProtocolViolation::Mismatch.into());
                    }
                    buffer.advance(header_len);
                    break;
                }
                FrameHeader::Incomplete => {
                    if reader.read_buf(&mut buffer).await? == 0 {
                        return Err(ProtocolViolation::ShortEcho {
                            expected,
                            received: 0,
                        }
                        .into());
                    }
                }
                FrameHeader::InvalidLength => return Err(ProtocolViolation::InvalidLength.into()),
            }
        }
    }

    while buffer.len() < expected {
        buffer.reserve(expected - buffer.len());
        if reader.read_buf(&mut buffer).await? == 0 {
            return Err(ProtocolViolation::ShortEcho {
                expected,
                received: buffer.len(),
            }
            .into());
        }
    }

    let echoed = buffer.split_to(expected).freeze();
    if echoed != message {
        return Err(ProtocolViolation::Mismatch.into());
    }
    Ok(echoed)
}

/// Echo server endpoint.
pub struct EchoServer {
    endpoint: Endpoint,
    framing: Framing,
    state: ServerState,
}

impl EchoServer {
    /// Bind on `addr` with the echo ALPN.
    pub fn bind(addr: SocketAddr, pair: &CertifiedPair, framing: Framing) -> Result<Self, EchoError> {
        let settings = TransportSettings::default();
        let config = tls::quic_server_config(pair, &[ECHO_ALPN], settings.idle_timeout)?;
        let endpoint = quic::bind(addr, config, &settings)?;
        Ok(Self {
            endpoint,
            framing,
            state: ServerState::Listening,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.endpoint.local_addr()
    }

    pub fn state(&self) -> ServerState {
        self.state
    }

    fn transition(&mut self, state: ServerState) {
        trace!(from = ?self.state, to = ?state, "Echo server state");
        self.state = state;
    }

    /// Serve one connection with one stream. Returns the bytes echoed.
    pub async fn serve_one<F>(&mut self, observe: F) -> Result<u64, EchoError>
    where
        F: FnMut(&[u8]),
    {
        self.transition(ServerState::Listening);
        let incoming = self
            .endpoint
            .accept()
            .await
            .ok_or(TransportError::Connection(ConnectionError::LocallyClosed))?;
        let connection = incoming.await.map_err(TransportError::from)?;
        self.transition(ServerState::ConnectionAccepted);
        debug!(peer = %connection.remote_address(), "Echo connection");

        let (mut send, mut recv) = connection.accept_bi().await.map_err(TransportError::from)?;
        self.transition(ServerState::StreamAccepted);

        self.transition(ServerState::Echoing);
        let echoed = match self.framing {
            Framing::Raw => echo_raw(&mut recv, &mut send, observe).await?,
            Framing::LengthPrefixed => echo_framed(&mut recv, &mut send, observe).await?,
        };
        send.finish().map_err(TransportError::from)?;

        // Let the peer read everything before the connection goes away.
        connection.closed().await;
        self.transition(ServerState::Closed);
        Ok(echoed)
    }

    /// Close the endpoint and wait for it to go idle.
    pub async fn close(self) {
        self.endpoint.close(0u32.into(), b"done");
        self.endpoint.wait_idle().await;
    }
}

/// Echo client endpoint.
pub struct EchoClient {
    endpoint: Endpoint,
    framing: Framing,
    state: ClientState,
}

impl EchoClient {
    /// Create a client endpoint bound to `local` using `config`. The echo
    /// ALPN is set here.
    pub fn new(
        local: SocketAddr,
        mut config: rustls::ClientConfig,
        framing: Framing,
    ) -> Result<Self, EchoError> {
        config.alpn_protocols = vec![ECHO_ALPN.to_vec()];
        let mut endpoint = Endpoint::client(local)?;
        endpoint.set_default_client_config(tls::quic_client_config(config)?);
        Ok(Self {
            endpoint,
            framing,
            state: ClientState::Idle,
        })
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    fn transition(&mut self, state: ClientState) {
        trace!(from = ?self.state, to = ?state, "Echo client state");
        self.state = state;
    }

    /// Send `message` to the server at `addr` and verify the echo.
    pub async fn send(
        &mut self,
        addr: SocketAddr,
        server_name: &str,
        message: &[u8],
    ) -> Result<Bytes, EchoError> {
        self.transition(ClientState::Idle);
        let connection = self
            .endpoint
            .connect(addr, server_name)
            .map_err(TransportError::from)?
            .await
            .map_err(TransportError::from)?;
        self.transition(ClientState::Connected);

        let (mut send, mut recv) = connection.open_bi().await.map_err(TransportError::from)?;
        self.transition(ClientState::StreamOpened);

        let result = self.exchange(&mut send, &mut recv, message).await;
        if result.is_ok() {
            let _ = send.finish();
            // Wait for the server to finish its side.
            let mut rest = [0u8; 1];
            let _ = recv.read(&mut rest).await;
        }
        connection.close(0u32.into(), b"done");
        result
    }

    async fn exchange(
        &mut self,
        send: &mut quinn::SendStream,
        recv: &mut quinn::RecvStream,
        message: &[u8],
    ) -> Result<Bytes, EchoError> {
        send_message(send, message, self.framing).await?;
        self.transition(ClientState::MessageSent);

        self.transition(ClientState::AwaitingExactEcho);
        let echoed = await_echo(recv, message, self.framing).await?;
        self.transition(ClientState::Verified);
        Ok(echoed)
    }

    /// Wait for outstanding connections to close.
    pub async fn close(self) {
        self.endpoint.wait_idle().await;
    }
}
