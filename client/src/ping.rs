//! Minimal status client: handshake, status request, parse the JSON reply.

use log::debug;
use shared::codec::{
    parse_packet_header, parse_status_response, serialize_handshake, serialize_status_request,
    STATUS_RESPONSE_ID,
};
use shared::{ProtocolError, ProtocolState, StatusSnapshot, PROTOCOL_VERSION};
use std::io;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout, Instant};

#[derive(Debug, Error)]
pub enum PingError {
    #[error("timed out waiting for a status response")]
    Timeout,

    #[error("connection failed: {0}")]
    Connection(#[from] io::Error),

    #[error("invalid status response: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("expected a status response, got packet 0x{0:02X}")]
    UnexpectedPacket(i32),
}

/// Timing knobs for a single ping
#[derive(Debug, Clone)]
pub struct PingOptions {
    pub connect_timeout: Duration,
    /// Quiet period after the last received chunk that ends the response
    pub settle: Duration,
    /// Upper bound on the whole exchange once connected
    pub timeout: Duration,
    pub protocol_version: i32,
}

impl Default for PingOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            settle: Duration::from_millis(100),
            timeout: Duration::from_secs(5),
            protocol_version: PROTOCOL_VERSION,
        }
    }
}

/// Pings `host:port` with default options.
pub async fn ping_server(host: &str, port: u16) -> Result<StatusSnapshot, PingError> {
    ping_server_with(host, port, &PingOptions::default()).await
}

/// Performs a status exchange and returns the decoded status with the raw
/// response frame attached.
pub async fn ping_server_with(
    host: &str,
    port: u16,
    options: &PingOptions,
) -> Result<StatusSnapshot, PingError> {
    let mut stream = timeout(options.connect_timeout, TcpStream::connect((host, port)))
        .await
        .map_err(|_| PingError::Timeout)??;

    let mut request = serialize_handshake(
        options.protocol_version,
        host,
        port,
        ProtocolState::Status,
    );
    request.extend_from_slice(&serialize_status_request());
    stream.write_all(&request).await?;

    let data = read_until_settled(&mut stream, options).await?;
    debug!("Received {} status bytes from {}:{}", data.len(), host, port);

    let header = parse_packet_header(&data)?;
    if header.id != STATUS_RESPONSE_ID {
        return Err(PingError::UnexpectedPacket(header.id));
    }
    let status = parse_status_response(header.payload)?;
    let raw = data[..header.frame_length()].to_vec();

    Ok(status.with_raw(raw))
}

/// Reads until the peer goes quiet for `settle`, closes, or the overall
/// deadline passes.
async fn read_until_settled(
    stream: &mut TcpStream,
    options: &PingOptions,
) -> Result<Vec<u8>, PingError> {
    let deadline = Instant::now() + options.timeout;
    let mut data = Vec::new();
    let mut buffer = [0u8; 4096];

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        let wait = if data.is_empty() {
            remaining
        } else {
            options.settle.min(remaining)
        };

        match timeout(wait, stream.read(&mut buffer)).await {
            Ok(Ok(0)) => {
                if data.is_empty() {
                    return Err(PingError::Connection(io::ErrorKind::UnexpectedEof.into()));
                }
                break;
            }
            Ok(Ok(n)) => data.extend_from_slice(&buffer[..n]),
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => break,
        }
    }

    if data.is_empty() {
        return Err(PingError::Timeout);
    }
    Ok(data)
}
