//! Multiplexed transport to the edge gateway.
//!
//! A [`Session`] is one authenticated connection to an edge that carries many
//! independent byte streams. Streams are plain `AsyncRead + AsyncWrite`
//! handles; what a stream is for is decided by the first control message
//! written on it (see [`open_typed_stream`]).
//!
//! Control message layout:
//!
//! ```text
//! +--------+-----------------+-------------+
//! | kind   | length (u32 BE) | payload     |
//! | 1 byte | 4 bytes         | length bytes|
//! +--------+-----------------+-------------+
//! ```

pub mod ws;

#[cfg(test)]
pub(crate) mod loopback;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

use crate::error::TransportError;
use crate::resolver::EdgeRoute;

pub use ws::WsConnector;

/// One duplex byte channel inside a session.
pub type MuxStream = tokio::io::DuplexStream;

/// Upper bound for a single control message payload.
pub const MAX_MESSAGE_LEN: usize = 1024 * 1024;

/// Edge hosts used in development setups, reached without certificate checks.
const RELAXED_TLS_PREFIXES: [&str; 2] = ["edge:", "localhost:"];

/// A live multiplexed connection to an edge.
#[async_trait]
pub trait Session: Send + Sync {
    /// Open a new outbound stream.
    async fn open_stream(&self) -> Result<MuxStream, TransportError>;

    /// Wait for a stream opened by the remote side. Fails once the session
    /// is gone, which makes it the liveness probe for idle sessions.
    async fn accept_stream(&self) -> Result<MuxStream, TransportError>;

    /// Tear the session down. Open streams see EOF.
    async fn close(&self);
}

/// Opens sessions to edges.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, route: &EdgeRoute, auth_token: &str) -> Result<Arc<dyn Session>, TransportError>;
}

/// Control message kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageKind {
    Ok = 0,
    Error = 1,
    TcpTunnel = 2,
    UdpTunnel = 3,
    Pty = 4,
    PtyCommand = 5,
}

impl MessageKind {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => Self::Ok,
            1 => Self::Error,
            2 => Self::TcpTunnel,
            3 => Self::UdpTunnel,
            4 => Self::Pty,
            5 => Self::PtyCommand,
            _ => return None,
        })
    }
}

/// A decoded control message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub kind: MessageKind,
    pub payload: Vec<u8>,
}

/// Write one control message.
pub async fn write_message<W>(w: &mut W, kind: MessageKind, payload: &[u8]) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    if payload.len() > MAX_MESSAGE_LEN {
        return Err(TransportError::Protocol(format!(
            "message payload too large: {} bytes",
            payload.len()
        )));
    }
    let mut buf = Vec::with_capacity(5 + payload.len());
    buf.push(kind as u8);
    // Length bounded by MAX_MESSAGE_LEN above
    #[allow(clippy::cast_possible_truncation)]
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(payload);
    w.write_all(&buf).await?;
    w.flush().await?;
    trace!(?kind, len = payload.len(), "Wrote control message");
    Ok(())
}

/// Read one control message.
pub async fn read_message<R>(r: &mut R) -> Result<Message, TransportError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 5];
    r.read_exact(&mut header).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            TransportError::SessionClosed
        } else {
            TransportError::Io(e)
        }
    })?;
    let kind = MessageKind::from_u8(header[0])
        .ok_or_else(|| TransportError::Protocol(format!("unknown message kind {}", header[0])))?;
    let len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]) as usize;
    if len > MAX_MESSAGE_LEN {
        return Err(TransportError::Protocol(format!("message payload too large: {len} bytes")));
    }
    let mut payload = vec![0u8; len];
    r.read_exact(&mut payload).await?;
    Ok(Message { kind, payload })
}

/// Read a reply and require it to be OK, returning its payload.
pub async fn expect_ok<R>(r: &mut R) -> Result<Vec<u8>, TransportError>
where
    R: AsyncRead + Unpin,
{
    let reply = read_message(r).await?;
    match reply.kind {
        MessageKind::Ok => Ok(reply.payload),
        MessageKind::Error => Err(TransportError::Rejected(
            String::from_utf8_lossy(&reply.payload).into_owned(),
        )),
        other => Err(TransportError::Protocol(format!("unexpected reply {other:?}"))),
    }
}

/// Open a stream, announce its purpose and wait for the remote to accept.
///
/// Returns the stream and the identifier the remote assigned to it (empty
/// for tunnels, the PTY session id for terminals).
pub async fn open_typed_stream(
    session: &dyn Session,
    kind: MessageKind,
    payload: &[u8],
) -> Result<(MuxStream, String), TransportError> {
    let mut stream = session
        .open_stream()
        .await
        .map_err(|e| TransportError::StreamOpen(e.to_string()))?;
    write_message(&mut stream, kind, payload).await?;
    let assigned = expect_ok(&mut stream).await?;
    let assigned = String::from_utf8(assigned)
        .map_err(|_| TransportError::Protocol("assigned id is not UTF-8".into()))?;
    Ok((stream, assigned))
}

/// `wss://{edge}/device/{uuid}`
pub fn edge_url(route: &EdgeRoute) -> String {
    format!("wss://{}/device/{}", route.edge_host, route.uuid)
}

/// Development edges run with self-signed certificates.
pub fn uses_relaxed_tls(edge_host: &str) -> bool {
    RELAXED_TLS_PREFIXES.iter().any(|p| edge_host.starts_with(p))
}
