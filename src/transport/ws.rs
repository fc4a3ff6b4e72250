//! WebSocket session with stream multiplexing.
//!
//! WebSocket has no native streams, so every binary message carries a small
//! header:
//!
//! - 4 bytes: stream id (big-endian u32)
//! - 1 byte: frame kind (0 = data, 1 = fin, 2 = window)
//! - rest: payload
//!
//! The client allocates odd stream ids, the edge even ones. A data frame for
//! an unknown id of the peer's parity opens a new inbound stream.
//!
//! Each stream handed out is one half of a `tokio::io::duplex` pair; a pump
//! task moves bytes between the other half and the WebSocket. When the
//! session dies the pumps are dropped and every stream sees EOF.
//!
//! Flow control is per stream. A side may have at most [`STREAM_WINDOW`]
//! unacknowledged data bytes in flight on a stream; the receiver hands
//! credit back with a window frame (u32 BE byte count) once the bytes reach
//! the stream's reader. The reader task never waits on a single stream, so
//! a stream nobody reads only stalls itself. A peer that overruns the
//! window gets the stream reset.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Semaphore};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::{edge_url, uses_relaxed_tls, Connector, MuxStream, Session};
use crate::error::TransportError;
use crate::resolver::EdgeRoute;

const FRAME_DATA: u8 = 0;
const FRAME_FIN: u8 = 1;
const FRAME_WINDOW: u8 = 2;
const HEADER_LEN: usize = 5;

/// Per-stream buffer between the caller and its pump.
const STREAM_BUFFER: usize = 64 * 1024;
const CHUNK: usize = 16 * 1024;
/// Unacknowledged bytes a sender may have in flight on one stream.
pub const STREAM_WINDOW: usize = 256 * 1024;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

fn encode_frame(stream_id: u32, kind: u8, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.extend_from_slice(&stream_id.to_be_bytes());
    frame.push(kind);
    frame.extend_from_slice(payload);
    frame
}

fn decode_frame(data: &[u8]) -> Option<(u32, u8, &[u8])> {
    if data.len() < HEADER_LEN {
        return None;
    }
    let stream_id = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
    Some((stream_id, data[4], &data[HEADER_LEN..]))
}

// Chunks and windows are far below u32::MAX
#[allow(clippy::cast_possible_truncation)]
fn window_frame(stream_id: u32, credit: usize) -> Vec<u8> {
    encode_frame(stream_id, FRAME_WINDOW, &(credit as u32).to_be_bytes())
}

/// Which end of the WebSocket this session is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Edge,
}

impl Role {
    fn first_stream_id(self) -> u32 {
        match self {
            Self::Client => 1,
            Self::Edge => 2,
        }
    }

    fn owns(self, stream_id: u32) -> bool {
        (stream_id % 2 == 1) == (self == Self::Client)
    }
}

enum Inbound {
    Data(Bytes),
    Fin,
}

/// Reader-side view of one stream.
#[derive(Clone)]
struct StreamEntry {
    inbound: mpsc::UnboundedSender<Inbound>,
    /// Bytes the peer may still send before waiting for a window frame.
    send_credit: Arc<Semaphore>,
    /// Bytes received but not yet handed to the stream's reader.
    buffered: Arc<AtomicUsize>,
}

type StreamMap = Arc<Mutex<HashMap<u32, StreamEntry>>>;

/// Outgoing frame queues. Data and FIN frames keep their order on `data`;
/// window frames jump the queue on `control` and never block.
#[derive(Clone)]
struct Outbound {
    data: mpsc::Sender<Vec<u8>>,
    control: mpsc::UnboundedSender<Vec<u8>>,
}

/// A multiplexed session over one WebSocket.
pub struct WsSession {
    role: Role,
    outbound: Outbound,
    streams: StreamMap,
    accept_rx: tokio::sync::Mutex<mpsc::Receiver<MuxStream>>,
    next_stream_id: AtomicU32,
    shutdown: CancellationToken,
}

impl WsSession {
    /// Take over an established WebSocket and start its reader and writer.
    pub fn new<S>(ws: WebSocketStream<S>, role: Role) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (sink, source) = ws.split();
        let (data_tx, data_rx) = mpsc::channel::<Vec<u8>>(256);
        let (control_tx, control_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let (accept_tx, accept_rx) = mpsc::channel(64);
        let streams: StreamMap = Arc::new(Mutex::new(HashMap::new()));
        let shutdown = CancellationToken::new();
        let outbound = Outbound {
            data: data_tx,
            control: control_tx,
        };

        tokio::spawn(writer_task(sink, data_rx, control_rx, shutdown.clone()));
        tokio::spawn(reader_task(
            source,
            role,
            streams.clone(),
            accept_tx,
            outbound.clone(),
            shutdown.clone(),
        ));

        Self {
            role,
            outbound,
            streams,
            accept_rx: tokio::sync::Mutex::new(accept_rx),
            next_stream_id: AtomicU32::new(role.first_stream_id()),
            shutdown,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

impl Drop for WsSession {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[async_trait]
impl Session for WsSession {
    async fn open_stream(&self) -> Result<MuxStream, TransportError> {
        if self.shutdown.is_cancelled() {
            return Err(TransportError::SessionClosed);
        }
        // Step by two to keep the id parity of this side
        let stream_id = self.next_stream_id.fetch_add(2, Ordering::SeqCst);
        debug!(stream_id, "Opened stream");
        let (stream, _) = register_stream(
            stream_id,
            &self.streams,
            self.outbound.clone(),
            self.shutdown.clone(),
        );
        Ok(stream)
    }

    async fn accept_stream(&self) -> Result<MuxStream, TransportError> {
        let mut rx = self.accept_rx.lock().await;
        tokio::select! {
            () = self.shutdown.cancelled() => Err(TransportError::SessionClosed),
            stream = rx.recv() => stream.ok_or(TransportError::SessionClosed),
        }
    }

    async fn close(&self) {
        debug!("Closing session");
        self.shutdown.cancel();
    }
}

/// Allocate the duplex pair for a stream and start its pump.
fn register_stream(
    stream_id: u32,
    streams: &StreamMap,
    outbound: Outbound,
    shutdown: CancellationToken,
) -> (MuxStream, StreamEntry) {
    let (user, pump) = tokio::io::duplex(STREAM_BUFFER);
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let entry = StreamEntry {
        inbound: inbound_tx,
        send_credit: Arc::new(Semaphore::new(STREAM_WINDOW)),
        buffered: Arc::new(AtomicUsize::new(0)),
    };
    if let Ok(mut map) = streams.lock() {
        map.insert(stream_id, entry.clone());
    }
    let streams = streams.clone();
    let send_credit = entry.send_credit.clone();
    let buffered = entry.buffered.clone();
    tokio::spawn(async move {
        tokio::select! {
            () = shutdown.cancelled() => {}
            () = pump_stream(stream_id, pump, inbound_rx, outbound, send_credit, buffered) => {}
        }
        if let Ok(mut map) = streams.lock() {
            map.remove(&stream_id);
        }
        trace!(stream_id, "Stream pump ended");
    });
    (user, entry)
}

async fn pump_stream(
    stream_id: u32,
    pump: MuxStream,
    mut inbound_rx: mpsc::UnboundedReceiver<Inbound>,
    outbound: Outbound,
    send_credit: Arc<Semaphore>,
    buffered: Arc<AtomicUsize>,
) {
    let (mut rd, mut wr) = tokio::io::split(pump);

    let sending = async {
        let mut buf = vec![0u8; CHUNK];
        loop {
            match rd.read(&mut buf).await {
                Ok(0) | Err(_) => {
                    let _ = outbound.data.send(encode_frame(stream_id, FRAME_FIN, &[])).await;
                    break;
                }
                Ok(n) => {
                    // n <= CHUNK
                    #[allow(clippy::cast_possible_truncation)]
                    match send_credit.acquire_many(n as u32).await {
                        Ok(permits) => permits.forget(),
                        Err(_) => break,
                    }
                    if outbound
                        .data
                        .send(encode_frame(stream_id, FRAME_DATA, &buf[..n]))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
            }
        }
    };

    let receiving = async {
        while let Some(msg) = inbound_rx.recv().await {
            match msg {
                Inbound::Data(data) => {
                    if wr.write_all(&data).await.is_err() {
                        break;
                    }
                    buffered.fetch_sub(data.len(), Ordering::SeqCst);
                    if outbound.control.send(window_frame(stream_id, data.len())).is_err() {
                        break;
                    }
                }
                Inbound::Fin => break,
            }
        }
        let _ = wr.shutdown().await;
    };

    tokio::join!(sending, receiving);
}

async fn writer_task<S>(
    mut sink: SplitSink<WebSocketStream<S>, Message>,
    mut data: mpsc::Receiver<Vec<u8>>,
    mut control: mpsc::UnboundedReceiver<Vec<u8>>,
    shutdown: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    loop {
        let frame = tokio::select! {
            biased;
            () = shutdown.cancelled() => break,
            Some(frame) = control.recv() => frame,
            frame = data.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };
        if let Err(e) = sink.send(Message::Binary(frame.into())).await {
            warn!("WebSocket send error: {e}");
            break;
        }
    }
    shutdown.cancel();
    let _ = sink.close().await;
    debug!("WebSocket writer ended");
}

/// Queue `payload` for the stream's reader without waiting. Returns false
/// when the peer overran the window.
fn deliver(entry: &StreamEntry, payload: &[u8]) -> bool {
    let held = entry.buffered.fetch_add(payload.len(), Ordering::SeqCst) + payload.len();
    if held > STREAM_WINDOW {
        return false;
    }
    let _ = entry.inbound.send(Inbound::Data(Bytes::copy_from_slice(payload)));
    true
}

/// Drop the stream locally and tell the peer it is finished.
fn reset_stream(stream_id: u32, streams: &StreamMap, outbound: &Outbound) {
    warn!(stream_id, "Peer overran stream window, resetting");
    if let Ok(mut map) = streams.lock() {
        map.remove(&stream_id);
    }
    let _ = outbound.control.send(encode_frame(stream_id, FRAME_FIN, &[]));
}

async fn reader_task<S>(
    mut source: SplitStream<WebSocketStream<S>>,
    role: Role,
    streams: StreamMap,
    accept_tx: mpsc::Sender<MuxStream>,
    outbound: Outbound,
    shutdown: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    loop {
        let next = tokio::select! {
            () = shutdown.cancelled() => break,
            next = source.next() => next,
        };
        let data = match next {
            Some(Ok(Message::Binary(data))) => data,
            Some(Ok(Message::Close(_))) | None => {
                debug!("WebSocket closed by peer");
                break;
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                warn!("WebSocket read error: {e}");
                break;
            }
        };

        let Some((stream_id, kind, payload)) = decode_frame(&data) else {
            warn!("Invalid frame received");
            continue;
        };

        let existing = streams.lock().ok().and_then(|map| map.get(&stream_id).cloned());
        match (existing, kind) {
            (Some(entry), FRAME_DATA) => {
                if !deliver(&entry, payload) {
                    reset_stream(stream_id, &streams, &outbound);
                }
            }
            (Some(entry), FRAME_FIN) => {
                let _ = entry.inbound.send(Inbound::Fin);
            }
            (Some(entry), FRAME_WINDOW) => {
                let Ok(raw) = <[u8; 4]>::try_from(payload) else {
                    warn!(stream_id, "Malformed window frame");
                    continue;
                };
                let granted = u32::from_be_bytes(raw) as usize;
                // Never hold more credit than one full window
                let room = STREAM_WINDOW.saturating_sub(entry.send_credit.available_permits());
                entry.send_credit.add_permits(granted.min(room));
            }
            (None, FRAME_DATA) if !role.owns(stream_id) => {
                let (stream, entry) =
                    register_stream(stream_id, &streams, outbound.clone(), shutdown.clone());
                if !deliver(&entry, payload) {
                    reset_stream(stream_id, &streams, &outbound);
                    continue;
                }
                if accept_tx.try_send(stream).is_err() {
                    warn!(stream_id, "Accept queue full, dropping stream");
                }
            }
            (_, kind) => trace!(stream_id, kind, "Dropping frame"),
        }
    }
    shutdown.cancel();
    debug!("WebSocket reader ended");
}

/// Opens [`WsSession`]s to `wss://{edge}/device/{uuid}`.
#[derive(Debug, Clone)]
pub struct WsConnector {
    connect_timeout: Duration,
}

impl Default for WsConnector {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

impl WsConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }

    /// Dial `url` with a bearer token. `relaxed_tls` skips certificate and
    /// hostname verification.
    pub async fn connect_url(
        &self,
        url: &str,
        auth_token: &str,
        relaxed_tls: bool,
    ) -> Result<WsSession, TransportError> {
        let mut request = url
            .into_client_request()
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {auth_token}"))
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        request.headers_mut().insert("Authorization", bearer);

        let tls = if relaxed_tls {
            let connector = native_tls::TlsConnector::builder()
                .danger_accept_invalid_certs(true)
                .danger_accept_invalid_hostnames(true)
                .build()
                .map_err(|e| TransportError::Connect(e.to_string()))?;
            Some(tokio_tungstenite::Connector::NativeTls(connector))
        } else {
            None
        };

        let handshake = tokio_tungstenite::connect_async_tls_with_config(request, None, true, tls);
        let (ws, _response) = tokio::time::timeout(self.connect_timeout, handshake)
            .await
            .map_err(|_| TransportError::Connect(format!("timed out connecting to {url}")))?
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        debug!(url, "Edge session established");
        Ok(WsSession::new(ws, Role::Client))
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn open(&self, route: &EdgeRoute, auth_token: &str) -> Result<Arc<dyn Session>, TransportError> {
        let url = edge_url(route);
        let session = self
            .connect_url(&url, auth_token, uses_relaxed_tls(&route.edge_host))
            .await?;
        Ok(Arc::new(session))
    }
}
