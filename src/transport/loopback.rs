//! In-process edge for tests.
//!
//! Implements [`Connector`] and [`Session`] without a network hop: every
//! opened stream is served by a task that plays the device side. TCP and UDP
//! tunnel requests are dialed for real, PTY streams echo, and PTY commands
//! are recorded for inspection.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpStream, UdpSocket};
use tokio_util::sync::CancellationToken;

use super::{read_message, write_message, Connector, MessageKind, MuxStream, Session};
use crate::bridge::udp::{read_datagram, write_datagram};
use crate::error::TransportError;
use crate::resolver::EdgeRoute;

pub(crate) const PTY_SESSION_ID: &str = "pty-1";

#[derive(Default)]
struct EdgeState {
    /// Routes and tokens presented to [`Connector::open`].
    opens: Mutex<Vec<(EdgeRoute, String)>>,
    /// Decoded JSON payloads of Pty and PtyCommand messages, in arrival order.
    pty_messages: Mutex<Vec<(MessageKind, Value)>>,
    /// Number of upcoming `open` calls to fail.
    refuse_opens: AtomicUsize,
    sessions: Mutex<Vec<CancellationToken>>,
}

#[derive(Clone, Default)]
pub(crate) struct LoopbackEdge {
    state: Arc<EdgeState>,
}

impl LoopbackEdge {
    pub fn start() -> Self {
        Self::default()
    }

    /// A fresh session that is not tied to any route.
    pub fn session(&self) -> Arc<dyn Session> {
        Arc::new(self.new_session())
    }

    /// Fail the next `n` calls to `open`.
    pub fn refuse_next_opens(&self, n: usize) {
        self.state.refuse_opens.store(n, Ordering::SeqCst);
    }

    /// Kill every live session, as if the device dropped off the edge.
    pub fn fail_sessions(&self) {
        for token in self.state.sessions.lock().unwrap().drain(..) {
            token.cancel();
        }
    }

    pub fn opens(&self) -> Vec<(EdgeRoute, String)> {
        self.state.opens.lock().unwrap().clone()
    }

    pub fn pty_messages(&self) -> Vec<(MessageKind, Value)> {
        self.state.pty_messages.lock().unwrap().clone()
    }

    fn new_session(&self) -> LoopbackSession {
        let shutdown = CancellationToken::new();
        self.state.sessions.lock().unwrap().push(shutdown.clone());
        LoopbackSession {
            state: self.state.clone(),
            shutdown,
        }
    }
}

#[async_trait]
impl Connector for LoopbackEdge {
    async fn open(&self, route: &EdgeRoute, auth_token: &str) -> Result<Arc<dyn Session>, TransportError> {
        self.state
            .opens
            .lock()
            .unwrap()
            .push((route.clone(), auth_token.to_string()));
        let refused = self
            .state
            .refuse_opens
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(TransportError::Connect("edge unavailable".into()));
        }
        Ok(Arc::new(self.new_session()))
    }
}

struct LoopbackSession {
    state: Arc<EdgeState>,
    shutdown: CancellationToken,
}

#[async_trait]
impl Session for LoopbackSession {
    async fn open_stream(&self) -> Result<MuxStream, TransportError> {
        if self.shutdown.is_cancelled() {
            return Err(TransportError::SessionClosed);
        }
        let (local, remote) = tokio::io::duplex(64 * 1024);
        let state = self.state.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = shutdown.cancelled() => {}
                () = serve_stream(state, remote) => {}
            }
        });
        Ok(local)
    }

    async fn accept_stream(&self) -> Result<MuxStream, TransportError> {
        self.shutdown.cancelled().await;
        Err(TransportError::SessionClosed)
    }

    async fn close(&self) {
        self.shutdown.cancel();
    }
}

async fn serve_stream(state: Arc<EdgeState>, mut stream: MuxStream) {
    let Ok(msg) = read_message(&mut stream).await else {
        return;
    };
    let target = String::from_utf8_lossy(&msg.payload).into_owned();
    match msg.kind {
        MessageKind::TcpTunnel => match TcpStream::connect(&target).await {
            Ok(mut tcp) => {
                if write_message(&mut stream, MessageKind::Ok, b"").await.is_ok() {
                    let _ = tokio::io::copy_bidirectional(&mut stream, &mut tcp).await;
                }
            }
            Err(e) => {
                let _ = write_message(&mut stream, MessageKind::Error, e.to_string().as_bytes()).await;
            }
        },
        MessageKind::UdpTunnel => {
            let Ok(socket) = UdpSocket::bind("127.0.0.1:0").await else { return };
            if socket.connect(&target).await.is_err() {
                let _ = write_message(&mut stream, MessageKind::Error, b"udp connect failed").await;
                return;
            }
            if write_message(&mut stream, MessageKind::Ok, b"").await.is_err() {
                return;
            }
            let (mut rd, mut wr) = tokio::io::split(stream);
            let upstream = async {
                while let Ok(Some(datagram)) = read_datagram(&mut rd).await {
                    let _ = socket.send(&datagram).await;
                }
            };
            let downstream = async {
                let mut buf = vec![0u8; 65_535];
                while let Ok(n) = socket.recv(&mut buf).await {
                    if write_datagram(&mut wr, &buf[..n]).await.is_err() {
                        break;
                    }
                }
            };
            tokio::select! {
                () = upstream => {}
                () = downstream => {}
            }
        }
        MessageKind::Pty => {
            record(&state, msg.kind, &msg.payload);
            if write_message(&mut stream, MessageKind::Ok, PTY_SESSION_ID.as_bytes()).await.is_ok() {
                let (mut rd, mut wr) = tokio::io::split(stream);
                let _ = tokio::io::copy(&mut rd, &mut wr).await;
                let _ = wr.shutdown().await;
            }
        }
        MessageKind::PtyCommand => {
            record(&state, msg.kind, &msg.payload);
            let _ = write_message(&mut stream, MessageKind::Ok, b"").await;
        }
        MessageKind::Ok | MessageKind::Error => {
            let _ = write_message(&mut stream, MessageKind::Error, b"unexpected message").await;
        }
    }
}

fn record(state: &EdgeState, kind: MessageKind, payload: &[u8]) {
    let value = serde_json::from_slice(payload).unwrap_or(Value::Null);
    state.pty_messages.lock().unwrap().push((kind, value));
}
