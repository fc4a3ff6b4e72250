//! TCP listener bridge: one tunnel stream per accepted connection.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::transport::{open_typed_stream, MessageKind, Session};

/// Pause after a failed accept, e.g. when out of file descriptors.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Accept connections on `listener` until cancelled. Connections in flight
/// are aborted when this returns.
pub async fn serve(
    listener: TcpListener,
    session: Arc<dyn Session>,
    remote: String,
    cancel: CancellationToken,
) {
    let mut conns = JoinSet::new();
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((tcp, peer)) => {
                    debug!(%peer, remote, "Accepted connection");
                    conns.spawn(forward(tcp, session.clone(), remote.clone()));
                }
                Err(e) => {
                    warn!("Accept failed: {e}");
                    if !pause(&cancel, ACCEPT_RETRY_DELAY).await {
                        break;
                    }
                }
            },
        }
        while conns.try_join_next().is_some() {}
    }
    conns.shutdown().await;
}

/// Sleep for `delay`; false when cancelled first.
async fn pause(cancel: &CancellationToken, delay: Duration) -> bool {
    tokio::select! {
        () = cancel.cancelled() => false,
        () = tokio::time::sleep(delay) => true,
    }
}

async fn forward(mut tcp: TcpStream, session: Arc<dyn Session>, remote: String) {
    let mut stream = match open_typed_stream(session.as_ref(), MessageKind::TcpTunnel, remote.as_bytes()).await {
        Ok((stream, _)) => stream,
        Err(e) => {
            warn!(remote, "Error opening tunnel stream: {e}");
            return;
        }
    };
    match tokio::io::copy_bidirectional(&mut tcp, &mut stream).await {
        Ok((up, down)) => debug!(remote, up, down, "Connection closed"),
        Err(e) => debug!(remote, "Connection ended: {e}"),
    }
}
