//! UDP socket bridge.
//!
//! Each local peer address is a flow with its own tunnel stream. Datagram
//! boundaries survive the byte stream by a u16 big-endian length prefix.
//! Flows end when their stream closes or after [`FLOW_IDLE_TIMEOUT`] without
//! traffic from the local peer.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::transport::{open_typed_stream, MessageKind, Session};

pub const FLOW_IDLE_TIMEOUT: Duration = Duration::from_secs(120);

const MAX_DATAGRAM: usize = u16::MAX as usize;
/// Datagrams queued per flow while its stream is opening or busy.
const FLOW_BACKLOG: usize = 64;

/// Write one length-prefixed datagram.
pub async fn write_datagram<W>(w: &mut W, datagram: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let len = u16::try_from(datagram.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "datagram too large"))?;
    let mut buf = Vec::with_capacity(2 + datagram.len());
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(datagram);
    w.write_all(&buf).await?;
    w.flush().await
}

/// Read one length-prefixed datagram; `None` on a clean end of stream.
pub async fn read_datagram<R>(r: &mut R) -> io::Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut len = [0u8; 2];
    match r.read_exact(&mut len).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let mut datagram = vec![0u8; usize::from(u16::from_be_bytes(len))];
    r.read_exact(&mut datagram).await?;
    Ok(Some(datagram))
}

/// Relay datagrams on `socket` until cancelled.
pub async fn serve(
    socket: UdpSocket,
    session: Arc<dyn Session>,
    remote: String,
    cancel: CancellationToken,
) {
    let socket = Arc::new(socket);
    let mut flows: HashMap<SocketAddr, mpsc::Sender<Vec<u8>>> = HashMap::new();
    let mut tasks = JoinSet::new();
    let mut buf = vec![0u8; MAX_DATAGRAM];

    loop {
        let (n, peer) = tokio::select! {
            () = cancel.cancelled() => break,
            received = socket.recv_from(&mut buf) => match received {
                Ok(r) => r,
                Err(e) => {
                    warn!("UDP receive failed: {e}");
                    continue;
                }
            },
        };
        let datagram = buf[..n].to_vec();

        let Some(datagram) = dispatch(&flows, peer, datagram) else {
            continue;
        };

        let (tx, rx) = mpsc::channel(FLOW_BACKLOG);
        // Fresh channel with capacity; cannot fail
        let _ = tx.try_send(datagram);
        flows.insert(peer, tx);
        debug!(%peer, remote, "New UDP flow");
        tasks.spawn(flow(socket.clone(), peer, rx, session.clone(), remote.clone()));

        while tasks.try_join_next().is_some() {}
        flows.retain(|_, tx| !tx.is_closed());
    }
    tasks.shutdown().await;
}

/// Hand `datagram` to `peer`'s flow without waiting. A backlogged flow drops
/// it. Returns the datagram when a new flow has to be started for it.
fn dispatch(
    flows: &HashMap<SocketAddr, mpsc::Sender<Vec<u8>>>,
    peer: SocketAddr,
    datagram: Vec<u8>,
) -> Option<Vec<u8>> {
    let Some(tx) = flows.get(&peer) else {
        return Some(datagram);
    };
    match tx.try_send(datagram) {
        Ok(()) => None,
        Err(mpsc::error::TrySendError::Full(_)) => {
            trace!(%peer, "UDP flow backlogged, dropping datagram");
            None
        }
        // Flow ended; start a new one with this datagram
        Err(mpsc::error::TrySendError::Closed(d)) => Some(d),
    }
}

async fn flow(
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    mut rx: mpsc::Receiver<Vec<u8>>,
    session: Arc<dyn Session>,
    remote: String,
) {
    let stream = match open_typed_stream(session.as_ref(), MessageKind::UdpTunnel, remote.as_bytes()).await {
        Ok((stream, _)) => stream,
        Err(e) => {
            warn!(remote, "Error opening UDP tunnel stream: {e}");
            return;
        }
    };
    let (mut rd, mut wr) = tokio::io::split(stream);

    let upstream = async {
        while let Ok(Some(datagram)) = tokio::time::timeout(FLOW_IDLE_TIMEOUT, rx.recv()).await {
            if write_datagram(&mut wr, &datagram).await.is_err() {
                break;
            }
        }
    };
    let downstream = async {
        while let Ok(Some(datagram)) = read_datagram(&mut rd).await {
            if socket.send_to(&datagram, peer).await.is_err() {
                break;
            }
        }
    };

    tokio::select! {
        () = upstream => {}
        () = downstream => {}
    }
    debug!(%peer, remote, "UDP flow closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::loopback::LoopbackEdge;

    #[tokio::test]
    async fn datagram_framing_keeps_boundaries() {
        let mut buf = Vec::new();
        write_datagram(&mut buf, b"one").await.unwrap();
        write_datagram(&mut buf, b"").await.unwrap();
        write_datagram(&mut buf, b"three").await.unwrap();
        assert_eq!(&buf[..2], &3u16.to_be_bytes());

        let mut r = buf.as_slice();
        assert_eq!(read_datagram(&mut r).await.unwrap().unwrap(), b"one");
        assert_eq!(read_datagram(&mut r).await.unwrap().unwrap(), b"");
        assert_eq!(read_datagram(&mut r).await.unwrap().unwrap(), b"three");
        assert!(read_datagram(&mut r).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn oversized_datagram_rejected() {
        let mut buf = Vec::new();
        let big = vec![0u8; MAX_DATAGRAM + 1];
        assert!(write_datagram(&mut buf, &big).await.is_err());
    }

    #[test]
    fn backlogged_flow_drops_instead_of_blocking() {
        let peer: SocketAddr = "127.0.0.1:5000".parse().unwrap();
        let mut flows = HashMap::new();
        assert_eq!(dispatch(&flows, peer, b"new".to_vec()), Some(b"new".to_vec()));

        let (tx, mut rx) = mpsc::channel(FLOW_BACKLOG);
        flows.insert(peer, tx);
        for _ in 0..FLOW_BACKLOG + 5 {
            assert_eq!(dispatch(&flows, peer, b"d".to_vec()), None);
        }
        let mut queued = 0;
        while rx.try_recv().is_ok() {
            queued += 1;
        }
        assert_eq!(queued, FLOW_BACKLOG);

        drop(rx);
        assert_eq!(dispatch(&flows, peer, b"again".to_vec()), Some(b"again".to_vec()));
    }

    #[tokio::test]
    async fn udp_flow_round_trip() {
        // Device-side UDP echo
        let device = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let device_addr = device.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 1500];
            loop {
                let (n, from) = device.recv_from(&mut buf).await.unwrap();
                device.send_to(&buf[..n], from).await.unwrap();
            }
        });

        let local = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let local_addr = local.local_addr().unwrap();
        let edge = LoopbackEdge::start();
        let cancel = CancellationToken::new();
        tokio::spawn(serve(local, edge.session(), device_addr.to_string(), cancel.clone()));

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.connect(local_addr).await.unwrap();
        client.send(b"ping").await.unwrap();
        let mut buf = [0u8; 16];
        let n = tokio::time::timeout(Duration::from_secs(5), client.recv(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], b"ping");
        cancel.cancel();
    }
}
