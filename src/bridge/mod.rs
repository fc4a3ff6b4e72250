//! Local ends of a tunnel.
//!
//! [`run`] binds one listener per target, bridges every local connection or
//! datagram flow to a fresh stream on the session, and blocks until the
//! session dies or the caller cancels. Everything spawned here lives in one
//! `JoinSet` and is aborted on return.

pub mod stdio;
pub mod tcp;
pub mod udp;

use std::io;
use std::sync::Arc;

use tokio::net::{TcpListener, UdpSocket};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{ParseError, TunnelError};
use crate::target::{validate_targets, Protocol, Target};
use crate::transport::Session;

enum Bound {
    Tcp(TcpListener),
    Udp(UdpSocket),
}

/// Serve `targets` over `session` until the session fails or `cancel` fires.
///
/// Returns `Ok(())` on cancellation and [`TunnelError::Session`] naming
/// `device` when the session goes away underneath.
pub async fn run(
    session: Arc<dyn Session>,
    device: &str,
    targets: &[Target],
    cancel: CancellationToken,
) -> Result<(), TunnelError> {
    if targets.is_empty() {
        return Err(ParseError::NoTargets(device.to_string()).into());
    }
    validate_targets(targets)?;

    if let [target] = targets {
        if target.is_stdio() {
            return tokio::select! {
                () = cancel.cancelled() => Ok(()),
                res = stdio::run(session.as_ref(), target, tokio::io::stdin(), tokio::io::stdout()) => res,
            };
        }
    }

    // Bind everything before serving anything so a bad port fails the whole set
    let mut bound = Vec::with_capacity(targets.len());
    for target in targets {
        bound.push((bind(target).await?, target));
    }

    let mut tasks = JoinSet::new();
    for (socket, target) in bound {
        let remote = target.remote_addr();
        match socket {
            Bound::Tcp(listener) => {
                tasks.spawn(tcp::serve(listener, session.clone(), remote, cancel.clone()));
            }
            Bound::Udp(socket) => {
                tasks.spawn(udp::serve(socket, session.clone(), remote, cancel.clone()));
            }
        }
        println!(
            "Tunneling {} {} to {}",
            target.protocol,
            target.local_addr(),
            target.remote_addr()
        );
    }

    // The device never opens streams towards us; accept only fails once the
    // session is gone
    let watch = async {
        loop {
            match session.accept_stream().await {
                Ok(stream) => {
                    debug!("Dropping unexpected inbound stream");
                    drop(stream);
                }
                Err(e) => return e,
            }
        }
    };

    let result = tokio::select! {
        () = cancel.cancelled() => {
            println!("Connection closed");
            Ok(())
        }
        err = watch => Err(TunnelError::Session {
            device: device.to_string(),
            source: err,
        }),
    };

    tasks.shutdown().await;
    session.close().await;
    info!(device, "Tunnel stopped");
    result
}

async fn bind(target: &Target) -> Result<Bound, TunnelError> {
    let addr = target.local_addr();
    let bound = match target.protocol {
        Protocol::Tcp => TcpListener::bind(&addr).await.map(Bound::Tcp),
        Protocol::Udp => UdpSocket::bind(&addr).await.map(Bound::Udp),
    };
    bound.map_err(|source| TunnelError::Bind { addr, source })
}

/// Ask the OS for a currently unused TCP port on the loopback interface.
pub async fn free_port() -> io::Result<u16> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    Ok(listener.local_addr()?.port())
}
