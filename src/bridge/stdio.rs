//! Stdio passthrough, for use as an ssh `ProxyCommand` and similar.

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::error::TunnelError;
use crate::target::Target;
use crate::transport::{open_typed_stream, MessageKind, Session};

/// Bridge `input`/`output` to one tunnel stream towards `target`'s remote
/// end. Returns when either direction reaches EOF.
pub async fn run<R, W>(session: &dyn Session, target: &Target, mut input: R, mut output: W) -> Result<(), TunnelError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let remote = target.remote_addr();
    let (stream, _) = open_typed_stream(session, MessageKind::TcpTunnel, remote.as_bytes()).await?;
    let (mut rd, mut wr) = tokio::io::split(stream);

    let upstream = async {
        tokio::io::copy(&mut input, &mut wr).await?;
        wr.shutdown().await
    };
    let downstream = async {
        tokio::io::copy(&mut rd, &mut output).await?;
        output.flush().await
    };

    tokio::select! {
        res = upstream => res?,
        res = downstream => res?,
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::parse_target;
    use crate::transport::loopback::LoopbackEdge;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn stdio_moves_bytes_both_ways() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let (mut rd, mut wr) = sock.split();
            let _ = tokio::io::copy(&mut rd, &mut wr).await;
        });

        let target = parse_target(&format!("stdio:127.0.0.1:{port}")).unwrap();
        let edge = LoopbackEdge::start();
        let session = edge.session();

        let (mut stdin_w, stdin_r) = tokio::io::duplex(1024);
        let (stdout_w, mut stdout_r) = tokio::io::duplex(1024);
        let bridge = tokio::spawn(async move { run(session.as_ref(), &target, stdin_r, stdout_w).await });

        stdin_w.write_all(b"SSH-2.0-test\r\n").await.unwrap();
        let mut buf = [0u8; 14];
        stdout_r.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"SSH-2.0-test\r\n");

        drop(stdin_w);
        assert!(bridge.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn refused_remote_is_transport_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let target = parse_target(&format!("stdio:127.0.0.1:{port}")).unwrap();
        let edge = LoopbackEdge::start();
        let session = edge.session();
        let err = run(session.as_ref(), &target, tokio::io::empty(), tokio::io::sink())
            .await
            .unwrap_err();
        assert!(matches!(err, TunnelError::Transport(_)));
    }
}
