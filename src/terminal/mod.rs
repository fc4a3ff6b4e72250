//! Interactive terminal sessions on a device.
//!
//! A terminal is one `Pty` stream carrying the shell's bytes plus a control
//! channel for window size changes. Each resize travels on its own short-lived
//! stream as a `PtyCommand` message and must be acknowledged.

pub mod raw;
pub mod resize;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{TransportError, TunnelError};
use crate::transport::{open_typed_stream, MessageKind, Session};

pub use raw::{term_size, RawModeGuard};
pub use resize::{platform_watcher, NoopResizeWatcher, ResizeWatcher};

/// Terminal dimensions in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TermSize {
    pub cols: u16,
    pub rows: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PtyCommandKind {
    Resize,
}

/// Control message for a device PTY.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PtyCommand {
    #[serde(rename = "type")]
    pub kind: PtyCommandKind,
    pub session_id: String,
    pub cols: u16,
    pub rows: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command_args: Vec<String>,
}

impl PtyCommand {
    pub fn resize(session_id: &str, size: TermSize) -> Self {
        Self {
            kind: PtyCommandKind::Resize,
            session_id: session_id.to_string(),
            cols: size.cols,
            rows: size.rows,
            command: None,
            command_args: Vec::new(),
        }
    }

    /// Initial command for a new PTY: the window size, plus the program to
    /// run instead of the login shell when `command` is non-empty.
    pub fn open(size: TermSize, command: &[String]) -> Self {
        let mut cmd = Self::resize("", size);
        if let Some((program, args)) = command.split_first() {
            cmd.command = Some(program.clone());
            cmd.command_args = args.to_vec();
        }
        cmd
    }
}

/// Send one resize on a fresh control stream and wait for the OK.
pub async fn send_resize(session: &dyn Session, session_id: &str, size: TermSize) -> Result<(), TransportError> {
    let payload = serde_json::to_vec(&PtyCommand::resize(session_id, size))
        .map_err(|e| TransportError::Protocol(e.to_string()))?;
    let (mut stream, _) = open_typed_stream(session, MessageKind::PtyCommand, &payload).await?;
    let _ = stream.shutdown().await;
    debug!(session_id, cols = size.cols, rows = size.rows, "Terminal resized");
    Ok(())
}

/// Forward size changes from `watcher` until it runs dry. Unchanged sizes
/// are skipped; a failed resize is logged and the next change retried.
async fn forward_resizes(
    session: &dyn Session,
    session_id: &str,
    mut last: TermSize,
    watcher: &mut dyn ResizeWatcher,
) {
    while let Some(size) = watcher.next_size().await {
        if size == last {
            continue;
        }
        match send_resize(session, session_id, size).await {
            Ok(()) => last = size,
            Err(e) => warn!("error resizing terminal: {e}"),
        }
    }
}

/// Run a terminal session over `input`/`output`.
///
/// Ends when either copy direction finishes or `cancel` fires.
pub async fn run_session<R, W>(
    session: &dyn Session,
    command: &[String],
    size: TermSize,
    mut input: R,
    mut output: W,
    mut watcher: Box<dyn ResizeWatcher>,
    cancel: CancellationToken,
) -> Result<(), TunnelError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let payload = serde_json::to_vec(&PtyCommand::open(size, command))
        .map_err(|e| TransportError::Protocol(e.to_string()))?;
    let (stream, session_id) = open_typed_stream(session, MessageKind::Pty, &payload)
        .await
        .map_err(|e| TransportError::StreamOpen(format!("error opening shell stream: {e}")))?;
    debug!(session_id, "PTY opened");

    let (mut rd, mut wr) = tokio::io::split(stream);
    let to_pty = async {
        tokio::io::copy(&mut input, &mut wr).await?;
        wr.shutdown().await
    };
    let from_pty = async {
        tokio::io::copy(&mut rd, &mut output).await?;
        output.flush().await
    };
    let resizes = async {
        forward_resizes(session, &session_id, size, watcher.as_mut()).await;
        std::future::pending::<()>().await;
    };

    tokio::select! {
        () = cancel.cancelled() => {}
        res = to_pty => res?,
        res = from_pty => res?,
        () = resizes => {}
    }
    Ok(())
}

/// Interactive terminal on the process' own tty: raw mode for the duration
/// of the session, SIGWINCH-driven resizes.
pub async fn run(session: Arc<dyn Session>, command: &[String], cancel: CancellationToken) -> Result<(), TunnelError> {
    let _guard = RawModeGuard::enable()?;
    let size = term_size()?;
    run_session(
        session.as_ref(),
        command,
        size,
        tokio::io::stdin(),
        tokio::io::stdout(),
        platform_watcher(),
        cancel,
    )
    .await
}
