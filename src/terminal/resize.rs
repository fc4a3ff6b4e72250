//! Terminal resize notifications.

use async_trait::async_trait;
use tracing::warn;

use super::TermSize;

/// Source of terminal size changes.
#[async_trait]
pub trait ResizeWatcher: Send {
    /// Wait for the next change notification and report the size at that
    /// point. `None` means no further notifications will arrive.
    async fn next_size(&mut self) -> Option<TermSize>;
}

/// SIGWINCH-driven watcher.
#[cfg(unix)]
pub struct SignalResizeWatcher {
    signal: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl SignalResizeWatcher {
    pub fn new() -> std::io::Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};
        Ok(Self {
            signal: signal(SignalKind::window_change())?,
        })
    }
}

#[cfg(unix)]
#[async_trait]
impl ResizeWatcher for SignalResizeWatcher {
    async fn next_size(&mut self) -> Option<TermSize> {
        loop {
            self.signal.recv().await?;
            match super::raw::term_size() {
                Ok(size) => return Some(size),
                Err(e) => warn!("error reading terminal size: {e}"),
            }
        }
    }
}

/// Watcher for platforms without resize notifications.
pub struct NoopResizeWatcher;

#[async_trait]
impl ResizeWatcher for NoopResizeWatcher {
    async fn next_size(&mut self) -> Option<TermSize> {
        None
    }
}

/// The watcher for this platform.
pub fn platform_watcher() -> Box<dyn ResizeWatcher> {
    #[cfg(unix)]
    {
        match SignalResizeWatcher::new() {
            Ok(w) => return Box::new(w),
            Err(e) => warn!("resize notifications unavailable: {e}"),
        }
    }
    Box::new(NoopResizeWatcher)
}
