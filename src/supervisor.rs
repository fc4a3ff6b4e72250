//! Multi-device connection supervisor.
//!
//! Every requested device gets its own task that runs the full connect cycle
//! and restarts it with exponential backoff plus jitter when it fails. Input
//! is validated for all devices before the first connection is attempted.
//!
//! Two failure modes:
//! - fail-fast (default): the first device that gives up cancels the rest and
//!   its error is returned.
//! - tolerant (`allow_failures`): failures are printed and collected, the
//!   remaining devices keep running.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::TunnelError;
use crate::target::{DeviceConnection, Target};

/// Connect attempts per device unless configured otherwise.
pub const DEFAULT_RETRIES: u32 = 1;
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_secs(5);
pub const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(60);

/// How often and how patiently to reconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Connect attempts before giving up; 0 retries forever.
    pub retries: u32,
    pub base: Duration,
    pub max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: DEFAULT_RETRIES,
            base: DEFAULT_BACKOFF_BASE,
            max: DEFAULT_BACKOFF_MAX,
        }
    }
}

impl RetryPolicy {
    /// `min(base * 2^attempt, max)`
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base.checked_mul(factor).unwrap_or(self.max).min(self.max)
    }

    /// Backoff for `attempt` plus a random share of itself, so devices that
    /// failed together do not reconnect in lockstep.
    pub fn delay(&self, attempt: u32) -> Duration {
        let backoff = self.backoff(attempt);
        let jitter: f64 = rand::thread_rng().gen_range(0.0..1.0);
        backoff + backoff.mul_f64(jitter)
    }

    fn exhausted(&self, attempts: u32) -> bool {
        self.retries > 0 && attempts >= self.retries
    }
}

/// One full connect cycle against one device.
///
/// Implementations return `Ok(())` only once `cancel` fired; any other end of
/// the connection is an error the supervisor may retry.
#[async_trait]
pub trait DeviceLink: Send + Sync {
    async fn connect(&self, device_id: &str, targets: &[Target], cancel: CancellationToken) -> Result<(), TunnelError>;
}

/// A device that was skipped or gave up.
#[derive(Debug)]
pub struct DeviceFailure {
    pub device_id: String,
    pub error: TunnelError,
}

/// Keep one device connected until cancellation, a non-retryable error, or
/// the retry budget runs out. Returns the last error in the latter cases.
pub async fn connect_with_retry(
    link: &dyn DeviceLink,
    device_id: &str,
    targets: &[Target],
    policy: RetryPolicy,
    cancel: CancellationToken,
) -> Result<(), TunnelError> {
    let mut attempts = 0u32;
    loop {
        let err = match link.connect(device_id, targets, cancel.clone()).await {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };
        if cancel.is_cancelled() {
            debug!(device_id, "Ignoring error after cancellation: {err}");
            return Ok(());
        }
        if !err.is_retryable() {
            return Err(err);
        }
        println!("error connecting to device {device_id}: {err}");

        let delay = policy.delay(attempts);
        attempts += 1;
        if policy.exhausted(attempts) {
            return Err(err);
        }

        println!("Attempt {attempts} failed. Retrying in {delay:?}...");
        tokio::select! {
            () = cancel.cancelled() => return Ok(()),
            () = tokio::time::sleep(delay) => {}
        }
    }
}

/// Connect to every device in `connections` concurrently.
///
/// All requests are validated first, in order. With `allow_failures` unset
/// the first invalid request aborts the batch before any device is dialed,
/// and the first device that gives up cancels its siblings. Otherwise
/// failures are printed, collected and returned once all devices finished.
pub async fn connect_all(
    link: Arc<dyn DeviceLink>,
    connections: &[DeviceConnection],
    allow_failures: bool,
    policy: RetryPolicy,
    cancel: CancellationToken,
) -> Result<Vec<DeviceFailure>, TunnelError> {
    let mut failures = Vec::new();
    let mut ready = Vec::with_capacity(connections.len());

    for conn in connections {
        match conn.parse() {
            Ok(targets) => ready.push((conn.device_id.clone(), targets)),
            Err(e) if !allow_failures => return Err(e.into()),
            Err(e) => {
                eprintln!("error: {e}");
                failures.push(DeviceFailure {
                    device_id: conn.device_id.clone(),
                    error: e.into(),
                });
            }
        }
    }

    let scope = cancel.child_token();
    let mut devices = JoinSet::new();
    for (device_id, targets) in ready {
        let link = link.clone();
        let scope = scope.clone();
        devices.spawn(async move {
            let result = connect_with_retry(link.as_ref(), &device_id, &targets, policy, scope).await;
            (device_id, result)
        });
    }

    while let Some(joined) = devices.join_next().await {
        let (device_id, error) = match joined {
            Ok((_, Ok(()))) => continue,
            Ok((device_id, Err(e))) => (device_id, e),
            Err(e) if e.is_cancelled() => continue,
            Err(e) => (String::new(), TunnelError::Io(io::Error::other(e.to_string()))),
        };

        if !allow_failures {
            scope.cancel();
            devices.shutdown().await;
            return Err(error);
        }
        eprintln!("error: device {device_id}: {error}");
        failures.push(DeviceFailure { device_id, error });
    }

    info!(failed = failures.len(), "All device connections finished");
    Ok(failures)
}
