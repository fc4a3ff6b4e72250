//! Error taxonomy for the tunnel subsystem.
//!
//! Parse errors are never retried. Resolution, transport and tunnel errors
//! fail the current connect attempt and are retried by the supervisor under
//! its backoff policy. Authentication failures never reach this module: the
//! broker answers them with a plain `401`.

use std::io;

use thiserror::Error;

use crate::api::ApiError;

/// Why a single port field was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PortError {
    #[error("empty port")]
    Empty,
    #[error("invalid port number")]
    InvalidNumber,
}

/// Malformed user input: target strings, device identifiers, target lists.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("invalid format")]
    InvalidFormat,
    #[error("invalid local port: {0}")]
    InvalidLocalPort(PortError),
    #[error("invalid remote port: {0}")]
    InvalidRemotePort(PortError),
    #[error("invalid device ID {0}")]
    InvalidDeviceId(String),
    #[error("error parsing target {target}: {source}")]
    Target {
        target: String,
        #[source]
        source: Box<ParseError>,
    },
    #[error("no targets defined for device {0}")]
    NoTargets(String),
    #[error("stdio is only supported for single target connections")]
    StdioNotExclusive,
}

/// The device could not be turned into a reachable edge route.
#[derive(Debug, Error)]
pub enum ResolutionError {
    #[error("remote access is not available for device {0}")]
    RemoteAccessUnavailable(String),
    #[error("device not found")]
    NotFound,
    #[error("multiple devices found")]
    Ambiguous,
    #[error("device {device} is connected to a legacy edge (version {version}), which is not supported")]
    UnsupportedEdge { device: String, version: u8 },
    #[error("device lookup failed: {0}")]
    Lookup(#[from] ApiError),
}

/// Failures of the multiplexed transport to the edge gateway.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("error initializing remote access client: {0}")]
    Connect(String),
    #[error("error opening stream: {0}")]
    StreamOpen(String),
    #[error("session closed")]
    SessionClosed,
    #[error("remote rejected request: {0}")]
    Rejected(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Umbrella error for one connect attempt against one device.
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Resolution(#[from] ResolutionError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("error binding {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("port {0} is not ready")]
    PortNotReady(u16),
    #[error("session error for device {device}: {source}")]
    Session {
        device: String,
        #[source]
        source: TransportError,
    },
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl TunnelError {
    /// Parse errors describe bad input; retrying cannot fix them.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Parse(_))
    }

    /// Whether the failure came from looking the device up rather than from
    /// the tunnel itself.
    pub fn is_resolution(&self) -> bool {
        matches!(self, Self::Resolution(_))
    }
}

/// Fatal broker failures. Per-request failures never surface here.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("error logging in to the management API: {0}")]
    Login(#[source] ApiError),
    #[error("re-authentication failed: {0}")]
    Reauth(#[source] ApiError),
    #[error("error binding {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("server error: {0}")]
    Serve(#[source] io::Error),
}

/// Settings and connect-file loading failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse {path}: {message}")]
    Parse { path: String, message: String },
    #[error("{0}")]
    Invalid(String),
}
