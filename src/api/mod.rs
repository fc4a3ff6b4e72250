//! Management API boundary.
//!
//! The tunnel core only needs three calls from the management API: logging
//! in, reading a device's remote-access status, and looking a device up by
//! UUID. They are exposed through [`DeviceDirectory`] so the resolver and the
//! broker can be driven by a fake directory in tests.

pub mod client;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

pub use client::{ApiClient, Credentials};

/// Version of the edge gateway a device is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeVersion {
    /// Legacy OpenVPN-based edge, reached through the VPN index.
    OpenVpn,
    /// Native multiplexed remote-access edge.
    Native,
    Unknown(u8),
}

impl From<u8> for EdgeVersion {
    fn from(v: u8) -> Self {
        match v {
            0 => Self::OpenVpn,
            1 => Self::Native,
            other => Self::Unknown(other),
        }
    }
}

impl EdgeVersion {
    pub fn as_u8(self) -> u8 {
        match self {
            Self::OpenVpn => 0,
            Self::Native => 1,
            Self::Unknown(v) => v,
        }
    }
}

/// `GET /api/v2/device/{id}/status` response.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceStatus {
    #[serde(default)]
    pub uuid: String,
    #[serde(default)]
    pub remote_access: bool,
    /// `<edge-host>:<edge-port>`; only set when `remote_access` is true.
    #[serde(default)]
    pub edge: String,
    #[serde(default)]
    pub edge_version: u8,
}

/// One row of the inventory search used for UUID lookups.
#[derive(Debug, Clone, Deserialize)]
pub struct InventoryItem {
    pub pub_key_digest: String,
    #[serde(default)]
    pub uuid: String,
}

/// Errors returned by the management API client.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Connection refused, timeout, TLS failure, etc.
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),
    /// The API answered with a non-2xx status.
    #[error("API error (HTTP {status}): {message}")]
    Status { status: u16, message: String },
    /// The response body was not the expected JSON.
    #[error("invalid API response: {0}")]
    Decode(String),
    /// No credentials were available to log in.
    #[error("no credentials provided: set QBEE_EMAIL and QBEE_PASSWORD or an API token")]
    MissingCredentials,
}

impl ApiError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Status { status: 404, .. })
    }
}

/// The subset of the management API the tunnel core consumes.
#[async_trait]
pub trait DeviceDirectory: Send + Sync {
    /// Current remote-access status of a device.
    async fn device_status(&self, device_id: &str) -> Result<DeviceStatus, ApiError>;

    /// Devices whose UUID matches `uuid`.
    async fn find_by_uuid(&self, uuid: &str) -> Result<Vec<InventoryItem>, ApiError>;

    /// Bearer token presented to the edge gateway.
    fn auth_token(&self) -> String;
}
