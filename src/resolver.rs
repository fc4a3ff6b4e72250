//! Device status resolution.
//!
//! Every new session starts here: the management API says whether remote
//! access is enabled for the device and which edge gateway serves it.
//! Nothing is cached; a reconnect always sees the current edge.

use std::sync::Arc;

use tracing::debug;

use crate::api::{DeviceDirectory, EdgeVersion};
use crate::error::ResolutionError;

/// Where a device can be reached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EdgeRoute {
    pub device_id: String,
    pub uuid: String,
    /// `<host>:<port>` of the edge gateway.
    pub edge_host: String,
    pub edge_version: EdgeVersion,
}

impl EdgeRoute {
    /// Only the native edge speaks the multiplexed transport.
    pub fn require_native(&self) -> Result<(), ResolutionError> {
        match self.edge_version {
            EdgeVersion::Native => Ok(()),
            other => Err(ResolutionError::UnsupportedEdge {
                device: self.device_id.clone(),
                version: other.as_u8(),
            }),
        }
    }
}

/// Turns device identifiers into [`EdgeRoute`]s.
#[derive(Clone)]
pub struct Resolver {
    directory: Arc<dyn DeviceDirectory>,
}

impl Resolver {
    pub fn new(directory: Arc<dyn DeviceDirectory>) -> Self {
        Self { directory }
    }

    pub fn directory(&self) -> &Arc<dyn DeviceDirectory> {
        &self.directory
    }

    /// Look up the device's current edge route.
    pub async fn resolve(&self, device_id: &str) -> Result<EdgeRoute, ResolutionError> {
        let status = self.directory.device_status(device_id).await.map_err(|e| {
            if e.is_not_found() {
                ResolutionError::NotFound
            } else {
                ResolutionError::Lookup(e)
            }
        })?;

        if !status.remote_access || status.edge.is_empty() {
            return Err(ResolutionError::RemoteAccessUnavailable(device_id.to_string()));
        }

        debug!(
            device = device_id,
            edge = %status.edge,
            edge_version = status.edge_version,
            "Resolved device"
        );

        Ok(EdgeRoute {
            device_id: device_id.to_string(),
            uuid: status.uuid,
            edge_host: status.edge,
            edge_version: EdgeVersion::from(status.edge_version),
        })
    }

    /// Map a device UUID to its public key digest.
    ///
    /// Identifiers that are not UUIDs are returned unchanged.
    pub async fn resolve_identifier(&self, identifier: &str) -> Result<String, ResolutionError> {
        if uuid::Uuid::parse_str(identifier).is_err() {
            return Ok(identifier.to_string());
        }

        let items = self.directory.find_by_uuid(identifier).await?;
        match items.as_slice() {
            [] => Err(ResolutionError::NotFound),
            [item] => Ok(item.pub_key_digest.clone()),
            _ => Err(ResolutionError::Ambiguous),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::api::{ApiError, DeviceStatus, InventoryItem};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// In-memory directory for resolver, supervisor and broker tests.
    #[derive(Default)]
    pub(crate) struct FakeDirectory {
        pub statuses: HashMap<String, DeviceStatus>,
        pub inventory: Vec<InventoryItem>,
        pub status_calls: AtomicUsize,
    }

    impl FakeDirectory {
        pub fn with_device(mut self, device_id: &str, edge: &str, edge_version: u8) -> Self {
            self.statuses.insert(
                device_id.to_string(),
                DeviceStatus {
                    uuid: format!("uuid-{device_id}"),
                    remote_access: true,
                    edge: edge.to_string(),
                    edge_version,
                },
            );
            self
        }
    }

    #[async_trait]
    impl DeviceDirectory for FakeDirectory {
        async fn device_status(&self, device_id: &str) -> Result<DeviceStatus, ApiError> {
            self.status_calls.fetch_add(1, Ordering::SeqCst);
            self.statuses.get(device_id).cloned().ok_or(ApiError::Status {
                status: 404,
                message: "device not found".into(),
            })
        }

        async fn find_by_uuid(&self, uuid: &str) -> Result<Vec<InventoryItem>, ApiError> {
            Ok(self.inventory.iter().filter(|i| i.uuid == uuid).cloned().collect())
        }

        fn auth_token(&self) -> String {
            "test-token".into()
        }
    }

    #[tokio::test]
    async fn resolves_enabled_device() {
        let dir = FakeDirectory::default().with_device("dev", "edge.example.com:443", 1);
        let route = Resolver::new(Arc::new(dir)).resolve("dev").await.unwrap();
        assert_eq!(route.uuid, "uuid-dev");
        assert_eq!(route.edge_host, "edge.example.com:443");
        assert_eq!(route.edge_version, EdgeVersion::Native);
        assert!(route.require_native().is_ok());
    }

    #[tokio::test]
    async fn disabled_remote_access_is_reported() {
        let mut dir = FakeDirectory::default().with_device("dev", "edge:443", 1);
        dir.statuses.get_mut("dev").unwrap().remote_access = false;
        let err = Resolver::new(Arc::new(dir)).resolve("dev").await.unwrap_err();
        assert!(matches!(err, ResolutionError::RemoteAccessUnavailable(ref id) if id == "dev"));
        assert_eq!(err.to_string(), "remote access is not available for device dev");
    }

    #[tokio::test]
    async fn unknown_device_is_not_found() {
        let err = Resolver::new(Arc::new(FakeDirectory::default()))
            .resolve("nope")
            .await
            .unwrap_err();
        assert!(matches!(err, ResolutionError::NotFound));
    }

    #[tokio::test]
    async fn legacy_edge_is_unsupported() {
        let dir = FakeDirectory::default().with_device("dev", "vpn.example.com:443", 0);
        let route = Resolver::new(Arc::new(dir)).resolve("dev").await.unwrap();
        assert_eq!(route.edge_version, EdgeVersion::OpenVpn);
        assert!(matches!(
            route.require_native().unwrap_err(),
            ResolutionError::UnsupportedEdge { version: 0, .. }
        ));
    }

    #[tokio::test]
    async fn resolver_is_not_cached() {
        let dir = Arc::new(FakeDirectory::default().with_device("dev", "edge:443", 1));
        let resolver = Resolver::new(dir.clone());
        resolver.resolve("dev").await.unwrap();
        resolver.resolve("dev").await.unwrap();
        assert_eq!(dir.status_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn identifier_resolution() {
        let uuid = "0b4d52d4-7a40-4a6c-9bd6-3c1b1e7a3d11";
        let dup = "9f0c4e5e-2f51-4b8e-8d61-0f6c0c9b8a22";
        let dir = FakeDirectory {
            inventory: vec![
                InventoryItem { pub_key_digest: "digest-a".into(), uuid: uuid.into() },
                InventoryItem { pub_key_digest: "digest-b".into(), uuid: dup.into() },
                InventoryItem { pub_key_digest: "digest-c".into(), uuid: dup.into() },
            ],
            ..FakeDirectory::default()
        };
        let resolver = Resolver::new(Arc::new(dir));

        assert_eq!(resolver.resolve_identifier(uuid).await.unwrap(), "digest-a");
        assert_eq!(resolver.resolve_identifier("plain-id").await.unwrap(), "plain-id");
        assert!(matches!(
            resolver.resolve_identifier(dup).await.unwrap_err(),
            ResolutionError::Ambiguous
        ));
        assert!(matches!(
            resolver
                .resolve_identifier("11111111-2222-4333-8444-555555555555")
                .await
                .unwrap_err(),
            ResolutionError::NotFound
        ));
    }
}
