//! One connect cycle: resolve the device, open a session to its edge, and
//! serve targets or a terminal on it.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::bridge;
use crate::error::TunnelError;
use crate::resolver::{EdgeRoute, Resolver};
use crate::supervisor::DeviceLink;
use crate::target::Target;
use crate::terminal;
use crate::transport::{Connector, Session};

/// Composes resolver, connector and bridge.
#[derive(Clone)]
pub struct Tunneler {
    resolver: Resolver,
    connector: Arc<dyn Connector>,
}

impl Tunneler {
    pub fn new(resolver: Resolver, connector: Arc<dyn Connector>) -> Self {
        Self { resolver, connector }
    }

    pub fn resolver(&self) -> &Resolver {
        &self.resolver
    }

    /// Resolve `device_id` and open a session to its edge.
    pub async fn open_session(&self, device_id: &str) -> Result<(EdgeRoute, Arc<dyn Session>), TunnelError> {
        let route = self.resolver.resolve(device_id).await?;
        route.require_native()?;
        let token = self.resolver.directory().auth_token();
        let session = self.connector.open(&route, &token).await?;
        info!(device = device_id, edge = %route.edge_host, "Session opened");
        Ok((route, session))
    }

    /// Interactive terminal on `device_id`, running `command` instead of the
    /// login shell when given.
    pub async fn terminal(&self, device_id: &str, command: &[String], cancel: CancellationToken) -> Result<(), TunnelError> {
        let (_, session) = self.open_session(device_id).await?;
        let result = terminal::run(session.clone(), command, cancel).await;
        session.close().await;
        result
    }
}

#[async_trait]
impl DeviceLink for Tunneler {
    async fn connect(&self, device_id: &str, targets: &[Target], cancel: CancellationToken) -> Result<(), TunnelError> {
        let (_, session) = self.open_session(device_id).await?;
        bridge::run(session, device_id, targets, cancel).await
    }
}
