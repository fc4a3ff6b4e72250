//! On-demand HTTP reverse proxy to device ports.
//!
//! Every request names a device (header or `Host` label) and optionally a
//! device port. The first request for a `device:port` pair opens a tunnel to
//! a free local port; later requests reuse it until it idles out or the
//! device session dies.
//!
//! ```text
//! mod.rs    — BrokerState, router, serve(), GC and re-auth loops
//! cache.rs  — ConnectionCache / TunnelHandle
//! auth.rs   — token middleware, session cookies
//! proxy.rs  — fallback handler: tunnel lookup + forwarding
//! ```

pub mod auth;
pub mod cache;
pub mod proxy;

use std::future::IntoFuture;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use axum::{body::Body, middleware, Router};
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::api::{ApiClient, ApiError, Credentials, DeviceDirectory, DeviceStatus, InventoryItem};
use crate::config::{BrokerConfig, Config};
use crate::connect::Tunneler;
use crate::error::BrokerError;
use crate::resolver::Resolver;
use crate::transport::WsConnector;

pub use auth::BrokerAuth;
pub use cache::{ConnectionCache, TunnelHandle};

/// Shared state handed to the proxy handler.
#[derive(Clone)]
pub struct BrokerState {
    pub tunneler: Tunneler,
    pub cache: Arc<ConnectionCache>,
    pub auth: Arc<BrokerAuth>,
    pub settings: Arc<BrokerConfig>,
    pub client: Client<HttpConnector, Body>,
    /// Parent of every tunnel's cancellation token.
    pub shutdown: CancellationToken,
}

impl BrokerState {
    pub fn new(tunneler: Tunneler, settings: BrokerConfig, shutdown: CancellationToken) -> Self {
        Self {
            tunneler,
            cache: Arc::new(ConnectionCache::new(settings.tunnel_ttl())),
            auth: Arc::new(BrokerAuth::new(settings.auth_token.clone(), settings.session_ttl())),
            settings: Arc::new(settings),
            client: Client::builder(TokioExecutor::new()).build_http(),
            shutdown,
        }
    }
}

/// Every path is proxied; auth wraps the whole thing.
pub fn router(state: BrokerState) -> Router {
    Router::new()
        .fallback(proxy::proxy)
        .layer(middleware::from_fn_with_state(state.auth.clone(), auth::require_token))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// A [`DeviceDirectory`] whose backing client can be swapped while requests
/// are in flight. Used to refresh the management API login.
pub struct SharedDirectory {
    inner: RwLock<Arc<dyn DeviceDirectory>>,
}

impl SharedDirectory {
    pub fn new(inner: Arc<dyn DeviceDirectory>) -> Self {
        Self {
            inner: RwLock::new(inner),
        }
    }

    pub fn replace(&self, next: Arc<dyn DeviceDirectory>) {
        *self.inner.write().unwrap_or_else(PoisonError::into_inner) = next;
    }

    fn current(&self) -> Arc<dyn DeviceDirectory> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

#[async_trait]
impl DeviceDirectory for SharedDirectory {
    async fn device_status(&self, device_id: &str) -> Result<DeviceStatus, ApiError> {
        self.current().device_status(device_id).await
    }

    async fn find_by_uuid(&self, uuid: &str) -> Result<Vec<InventoryItem>, ApiError> {
        self.current().find_by_uuid(uuid).await
    }

    fn auth_token(&self) -> String {
        self.current().auth_token()
    }
}

/// Sweep idle tunnels and expired browser sessions every `every`.
async fn gc_loop(state: BrokerState, every: Duration) {
    let mut interval = tokio::time::interval(every);
    interval.tick().await;
    loop {
        interval.tick().await;
        let tunnels = state.cache.clean_up().await;
        let sessions = state.auth.sweep().await;
        if tunnels > 0 || sessions > 0 {
            debug!(tunnels, sessions, "GC sweep");
        }
    }
}

/// Log in again every `every` and swap the fresh client in. Only returns on
/// failure.
async fn reauth_loop(
    directory: Arc<SharedDirectory>,
    base_url: String,
    credentials: Credentials,
    every: Duration,
) -> ApiError {
    let mut interval = tokio::time::interval(every);
    interval.tick().await;
    loop {
        interval.tick().await;
        match ApiClient::login_with(&base_url, &credentials).await {
            Ok(client) => {
                directory.replace(Arc::new(client));
                info!("Re-authenticated with management API");
            }
            Err(e) => return e,
        }
    }
}

/// Run the broker until `shutdown` fires or re-authentication fails.
pub async fn serve(config: &Config, shutdown: CancellationToken) -> Result<(), BrokerError> {
    let credentials = config.api.credentials();
    let client = ApiClient::login_with(&config.api.base_url, &credentials)
        .await
        .map_err(BrokerError::Login)?;
    let directory = Arc::new(SharedDirectory::new(Arc::new(client)));

    let tunneler = Tunneler::new(
        Resolver::new(directory.clone()),
        Arc::new(WsConnector::new(config.connect.connect_timeout())),
    );
    let settings = config.broker.clone();
    let state = BrokerState::new(tunneler, settings.clone(), shutdown.clone());

    if !state.auth.is_enabled() {
        warn!("No authentication token provided. Device access will be open");
    }

    let addr = format!("0.0.0.0:{}", settings.listen_port);
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|source| BrokerError::Bind { addr: addr.clone(), source })?;
    info!("Broker listening on {addr}");

    let gc = tokio::spawn(gc_loop(state.clone(), settings.gc_interval()));

    let server = axum::serve(listener, router(state.clone())).with_graceful_shutdown({
        let shutdown = shutdown.clone();
        async move { shutdown.cancelled().await }
    })
    .into_future();

    let result = tokio::select! {
        res = server => res.map_err(BrokerError::Serve),
        err = reauth_loop(directory, config.api.base_url.clone(), credentials, settings.reauth_interval()) => {
            Err(BrokerError::Reauth(err))
        }
    };

    info!("Shutting down...");
    gc.abort();
    shutdown.cancel();
    let closed = state.cache.cancel_all().await;
    if closed > 0 {
        info!(tunnels = closed, "Closed cached tunnels");
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::tests::FakeDirectory;

    #[tokio::test]
    async fn shared_directory_swaps_backend() {
        let shared = SharedDirectory::new(Arc::new(FakeDirectory::default()));
        assert!(shared.device_status("dev").await.is_err());

        shared.replace(Arc::new(FakeDirectory::default().with_device("dev", "edge:8443", 1)));
        let status = shared.device_status("dev").await.unwrap();
        assert_eq!(status.edge, "edge:8443");
        assert_eq!(shared.auth_token(), "test-token");
    }

    #[tokio::test]
    async fn gc_loop_evicts_idle_tunnels() {
        use crate::transport::loopback::LoopbackEdge;
        use std::sync::atomic::{AtomicBool, Ordering};

        let edge = LoopbackEdge::start();
        let tunneler = Tunneler::new(
            Resolver::new(Arc::new(FakeDirectory::default())),
            Arc::new(edge),
        );
        let settings = BrokerConfig {
            tunnel_ttl_secs: 0,
            ..BrokerConfig::default()
        };
        let state = BrokerState::new(tunneler, settings, CancellationToken::new());

        let cancelled = Arc::new(AtomicBool::new(false));
        state
            .cache
            .add("dev:80".into(), TunnelHandle::new(4000, {
                let cancelled = cancelled.clone();
                move || cancelled.store(true, Ordering::SeqCst)
            }))
            .await;

        let gc = tokio::spawn(gc_loop(state.clone(), Duration::from_millis(10)));
        for _ in 0..200 {
            if cancelled.load(Ordering::SeqCst) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        gc.abort();
        assert!(cancelled.load(Ordering::SeqCst));
        assert!(state.cache.is_empty().await);
    }
}
