//! Per-request tunnel lookup and HTTP forwarding.
//!
//! Forwarding behaves like a standard reverse proxy: hop-by-hop headers are
//! dropped in both directions, and a `Connection: Upgrade` request (e.g. a
//! WebSocket from a device web UI) that the device answers with `101` gets
//! its two upgraded connections spliced together.

use std::time::Duration;

use axum::{
    body::Body,
    extract::{Request, State},
    http::{
        header::{CONNECTION, HOST, UPGRADE},
        HeaderMap, HeaderName, HeaderValue, StatusCode, Uri,
    },
    response::{IntoResponse, Response},
    Json,
};
use hyper_util::rt::TokioIo;
use serde_json::json;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use super::cache::{cache_key, TunnelHandle};
use super::BrokerState;
use crate::bridge;
use crate::error::TunnelError;
use crate::target::parse_target;

pub const DEVICE_ID_HEADER: &str = "x-qbee-device-id";
pub const DEVICE_PORT_HEADER: &str = "x-qbee-device-port";

const READY_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Headers that describe one connection, not the message.
const HOP_BY_HOP: [&str; 9] = [
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({"error": message.into()}))).into_response()
}

/// Fallback handler: every request is proxied to a device.
pub async fn proxy(State(state): State<BrokerState>, request: Request) -> Response {
    let Some(identifier) = device_identifier(request.headers()) else {
        return error_response(StatusCode::BAD_REQUEST, "missing device id");
    };
    let device_port = match device_port(request.headers(), state.settings.remote_port) {
        Ok(port) => port,
        Err(message) => return error_response(StatusCode::BAD_REQUEST, message),
    };

    let device_id = match state.tunneler.resolver().resolve_identifier(&identifier).await {
        Ok(id) => id,
        Err(e) => {
            warn!(device = identifier, "error resolving device: {e}");
            return error_response(StatusCode::NOT_FOUND, e.to_string());
        }
    };

    let local_port = match tunnel_port(&state, &device_id, device_port).await {
        Ok(port) => port,
        Err(e) => {
            warn!(device = device_id, port = device_port, "error opening tunnel: {e}");
            let status = if e.is_resolution() {
                StatusCode::NOT_FOUND
            } else {
                StatusCode::BAD_GATEWAY
            };
            return error_response(status, e.to_string());
        }
    };

    match forward(&state, local_port, request).await {
        Ok(response) => response,
        Err(e) => {
            warn!(device = device_id, "proxy error: {e}");
            error_response(StatusCode::BAD_GATEWAY, format!("proxy error: {e}"))
        }
    }
}

/// `X-Qbee-Device-Id`, else the leading label of `Host`.
fn device_identifier(headers: &HeaderMap) -> Option<String> {
    if let Some(id) = header_str(headers, DEVICE_ID_HEADER)
        .map(str::trim)
        .filter(|id| !id.is_empty())
    {
        return Some(id.to_string());
    }
    let host = header_str(headers, HOST.as_str())?;
    let label = host.split(':').next()?.split('.').next()?.trim();
    (!label.is_empty()).then(|| label.to_string())
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn device_port(headers: &HeaderMap, default: u16) -> Result<u16, String> {
    match header_str(headers, DEVICE_PORT_HEADER) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse::<u16>()
            .ok()
            .filter(|p| *p != 0)
            .ok_or_else(|| format!("invalid device port: {raw}")),
    }
}

/// Local port of a tunnel to `device_id:device_port`, establishing one on a
/// cache miss.
async fn tunnel_port(state: &BrokerState, device_id: &str, device_port: u16) -> Result<u16, TunnelError> {
    let key = cache_key(device_id, device_port);
    if let Some(port) = state.cache.get(&key).await {
        debug!(key, port, "Tunnel cache hit");
        return Ok(port);
    }

    let local_port = bridge::free_port().await?;
    let target = parse_target(&format!(
        "127.0.0.1:{local_port}:{}:{device_port}",
        state.settings.remote_host
    ))?;
    let cancel = state.shutdown.child_token();
    let (_, session) = state.tunneler.open_session(device_id).await?;

    let mut task = tokio::spawn({
        let cancel = cancel.clone();
        let device_id = device_id.to_string();
        async move { bridge::run(session, &device_id, &[target], cancel).await }
    });

    let ready = tokio::time::timeout(state.settings.ready_timeout(), async {
        tokio::select! {
            () = wait_for_port(local_port) => None,
            res = &mut task => Some(res),
        }
    })
    .await;

    match ready {
        Ok(None) => {}
        Ok(Some(res)) => {
            cancel.cancel();
            return Err(match res {
                Ok(Err(e)) => e,
                Ok(Ok(())) => TunnelError::PortNotReady(local_port),
                Err(e) => TunnelError::Io(std::io::Error::other(e)),
            });
        }
        Err(_) => {
            cancel.cancel();
            task.abort();
            return Err(TunnelError::PortNotReady(local_port));
        }
    }

    info!(key, local_port, "Tunnel established");
    state
        .cache
        .add(key.clone(), TunnelHandle::new(local_port, {
            let cancel = cancel.clone();
            move || cancel.cancel()
        }))
        .await;

    // Evict as soon as the session dies under us
    let cache = state.cache.clone();
    tokio::spawn(async move {
        let result = task.await;
        if cache.remove_if_port(&key, local_port).await {
            info!(key, local_port, "Tunnel closed");
        }
        match result {
            Ok(Err(e)) => warn!(key, "tunnel ended: {e}"),
            Err(e) => warn!(key, "tunnel task failed: {e}"),
            Ok(Ok(())) => {}
        }
    });

    Ok(local_port)
}

async fn wait_for_port(port: u16) {
    loop {
        if TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
            return;
        }
        tokio::time::sleep(READY_POLL_INTERVAL).await;
    }
}

/// Protocol requested by a `Connection: Upgrade` request.
fn upgrade_type(headers: &HeaderMap) -> Option<HeaderValue> {
    let wants_upgrade = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));
    if wants_upgrade {
        headers.get(UPGRADE).cloned()
    } else {
        None
    }
}

/// Drop hop-by-hop headers, including any named in `Connection`.
fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

/// Forward `request` to the tunnel's local end, keeping method, path, query
/// and end-to-end headers. `Host` is rewritten to the local authority.
async fn forward(state: &BrokerState, local_port: u16, mut request: Request) -> Result<Response, String> {
    let upgrade = upgrade_type(request.headers());
    let client_upgrade = upgrade.is_some().then(|| hyper::upgrade::on(&mut request));

    let (parts, body) = request.into_parts();
    let path_and_query = parts.uri.path_and_query().map_or("/", |pq| pq.as_str());
    let uri: Uri = format!("http://127.0.0.1:{local_port}{path_and_query}")
        .parse()
        .map_err(|e| format!("invalid upstream uri: {e}"))?;

    let mut forwarded = axum::http::Request::builder()
        .method(parts.method)
        .uri(&uri)
        .body(body)
        .map_err(|e| e.to_string())?;
    let headers = forwarded.headers_mut();
    *headers = parts.headers;
    strip_hop_by_hop(headers);
    if let Some(protocol) = upgrade {
        headers.insert(CONNECTION, HeaderValue::from_static("upgrade"));
        headers.insert(UPGRADE, protocol);
    }
    if let Some(authority) = uri.authority() {
        if let Ok(host) = HeaderValue::from_str(authority.as_str()) {
            headers.insert(HOST, host);
        }
    }

    let mut response = state.client.request(forwarded).await.map_err(|e| e.to_string())?;

    if response.status() == StatusCode::SWITCHING_PROTOCOLS {
        let Some(client_upgrade) = client_upgrade else {
            return Err("device switched protocols without an upgrade request".to_string());
        };
        let device_upgrade = hyper::upgrade::on(&mut response);
        tokio::spawn(async move {
            match tokio::try_join!(client_upgrade, device_upgrade) {
                Ok((client, device)) => {
                    let mut client = TokioIo::new(client);
                    let mut device = TokioIo::new(device);
                    match tokio::io::copy_bidirectional(&mut client, &mut device).await {
                        Ok((up, down)) => debug!(up, down, "Upgraded connection closed"),
                        Err(e) => debug!("upgraded connection ended: {e}"),
                    }
                }
                Err(e) => warn!("error upgrading connection: {e}"),
            }
        });
        let (parts, _) = response.into_parts();
        return Ok(Response::from_parts(parts, Body::empty()));
    }

    let (mut parts, body) = response.into_parts();
    strip_hop_by_hop(&mut parts.headers);
    Ok(Response::from_parts(parts, Body::new(body)))
}
