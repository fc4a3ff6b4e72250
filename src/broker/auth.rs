//! Pre-shared token authentication for the broker.
//!
//! With no token configured every request passes. Otherwise a request must
//! carry either a live `session_token` cookie or an `X-Qbee-Authorization`
//! header equal to the token; the latter is answered with a fresh session
//! cookie so browsers only need the header once. A request that already
//! holds a live session never mints another, and the session map is capped
//! at [`MAX_SESSIONS`] so clients that ignore cookies cannot grow it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    extract::{Request, State},
    http::{
        header::{COOKIE, SET_COOKIE},
        HeaderMap, HeaderValue, StatusCode,
    },
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use rand::{distributions::Alphanumeric, Rng};
use serde_json::json;
use tokio::sync::Mutex;
use tracing::warn;

pub const AUTH_HEADER: &str = "x-qbee-authorization";
pub const SESSION_COOKIE: &str = "session_token";

const SESSION_TOKEN_LEN: usize = 32;
/// Live browser sessions kept at once; the one closest to expiry goes first.
pub const MAX_SESSIONS: usize = 4096;

/// Broker token plus the browser sessions it has issued.
pub struct BrokerAuth {
    token: Option<String>,
    sessions: Mutex<HashMap<String, Instant>>,
    ttl: Duration,
}

impl BrokerAuth {
    /// `ttl` bounds both the cookie's `Max-Age` and the server-side session.
    pub fn new(token: Option<String>, ttl: Duration) -> Self {
        Self {
            token: token.filter(|t| !t.is_empty()),
            sessions: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.token.is_some()
    }

    async fn issue_session(&self) -> String {
        let token: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(SESSION_TOKEN_LEN)
            .map(char::from)
            .collect();
        let now = Instant::now();
        let mut sessions = self.sessions.lock().await;
        if sessions.len() >= MAX_SESSIONS {
            sessions.retain(|_, expires| *expires > now);
        }
        if sessions.len() >= MAX_SESSIONS {
            let oldest = sessions
                .iter()
                .min_by_key(|(_, expires)| **expires)
                .map(|(token, _)| token.clone());
            if let Some(oldest) = oldest {
                sessions.remove(&oldest);
            }
        }
        sessions.insert(token.clone(), now + self.ttl);
        token
    }

    async fn has_session(&self, token: &str) -> bool {
        let now = Instant::now();
        let mut sessions = self.sessions.lock().await;
        match sessions.get(token) {
            Some(expires) if *expires > now => true,
            Some(_) => {
                sessions.remove(token);
                false
            }
            None => false,
        }
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Drop expired sessions. Returns how many were removed.
    pub async fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut sessions = self.sessions.lock().await;
        let before = sessions.len();
        sessions.retain(|_, expires| *expires > now);
        before - sessions.len()
    }

    fn session_cookie(&self, token: &str) -> String {
        format!(
            "{SESSION_COOKIE}={token}; Path=/; HttpOnly; SameSite=Strict; Max-Age={}",
            self.ttl.as_secs()
        )
    }
}

/// Axum middleware enforcing [`BrokerAuth`].
///
/// # Error responses
///
/// - `401 Unauthorized` with a JSON `error` body when neither a valid cookie
///   nor the token header is present
pub async fn require_token(State(auth): State<Arc<BrokerAuth>>, request: Request, next: Next) -> Response {
    let Some(expected) = auth.token.as_deref() else {
        return next.run(request).await;
    };

    if let Some(session) = cookie_value(request.headers(), SESSION_COOKIE) {
        if auth.has_session(session).await {
            return next.run(request).await;
        }
    }

    let provided = request
        .headers()
        .get(AUTH_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if provided.is_empty() || !constant_time_eq(expected.as_bytes(), provided.as_bytes()) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "Unauthorized"})),
        )
            .into_response();
    }

    let session = auth.issue_session().await;
    let mut response = next.run(request).await;
    match HeaderValue::from_str(&auth.session_cookie(&session)) {
        Ok(cookie) => {
            response.headers_mut().append(SET_COOKIE, cookie);
        }
        Err(e) => warn!("error building session cookie: {e}"),
    }
    response
}

fn cookie_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(k, _)| *k == name)
        .map(|(_, v)| v)
}

/// Constant-time byte comparison.
///
/// Always iterates over the full length of `expected` regardless of `provided`
/// length, so response times do not reveal the token length.
pub fn constant_time_eq(expected: &[u8], provided: &[u8]) -> bool {
    let mut diff = u8::from(expected.len() != provided.len());
    for (i, e) in expected.iter().enumerate() {
        diff |= e ^ provided.get(i).copied().unwrap_or(0xff);
    }
    diff == 0
}
