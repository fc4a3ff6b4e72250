//! HTTP client for the management API.
//!
//! [`ApiClient`] wraps `reqwest::Client` with the base URL and the bearer
//! token obtained at login. Non-2xx responses are parsed for an `error`
//! field in the JSON body; if that fails the raw body becomes the message.

use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use super::{ApiError, DeviceDirectory, DeviceStatus, InventoryItem};

/// Public management API endpoint used when no base URL is configured.
pub const DEFAULT_BASE_URL: &str = "https://www.app.qbee.io";

const LOGIN_PATH: &str = "/api/v2/login";
const INVENTORY_PATH: &str = "/api/v2/inventory";

/// Credentials accepted by [`ApiClient::login_with`].
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub email: Option<String>,
    pub password: Option<String>,
    /// Pre-issued API token; skips the login call when set.
    pub token: Option<String>,
}

#[derive(Deserialize)]
struct LoginResponse {
    token: String,
}

#[derive(Deserialize)]
struct InventoryListResponse {
    #[serde(default)]
    items: Vec<InventoryItem>,
}

/// Authenticated client for one management API endpoint.
#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl ApiClient {
    /// Create an unauthenticated client for `base_url`.
    pub fn new(base_url: &str) -> Result<Self, ApiError> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("qbee-connect/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            http,
            // Strip trailing slash for consistent URL construction
            base_url: base_url.trim_end_matches('/').to_string(),
            token: String::new(),
        })
    }

    /// Use an existing bearer token.
    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = token.into();
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Build a client for `base_url` and authenticate it with whatever
    /// `credentials` carry: a token wins over email/password.
    pub async fn login_with(base_url: &str, credentials: &Credentials) -> Result<Self, ApiError> {
        let client = Self::new(base_url)?;
        if let Some(token) = credentials.token.as_deref().filter(|t| !t.is_empty()) {
            return Ok(client.with_token(token));
        }
        match (credentials.email.as_deref(), credentials.password.as_deref()) {
            (Some(email), Some(password)) if !email.is_empty() && !password.is_empty() => {
                let token = client.login(email, password).await?;
                Ok(client.with_token(token))
            }
            _ => Err(ApiError::MissingCredentials),
        }
    }

    /// `POST /api/v2/login` — exchange email and password for a bearer token.
    pub async fn login(&self, email: &str, password: &str) -> Result<String, ApiError> {
        let resp = self
            .http
            .post(format!("{}{LOGIN_PATH}", self.base_url))
            .json(&json!({ "email": email, "password": password }))
            .send()
            .await?;
        let body: LoginResponse = Self::handle_response(resp).await?;
        debug!("Authenticated against {}", self.base_url);
        Ok(body.token)
    }

    /// `GET /api/v2/device/{id}/status`
    pub async fn get_device_status(&self, device_id: &str) -> Result<DeviceStatus, ApiError> {
        let resp = self
            .http
            .get(format!("{}/api/v2/device/{device_id}/status", self.base_url))
            .bearer_auth(&self.token)
            .send()
            .await?;
        Self::handle_response(resp).await
    }

    /// `GET /api/v2/inventory?search={"uuid": ...}`
    pub async fn list_inventory_by_uuid(&self, uuid: &str) -> Result<Vec<InventoryItem>, ApiError> {
        let search = json!({ "uuid": uuid }).to_string();
        let resp = self
            .http
            .get(format!("{}{INVENTORY_PATH}", self.base_url))
            .query(&[("search", search.as_str())])
            .bearer_auth(&self.token)
            .send()
            .await?;
        let body: InventoryListResponse = Self::handle_response(resp).await?;
        Ok(body.items)
    }

    async fn handle_response<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T, ApiError> {
        let status = resp.status();
        let body = resp.text().await?;

        if status.is_success() {
            serde_json::from_str(&body).map_err(|e| ApiError::Decode(format!("{e}: {body}")))
        } else {
            let message = serde_json::from_str::<serde_json::Value>(&body)
                .ok()
                .and_then(|v| v["error"].as_str().map(String::from))
                .unwrap_or(body);
            Err(ApiError::Status {
                status: status.as_u16(),
                message,
            })
        }
    }
}

#[async_trait]
impl DeviceDirectory for ApiClient {
    async fn device_status(&self, device_id: &str) -> Result<DeviceStatus, ApiError> {
        self.get_device_status(device_id).await
    }

    async fn find_by_uuid(&self, uuid: &str) -> Result<Vec<InventoryItem>, ApiError> {
        self.list_inventory_by_uuid(uuid).await
    }

    fn auth_token(&self) -> String {
        self.token.clone()
    }
}
