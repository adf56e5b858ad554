//! Network layer for QR Parking - backend API client and connectivity tracking

use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::models::*;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use reqwest::{Client, RequestBuilder, Response};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::watch;
use url::Url;

// ============================================================================
// Backend contracts
// ============================================================================

/// Backend persistence for call records. Any `Err` means the write did not
/// happen; callers never assume partial success.
#[async_trait]
pub trait CallRecordClient: Send + Sync {
    async fn create(&self, receiver_id: &str) -> Result<CallRecord>;

    async fn update_status(&self, call_id: &str, status: CallStatus, at: DateTime<Utc>) -> Result<()>;
}

/// Mints calling-platform credentials.
#[async_trait]
pub trait TokenMinter: Send + Sync {
    async fn mint_token(&self) -> Result<TokenRecord>;
}

/// Both backend contracts plus the session bearer token they authenticate with.
pub trait CallBackend: CallRecordClient + TokenMinter {
    fn set_session_token(&self, token: Option<String>);
}

// ============================================================================
// HTTP API Client
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateCallResponse {
    id: String,
    #[serde(default)]
    created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenResponse {
    token: String,
    expires_at: DateTime<Utc>,
}

pub struct ApiClient {
    client: Client,
    base_url: Url,
    token: Mutex<Option<String>>,
}

impl ApiClient {
    pub fn new(config: &ClientConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.calls.request_timeout())
            .build()?;

        Ok(Self {
            client,
            base_url: Url::parse(&config.http_url())?,
            token: Mutex::new(None),
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        Ok(self.base_url.join(path)?)
    }

    fn authorized(&self, req: RequestBuilder) -> Result<RequestBuilder> {
        match self.token.lock().as_ref() {
            Some(t) => Ok(req.bearer_auth(t)),
            None => Err(Error::NotLoggedIn),
        }
    }

    async fn check(resp: Response) -> Result<Response> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(Error::Backend(format!("{}: {}", status, body)))
    }
}

impl CallBackend for ApiClient {
    fn set_session_token(&self, token: Option<String>) {
        *self.token.lock() = token;
    }
}

#[async_trait]
impl CallRecordClient for ApiClient {
    async fn create(&self, receiver_id: &str) -> Result<CallRecord> {
        let req = self
            .client
            .post(self.endpoint("api/v1/calls")?)
            .header("Idempotency-Key", uuid::Uuid::new_v4().to_string())
            .json(&json!({ "receiverId": receiver_id }));

        let resp = Self::check(self.authorized(req)?.send().await?).await?;
        let data: CreateCallResponse = resp.json().await?;

        Ok(CallRecord {
            id: data.id,
            receiver_id: receiver_id.to_string(),
            status: CallStatus::Initiated,
            created_at: data.created_at.unwrap_or_else(Utc::now),
            answered_at: None,
            ended_at: None,
            failed_at: None,
        })
    }

    async fn update_status(&self, call_id: &str, status: CallStatus, at: DateTime<Utc>) -> Result<()> {
        let mut body = json!({ "status": status });
        let stamp = match status {
            CallStatus::Answered => Some("answeredAt"),
            CallStatus::Ended => Some("endedAt"),
            CallStatus::Failed => Some("failedAt"),
            CallStatus::Initiated => None,
        };
        if let Some(field) = stamp {
            body[field] = json!(at);
        }

        let req = self
            .client
            .patch(self.endpoint(&format!("api/v1/calls/{}/status", call_id))?)
            .json(&body);

        Self::check(self.authorized(req)?.send().await?).await?;
        Ok(())
    }
}

#[async_trait]
impl TokenMinter for ApiClient {
    async fn mint_token(&self) -> Result<TokenRecord> {
        let req = self.client.post(self.endpoint("api/v1/calls/token")?);
        let resp = Self::check(self.authorized(req)?.send().await?).await?;
        let data: TokenResponse = resp.json().await?;

        Ok(TokenRecord {
            token: data.token,
            expires_at: data.expires_at,
        })
    }
}

// ============================================================================
// Connectivity
// ============================================================================

/// Latest known network reachability, fed by the platform's network callback.
pub struct ConnectivityMonitor {
    online: watch::Sender<bool>,
}

impl ConnectivityMonitor {
    pub fn new(online: bool) -> Self {
        let (tx, _rx) = watch::channel(online);
        Self { online: tx }
    }

    pub fn is_online(&self) -> bool {
        *self.online.borrow()
    }

    pub fn set_online(&self, online: bool) {
        let changed = self.online.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
        if changed {
            log::info!("Connectivity changed: online={}", online);
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.online.subscribe()
    }
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::new(true)
    }
}
