//! Remote gateway: the request/response seam to the shopping-list API.
//!
//! ```text
//! MutationEngine ─┐
//! SessionStore  ──┼──► dyn RemoteGateway ──► HttpGateway ──► REST API
//! ListStore     ──┘          ▲
//!                            └── FakeGateway (tests)
//! ```
//!
//! The gateway never retains entities; it returns owned values to the caller.
//! A 401 from any endpoint invalidates the shared [`Credentials`], which is how
//! the rest of the engine learns that a new login is required.

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::watch;

use crate::config::ClientConfig;
use crate::model::{ActiveSession, Category, CheckState, EntityId, Item, ListItem, NewListEntry};

/// Gateway errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    /// The request never produced a response (DNS, refused, reset, timeout)
    Transport(String),
    /// The server rejected the credential
    Unauthorized,
    /// Non-success status other than 401
    Status { status: u16, message: String },
    /// The response body did not match the expected shape
    Decode(String),
}

impl GatewayError {
    /// Whether retrying the same request later may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            GatewayError::Transport(_) => true,
            GatewayError::Status { status, .. } => *status >= 500,
            GatewayError::Unauthorized | GatewayError::Decode(_) => false,
        }
    }
}

impl std::fmt::Display for GatewayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GatewayError::Transport(e) => write!(f, "Transport error: {e}"),
            GatewayError::Unauthorized => write!(f, "Unauthorized: login required"),
            GatewayError::Status { status, message } => {
                write!(f, "Server returned {status}: {message}")
            }
            GatewayError::Decode(e) => write!(f, "Decode error: {e}"),
        }
    }
}

impl std::error::Error for GatewayError {}

/// Shared bearer credential with change notifications.
///
/// `None` means "login required". Subscribers observe every change, including
/// invalidation after a 401.
pub struct Credentials {
    token: watch::Sender<Option<String>>,
}

impl Credentials {
    pub fn new(token: Option<String>) -> Self {
        Self {
            token: watch::Sender::new(token),
        }
    }

    /// Current token, if any.
    pub fn token(&self) -> Option<String> {
        self.token.borrow().clone()
    }

    pub fn is_present(&self) -> bool {
        self.token.borrow().is_some()
    }

    /// Store a freshly issued token.
    pub fn set(&self, token: impl Into<String>) {
        self.token.send_replace(Some(token.into()));
    }

    /// Drop the token (logout or server rejection).
    pub fn invalidate(&self) {
        if self.token.send_replace(None).is_some() {
            log::warn!("Credential invalidated, login required");
        }
    }

    /// Watch for credential changes.
    pub fn subscribe(&self) -> watch::Receiver<Option<String>> {
        self.token.subscribe()
    }
}

impl Default for Credentials {
    fn default() -> Self {
        Self::new(None)
    }
}

/// Operations against the backing service.
#[async_trait]
pub trait RemoteGateway: Send + Sync {
    // Shopping list
    async fn fetch_list(&self) -> Result<Vec<ListItem>, GatewayError>;
    async fn add_list_entries(
        &self,
        entries: &[NewListEntry],
    ) -> Result<Vec<ListItem>, GatewayError>;
    async fn update_list_entry(
        &self,
        id: EntityId,
        quantity: f64,
        unit: Option<&str>,
    ) -> Result<ListItem, GatewayError>;
    async fn remove_list_entry(&self, id: EntityId) -> Result<(), GatewayError>;
    async fn bulk_remove_list_entries(&self, ids: &[EntityId]) -> Result<(), GatewayError>;
    async fn clear_list(&self) -> Result<(), GatewayError>;
    async fn purchase(&self) -> Result<(), GatewayError>;

    // Catalogue
    async fn fetch_items(&self) -> Result<Vec<Item>, GatewayError>;
    async fn fetch_categories(&self) -> Result<Vec<Category>, GatewayError>;
    async fn merge_items(
        &self,
        target: EntityId,
        sources: &[EntityId],
    ) -> Result<Item, GatewayError>;
    async fn bulk_delete_items(&self, ids: &[EntityId]) -> Result<(), GatewayError>;
    async fn bulk_set_category(
        &self,
        ids: &[EntityId],
        category_id: Option<EntityId>,
    ) -> Result<(), GatewayError>;

    // Shopping session
    async fn fetch_active_session(&self) -> Result<Option<ActiveSession>, GatewayError>;
    async fn start_session(&self) -> Result<ActiveSession, GatewayError>;
    async fn toggle_session_check(&self, session_item_id: EntityId)
        -> Result<CheckState, GatewayError>;
    async fn complete_session(&self) -> Result<(), GatewayError>;
    async fn abort_session(&self) -> Result<(), GatewayError>;
}

/// REST implementation over reqwest.
pub struct HttpGateway {
    client: Client,
    base: String,
    credentials: Arc<Credentials>,
}

impl HttpGateway {
    pub fn new(config: &ClientConfig, credentials: Arc<Credentials>) -> Result<Self, GatewayError> {
        let mut builder = Client::builder();
        if let Some(timeout) = config.request_timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder
            .build()
            .map_err(|e| GatewayError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            base: config.api_base.trim_end_matches('/').to_string(),
            credentials,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base)
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, GatewayError> {
        let request = match self.credentials.token() {
            Some(token) => request.bearer_auth(token),
            None => request,
        };
        let response = request
            .send()
            .await
            .map_err(|e| GatewayError::Transport(e.to_string()))?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            self.credentials.invalidate();
            return Err(GatewayError::Unauthorized);
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            log::debug!("Request failed with {status}: {message}");
            return Err(GatewayError::Status {
                status: status.as_u16(),
                message,
            });
        }
        Ok(response)
    }

    async fn send_json<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, GatewayError> {
        self.send(request)
            .await?
            .json::<T>()
            .await
            .map_err(|e| GatewayError::Decode(e.to_string()))
    }

    async fn send_empty(&self, request: RequestBuilder) -> Result<(), GatewayError> {
        self.send(request).await.map(|_| ())
    }
}

#[async_trait]
impl RemoteGateway for HttpGateway {
    async fn fetch_list(&self) -> Result<Vec<ListItem>, GatewayError> {
        self.send_json(self.client.get(self.url("/api/list"))).await
    }

    async fn add_list_entries(
        &self,
        entries: &[NewListEntry],
    ) -> Result<Vec<ListItem>, GatewayError> {
        let body = json!({ "items": entries });
        self.send_json(self.client.post(self.url("/api/list/add")).json(&body))
            .await
    }

    async fn update_list_entry(
        &self,
        id: EntityId,
        quantity: f64,
        unit: Option<&str>,
    ) -> Result<ListItem, GatewayError> {
        let mut body = json!({ "quantity": quantity });
        if let Some(unit) = unit {
            body["unit"] = json!(unit);
        }
        self.send_json(self.client.put(self.url(&format!("/api/list/{id}"))).json(&body))
            .await
    }

    async fn remove_list_entry(&self, id: EntityId) -> Result<(), GatewayError> {
        self.send_empty(self.client.delete(self.url(&format!("/api/list/{id}"))))
            .await
    }

    async fn bulk_remove_list_entries(&self, ids: &[EntityId]) -> Result<(), GatewayError> {
        let body = json!({ "ids": ids });
        self.send_empty(self.client.post(self.url("/api/list/remove")).json(&body))
            .await
    }

    async fn clear_list(&self) -> Result<(), GatewayError> {
        self.send_empty(self.client.delete(self.url("/api/list"))).await
    }

    async fn purchase(&self) -> Result<(), GatewayError> {
        self.send_empty(self.client.post(self.url("/api/list/purchase")))
            .await
    }

    async fn fetch_items(&self) -> Result<Vec<Item>, GatewayError> {
        self.send_json(self.client.get(self.url("/api/items"))).await
    }

    async fn fetch_categories(&self) -> Result<Vec<Category>, GatewayError> {
        self.send_json(self.client.get(self.url("/api/categories")))
            .await
    }

    async fn merge_items(
        &self,
        target: EntityId,
        sources: &[EntityId],
    ) -> Result<Item, GatewayError> {
        let body = json!({ "source_ids": sources });
        self.send_json(
            self.client
                .post(self.url(&format!("/api/items/{target}/merge")))
                .json(&body),
        )
        .await
    }

    async fn bulk_delete_items(&self, ids: &[EntityId]) -> Result<(), GatewayError> {
        let body = json!({ "ids": ids });
        self.send_empty(self.client.post(self.url("/api/items/delete")).json(&body))
            .await
    }

    async fn bulk_set_category(
        &self,
        ids: &[EntityId],
        category_id: Option<EntityId>,
    ) -> Result<(), GatewayError> {
        let body = json!({ "item_ids": ids, "category_id": category_id });
        self.send_empty(
            self.client
                .post(self.url("/api/items/set-category"))
                .json(&body),
        )
        .await
    }

    async fn fetch_active_session(&self) -> Result<Option<ActiveSession>, GatewayError> {
        self.send_json(self.client.get(self.url("/api/session/active")))
            .await
    }

    async fn start_session(&self) -> Result<ActiveSession, GatewayError> {
        self.send_json(self.client.post(self.url("/api/session/start")))
            .await
    }

    async fn toggle_session_check(
        &self,
        session_item_id: EntityId,
    ) -> Result<CheckState, GatewayError> {
        self.send_json(
            self.client
                .put(self.url(&format!("/api/session/check/{session_item_id}"))),
        )
        .await
    }

    async fn complete_session(&self) -> Result<(), GatewayError> {
        self.send_empty(self.client.post(self.url("/api/session/complete")))
            .await
    }

    async fn abort_session(&self) -> Result<(), GatewayError> {
        self.send_empty(self.client.delete(self.url("/api/session/active")))
            .await
    }
}
