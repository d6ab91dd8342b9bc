//! Paginated notification history.
//!
//! The [`HistorySource`] trait is what the engine calls on initialize; the
//! [`HttpHistorySource`] implementation talks to the REST endpoint:
//!
//! ```text
//! GET {api_base}/notification/all?pageIndex=1&pageSize=10
//! Authorization: Bearer <token>
//!
//! { "isSuccess": true, "code": 200, "message": "...",
//!   "data": { "data": [ ... ], "totalItems": 42, "totalPage": 5,
//!             "currentPage": 1, "pageSize": 10 } }
//! ```

// Rust guideline compliant 2026-02

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::auth::TokenProvider;
use crate::constants;
use crate::notification::{timestamp_from_value, Notification};

/// A history fetch failed. Never fatal to the engine.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    /// The request never produced a response (DNS, connect, timeout).
    #[error("network error: {0}")]
    Network(String),
    /// Non-2xx status, or a response flagged `isSuccess: false`.
    #[error("server error: {0}")]
    ServerError(String),
    /// The body was not the expected envelope.
    #[error("invalid response: {0}")]
    Decode(String),
}

/// Something that can return a page of past notifications, newest first.
#[async_trait]
pub trait HistorySource: Send + Sync {
    /// Fetch page `page_index` (1-based) of `page_size` notifications on
    /// behalf of the session that owns `tokens`.
    async fn fetch_page(
        &self,
        tokens: &dyn TokenProvider,
        page_index: u32,
        page_size: u32,
    ) -> Result<Vec<Notification>, FetchError>;
}

/// One page plus the paging metadata the server reports.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryPage {
    /// Notifications on this page, newest first.
    pub notifications: Vec<Notification>,
    /// Total notifications across all pages.
    pub total_items: u64,
    /// Number of pages.
    pub total_pages: u64,
    /// Page returned.
    pub current_page: u64,
    /// Page size used by the server.
    pub page_size: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HistoryEnvelope {
    is_success: bool,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    data: Option<PageBody>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct PageBody {
    data: Vec<HistoryItem>,
    total_items: u64,
    total_page: u64,
    current_page: u64,
    page_size: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HistoryItem {
    #[serde(default)]
    id: serde_json::Value,
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    data: serde_json::Value,
    #[serde(default)]
    read: bool,
    #[serde(default)]
    created_at: serde_json::Value,
    #[serde(default)]
    status: Option<String>,
}

impl HistoryItem {
    /// Convert to a notification. Items without an id are skipped.
    ///
    /// A missing or unparsable `createdAt` becomes `fetched_at`.
    fn into_notification(self, fetched_at: DateTime<Utc>) -> Option<Notification> {
        let id = match self.id {
            serde_json::Value::String(s) if !s.is_empty() => s,
            serde_json::Value::Number(n) => n.to_string(),
            _ => return None,
        };
        Some(Notification {
            id,
            kind: self.kind.unwrap_or_default(),
            payload: self.data,
            read: self.read,
            created_at: timestamp_from_value(&self.created_at).unwrap_or(fetched_at),
            status: self.status.unwrap_or_default(),
        })
    }
}

/// Decode a history response body.
fn decode_page(body: &[u8], fetched_at: DateTime<Utc>) -> Result<HistoryPage, FetchError> {
    let envelope: HistoryEnvelope =
        serde_json::from_slice(body).map_err(|e| FetchError::Decode(e.to_string()))?;

    if !envelope.is_success {
        return Err(FetchError::ServerError(
            envelope
                .message
                .unwrap_or_else(|| "request was not successful".to_string()),
        ));
    }

    let body = envelope.data.unwrap_or_default();
    let total = body.data.len();
    let notifications: Vec<Notification> = body
        .data
        .into_iter()
        .filter_map(|item| item.into_notification(fetched_at))
        .collect();
    if notifications.len() < total {
        log::warn!(
            "[History] Skipped {} item(s) without an id",
            total - notifications.len()
        );
    }

    Ok(HistoryPage {
        notifications,
        total_items: body.total_items,
        total_pages: body.total_page,
        current_page: body.current_page,
        page_size: body.page_size,
    })
}

/// History client for the REST endpoint.
///
/// Holds no credentials; every fetch authenticates with the caller's
/// [`TokenProvider`], so one client serves consecutive users.
#[derive(Clone)]
pub struct HttpHistorySource {
    client: reqwest::Client,
    api_base_url: String,
}

impl std::fmt::Debug for HttpHistorySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpHistorySource")
            .field("api_base_url", &self.api_base_url)
            .finish_non_exhaustive()
    }
}

impl HttpHistorySource {
    /// Create a client for `api_base_url`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(api_base_url: impl Into<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(constants::HTTP_REQUEST_TIMEOUT)
            .build()?;
        Ok(Self::with_client(client, api_base_url))
    }

    /// Creates a history client with a pre-configured HTTP client.
    #[must_use]
    pub fn with_client(client: reqwest::Client, api_base_url: impl Into<String>) -> Self {
        Self {
            client,
            api_base_url: api_base_url.into(),
        }
    }

    /// Fetch one page with its paging metadata, authenticating with `tokens`.
    ///
    /// A provider that has no token yields an unauthenticated request; the
    /// server's answer decides what that means.
    pub async fn fetch(
        &self,
        tokens: &dyn TokenProvider,
        page_index: u32,
        page_size: u32,
    ) -> Result<HistoryPage, FetchError> {
        let url = format!(
            "{}/{}",
            self.api_base_url.trim_end_matches('/'),
            constants::HISTORY_PATH
        );

        let mut request = self
            .client
            .get(&url)
            .query(&[("pageIndex", page_index), ("pageSize", page_size)]);
        match tokens.access_token().await {
            Ok(token) => request = request.bearer_auth(token),
            Err(e) => log::debug!("[History] Fetching without a token: {e}"),
        }

        let response = request
            .send()
            .await
            .map_err(|e| FetchError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::ServerError(format!("HTTP {status}")));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| FetchError::Network(e.to_string()))?;
        let page = decode_page(&body, Utc::now())?;

        log::debug!(
            "[History] Page {}/{}: {} notification(s)",
            page.current_page,
            page.total_pages,
            page.notifications.len()
        );
        Ok(page)
    }
}

#[async_trait]
impl HistorySource for HttpHistorySource {
    async fn fetch_page(
        &self,
        tokens: &dyn TokenProvider,
        page_index: u32,
        page_size: u32,
    ) -> Result<Vec<Notification>, FetchError> {
        self.fetch(tokens, page_index, page_size)
            .await
            .map(|page| page.notifications)
    }
}
