//! Event ingestion: raw push payloads in, canonical notifications out.
//!
//! Each session owns one [`IngestionPipeline`] that drains the session's
//! inbound queue in order. Malformed events are logged and dropped; they
//! never stop the pipeline.

// Rust guideline compliant 2026-02

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use crate::cache::{Epoch, NotificationCache};
use crate::notification::{timestamp_from_value, Notification};

/// A raw push event could not be turned into a notification.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IngestionError {
    /// Missing or unparsable required field, or not JSON at all.
    #[error("malformed event: {0}")]
    Malformed(String),
}

/// Side-effect published for every ingested notification.
///
/// Carries the raw payload text so a UI can show it as-is in a toast.
#[derive(Debug, Clone)]
pub struct Arrival {
    /// The normalized notification, as stored in the cache.
    pub notification: Notification,
    /// The payload exactly as it arrived on the channel.
    pub raw: String,
}

/// Parse a raw push event into a [`Notification`].
///
/// The hub sends the notification as a JSON-encoded string; a plain JSON
/// object is accepted too. `id`, `type` and `createdAt` are required.
/// `read` is always `false` on arrival, whatever the server sent.
pub fn parse_event(raw: &serde_json::Value) -> Result<Notification, IngestionError> {
    let decoded;
    let object = match raw {
        serde_json::Value::String(text) => {
            decoded = serde_json::from_str::<serde_json::Value>(text)
                .map_err(|e| IngestionError::Malformed(format!("not JSON: {e}")))?;
            &decoded
        }
        other => other,
    };
    let Some(fields) = object.as_object() else {
        return Err(IngestionError::Malformed("event is not an object".into()));
    };

    let id = match fields.get("id") {
        Some(serde_json::Value::String(s)) if !s.is_empty() => s.clone(),
        Some(serde_json::Value::Number(n)) => n.to_string(),
        _ => return Err(IngestionError::Malformed("missing id".into())),
    };
    let kind = fields
        .get("type")
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| IngestionError::Malformed(format!("missing type on {id}")))?
        .to_string();
    let created_at = fields
        .get("createdAt")
        .and_then(timestamp_from_value)
        .ok_or_else(|| IngestionError::Malformed(format!("missing or invalid createdAt on {id}")))?;

    Ok(Notification {
        id,
        kind,
        payload: fields.get("data").cloned().unwrap_or_default(),
        read: false,
        created_at,
        status: fields
            .get("status")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default()
            .to_string(),
    })
}

/// Turns inbound events into cache writes and arrival announcements.
#[derive(Debug, Clone)]
pub struct IngestionPipeline {
    cache: Arc<NotificationCache>,
    epoch: Epoch,
    arrivals: broadcast::Sender<Arrival>,
}

impl IngestionPipeline {
    /// Create a pipeline that writes into `cache` for as long as it stays in `epoch`.
    pub fn new(
        cache: Arc<NotificationCache>,
        epoch: Epoch,
        arrivals: broadcast::Sender<Arrival>,
    ) -> Self {
        Self {
            cache,
            epoch,
            arrivals,
        }
    }

    /// Ingest one raw event.
    ///
    /// On success the notification is in the cache (unless the session's
    /// epoch has passed) and an [`Arrival`] has been broadcast. Broadcasting
    /// never blocks; with no receivers the arrival is simply dropped.
    pub fn on_event(&self, raw: &serde_json::Value) -> Result<Notification, IngestionError> {
        let notification = parse_event(raw)?;

        if self
            .cache
            .insert_in_epoch(self.epoch, notification.clone())
            .is_none()
        {
            log::debug!("[Ingest] Session ended, discarding {}", notification.id);
            return Ok(notification);
        }

        let raw_text = match raw {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        let _ = self.arrivals.send(Arrival {
            notification: notification.clone(),
            raw: raw_text,
        });
        Ok(notification)
    }

    /// Drain `events` in order until the queue closes or `cancel` fires.
    pub async fn run(self, mut events: mpsc::UnboundedReceiver<serde_json::Value>, cancel: CancellationToken) {
        loop {
            let raw = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                raw = events.recv() => match raw {
                    Some(raw) => raw,
                    None => break,
                },
            };

            match self.on_event(&raw) {
                Ok(n) => log::debug!("[Ingest] Stored notification {} ({})", n.id, n.kind),
                Err(e) => log::warn!("[Ingest] Dropping event: {e}"),
            }
        }
        log::debug!("[Ingest] Pipeline stopped");
    }
}
