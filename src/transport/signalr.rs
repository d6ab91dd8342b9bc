//! SignalR JSON hub protocol over WebSocket.
//!
//! # Protocol
//!
//! - Connects straight to the hub's WebSocket endpoint (no negotiate round
//!   trip) with the token as a `Bearer` header and as `access_token` in the
//!   query string, since browsers-style hubs read it from there
//! - Sends the handshake `{"protocol":"json","version":1}` and expects `{}`
//! - Every message is a JSON record terminated by `0x1E`; one text frame may
//!   carry several records
//! - Handles invocation (1), completion (3), ping (6) and close (7)
//! - Pings every [`KEEPALIVE_INTERVAL`]; treats [`SERVER_TIMEOUT`] of silence
//!   as a dead link
//!
//! One background task per connection owns both socket halves and routes
//! completions back to the waiting [`ChannelHandle::invoke`] call by
//! invocation id.

// Rust guideline compliant 2026-02

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use super::{ChannelEvent, ChannelHandle, Connection, Transport, TransportError};
use crate::constants::{
    HANDSHAKE_TIMEOUT, INVOKE_TIMEOUT, KEEPALIVE_INTERVAL, SERVER_TIMEOUT,
};
use crate::ws::{self, WsMessage, WsReader, WsWriter};

/// Record terminator.
const RECORD_SEPARATOR: char = '\u{1e}';

/// Message type ids from the hub protocol.
const TYPE_INVOCATION: u64 = 1;
const TYPE_COMPLETION: u64 = 3;
const TYPE_PING: u64 = 6;
const TYPE_CLOSE: u64 = 7;

type PendingInvocations = Arc<Mutex<HashMap<String, oneshot::Sender<Result<serde_json::Value, TransportError>>>>>;

/// SignalR client transport.
#[derive(Debug, Clone)]
pub struct SignalRTransport {
    handshake_timeout: Duration,
    invoke_timeout: Duration,
    keepalive_interval: Duration,
    server_timeout: Duration,
}

impl Default for SignalRTransport {
    fn default() -> Self {
        Self {
            handshake_timeout: HANDSHAKE_TIMEOUT,
            invoke_timeout: INVOKE_TIMEOUT,
            keepalive_interval: KEEPALIVE_INTERVAL,
            server_timeout: SERVER_TIMEOUT,
        }
    }
}

impl SignalRTransport {
    /// Transport with the default timeouts.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set how long to wait for the hub handshake.
    #[must_use]
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Set how long `invoke` waits for a completion.
    #[must_use]
    pub fn invoke_timeout(mut self, timeout: Duration) -> Self {
        self.invoke_timeout = timeout;
        self
    }

    /// Set the client ping interval.
    #[must_use]
    pub fn keepalive_interval(mut self, interval: Duration) -> Self {
        self.keepalive_interval = interval;
        self
    }

    /// Set how much server silence counts as a dropped link.
    #[must_use]
    pub fn server_timeout(mut self, timeout: Duration) -> Self {
        self.server_timeout = timeout;
        self
    }
}

/// Build the WebSocket URL for a hub, carrying the token in the query string.
fn hub_socket_url(hub_url: &str, access_token: &str) -> Result<String, TransportError> {
    let mut url = reqwest::Url::parse(&ws::http_to_ws_scheme(hub_url))
        .map_err(|e| TransportError::Connect(format!("invalid hub URL '{hub_url}': {e}")))?;
    url.query_pairs_mut().append_pair("access_token", access_token);
    Ok(url.into())
}

fn record(value: &serde_json::Value) -> String {
    let mut text = value.to_string();
    text.push(RECORD_SEPARATOR);
    text
}

fn split_records(text: &str) -> impl Iterator<Item = &str> {
    text.split(RECORD_SEPARATOR).filter(|r| !r.trim().is_empty())
}

#[async_trait]
impl Transport for SignalRTransport {
    async fn connect(&self, url: &str, access_token: &str) -> Result<Connection, TransportError> {
        let socket_url = hub_socket_url(url, access_token)?;
        let bearer = format!("Bearer {access_token}");

        log::debug!("[SignalR] Connecting to {url}");
        let (mut writer, mut reader) = ws::connect(&socket_url, &[("Authorization", &bearer)])
            .await
            .map_err(|e| {
                if ws::is_unauthorized(&e) {
                    TransportError::Unauthorized(format!("{e:#}"))
                } else {
                    TransportError::Connect(format!("{e:#}"))
                }
            })?;

        let handshake = serde_json::json!({ "protocol": "json", "version": 1 });
        writer
            .send_text(&record(&handshake))
            .await
            .map_err(|e| TransportError::Handshake(format!("{e:#}")))?;

        let leftover = match tokio::time::timeout(self.handshake_timeout, await_handshake(&mut writer, &mut reader)).await {
            Ok(Ok(leftover)) => leftover,
            Ok(Err(e)) => {
                let _ = writer.close().await;
                return Err(e);
            }
            Err(_) => {
                let _ = writer.close().await;
                return Err(TransportError::Timeout);
            }
        };
        log::info!("[SignalR] Connected to {url}");

        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let pending: PendingInvocations = Arc::new(Mutex::new(HashMap::new()));
        let shutdown = CancellationToken::new();

        tokio::spawn(run_io_loop(
            IoContext {
                pending: Arc::clone(&pending),
                events_tx,
                keepalive_interval: self.keepalive_interval,
                server_timeout: self.server_timeout,
                shutdown: shutdown.clone(),
            },
            writer,
            reader,
            outgoing_rx,
            leftover,
        ));

        Ok(Connection {
            handle: Box::new(SignalRHandle {
                outgoing_tx,
                pending,
                next_invocation: AtomicU64::new(0),
                invoke_timeout: self.invoke_timeout,
                shutdown,
            }),
            events: events_rx,
        })
    }
}

/// Wait for the handshake response.
///
/// Returns any records that arrived in the same frame after it.
async fn await_handshake(writer: &mut WsWriter, reader: &mut WsReader) -> Result<Vec<String>, TransportError> {
    while let Some(msg) = reader.recv().await {
        match msg {
            Ok(WsMessage::Text(text)) => {
                let mut records = split_records(&text);
                let Some(first) = records.next() else {
                    continue;
                };
                let response: serde_json::Value = serde_json::from_str(first)
                    .map_err(|e| TransportError::Handshake(format!("invalid handshake response: {e}")))?;
                if let Some(error) = response.get("error").and_then(serde_json::Value::as_str) {
                    return Err(TransportError::Handshake(error.to_string()));
                }
                return Ok(records.map(str::to_string).collect());
            }
            Ok(WsMessage::Ping(data)) => {
                let _ = writer.send_pong(data).await;
            }
            Ok(WsMessage::Close { code, reason }) => {
                return Err(TransportError::Handshake(format!(
                    "closed during handshake ({code}) {reason}"
                )));
            }
            Err(e) => return Err(TransportError::Handshake(format!("{e:#}"))),
        }
    }
    Err(TransportError::Handshake("stream ended before handshake".into()))
}

/// Outbound handle for one SignalR connection.
struct SignalRHandle {
    outgoing_tx: mpsc::UnboundedSender<String>,
    pending: PendingInvocations,
    next_invocation: AtomicU64,
    invoke_timeout: Duration,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for SignalRHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalRHandle")
            .field("closed", &self.shutdown.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl SignalRHandle {
    fn forget(&self, invocation_id: &str) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(invocation_id);
    }
}

#[async_trait]
impl ChannelHandle for SignalRHandle {
    async fn invoke(
        &self,
        method: &str,
        arguments: Vec<serde_json::Value>,
    ) -> Result<serde_json::Value, TransportError> {
        if self.shutdown.is_cancelled() {
            return Err(TransportError::Closed);
        }

        let invocation_id = self.next_invocation.fetch_add(1, Ordering::Relaxed).to_string();
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(invocation_id.clone(), tx);

        let message = serde_json::json!({
            "type": TYPE_INVOCATION,
            "invocationId": invocation_id,
            "target": method,
            "arguments": arguments,
        });
        if self.outgoing_tx.send(record(&message)).is_err() {
            self.forget(&invocation_id);
            return Err(TransportError::Closed);
        }
        log::trace!("[SignalR] Invoked {method} (id={invocation_id})");

        match tokio::time::timeout(self.invoke_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TransportError::Closed),
            Err(_) => {
                self.forget(&invocation_id);
                Err(TransportError::Timeout)
            }
        }
    }

    async fn close(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for SignalRHandle {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Shared state for the connection's background task.
struct IoContext {
    pending: PendingInvocations,
    events_tx: mpsc::UnboundedSender<ChannelEvent>,
    keepalive_interval: Duration,
    server_timeout: Duration,
    shutdown: CancellationToken,
}

/// Why a dispatched record ended the connection.
enum Dispatch {
    Continue,
    Close(Option<String>),
}

/// Owns the socket until it closes or the handle shuts it down.
///
/// Always finishes by failing outstanding invocations and emitting
/// [`ChannelEvent::Closed`].
async fn run_io_loop(
    ctx: IoContext,
    mut writer: WsWriter,
    mut reader: WsReader,
    mut outgoing_rx: mpsc::UnboundedReceiver<String>,
    leftover: Vec<String>,
) {
    let mut exit: Option<Option<String>> = None;

    for rec in &leftover {
        if let Dispatch::Close(error) = dispatch_record(&ctx, rec) {
            exit = Some(error);
            break;
        }
    }

    let ping = record(&serde_json::json!({ "type": TYPE_PING }));
    let mut keepalive = tokio::time::interval_at(
        tokio::time::Instant::now() + ctx.keepalive_interval,
        ctx.keepalive_interval,
    );
    keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut last_inbound = tokio::time::Instant::now();

    while exit.is_none() {
        tokio::select! {
            biased;

            () = ctx.shutdown.cancelled() => {
                log::debug!("[SignalR] Closing connection");
                let _ = writer.send_text(&record(&serde_json::json!({ "type": TYPE_CLOSE }))).await;
                let _ = writer.close().await;
                exit = Some(None);
            }

            msg = reader.recv() => {
                last_inbound = tokio::time::Instant::now();
                match msg {
                    Some(Ok(WsMessage::Text(text))) => {
                        for rec in split_records(&text) {
                            if let Dispatch::Close(error) = dispatch_record(&ctx, rec) {
                                exit = Some(error);
                                break;
                            }
                        }
                    }
                    Some(Ok(WsMessage::Ping(data))) => {
                        let _ = writer.send_pong(data).await;
                    }
                    Some(Ok(WsMessage::Close { code, reason })) => {
                        log::info!("[SignalR] Connection closed by server ({code}) {reason}");
                        exit = Some(Some(format!("closed by server ({code})")));
                    }
                    Some(Err(e)) => {
                        log::warn!("[SignalR] WebSocket error: {e}");
                        exit = Some(Some(e.to_string()));
                    }
                    None => {
                        log::info!("[SignalR] WebSocket stream ended");
                        exit = Some(Some("stream ended".to_string()));
                    }
                }
            }

            Some(frame) = outgoing_rx.recv() => {
                if let Err(e) = writer.send_text(&frame).await {
                    log::warn!("[SignalR] Send failed: {e}");
                    exit = Some(Some(e.to_string()));
                }
            }

            _ = keepalive.tick() => {
                if let Err(e) = writer.send_text(&ping).await {
                    log::warn!("[SignalR] Ping failed: {e}");
                    exit = Some(Some(e.to_string()));
                }
            }

            () = tokio::time::sleep_until(last_inbound + ctx.server_timeout) => {
                log::warn!(
                    "[SignalR] No message from server in {}s, dropping connection",
                    ctx.server_timeout.as_secs()
                );
                let _ = writer.close().await;
                exit = Some(Some("server timeout".to_string()));
            }
        }
    }

    let drained: Vec<_> = ctx
        .pending
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .drain()
        .collect();
    for (_, waiter) in drained {
        let _ = waiter.send(Err(TransportError::Closed));
    }

    let error = exit.flatten();
    let _ = ctx.events_tx.send(ChannelEvent::Closed { error });
}

/// Handle one hub protocol record.
fn dispatch_record(ctx: &IoContext, text: &str) -> Dispatch {
    let message: serde_json::Value = match serde_json::from_str(text) {
        Ok(message) => message,
        Err(e) => {
            log::warn!("[SignalR] Failed to parse record: {e}");
            return Dispatch::Continue;
        }
    };

    match message.get("type").and_then(serde_json::Value::as_u64) {
        Some(TYPE_INVOCATION) => {
            let Some(target) = message.get("target").and_then(serde_json::Value::as_str) else {
                log::warn!("[SignalR] Invocation without target");
                return Dispatch::Continue;
            };
            let arguments = match message.get("arguments") {
                Some(serde_json::Value::Array(args)) => args.clone(),
                _ => Vec::new(),
            };
            let event = ChannelEvent::Invocation {
                target: target.to_string(),
                arguments,
            };
            if ctx.events_tx.send(event).is_err() {
                log::trace!("[SignalR] Event receiver dropped");
            }
            Dispatch::Continue
        }
        Some(TYPE_COMPLETION) => {
            let Some(invocation_id) = message.get("invocationId").and_then(serde_json::Value::as_str) else {
                return Dispatch::Continue;
            };
            let waiter = ctx
                .pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(invocation_id);
            let result = match message.get("error").and_then(serde_json::Value::as_str) {
                Some(error) => Err(TransportError::Invoke(error.to_string())),
                None => Ok(message.get("result").cloned().unwrap_or_default()),
            };
            match waiter {
                Some(waiter) => {
                    let _ = waiter.send(result);
                }
                None => log::trace!("[SignalR] Completion for unknown invocation {invocation_id}"),
            }
            Dispatch::Continue
        }
        Some(TYPE_PING) => Dispatch::Continue,
        Some(TYPE_CLOSE) => {
            let error = message
                .get("error")
                .and_then(serde_json::Value::as_str)
                .map(str::to_string);
            log::info!("[SignalR] Server sent close (error={error:?})");
            Dispatch::Close(error.or_else(|| Some("closed by server".to_string())))
        }
        other => {
            log::trace!("[SignalR] Ignoring message type {other:?}");
            Dispatch::Continue
        }
    }
}
