//! Shared fakes for integration tests: an in-memory hub transport and a
//! scripted history source.

#![allow(dead_code, reason = "each test binary uses a different subset")]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use notification_sync::history::{FetchError, HistorySource};
use notification_sync::transport::{ChannelEvent, ChannelHandle, Connection, Transport, TransportError};
use notification_sync::{Notification, TokenProvider};
use tokio::sync::{mpsc, Notify};

pub const RECEIVE_EVENT: &str = "ReceiveNotification";
pub const JOIN_METHOD: &str = "JoinNotificationGroup";

/// What the next `connect` call does.
#[derive(Debug)]
pub enum Plan {
    /// Open, and accept the group join.
    Accept,
    /// Open, but fail the group join.
    JoinFails,
    /// Fail the connect.
    Refuse(TransportError),
    /// Block until the gate is notified, then open and accept.
    Gated(Arc<Notify>),
}

/// The test's view of one opened channel.
#[derive(Debug, Clone)]
pub struct FakeLink {
    pub token: String,
    events: mpsc::UnboundedSender<ChannelEvent>,
    closed: Arc<AtomicBool>,
    invocations: Arc<Mutex<Vec<(String, Vec<serde_json::Value>)>>>,
}

impl FakeLink {
    /// Deliver a notification push as the hub would (double-encoded JSON).
    pub async fn push(&self, payload: serde_json::Value) {
        self.push_raw(RECEIVE_EVENT, serde_json::Value::String(payload.to_string()))
            .await;
    }

    pub async fn push_raw(&self, target: &str, argument: serde_json::Value) {
        let _ = self.events.send(ChannelEvent::Invocation {
            target: target.to_string(),
            arguments: vec![argument],
        });
    }

    /// Simulate the network dropping the channel.
    pub async fn drop_link(&self) {
        let _ = self.events.send(ChannelEvent::Closed {
            error: Some("connection reset".to_string()),
        });
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn invocations(&self) -> Vec<(String, Vec<serde_json::Value>)> {
        self.invocations.lock().unwrap().clone()
    }
}

struct FakeHandle {
    join_fails: bool,
    closed: Arc<AtomicBool>,
    invocations: Arc<Mutex<Vec<(String, Vec<serde_json::Value>)>>>,
}

#[async_trait]
impl ChannelHandle for FakeHandle {
    async fn invoke(
        &self,
        method: &str,
        arguments: Vec<serde_json::Value>,
    ) -> Result<serde_json::Value, TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        self.invocations
            .lock()
            .unwrap()
            .push((method.to_string(), arguments));
        if self.join_fails {
            Err(TransportError::Invoke("join rejected".to_string()))
        } else {
            Ok(serde_json::Value::Null)
        }
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// In-memory transport driven by a queue of [`Plan`]s. Defaults to `Accept`.
#[derive(Default)]
pub struct FakeTransport {
    plans: Mutex<VecDeque<Plan>>,
    links: Mutex<Vec<FakeLink>>,
    connect_times: Mutex<Vec<tokio::time::Instant>>,
    connects: AtomicUsize,
}

impl FakeTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_plans(plans: impl IntoIterator<Item = Plan>) -> Arc<Self> {
        let transport = Self::default();
        transport.plans.lock().unwrap().extend(plans);
        Arc::new(transport)
    }

    pub fn push_plan(&self, plan: Plan) {
        self.plans.lock().unwrap().push_back(plan);
    }

    /// Number of `connect` calls so far (including refused ones).
    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Instants at which `connect` was called.
    pub fn connect_times(&self) -> Vec<tokio::time::Instant> {
        self.connect_times.lock().unwrap().clone()
    }

    /// Channels that were actually opened, oldest first.
    pub fn links(&self) -> Vec<FakeLink> {
        self.links.lock().unwrap().clone()
    }

    pub fn last_link(&self) -> FakeLink {
        self.links().pop().expect("no channel opened yet")
    }

    pub fn open_links(&self) -> usize {
        self.links().iter().filter(|l| !l.is_closed()).count()
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn connect(&self, _url: &str, access_token: &str) -> Result<Connection, TransportError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.connect_times
            .lock()
            .unwrap()
            .push(tokio::time::Instant::now());

        let plan = self.plans.lock().unwrap().pop_front().unwrap_or(Plan::Accept);
        let join_fails = match plan {
            Plan::Accept => false,
            Plan::JoinFails => true,
            Plan::Refuse(err) => return Err(err),
            Plan::Gated(gate) => {
                gate.notified().await;
                false
            }
        };

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));
        let invocations = Arc::new(Mutex::new(Vec::new()));
        self.links.lock().unwrap().push(FakeLink {
            token: access_token.to_string(),
            events: events_tx,
            closed: Arc::clone(&closed),
            invocations: Arc::clone(&invocations),
        });

        Ok(Connection {
            handle: Box::new(FakeHandle {
                join_fails,
                closed,
                invocations,
            }),
            events: events_rx,
        })
    }
}

/// History source returning scripted results. Defaults to an empty page.
#[derive(Default)]
pub struct FakeHistory {
    results: Mutex<VecDeque<Result<Vec<Notification>, FetchError>>>,
    gate: Mutex<Option<Arc<Notify>>>,
    calls: AtomicUsize,
    tokens: Mutex<Vec<Option<String>>>,
}

impl FakeHistory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_results(
        results: impl IntoIterator<Item = Result<Vec<Notification>, FetchError>>,
    ) -> Arc<Self> {
        let history = Self::default();
        history.results.lock().unwrap().extend(results);
        Arc::new(history)
    }

    /// Make the next fetch block until `gate` is notified.
    pub fn gate_next(&self, gate: Arc<Notify>) {
        *self.gate.lock().unwrap() = Some(gate);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Access token each fetch was made with, in call order.
    pub fn tokens(&self) -> Vec<Option<String>> {
        self.tokens.lock().unwrap().clone()
    }
}

#[async_trait]
impl HistorySource for FakeHistory {
    async fn fetch_page(
        &self,
        tokens: &dyn TokenProvider,
        _page_index: u32,
        _page_size: u32,
    ) -> Result<Vec<Notification>, FetchError> {
        let token = tokens.access_token().await.ok();
        self.tokens.lock().unwrap().push(token);
        self.calls.fetch_add(1, Ordering::SeqCst);
        let gate = self.gate.lock().unwrap().take();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        self.results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(Vec::new()))
    }
}

/// A history notification with a fixed timestamp.
pub fn notification(id: &str) -> Notification {
    Notification {
        id: id.to_string(),
        kind: "order_update".to_string(),
        payload: serde_json::json!(format!("payload for {id}")),
        read: true,
        created_at: Utc.timestamp_opt(1_714_557_600, 0).unwrap(),
        status: "sent".to_string(),
    }
}

/// A push payload as the hub serializes it.
pub fn push_event(id: &str) -> serde_json::Value {
    serde_json::json!({
        "id": id,
        "type": "order_update",
        "data": format!("live {id}"),
        "read": true,
        "createdAt": "2024-05-01T10:00:00Z",
        "status": "sent"
    })
}

/// Poll `condition` until it holds, failing the test after five seconds.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
