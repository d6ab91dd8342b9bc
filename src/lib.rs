//! Notification Sync - real-time notification synchronization engine.
//!
//! This crate keeps one live subscription to a push-notification hub for a
//! signed-in user, holds a bounded in-memory cache of notifications seeded
//! from a paginated history endpoint, and survives network interruptions by
//! reconnecting on a fixed backoff schedule.
//!
//! # Architecture
//!
//! - **Engine** - Facade the UI calls: initialize, teardown, snapshot, subscribe
//! - **Connection** - Lifecycle state machine and reconnect loop
//! - **Ingest** - Raw hub events in, normalized notifications out
//! - **Cache** - Ordered, size-capped, id-unique store; the UI's source of truth
//! - **History** - Paginated fetch used to seed the cache
//! - **Transport** - Channel abstraction plus the SignalR client
//!
//! # Modules
//!
//! - [`engine`] - [`NotificationEngine`] facade
//! - [`connection`] - [`ConnectionManager`] and [`ConnectionState`]
//! - [`cache`] - [`NotificationCache`]
//! - [`config`] - Configuration loading

// Rust guideline compliant 2026-02

pub mod auth;
pub mod backoff;
pub mod cache;
pub mod config;
pub mod connection;
pub mod constants;
pub mod engine;
pub mod history;
pub mod ingest;
pub mod notification;
pub mod transport;
pub mod ws;

// Re-export commonly used types
pub use auth::{StaticToken, TokenProvider};
pub use cache::{ChangeSubscription, NotificationCache, Snapshot};
pub use config::Config;
pub use connection::{ConnectError, ConnectionManager, ConnectionState};
pub use engine::{Initialized, NotificationEngine};
pub use history::{FetchError, HistorySource, HttpHistorySource};
pub use ingest::{Arrival, IngestionError};
pub use notification::Notification;
pub use transport::{SignalRTransport, Transport};
