//! Application-wide constants for notification-sync.
//!
//! This module centralizes the magic numbers and protocol names used by the
//! engine. Constants are grouped by domain.
//!
//! # Categories
//!
//! - **Timeouts**: Network and handshake timeouts
//! - **Reconnection**: The fixed backoff schedule
//! - **Cache & History**: Capacity and first-page defaults
//! - **Hub**: SignalR method and event names

// Rust guideline compliant 2026-02

use std::time::Duration;

// ============================================================================
// Timeouts
// ============================================================================

/// HTTP client request timeout for history fetches.
pub const HTTP_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// How long to wait for the SignalR handshake response after the WebSocket opens.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// How long an `invoke` waits for its completion message.
pub const INVOKE_TIMEOUT: Duration = Duration::from_secs(15);

/// Client ping interval. Matches the SignalR default keep-alive.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// Silence from the server longer than this is treated as a dropped channel.
///
/// SignalR servers ping every 15s, so two missed pings means the link is gone.
pub const SERVER_TIMEOUT: Duration = Duration::from_secs(30);

// ============================================================================
// Reconnection
// ============================================================================

/// Reconnect delays in milliseconds, indexed by attempt and clamped to the last entry.
pub const RECONNECT_SCHEDULE_MS: [u64; 5] = [0, 2_000, 5_000, 10_000, 20_000];

// ============================================================================
// Cache & History
// ============================================================================

/// Default number of notifications kept in memory.
pub const DEFAULT_CAPACITY: usize = 100;

/// History page requested on initialize (pages are 1-based on the server).
pub const DEFAULT_HISTORY_PAGE_INDEX: u32 = 1;

/// History page size requested on initialize.
pub const DEFAULT_HISTORY_PAGE_SIZE: u32 = 10;

/// Buffer of the arrival broadcast. Slow receivers skip ahead rather than block ingestion.
pub const ARRIVAL_BUFFER: usize = 64;

// ============================================================================
// Hub
// ============================================================================

/// Hub method that binds the connection to the user's notification group.
pub const JOIN_METHOD: &str = "JoinNotificationGroup";

/// Hub event carrying a pushed notification.
pub const RECEIVE_EVENT: &str = "ReceiveNotification";

/// Default hub URL used when no config file or env override is present.
pub const DEFAULT_HUB_URL: &str = "http://localhost:6900/notificationsHub";

/// Default REST base URL used for history fetches.
pub const DEFAULT_API_BASE_URL: &str = "http://localhost:6900/api";

/// Path (relative to the API base) of the paginated history endpoint.
pub const HISTORY_PATH: &str = "notification/all";
