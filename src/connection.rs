//! Connection lifecycle: one logical hub subscription per manager.
//!
//! # State machine
//!
//! ```text
//!   Idle ──open()──► Connecting ──ok──► Connected ──drop──► Reconnecting{n}
//!                        │                  ▲                  │    ▲
//!                        │ join failed      └──── retry ok ────┘    │ retry failed
//!                        └────────────────────► Reconnecting{0} ─────┘ (n += 1)
//!
//!   any state ──close()──► Disconnected   (terminal until the next open())
//! ```
//!
//! A connect attempt is: fetch a token from the [`TokenProvider`], open the
//! channel, then invoke the group-join method. Only after the join completes
//! is the link `Connected`. The reconnect loop never gives up; delays come
//! from the [`BackoffPolicy`] and only [`ConnectionManager::close`] stops it.
//!
//! # Teardown races
//!
//! Every state transition for a session happens under the session lock and
//! first checks that the session was not cancelled. `close()` cancels under
//! the same lock, so an attempt that finishes after `close()` sees the
//! cancellation, closes the channel it just opened and leaves the state at
//! `Disconnected`.

// Rust guideline compliant 2026-02

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::auth::TokenProvider;
use crate::backoff::BackoffPolicy;
use crate::transport::{ChannelEvent, Connection, Transport, TransportError};

/// Connection state of the hub subscription.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// Never opened.
    #[default]
    Idle,
    /// First connect attempt in flight.
    Connecting,
    /// Channel open and group joined.
    Connected,
    /// Waiting to retry after a drop.
    Reconnecting {
        /// Retry number, starting at 0 after each successful connection.
        attempt: u32,
        /// Delay before this retry fires.
        next_retry_ms: u64,
    },
    /// Closed by `close()`.
    Disconnected,
}

impl ConnectionState {
    /// Whether a session is live (connecting, connected or retrying).
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            Self::Connecting | Self::Connected | Self::Reconnecting { .. }
        )
    }
}

/// Why a connection could not be opened.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectError {
    /// No user id to bind the subscription to.
    #[error("no user identity")]
    NoIdentity,
    /// Network or handshake failure.
    #[error("transport failure: {0}")]
    TransportFailure(String),
    /// The token was missing or the server refused it.
    #[error("authentication rejected: {0}")]
    AuthRejected(String),
    /// `close()` ran while the attempt was in flight.
    #[error("connection attempt cancelled by teardown")]
    Cancelled,
}

impl From<TransportError> for ConnectError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Unauthorized(msg) => Self::AuthRejected(msg),
            other => Self::TransportFailure(other.to_string()),
        }
    }
}

/// Hub endpoint and protocol names for a manager.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Hub URL.
    pub hub_url: String,
    /// Method invoked with the user id to join the notification group.
    pub join_method: String,
    /// Hub event that carries notifications.
    pub receive_event: String,
    /// Reconnect delays.
    pub backoff: BackoffPolicy,
}

/// One logical binding of a manager to a user.
///
/// Cheap to clone; all clones observe the same cancellation.
#[derive(Debug, Clone)]
pub struct Session {
    id: u64,
    user_id: String,
    cancel: CancellationToken,
    reconnects: Arc<watch::Sender<u32>>,
}

impl Session {
    fn new(id: u64, user_id: &str) -> Self {
        let (reconnects, _) = watch::channel(0);
        Self {
            id,
            user_id: user_id.to_string(),
            cancel: CancellationToken::new(),
            reconnects: Arc::new(reconnects),
        }
    }

    /// User this session is bound to.
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Whether the session has not been closed.
    pub fn is_active(&self) -> bool {
        !self.cancel.is_cancelled()
    }

    /// Resolves once the session is closed.
    pub async fn ended(&self) {
        self.cancel.cancelled().await;
    }

    /// Counter bumped after every successful reconnect (not the first connect).
    pub fn reconnects(&self) -> watch::Receiver<u32> {
        self.reconnects.subscribe()
    }

    pub(crate) fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

struct Inner {
    transport: Arc<dyn Transport>,
    config: ConnectionConfig,
    state: watch::Sender<ConnectionState>,
    session: Mutex<Option<Session>>,
    next_session: AtomicU64,
}

impl Inner {
    fn lock_session(&self) -> MutexGuard<'_, Option<Session>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Set `state` on behalf of `session`, unless it has been closed.
    fn transition(&self, session: &Session, state: ConnectionState) -> bool {
        let _current = self.lock_session();
        if session.cancel.is_cancelled() {
            return false;
        }
        log::debug!("[Connection] {} -> {:?}", session.user_id, state);
        self.state.send_replace(state);
        true
    }
}

/// Owns the hub subscription and drives reconnection.
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("hub_url", &self.inner.config.hub_url)
            .field("state", &*self.inner.state.borrow())
            .finish_non_exhaustive()
    }
}

/// How a connect attempt failed.
enum EstablishError {
    /// Token, transport or handshake failure.
    Connect(ConnectError),
    /// Connected, but the group join failed. Treated like a drop.
    Join(TransportError),
}

/// Why the event pump stopped.
enum PumpExit {
    Cancelled,
    Dropped(Option<String>),
}

impl ConnectionManager {
    /// Create an idle manager.
    pub fn new(transport: Arc<dyn Transport>, config: ConnectionConfig) -> Self {
        let (state, _) = watch::channel(ConnectionState::Idle);
        Self {
            inner: Arc::new(Inner {
                transport,
                config,
                state,
                session: Mutex::new(None),
                next_session: AtomicU64::new(0),
            }),
        }
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        self.inner.state.borrow().clone()
    }

    /// Receiver that observes every state change.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// The live session, if any.
    pub fn current_session(&self) -> Option<Session> {
        self.inner.lock_session().clone()
    }

    /// Open a subscription for `user_id`.
    ///
    /// Any previous session is closed first. Hub events named by
    /// `receive_event` are forwarded, in order, into `inbound` for as long as
    /// the session lives, across reconnects.
    ///
    /// Returns once the first attempt settles: `Ok` when connected, or when
    /// the channel opened but the group join failed (the reconnect loop takes
    /// over in that case).
    ///
    /// # Errors
    ///
    /// - `NoIdentity` for an empty `user_id`
    /// - `AuthRejected` / `TransportFailure` when the first connect fails;
    ///   no retry loop is started
    /// - `Cancelled` when `close()` ran while the attempt was in flight
    pub async fn open(
        &self,
        user_id: &str,
        tokens: Arc<dyn TokenProvider>,
        inbound: mpsc::UnboundedSender<serde_json::Value>,
    ) -> Result<Session, ConnectError> {
        if user_id.trim().is_empty() {
            return Err(ConnectError::NoIdentity);
        }

        let session = Session::new(
            self.inner.next_session.fetch_add(1, Ordering::Relaxed),
            user_id,
        );
        {
            let mut current = self.inner.lock_session();
            if let Some(previous) = current.take() {
                log::info!("[Connection] Replacing session for {}", previous.user_id);
                previous.cancel.cancel();
            }
            *current = Some(session.clone());
            self.inner.state.send_replace(ConnectionState::Connecting);
        }

        let link = SessionLink {
            inner: Arc::clone(&self.inner),
            session: session.clone(),
            tokens,
            inbound,
        };

        match link.establish().await {
            Ok(connection) => {
                if !self.inner.transition(&session, ConnectionState::Connected) {
                    log::info!("[Connection] Closed during connect, dropping new channel");
                    connection.handle.close().await;
                    return Err(ConnectError::Cancelled);
                }
                log::info!("[Connection] Connected for {user_id}");
                tokio::spawn(link.supervise(Some(connection)));
                Ok(session)
            }
            Err(EstablishError::Join(e)) => {
                if !session.is_active() {
                    return Err(ConnectError::Cancelled);
                }
                log::warn!("[Connection] Group join failed for {user_id}: {e}; retrying");
                tokio::spawn(link.supervise(None));
                Ok(session)
            }
            Err(EstablishError::Connect(e)) => {
                let cancelled = {
                    let mut current = self.inner.lock_session();
                    let cancelled = session.cancel.is_cancelled();
                    if current.as_ref().is_some_and(|s| s.id == session.id) {
                        current.take();
                        self.inner.state.send_replace(ConnectionState::Disconnected);
                    }
                    session.cancel.cancel();
                    cancelled
                };
                if cancelled {
                    return Err(ConnectError::Cancelled);
                }
                log::warn!("[Connection] Connect failed for {user_id}: {e}");
                Err(e)
            }
        }
    }

    /// End `session` only: if it is still the live one the manager goes to
    /// `Disconnected`, otherwise it is just cancelled.
    pub(crate) fn end(&self, session: &Session) {
        let mut current = self.inner.lock_session();
        if current.as_ref().is_some_and(|s| s.id == session.id) {
            current.take();
            self.inner.state.send_replace(ConnectionState::Disconnected);
        }
        session.cancel.cancel();
    }

    /// Close the subscription. Idempotent and safe from any state.
    ///
    /// Cancels a pending reconnect wait, makes any in-flight attempt discard
    /// its channel, and releases the open channel. Leaves the state at
    /// `Disconnected`.
    pub fn close(&self) {
        let mut current = self.inner.lock_session();
        if let Some(session) = current.take() {
            log::info!("[Connection] Closing session for {}", session.user_id);
            session.cancel.cancel();
        }
        self.inner.state.send_replace(ConnectionState::Disconnected);
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Some(session) = self.inner.lock_session().take() {
            session.cancel.cancel();
        }
    }
}

/// Everything a session's background task needs.
struct SessionLink {
    inner: Arc<Inner>,
    session: Session,
    tokens: Arc<dyn TokenProvider>,
    inbound: mpsc::UnboundedSender<serde_json::Value>,
}

impl SessionLink {
    /// One connect attempt: token, channel, group join.
    async fn establish(&self) -> Result<Connection, EstablishError> {
        let config = &self.inner.config;

        let token = self
            .tokens
            .access_token()
            .await
            .map_err(|e| EstablishError::Connect(ConnectError::AuthRejected(format!("{e:#}"))))?;

        let connection = self
            .inner
            .transport
            .connect(&config.hub_url, &token)
            .await
            .map_err(|e| EstablishError::Connect(e.into()))?;

        if !self.session.is_active() {
            connection.handle.close().await;
            return Err(EstablishError::Connect(ConnectError::Cancelled));
        }

        let join = connection
            .handle
            .invoke(
                &config.join_method,
                vec![serde_json::Value::String(self.session.user_id.clone())],
            )
            .await;
        match join {
            Ok(_) => Ok(connection),
            Err(e) => {
                connection.handle.close().await;
                Err(EstablishError::Join(e))
            }
        }
    }

    /// Session task: pump events, and reconnect whenever the channel drops.
    async fn supervise(self, mut current: Option<Connection>) {
        loop {
            if let Some(connection) = current.take() {
                match self.pump(connection).await {
                    PumpExit::Cancelled => break,
                    PumpExit::Dropped(reason) => log::warn!(
                        "[Connection] Channel dropped for {}: {}",
                        self.session.user_id,
                        reason.as_deref().unwrap_or("closed")
                    ),
                }
            }

            match self.reconnect().await {
                Some(connection) => current = Some(connection),
                None => break,
            }
        }
        log::debug!("[Connection] Session task for {} finished", self.session.user_id);
    }

    /// Forward hub events into the inbound queue until the channel closes.
    async fn pump(&self, mut connection: Connection) -> PumpExit {
        let receive_event = &self.inner.config.receive_event;
        loop {
            let event = tokio::select! {
                biased;
                () = self.session.cancel.cancelled() => {
                    connection.handle.close().await;
                    return PumpExit::Cancelled;
                }
                event = connection.events.recv() => event,
            };

            match event {
                Some(ChannelEvent::Invocation { target, mut arguments }) if target == *receive_event => {
                    if arguments.is_empty() {
                        log::warn!("[Connection] {target} without payload, ignoring");
                        continue;
                    }
                    if self.inbound.send(arguments.swap_remove(0)).is_err() {
                        log::debug!("[Connection] Inbound queue closed, event dropped");
                    }
                }
                Some(ChannelEvent::Invocation { target, .. }) => {
                    log::trace!("[Connection] Ignoring hub event {target}");
                }
                Some(ChannelEvent::Closed { error }) => {
                    connection.handle.close().await;
                    return PumpExit::Dropped(error);
                }
                None => {
                    connection.handle.close().await;
                    return PumpExit::Dropped(None);
                }
            }
        }
    }

    /// Retry until connected or cancelled. Attempt count starts at zero.
    async fn reconnect(&self) -> Option<Connection> {
        let mut attempt: u32 = 0;
        loop {
            let delay = self.inner.config.backoff.delay(attempt);
            let state = ConnectionState::Reconnecting {
                attempt,
                next_retry_ms: delay.as_millis() as u64,
            };
            if !self.inner.transition(&self.session, state) {
                return None;
            }
            log::info!(
                "[Connection] Reconnecting in {}ms (attempt {})",
                delay.as_millis(),
                attempt
            );

            tokio::select! {
                biased;
                () = self.session.cancel.cancelled() => return None,
                () = tokio::time::sleep(delay) => {}
            }

            match self.establish().await {
                Ok(connection) => {
                    if !self.inner.transition(&self.session, ConnectionState::Connected) {
                        connection.handle.close().await;
                        return None;
                    }
                    log::info!("[Connection] Reconnected for {}", self.session.user_id);
                    self.session.reconnects.send_modify(|n| *n = n.wrapping_add(1));
                    return Some(connection);
                }
                Err(EstablishError::Connect(ConnectError::Cancelled)) => return None,
                Err(EstablishError::Connect(e)) => {
                    log::warn!("[Connection] Reconnect attempt {attempt} failed: {e}");
                }
                Err(EstablishError::Join(e)) => {
                    log::warn!("[Connection] Reconnect attempt {attempt} join failed: {e}");
                }
            }
            attempt = attempt.saturating_add(1);
        }
    }
}
