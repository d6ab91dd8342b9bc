//! Notification sync engine: the facade the UI layer talks to.
//!
//! # Architecture
//!
//! ```text
//!   initialize(user, tokens)
//!        │
//!        ├─► ConnectionManager::open ──► hub channel ──┐
//!        │                                              │ ReceiveNotification
//!        ├─► HistorySource::fetch_page(tokens)          ▼
//!        │        │                              inbound mpsc queue
//!        │        ▼                                     │
//!        │   cache.replace_all ◄── seeded first ──┐     │
//!        │                                        │     ▼
//!        └─► spawn IngestionPipeline ─────────────┴─► cache.insert ──► listeners
//!                                                      └─► arrivals (broadcast)
//! ```
//!
//! Events that arrive while the history page is loading wait in the inbound
//! queue and are applied after the seed, so the seed never overwrites them.
//! The queue is unbounded so a slow history fetch never backs up into the
//! socket.
//!
//! Each `initialize` registers its claim before it starts connecting. A
//! second call for the same user finds that claim and returns
//! [`Initialized::AlreadyActive`]; a call for another user or
//! [`NotificationEngine::teardown`] revokes it.
//!
//! The engine is an explicit instance owned by the application's session
//! root: build it at sign-in, call [`NotificationEngine::teardown`] (or drop
//! it) at sign-out.

// Rust guideline compliant 2026-02

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::auth::TokenProvider;
use crate::cache::{ChangeSubscription, Epoch, NotificationCache, Snapshot};
use crate::config::Config;
use crate::connection::{ConnectError, ConnectionConfig, ConnectionManager, ConnectionState, Session};
use crate::constants::ARRIVAL_BUFFER;
use crate::history::{FetchError, HistorySource};
use crate::ingest::{Arrival, IngestionPipeline};
use crate::transport::Transport;

/// Result of a successful [`NotificationEngine::initialize`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Initialized {
    /// A new session was opened.
    Started {
        /// How the history seed went: the number of notifications loaded, or
        /// why it failed. A failure leaves the cache empty but the live
        /// subscription running.
        history: Result<usize, FetchError>,
    },
    /// A session for this user is already live or still connecting; nothing
    /// was done.
    AlreadyActive,
}

/// Which history page seeds the cache.
#[derive(Debug, Clone, Copy)]
struct HistoryPlan {
    page_index: u32,
    page_size: u32,
    refresh_on_reconnect: bool,
}

/// One `initialize` call's hold on the engine, from before connecting until
/// teardown or replacement.
struct Claim {
    id: u64,
    user_id: String,
    revoked: CancellationToken,
}

/// Keeps a bounded notification cache in sync with the push hub.
pub struct NotificationEngine {
    connection: ConnectionManager,
    cache: Arc<NotificationCache>,
    history: Arc<dyn HistorySource>,
    arrivals: broadcast::Sender<Arrival>,
    plan: HistoryPlan,
    active: Mutex<Option<Claim>>,
    next_claim: AtomicU64,
}

impl std::fmt::Debug for NotificationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationEngine")
            .field("connection", &self.connection)
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}

impl NotificationEngine {
    /// Build an idle engine from config and its two collaborators.
    pub fn new(config: &Config, transport: Arc<dyn Transport>, history: Arc<dyn HistorySource>) -> Self {
        let connection = ConnectionManager::new(
            transport,
            ConnectionConfig {
                hub_url: config.hub_url.clone(),
                join_method: config.join_method.clone(),
                receive_event: config.receive_event.clone(),
                backoff: config.backoff_policy(),
            },
        );
        let (arrivals, _) = broadcast::channel(ARRIVAL_BUFFER);

        Self {
            connection,
            cache: Arc::new(NotificationCache::new(config.capacity)),
            history,
            arrivals,
            plan: HistoryPlan {
                page_index: config.history_page_index,
                page_size: config.history_page_size,
                refresh_on_reconnect: config.refresh_on_reconnect,
            },
            active: Mutex::new(None),
            next_claim: AtomicU64::new(0),
        }
    }

    /// Start syncing notifications for `user_id`.
    ///
    /// Calling again for the same user while a session is connecting or live
    /// is a no-op. Calling for a different user tears the old session down
    /// (channel closed, cache cleared) before opening the new one.
    ///
    /// `tokens` authenticates both the hub channel and the history fetches
    /// of this session.
    ///
    /// A failed history fetch does not fail initialize; it is reported in
    /// [`Initialized::Started`].
    ///
    /// # Errors
    ///
    /// - `NoIdentity` for an empty `user_id`
    /// - `TransportFailure` / `AuthRejected` when the channel cannot be opened
    /// - `Cancelled` when [`Self::teardown`] or an `initialize` for another
    ///   user ran before this one finished
    pub async fn initialize(
        &self,
        user_id: &str,
        tokens: Arc<dyn TokenProvider>,
    ) -> Result<Initialized, ConnectError> {
        if user_id.trim().is_empty() {
            return Err(ConnectError::NoIdentity);
        }

        let (claim_id, revoked) = {
            let mut active = self.lock_active();
            if let Some(claim) = active.as_ref() {
                if claim.user_id == user_id && !claim.revoked.is_cancelled() {
                    log::debug!("[Engine] Session for {user_id} already active");
                    return Ok(Initialized::AlreadyActive);
                }
            }
            if let Some(previous) = active.take() {
                log::info!("[Engine] Switching from {} to {user_id}", previous.user_id);
                previous.revoked.cancel();
            }
            let claim = Claim {
                id: self.next_claim.fetch_add(1, Ordering::Relaxed),
                user_id: user_id.to_string(),
                revoked: CancellationToken::new(),
            };
            let handle = (claim.id, claim.revoked.clone());
            *active = Some(claim);
            handle
        };
        let epoch = self.cache.clear();

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let session = match self.connection.open(user_id, Arc::clone(&tokens), inbound_tx).await {
            Ok(session) => session,
            Err(e) => {
                self.release(claim_id);
                return Err(e);
            }
        };
        if !self.still_owns(claim_id, &session) {
            log::info!("[Engine] Session for {user_id} revoked while connecting");
            self.connection.end(&session);
            return Err(ConnectError::Cancelled);
        }

        let history = load_history(self.history.as_ref(), tokens.as_ref(), &self.cache, epoch, self.plan).await;
        if revoked.is_cancelled() || !session.is_active() {
            return Err(ConnectError::Cancelled);
        }

        let pipeline = IngestionPipeline::new(Arc::clone(&self.cache), epoch, self.arrivals.clone());
        tokio::spawn(pipeline.run(inbound_rx, session.cancellation()));

        if self.plan.refresh_on_reconnect {
            tokio::spawn(refresh_on_reconnect(
                session,
                tokens,
                Arc::clone(&self.history),
                Arc::clone(&self.cache),
                epoch,
                self.plan,
            ));
        }

        log::info!("[Engine] Syncing notifications for {user_id}");
        Ok(Initialized::Started { history })
    }

    /// Stop syncing: close the channel and empty the cache.
    ///
    /// Safe to call at any time, including while [`Self::initialize`] is
    /// still connecting; that attempt then discards its channel and returns
    /// `Cancelled`.
    pub fn teardown(&self) {
        if let Some(claim) = self.lock_active().take() {
            log::info!("[Engine] Tearing down session for {}", claim.user_id);
            claim.revoked.cancel();
        }
        self.connection.close();
        self.cache.clear();
    }

    /// Current cache contents, newest first.
    pub fn snapshot(&self) -> Snapshot {
        self.cache.snapshot()
    }

    /// Call `listener` with the new contents after every cache change.
    ///
    /// Drop the returned handle to unsubscribe.
    #[must_use = "dropping the subscription unregisters the listener"]
    pub fn subscribe_to_changes<F>(&self, listener: F) -> ChangeSubscription
    where
        F: Fn(&Snapshot) + Send + Sync + 'static,
    {
        self.cache.subscribe(listener)
    }

    /// Receive an [`Arrival`] for every live notification (toast feed).
    pub fn subscribe_arrivals(&self) -> broadcast::Receiver<Arrival> {
        self.arrivals.subscribe()
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// Receiver observing connection state changes.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.connection.watch_state()
    }

    /// User of the connecting or live session, if any.
    pub fn user_id(&self) -> Option<String> {
        self.lock_active()
            .as_ref()
            .filter(|claim| !claim.revoked.is_cancelled())
            .map(|claim| claim.user_id.clone())
    }

    /// Whether claim `claim_id` still owns the engine and `session` is live.
    fn still_owns(&self, claim_id: u64, session: &Session) -> bool {
        let active = self.lock_active();
        active
            .as_ref()
            .is_some_and(|claim| claim.id == claim_id && !claim.revoked.is_cancelled())
            && session.is_active()
    }

    /// Drop claim `claim_id` if it is still the current one.
    fn release(&self, claim_id: u64) {
        let mut active = self.lock_active();
        if active.as_ref().is_some_and(|claim| claim.id == claim_id) {
            if let Some(claim) = active.take() {
                claim.revoked.cancel();
            }
        }
    }

    fn lock_active(&self) -> MutexGuard<'_, Option<Claim>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Fetch the configured history page into the cache.
async fn load_history(
    history: &dyn HistorySource,
    tokens: &dyn TokenProvider,
    cache: &NotificationCache,
    epoch: Epoch,
    plan: HistoryPlan,
) -> Result<usize, FetchError> {
    match history.fetch_page(tokens, plan.page_index, plan.page_size).await {
        Ok(page) => {
            let count = page.len();
            if cache.replace_all_in_epoch(epoch, page) {
                log::info!("[History] Loaded {count} notification(s)");
            } else {
                log::debug!("[History] Session ended before history arrived, discarding");
            }
            Ok(count)
        }
        Err(e) => {
            log::warn!("[History] Failed to load notifications: {e}");
            Err(e)
        }
    }
}

/// Re-seed the cache from history after every successful reconnect.
async fn refresh_on_reconnect(
    session: Session,
    tokens: Arc<dyn TokenProvider>,
    history: Arc<dyn HistorySource>,
    cache: Arc<NotificationCache>,
    epoch: Epoch,
    plan: HistoryPlan,
) {
    let mut reconnects = session.reconnects();
    loop {
        tokio::select! {
            biased;
            () = session.ended() => break,
            changed = reconnects.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
        log::info!("[Engine] Reconnected, catching up on history");
        let _ = load_history(history.as_ref(), tokens.as_ref(), &cache, epoch, plan).await;
    }
}
