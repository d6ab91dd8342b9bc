//! Bounded, ordered in-memory notification cache.
//!
//! The cache is the single source of truth the UI reads. Entries are kept
//! newest-first; when a genuinely new id would push the size past capacity
//! the oldest entry (the tail) is evicted.
//!
//! # Snapshots
//!
//! Contents live behind an `Arc<Vec<_>>` that is swapped copy-on-write under
//! the write lock. A [`Snapshot`] is a clone of that `Arc`, so readers get an
//! immutable point-in-time view that later mutations can never tear.
//!
//! # Epochs
//!
//! [`NotificationCache::clear`] advances an [`Epoch`]. Writers that belong to
//! a session (ingestion, history seeding) go through the `*_in_epoch`
//! variants, which refuse the write once the cache has been cleared out from
//! under them. That keeps a late event from a torn-down session out of the
//! next session's cache.
//!
//! # Listener delivery
//!
//! Every change bumps a version under the write lock. Delivery is
//! serialized and a view older than the last one delivered is skipped, so
//! racing writers can never leave listeners on a stale snapshot.

// Rust guideline compliant 2026-02

use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};

use crate::constants::DEFAULT_CAPACITY;
use crate::notification::Notification;

/// Immutable, newest-first view of the cache contents.
pub type Snapshot = Arc<Vec<Notification>>;

/// Listener invoked with the new contents after every mutation.
pub type ChangeListener = Arc<dyn Fn(&Snapshot) + Send + Sync>;

/// Generation counter advanced by every [`NotificationCache::clear`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Epoch(u64);

/// What an insert did to the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    /// New id placed at the front. Carries the id evicted from the tail, if any.
    Inserted {
        /// Id of the entry dropped to stay within capacity.
        evicted: Option<String>,
    },
    /// Existing id updated in place; ordering unchanged.
    Replaced,
}

#[derive(Debug)]
struct Contents {
    entries: Snapshot,
    epoch: u64,
    version: u64,
}

#[derive(Default)]
struct ListenerRegistry {
    next_id: u64,
    entries: Vec<(u64, ChangeListener)>,
}

/// Size-capped, id-unique notification store.
pub struct NotificationCache {
    capacity: usize,
    contents: RwLock<Contents>,
    listeners: Arc<Mutex<ListenerRegistry>>,
    /// Version of the last snapshot handed to listeners. Held while they run.
    delivered: Mutex<u64>,
}

impl std::fmt::Debug for NotificationCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationCache")
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

impl Default for NotificationCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl NotificationCache {
    /// Create an empty cache holding at most `capacity` entries (minimum 1).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            contents: RwLock::new(Contents {
                entries: Arc::new(Vec::new()),
                epoch: 0,
                version: 0,
            }),
            listeners: Arc::new(Mutex::new(ListenerRegistry::default())),
            delivered: Mutex::new(0),
        }
    }

    /// Maximum number of entries.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Current number of entries.
    pub fn len(&self) -> usize {
        self.read_contents().entries.len()
    }

    /// Whether the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current epoch.
    pub fn epoch(&self) -> Epoch {
        Epoch(self.read_contents().epoch)
    }

    /// Point-in-time copy of the contents, newest first.
    pub fn snapshot(&self) -> Snapshot {
        Arc::clone(&self.read_contents().entries)
    }

    /// Insert a notification, or update the existing entry with the same id.
    ///
    /// A new id goes to the front and may evict the tail. An existing id is
    /// updated in place without moving.
    pub fn insert_or_replace(&self, notification: Notification) -> InsertOutcome {
        self.mutate(None, |entries, capacity| upsert(entries, capacity, notification))
            .unwrap_or(InsertOutcome::Replaced)
    }

    /// [`Self::insert_or_replace`] that is dropped if the cache was cleared since `epoch`.
    ///
    /// Returns `None` when the write was refused.
    pub fn insert_in_epoch(&self, epoch: Epoch, notification: Notification) -> Option<InsertOutcome> {
        self.mutate(Some(epoch), |entries, capacity| upsert(entries, capacity, notification))
    }

    /// Overwrite the contents with `notifications` (newest first).
    ///
    /// Later duplicates of an id are dropped, then the result is truncated to capacity.
    pub fn replace_all(&self, notifications: Vec<Notification>) {
        let _ = self.mutate(None, |entries, capacity| {
            *entries = dedup_truncate(notifications, capacity);
        });
    }

    /// [`Self::replace_all`] that is dropped if the cache was cleared since `epoch`.
    ///
    /// Returns `false` when the write was refused.
    pub fn replace_all_in_epoch(&self, epoch: Epoch, notifications: Vec<Notification>) -> bool {
        self.mutate(Some(epoch), |entries, capacity| {
            *entries = dedup_truncate(notifications, capacity);
        })
        .is_some()
    }

    /// Empty the cache and advance the epoch. Returns the new epoch.
    pub fn clear(&self) -> Epoch {
        let (epoch, version, snapshot) = {
            let mut contents = self.write_contents();
            contents.epoch += 1;
            contents.version += 1;
            contents.entries = Arc::new(Vec::new());
            (Epoch(contents.epoch), contents.version, Arc::clone(&contents.entries))
        };
        self.notify(version, &snapshot);
        epoch
    }

    /// Register a listener called with the new contents after every change.
    ///
    /// The listener stays registered until the returned [`ChangeSubscription`]
    /// is dropped or [`ChangeSubscription::unsubscribe`] is called. Listeners
    /// run on the mutating thread, one change at a time and never with a view
    /// older than one already delivered. They may read the cache but must not
    /// write to it, and should return quickly.
    #[must_use = "dropping the subscription unregisters the listener"]
    pub fn subscribe<F>(&self, listener: F) -> ChangeSubscription
    where
        F: Fn(&Snapshot) + Send + Sync + 'static,
    {
        let mut registry = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        let id = registry.next_id;
        registry.next_id += 1;
        registry.entries.push((id, Arc::new(listener)));
        ChangeSubscription {
            id,
            registry: Arc::downgrade(&self.listeners),
        }
    }

    /// Apply `f` under the write lock, then notify listeners.
    ///
    /// Returns `None` without touching anything if `expected` is stale.
    fn mutate<R>(
        &self,
        expected: Option<Epoch>,
        f: impl FnOnce(&mut Vec<Notification>, usize) -> R,
    ) -> Option<R> {
        let (result, version, snapshot) = {
            let mut contents = self.write_contents();
            if expected.is_some_and(|epoch| epoch.0 != contents.epoch) {
                return None;
            }
            let entries = Arc::make_mut(&mut contents.entries);
            let result = f(entries, self.capacity);
            contents.version += 1;
            (result, contents.version, Arc::clone(&contents.entries))
        };
        self.notify(version, &snapshot);
        Some(result)
    }

    /// Hand `snapshot` to the listeners unless a newer version already went out.
    fn notify(&self, version: u64, snapshot: &Snapshot) {
        let mut delivered = self.delivered.lock().unwrap_or_else(PoisonError::into_inner);
        if *delivered >= version {
            log::trace!("[Cache] Skipping stale view {version}");
            return;
        }
        *delivered = version;

        let listeners: Vec<ChangeListener> = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in listeners {
            listener(snapshot);
        }
    }

    fn read_contents(&self) -> std::sync::RwLockReadGuard<'_, Contents> {
        self.contents.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_contents(&self) -> std::sync::RwLockWriteGuard<'_, Contents> {
        self.contents.write().unwrap_or_else(PoisonError::into_inner)
    }
}

fn upsert(
    entries: &mut Vec<Notification>,
    capacity: usize,
    notification: Notification,
) -> InsertOutcome {
    if let Some(existing) = entries.iter_mut().find(|n| n.id == notification.id) {
        log::trace!("[Cache] Updated {} in place", notification.id);
        *existing = notification;
        return InsertOutcome::Replaced;
    }

    entries.insert(0, notification);
    let evicted = if entries.len() > capacity {
        entries.pop().map(|n| n.id)
    } else {
        None
    };
    if let Some(id) = &evicted {
        log::trace!("[Cache] Evicted {id}");
    }
    InsertOutcome::Inserted { evicted }
}

fn dedup_truncate(notifications: Vec<Notification>, capacity: usize) -> Vec<Notification> {
    let mut out: Vec<Notification> = Vec::with_capacity(notifications.len().min(capacity));
    for n in notifications {
        if out.len() == capacity {
            break;
        }
        if !out.iter().any(|existing| existing.id == n.id) {
            out.push(n);
        }
    }
    out
}

/// Handle for a registered change listener. Unregisters on drop.
pub struct ChangeSubscription {
    id: u64,
    registry: Weak<Mutex<ListenerRegistry>>,
}

impl std::fmt::Debug for ChangeSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeSubscription").field("id", &self.id).finish()
    }
}

impl ChangeSubscription {
    /// Stop receiving change notifications.
    pub fn unsubscribe(self) {
        // Drop does the work.
    }
}

impl Drop for ChangeSubscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .entries
                .retain(|(id, _)| *id != self.id);
        }
    }
}
