//! Notification dedup — "already sent" markers per conversation.
//!
//! Two backings behind one interface: an in-process bounded cache
//! (best-effort, resets on restart) and a DB-backed check over recorded
//! outbound messages (the stronger guarantee, used for greetings). Which
//! notice uses which backing is a wiring concern, not a code-path
//! difference.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tracing::warn;
use uuid::Uuid;

use crate::store::Database;

/// What kind of one-time notice a marker guards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DedupKind {
    Greeting,
    OutOfHours,
    QueuePosition,
}

/// Cache key: one marker per conversation per notice kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DedupKey {
    pub conversation_id: Uuid,
    pub kind: DedupKind,
}

impl DedupKey {
    pub fn new(conversation_id: Uuid, kind: DedupKind) -> Self {
        Self {
            conversation_id,
            kind,
        }
    }
}

/// Dedup check-and-mark.
#[async_trait]
pub trait Dedup: Send + Sync {
    /// True if `key` has not fired within `ttl` of `now`. A true result
    /// marks the key as fired at `now`.
    async fn check_and_mark(&self, key: &DedupKey, ttl: Duration, now: DateTime<Utc>) -> bool;
}

// ── In-process backing ──────────────────────────────────────────────

/// Entries older than this are dropped on insert regardless of capacity.
const MAX_ENTRY_AGE_MINUTES: i64 = 60;

struct MemoryDedupInner {
    entries: HashMap<DedupKey, DateTime<Utc>>,
    /// Insertion order, for capacity eviction.
    order: VecDeque<DedupKey>,
}

/// Bounded, time-evicting in-process marker cache.
///
/// Oldest entries are evicted once capacity is reached; stale entries are
/// pruned opportunistically. Guarantees are best-effort only — the cache
/// is empty after a restart.
pub struct MemoryDedup {
    inner: Mutex<MemoryDedupInner>,
    capacity: usize,
}

impl MemoryDedup {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(MemoryDedupInner {
                entries: HashMap::new(),
                order: VecDeque::new(),
            }),
            capacity: capacity.max(1),
        }
    }

    /// Number of live markers (test hook).
    pub fn len(&self) -> usize {
        self.inner.lock().map(|i| i.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl Dedup for MemoryDedup {
    async fn check_and_mark(&self, key: &DedupKey, ttl: Duration, now: DateTime<Utc>) -> bool {
        let Ok(mut inner) = self.inner.lock() else {
            return true;
        };

        if let Some(stamp) = inner.entries.get(key)
            && now.signed_duration_since(*stamp) < ttl
        {
            return false;
        }

        inner.entries.insert(*key, now);
        inner.order.push_back(*key);

        // Drop stale front entries, then enforce capacity. `order` may
        // hold re-marked keys more than once; only remove the map entry
        // when the stamp is actually old.
        let max_age = Duration::minutes(MAX_ENTRY_AGE_MINUTES);
        while let Some(front) = inner.order.front().copied() {
            let stale = match inner.entries.get(&front) {
                Some(stamp) => now.signed_duration_since(*stamp) > max_age,
                None => true,
            };
            if stale || inner.order.len() > self.capacity {
                inner.order.pop_front();
                if let Some(stamp) = inner.entries.get(&front).copied()
                    && (now.signed_duration_since(stamp) > max_age
                        || !inner.order.contains(&front))
                {
                    inner.entries.remove(&front);
                }
            } else {
                break;
            }
        }

        true
    }
}

// ── DB-backed backing ───────────────────────────────────────────────

/// DB-backed dedup over recorded outbound messages.
///
/// Any outbound send recorded within the window counts as the marker, so
/// the guarantee survives restarts. Marking is implicit: the dispatcher
/// records every successful send.
pub struct StoreDedup {
    store: Arc<dyn Database>,
}

impl StoreDedup {
    pub fn new(store: Arc<dyn Database>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Dedup for StoreDedup {
    async fn check_and_mark(&self, key: &DedupKey, ttl: Duration, now: DateTime<Utc>) -> bool {
        let since = now - ttl;
        match self
            .store
            .find_recent_outbound_message(key.conversation_id, since)
            .await
        {
            Ok(recent) => !recent,
            Err(e) => {
                // When in doubt, suppress: a missed greeting is cheaper
                // than a double one.
                warn!(
                    conversation_id = %key.conversation_id,
                    error = %e,
                    "Dedup lookup failed, suppressing notice"
                );
                false
            }
        }
    }
}
