//! Configuration types.

use std::time::Duration;

/// Engine configuration.
///
/// Windows are `chrono::Duration` because they are compared against
/// persisted `DateTime<Utc>` stamps; the external-call timeout is a
/// `std::time::Duration` because it feeds `tokio::time::timeout`.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Suppression window for the channel/queue greeting (DB-backed dedup).
    pub greeting_window: chrono::Duration,
    /// Suppression window for the out-of-hours and queue-position notices
    /// (in-process dedup, best-effort across restarts).
    pub notice_window: chrono::Duration,
    /// Maximum number of entries the in-process dedup cache holds.
    pub dedup_capacity: usize,
    /// Upper bound on any single transport send or bot-engine call.
    pub external_call_timeout: Duration,
    /// Capacity of the engine event broadcast channel.
    pub event_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            greeting_window: chrono::Duration::minutes(5),
            notice_window: chrono::Duration::minutes(5),
            dedup_capacity: 4096,
            external_call_timeout: Duration::from_secs(15),
            event_capacity: 256,
        }
    }
}
