//! Unified `Database` trait — the persistence operations the engine consumes.
//!
//! Entity CRUD (creating channels, queues, rules) belongs to the outer
//! application; the engine only reads topology and mutates conversations.
//! Concrete backends expose their own provisioning helpers.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::integrations::Integration;
use crate::model::{Channel, Conversation, Queue, TriageRule};

/// Backend-agnostic persistence trait.
#[async_trait]
pub trait Database: Send + Sync {
    // ── Conversations ───────────────────────────────────────────────

    async fn load_conversation(&self, id: Uuid) -> Result<Conversation, DatabaseError>;

    async fn save_conversation(&self, conversation: &Conversation) -> Result<(), DatabaseError>;

    // ── Topology ────────────────────────────────────────────────────

    async fn load_channel(&self, id: Uuid) -> Result<Channel, DatabaseError>;

    /// Queues attached to a channel, ordered by menu position.
    async fn load_queues(&self, channel_id: Uuid) -> Result<Vec<Queue>, DatabaseError>;

    async fn load_integration(&self, id: Uuid) -> Result<Integration, DatabaseError>;

    // ── Triage rules ────────────────────────────────────────────────

    /// Active rules for a tenant that apply to `channel_id` (scoped to it
    /// or unscoped), ordered priority desc then creation time desc.
    async fn load_active_rules(
        &self,
        tenant_id: Uuid,
        channel_id: Uuid,
    ) -> Result<Vec<TriageRule>, DatabaseError>;

    // ── Queue occupancy & message history ───────────────────────────

    /// Pending, agent-unassigned conversations waiting in a queue,
    /// excluding the asking conversation.
    async fn count_pending_in_queue(
        &self,
        queue_id: Uuid,
        excluding: Uuid,
    ) -> Result<u64, DatabaseError>;

    /// Whether any outbound message was recorded for the conversation at
    /// or after `since`. Backs the DB-backed greeting dedup.
    async fn find_recent_outbound_message(
        &self,
        conversation_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// Record an outbound send (writes the marker the dedup reads).
    async fn record_outbound_message(
        &self,
        conversation_id: Uuid,
        text: &str,
    ) -> Result<(), DatabaseError>;

    // ── Tags ────────────────────────────────────────────────────────

    /// Attach a tag to a conversation. Idempotent; returns whether the
    /// association is new.
    async fn attach_tag(&self, conversation_id: Uuid, tag_id: Uuid)
    -> Result<bool, DatabaseError>;

    async fn list_attached_tags(&self, conversation_id: Uuid) -> Result<Vec<Uuid>, DatabaseError>;

    // ── Settings ────────────────────────────────────────────────────

    /// Read a per-tenant setting, lazily creating it with `default` on
    /// first read.
    async fn get_or_create_setting(
        &self,
        tenant_id: Uuid,
        key: &str,
        default: &str,
    ) -> Result<String, DatabaseError>;
}
