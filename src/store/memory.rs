//! In-memory backend — tests and the demo binary.
//!
//! Same contract as the libSQL backend, minus durability. Provisioning
//! helpers (`insert_*`) stand in for the CRUD layer of the outer
//! application.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::integrations::Integration;
use crate::model::{Channel, Conversation, ConversationStatus, Queue, TriageRule};
use crate::store::Database;

#[derive(Default)]
struct Tables {
    conversations: HashMap<Uuid, Conversation>,
    channels: HashMap<Uuid, Channel>,
    queues: HashMap<Uuid, Queue>,
    integrations: HashMap<Uuid, Integration>,
    rules: Vec<TriageRule>,
    outbound: Vec<(Uuid, String, DateTime<Utc>)>,
    tags: Vec<(Uuid, Uuid)>,
    settings: HashMap<(Uuid, String), String>,
}

/// In-memory database backend.
#[derive(Default)]
pub struct MemoryBackend {
    tables: RwLock<Tables>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Provisioning helpers ────────────────────────────────────────

    pub async fn insert_conversation(&self, conversation: Conversation) {
        self.tables
            .write()
            .await
            .conversations
            .insert(conversation.id, conversation);
    }

    pub async fn insert_channel(&self, channel: Channel) {
        self.tables.write().await.channels.insert(channel.id, channel);
    }

    pub async fn insert_queue(&self, queue: Queue) {
        self.tables.write().await.queues.insert(queue.id, queue);
    }

    pub async fn insert_integration(&self, integration: Integration) {
        self.tables
            .write()
            .await
            .integrations
            .insert(integration.id, integration);
    }

    pub async fn insert_rule(&self, rule: TriageRule) {
        self.tables.write().await.rules.push(rule);
    }

    pub async fn set_setting(&self, tenant_id: Uuid, key: &str, value: &str) {
        self.tables
            .write()
            .await
            .settings
            .insert((tenant_id, key.to_string()), value.to_string());
    }

    /// Recorded outbound messages, oldest first (test hook).
    pub async fn outbound_log(&self) -> Vec<(Uuid, String)> {
        self.tables
            .read()
            .await
            .outbound
            .iter()
            .map(|(id, text, _)| (*id, text.clone()))
            .collect()
    }
}

#[async_trait]
impl Database for MemoryBackend {
    async fn load_conversation(&self, id: Uuid) -> Result<Conversation, DatabaseError> {
        self.tables
            .read()
            .await
            .conversations
            .get(&id)
            .cloned()
            .ok_or(DatabaseError::NotFound {
                entity: "conversation",
                id: id.to_string(),
            })
    }

    async fn save_conversation(&self, conversation: &Conversation) -> Result<(), DatabaseError> {
        let mut saved = conversation.clone();
        saved.updated_at = Utc::now();
        self.tables
            .write()
            .await
            .conversations
            .insert(saved.id, saved);
        Ok(())
    }

    async fn load_channel(&self, id: Uuid) -> Result<Channel, DatabaseError> {
        self.tables
            .read()
            .await
            .channels
            .get(&id)
            .cloned()
            .ok_or(DatabaseError::NotFound {
                entity: "channel",
                id: id.to_string(),
            })
    }

    async fn load_queues(&self, channel_id: Uuid) -> Result<Vec<Queue>, DatabaseError> {
        let tables = self.tables.read().await;
        let mut queues: Vec<Queue> = tables
            .queues
            .values()
            .filter(|q| q.channel_id == channel_id)
            .cloned()
            .collect();
        queues.sort_by_key(|q| q.position);
        Ok(queues)
    }

    async fn load_integration(&self, id: Uuid) -> Result<Integration, DatabaseError> {
        self.tables
            .read()
            .await
            .integrations
            .get(&id)
            .cloned()
            .ok_or(DatabaseError::NotFound {
                entity: "integration",
                id: id.to_string(),
            })
    }

    async fn load_active_rules(
        &self,
        tenant_id: Uuid,
        channel_id: Uuid,
    ) -> Result<Vec<TriageRule>, DatabaseError> {
        let tables = self.tables.read().await;
        let mut rules: Vec<TriageRule> = tables
            .rules
            .iter()
            .filter(|r| {
                r.active
                    && r.tenant_id == tenant_id
                    && (r.channel_id.is_none() || r.channel_id == Some(channel_id))
            })
            .cloned()
            .collect();
        rules.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(b.created_at.cmp(&a.created_at))
        });
        Ok(rules)
    }

    async fn count_pending_in_queue(
        &self,
        queue_id: Uuid,
        excluding: Uuid,
    ) -> Result<u64, DatabaseError> {
        let tables = self.tables.read().await;
        let count = tables
            .conversations
            .values()
            .filter(|c| {
                c.id != excluding
                    && c.assigned_queue_id == Some(queue_id)
                    && c.status == ConversationStatus::Pending
                    && c.assigned_user_id.is_none()
            })
            .count();
        Ok(count as u64)
    }

    async fn find_recent_outbound_message(
        &self,
        conversation_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let tables = self.tables.read().await;
        Ok(tables
            .outbound
            .iter()
            .any(|(id, _, at)| *id == conversation_id && *at >= since))
    }

    async fn record_outbound_message(
        &self,
        conversation_id: Uuid,
        text: &str,
    ) -> Result<(), DatabaseError> {
        self.tables
            .write()
            .await
            .outbound
            .push((conversation_id, text.to_string(), Utc::now()));
        Ok(())
    }

    async fn attach_tag(
        &self,
        conversation_id: Uuid,
        tag_id: Uuid,
    ) -> Result<bool, DatabaseError> {
        let mut tables = self.tables.write().await;
        if tables
            .tags
            .iter()
            .any(|(c, t)| *c == conversation_id && *t == tag_id)
        {
            return Ok(false);
        }
        tables.tags.push((conversation_id, tag_id));
        Ok(true)
    }

    async fn list_attached_tags(&self, conversation_id: Uuid) -> Result<Vec<Uuid>, DatabaseError> {
        let tables = self.tables.read().await;
        Ok(tables
            .tags
            .iter()
            .filter(|(c, _)| *c == conversation_id)
            .map(|(_, t)| *t)
            .collect())
    }

    async fn get_or_create_setting(
        &self,
        tenant_id: Uuid,
        key: &str,
        default: &str,
    ) -> Result<String, DatabaseError> {
        let mut tables = self.tables.write().await;
        Ok(tables
            .settings
            .entry((tenant_id, key.to_string()))
            .or_insert_with(|| default.to_string())
            .clone())
    }
}
