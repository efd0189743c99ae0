//! The routing engine — entry points, per-conversation serialization,
//! and event fan-out.
//!
//! The transport delivers inbound events concurrently with no ordering
//! guarantee, so the engine holds a per-conversation lock for the whole
//! dispatch pass: at most one decision in flight per conversation. The
//! triage rule engine runs first and short-circuits dispatch on a match.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{Mutex, OwnedMutexGuard, broadcast};
use tracing::{debug, error};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::dedup::{MemoryDedup, StoreDedup};
use crate::dispatch::Dispatcher;
use crate::error::Result;
use crate::integrations::IntegrationSet;
use crate::model::ConversationStatus;
use crate::store::Database;
use crate::transport::{InboundMessage, Transport};
use crate::triage::TriageEngine;

/// Notifications broadcast to interested listeners (UI push, audit).
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// A triage rule attached tags to a conversation.
    TagsChanged {
        conversation_id: Uuid,
        tag_ids: Vec<Uuid>,
    },
    /// The dispatcher routed a conversation to a queue.
    ConversationRouted {
        conversation_id: Uuid,
        queue_id: Option<Uuid>,
    },
}

/// Prune the lock table once it grows past this many entries.
const LOCK_TABLE_PRUNE_THRESHOLD: usize = 1024;

/// Lock-per-conversation table.
///
/// Entries are pruned opportunistically once nobody else holds them.
struct ConversationLocks {
    inner: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl ConversationLocks {
    fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    async fn acquire(&self, conversation_id: Uuid) -> OwnedMutexGuard<()> {
        let lock = {
            let mut table = self.inner.lock().await;
            if table.len() > LOCK_TABLE_PRUNE_THRESHOLD {
                table.retain(|_, lock| Arc::strong_count(lock) > 1);
            }
            Arc::clone(
                table
                    .entry(conversation_id)
                    .or_insert_with(|| Arc::new(Mutex::new(()))),
            )
        };
        lock.lock_owned().await
    }
}

/// The conversation routing & automation engine.
pub struct RoutingEngine {
    store: Arc<dyn Database>,
    triage: TriageEngine,
    dispatcher: Dispatcher,
    locks: ConversationLocks,
    events: broadcast::Sender<EngineEvent>,
}

impl RoutingEngine {
    pub fn new(
        store: Arc<dyn Database>,
        transport: Arc<dyn Transport>,
        integrations: IntegrationSet,
        config: EngineConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity);
        let triage = TriageEngine::new(Arc::clone(&store), events.clone());
        let dispatcher = Dispatcher::new(
            Arc::clone(&store),
            transport,
            integrations,
            Arc::new(MemoryDedup::new(config.dedup_capacity)),
            Arc::new(StoreDedup::new(Arc::clone(&store))),
            events.clone(),
            config,
        );
        Self {
            store,
            triage,
            dispatcher,
            locks: ConversationLocks::new(),
            events,
        }
    }

    /// Subscribe to engine events.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    /// Handle one inbound message.
    ///
    /// All failures are operator-visible via logs only; nothing is
    /// retried and nothing propagates back to the transport.
    pub async fn on_inbound_message(&self, conversation_id: Uuid, message: InboundMessage) {
        if let Err(e) = self.handle_inbound(conversation_id, &message).await {
            error!(
                conversation_id = %conversation_id,
                error = %e,
                "Dispatch aborted"
            );
        }
    }

    /// Invalidate cached rules after a rule or gate-setting change.
    pub async fn on_rule_setting_changed(&self, tenant_id: Uuid, channel_id: Uuid) {
        self.triage.invalidate(tenant_id, channel_id).await;
    }

    async fn handle_inbound(&self, conversation_id: Uuid, message: &InboundMessage) -> Result<()> {
        let _guard = self.locks.acquire(conversation_id).await;

        let mut conversation = self.store.load_conversation(conversation_id).await?;
        if conversation.status == ConversationStatus::Closed {
            debug!(conversation_id = %conversation_id, "Conversation is closed, ignoring");
            return Ok(());
        }

        let channel = self.store.load_channel(conversation.channel_id).await?;

        if self
            .triage
            .evaluate(&mut conversation, &channel, message.content())
            .await?
        {
            debug!(
                conversation_id = %conversation_id,
                "Triage rule applied, skipping dispatch"
            );
            return Ok(());
        }

        let queues = self.store.load_queues(channel.id).await?;
        self.dispatcher
            .dispatch(&mut conversation, &channel, &queues, message, Utc::now())
            .await
    }
}
