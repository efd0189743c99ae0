//! Triage rule engine — priority-ordered pattern rules that pre-empt
//! normal dispatch.
//!
//! First match wins: once a rule matches, its outcome is applied, the
//! conversation's automation state is cleared, and lower-priority rules
//! are never evaluated. Callers short-circuit dispatch on a match.

use std::collections::HashMap;
use std::sync::Arc;

use regex::RegexBuilder;
use tokio::sync::{RwLock, broadcast};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::engine::EngineEvent;
use crate::error::Result;
use crate::model::{Channel, Conversation, ConversationStatus, TriageRule};
use crate::store::Database;

/// Per-tenant setting gating rule evaluation. Provisioned as disabled on
/// first read.
pub const SETTING_TRIAGE_RULES: &str = "triage_rules";

const RULES_ENABLED: &str = "enabled";
const RULES_DISABLED: &str = "disabled";

#[derive(Clone)]
struct CacheEntry {
    enabled: bool,
    rules: Arc<Vec<TriageRule>>,
}

/// Rule evaluation with a per-(tenant, channel) cache.
pub struct TriageEngine {
    store: Arc<dyn Database>,
    events: broadcast::Sender<EngineEvent>,
    cache: RwLock<HashMap<(Uuid, Uuid), CacheEntry>>,
}

impl TriageEngine {
    pub fn new(store: Arc<dyn Database>, events: broadcast::Sender<EngineEvent>) -> Self {
        Self {
            store,
            events,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Evaluate the active rules against a message.
    ///
    /// Returns whether any rule matched (and was applied); the caller
    /// skips normal dispatch on true.
    pub async fn evaluate(
        &self,
        conversation: &mut Conversation,
        channel: &Channel,
        text: &str,
    ) -> Result<bool> {
        let entry = self.load_entry(channel).await?;
        if !entry.enabled || entry.rules.is_empty() {
            return Ok(false);
        }

        for rule in entry.rules.iter() {
            if !pattern_matches(rule, text) {
                continue;
            }
            debug!(
                conversation_id = %conversation.id,
                rule_id = %rule.id,
                priority = rule.priority,
                "Triage rule matched"
            );
            self.apply(rule, conversation).await?;
            return Ok(true);
        }

        Ok(false)
    }

    /// Drop the cached rules for a tenant+channel. Called when rules or
    /// the gate setting change.
    pub async fn invalidate(&self, tenant_id: Uuid, channel_id: Uuid) {
        self.cache.write().await.remove(&(tenant_id, channel_id));
    }

    async fn load_entry(&self, channel: &Channel) -> Result<CacheEntry> {
        let key = (channel.tenant_id, channel.id);
        if let Some(entry) = self.cache.read().await.get(&key) {
            return Ok(entry.clone());
        }

        let enabled = self
            .store
            .get_or_create_setting(channel.tenant_id, SETTING_TRIAGE_RULES, RULES_DISABLED)
            .await?
            == RULES_ENABLED;
        let rules = if enabled {
            self.store
                .load_active_rules(channel.tenant_id, channel.id)
                .await?
        } else {
            Vec::new()
        };

        let entry = CacheEntry {
            enabled,
            rules: Arc::new(rules),
        };
        self.cache.write().await.insert(key, entry.clone());
        Ok(entry)
    }

    /// Apply a matched rule's outcome.
    ///
    /// A human/queue decision always wins over bots: any match clears the
    /// conversation's automation state. A failed tag attach is logged and
    /// does not block the assignment.
    async fn apply(&self, rule: &TriageRule, conversation: &mut Conversation) -> Result<()> {
        if let Some(user_id) = rule.assign_user_id {
            conversation.status = ConversationStatus::Open;
            conversation.assigned_user_id = Some(user_id);
            if let Some(queue_id) = rule.assign_queue_id {
                conversation.assigned_queue_id = Some(queue_id);
            }
        } else if rule.assign_queue_id.is_some() || rule.assign_channel_id.is_some() {
            conversation.status = ConversationStatus::Pending;
            if let Some(queue_id) = rule.assign_queue_id {
                conversation.assigned_queue_id = Some(queue_id);
            }
            if let Some(channel_id) = rule.assign_channel_id {
                conversation.channel_id = channel_id;
            }
        }

        conversation.clear_automation();

        let mut tags_changed = false;
        for tag_id in &rule.tag_ids {
            match self.store.attach_tag(conversation.id, *tag_id).await {
                Ok(true) => tags_changed = true,
                Ok(false) => {}
                Err(e) => {
                    warn!(
                        conversation_id = %conversation.id,
                        tag_id = %tag_id,
                        error = %e,
                        "Failed to attach tag"
                    );
                }
            }
        }
        if tags_changed {
            let _ = self.events.send(EngineEvent::TagsChanged {
                conversation_id: conversation.id,
                tag_ids: rule.tag_ids.clone(),
            });
        }

        self.store.save_conversation(conversation).await?;
        Ok(())
    }
}

/// Whether a rule's pattern matches the message text.
///
/// Non-regex patterns are case-insensitive substring containment. Regex
/// patterns match case-insensitively; a pattern that fails to compile is
/// logged and skipped, it never aborts evaluation of later rules.
fn pattern_matches(rule: &TriageRule, text: &str) -> bool {
    if rule.is_regex {
        match RegexBuilder::new(&rule.pattern).case_insensitive(true).build() {
            Ok(re) => re.is_match(text),
            Err(e) => {
                warn!(rule_id = %rule.id, error = %e, "Skipping rule with invalid regex");
                false
            }
        }
    } else {
        text.to_lowercase().contains(&rule.pattern.to_lowercase())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::integrations::IntegrationKind;
    use crate::model::IntegrationBinding;
    use crate::store::MemoryBackend;

    struct Fixture {
        store: Arc<MemoryBackend>,
        engine: TriageEngine,
        events: broadcast::Receiver<EngineEvent>,
        channel: Channel,
        conversation: Conversation,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(MemoryBackend::new());
        let (tx, rx) = broadcast::channel(16);
        let engine = TriageEngine::new(Arc::clone(&store) as Arc<dyn Database>, tx);

        let tenant_id = Uuid::new_v4();
        let channel = Channel::new(tenant_id, "main");
        let conversation =
            Conversation::new(tenant_id, channel.id, Uuid::new_v4(), "+15550001");
        store.insert_channel(channel.clone()).await;
        store.insert_conversation(conversation.clone()).await;

        Fixture {
            store,
            engine,
            events: rx,
            channel,
            conversation,
        }
    }

    async fn enable_rules(f: &Fixture) {
        f.store
            .set_setting(f.channel.tenant_id, SETTING_TRIAGE_RULES, RULES_ENABLED)
            .await;
    }

    #[test]
    fn substring_match_is_case_insensitive() {
        let rule = TriageRule::new(Uuid::new_v4(), "REFUND", 1);
        assert!(pattern_matches(&rule, "I want a refund please"));
        assert!(!pattern_matches(&rule, "hello"));
    }

    #[test]
    fn regex_match_is_case_insensitive() {
        let mut rule = TriageRule::new(Uuid::new_v4(), r"order\s+#\d+", 1);
        rule.is_regex = true;
        assert!(pattern_matches(&rule, "Question about ORDER  #1234"));
        assert!(!pattern_matches(&rule, "Question about my order"));
    }

    #[test]
    fn invalid_regex_never_matches() {
        let mut rule = TriageRule::new(Uuid::new_v4(), r"(unclosed", 1);
        rule.is_regex = true;
        assert!(!pattern_matches(&rule, "(unclosed"));
    }

    #[tokio::test]
    async fn gate_is_provisioned_disabled_on_first_read() {
        let mut f = fixture().await;
        let mut rule = TriageRule::new(f.channel.tenant_id, "hello", 1);
        rule.assign_queue_id = Some(Uuid::new_v4());
        f.store.insert_rule(rule).await;

        let matched = f
            .engine
            .evaluate(&mut f.conversation, &f.channel, "hello there")
            .await
            .unwrap();
        assert!(!matched);

        // First read created the setting with the disabled default.
        let value = f
            .store
            .get_or_create_setting(f.channel.tenant_id, SETTING_TRIAGE_RULES, "missing")
            .await
            .unwrap();
        assert_eq!(value, RULES_DISABLED);
    }

    #[tokio::test]
    async fn rule_short_circuit_highest_priority_wins() {
        let mut f = fixture().await;
        enable_rules(&f).await;

        let queue_a = Uuid::new_v4();
        let queue_b = Uuid::new_v4();
        let mut rule_a = TriageRule::new(f.channel.tenant_id, "help", 10);
        rule_a.assign_queue_id = Some(queue_a);
        let mut rule_b = TriageRule::new(f.channel.tenant_id, "help", 5);
        rule_b.assign_queue_id = Some(queue_b);
        f.store.insert_rule(rule_b).await;
        f.store.insert_rule(rule_a).await;

        let matched = f
            .engine
            .evaluate(&mut f.conversation, &f.channel, "I need help")
            .await
            .unwrap();
        assert!(matched);
        assert_eq!(f.conversation.assigned_queue_id, Some(queue_a));
        assert_eq!(f.conversation.status, ConversationStatus::Pending);
    }

    #[tokio::test]
    async fn invalid_regex_is_skipped_not_fatal() {
        let mut f = fixture().await;
        enable_rules(&f).await;

        let mut broken = TriageRule::new(f.channel.tenant_id, r"(unclosed", 10);
        broken.is_regex = true;
        broken.assign_user_id = Some(Uuid::new_v4());
        f.store.insert_rule(broken).await;

        let queue_id = Uuid::new_v4();
        let mut fallback = TriageRule::new(f.channel.tenant_id, "unclosed", 5);
        fallback.assign_queue_id = Some(queue_id);
        f.store.insert_rule(fallback).await;

        let matched = f
            .engine
            .evaluate(&mut f.conversation, &f.channel, "(unclosed business")
            .await
            .unwrap();
        assert!(matched);
        assert_eq!(f.conversation.assigned_queue_id, Some(queue_id));
        assert!(f.conversation.assigned_user_id.is_none());
    }

    #[tokio::test]
    async fn user_assignment_opens_conversation() {
        let mut f = fixture().await;
        enable_rules(&f).await;

        let user_id = Uuid::new_v4();
        let mut rule = TriageRule::new(f.channel.tenant_id, "urgent", 1);
        rule.assign_user_id = Some(user_id);
        f.store.insert_rule(rule).await;

        let matched = f
            .engine
            .evaluate(&mut f.conversation, &f.channel, "URGENT: production down")
            .await
            .unwrap();
        assert!(matched);
        assert_eq!(f.conversation.status, ConversationStatus::Open);
        assert_eq!(f.conversation.assigned_user_id, Some(user_id));
    }

    #[tokio::test]
    async fn match_clears_automation_state() {
        let mut f = fixture().await;
        enable_rules(&f).await;

        f.conversation.integration = Some(IntegrationBinding {
            integration_id: Uuid::new_v4(),
            kind: IntegrationKind::Assistant,
        });
        f.conversation.prompt_id = Some(Uuid::new_v4());
        f.conversation.bot_usage_count = 4;
        f.conversation.last_bot_activity_at = Some(Utc::now());

        let mut rule = TriageRule::new(f.channel.tenant_id, "human", 1);
        rule.assign_queue_id = Some(Uuid::new_v4());
        f.store.insert_rule(rule).await;

        let matched = f
            .engine
            .evaluate(&mut f.conversation, &f.channel, "human please")
            .await
            .unwrap();
        assert!(matched);
        assert!(f.conversation.integration.is_none());
        assert!(f.conversation.prompt_id.is_none());
        assert_eq!(f.conversation.bot_usage_count, 0);
        assert!(f.conversation.last_bot_activity_at.is_none());
    }

    #[tokio::test]
    async fn tags_attach_idempotently_and_emit_once() {
        let mut f = fixture().await;
        enable_rules(&f).await;

        let tag_id = Uuid::new_v4();
        let mut rule = TriageRule::new(f.channel.tenant_id, "vip", 1);
        rule.tag_ids = vec![tag_id];
        f.store.insert_rule(rule).await;

        assert!(
            f.engine
                .evaluate(&mut f.conversation, &f.channel, "vip customer")
                .await
                .unwrap()
        );
        let event = f.events.try_recv().unwrap();
        assert!(matches!(event, EngineEvent::TagsChanged { .. }));

        // Second match: tag already present, exactly one association, no event.
        assert!(
            f.engine
                .evaluate(&mut f.conversation, &f.channel, "vip again")
                .await
                .unwrap()
        );
        assert!(f.events.try_recv().is_err());
        assert_eq!(
            f.store.list_attached_tags(f.conversation.id).await.unwrap(),
            vec![tag_id]
        );
    }

    #[tokio::test]
    async fn no_match_leaves_conversation_untouched() {
        let mut f = fixture().await;
        enable_rules(&f).await;

        let mut rule = TriageRule::new(f.channel.tenant_id, "billing", 1);
        rule.assign_queue_id = Some(Uuid::new_v4());
        f.store.insert_rule(rule).await;

        let matched = f
            .engine
            .evaluate(&mut f.conversation, &f.channel, "just saying hi")
            .await
            .unwrap();
        assert!(!matched);
        assert!(f.conversation.assigned_queue_id.is_none());
    }

    #[tokio::test]
    async fn cache_holds_until_invalidated() {
        let mut f = fixture().await;

        let mut rule = TriageRule::new(f.channel.tenant_id, "hello", 1);
        rule.assign_queue_id = Some(Uuid::new_v4());
        f.store.insert_rule(rule).await;

        // First evaluation caches the disabled gate.
        assert!(
            !f.engine
                .evaluate(&mut f.conversation, &f.channel, "hello")
                .await
                .unwrap()
        );

        // Flipping the setting alone is not seen through the cache.
        enable_rules(&f).await;
        assert!(
            !f.engine
                .evaluate(&mut f.conversation, &f.channel, "hello")
                .await
                .unwrap()
        );

        // Invalidation reloads the gate and the rules.
        f.engine
            .invalidate(f.channel.tenant_id, f.channel.id)
            .await;
        assert!(
            f.engine
                .evaluate(&mut f.conversation, &f.channel, "hello")
                .await
                .unwrap()
        );
    }
}
