//! Triage rules — priority-ordered patterns that pre-empt normal routing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A single triage rule.
///
/// Rules are evaluated in priority order (higher first, creation time
/// desc as the tiebreak) and the first match wins. The outcome fields
/// are checked in a fixed order: a user assignment beats a queue or
/// channel assignment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriageRule {
    pub id: Uuid,
    pub tenant_id: Uuid,
    /// None = the rule applies to every channel of the tenant.
    pub channel_id: Option<Uuid>,
    pub pattern: String,
    pub is_regex: bool,
    /// Higher priority evaluates first.
    pub priority: i32,
    pub active: bool,
    /// Assign straight to a user (conversation becomes open).
    pub assign_user_id: Option<Uuid>,
    /// Assign to a queue (conversation becomes pending).
    pub assign_queue_id: Option<Uuid>,
    /// Move the conversation to another channel (conversation becomes pending).
    pub assign_channel_id: Option<Uuid>,
    /// Tags attached on match, idempotently.
    pub tag_ids: Vec<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl TriageRule {
    /// Create a substring rule with no outcome; callers fill in the rest.
    pub fn new(tenant_id: Uuid, pattern: &str, priority: i32) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            channel_id: None,
            pattern: pattern.to_string(),
            is_regex: false,
            priority,
            active: true,
            assign_user_id: None,
            assign_queue_id: None,
            assign_channel_id: None,
            tag_ids: Vec::new(),
            created_at: Utc::now(),
        }
    }
}
