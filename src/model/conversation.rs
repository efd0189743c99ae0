//! Conversation — the unit of routing state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::integrations::IntegrationKind;

/// Lifecycle status of a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationStatus {
    /// Waiting in a queue for a human agent (or mid-chatbot).
    Pending,
    /// Assigned to a human agent.
    Open,
    /// Finished. The engine takes no action on closed conversations.
    Closed,
}

impl ConversationStatus {
    /// DB string for this status.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Open => "open",
            Self::Closed => "closed",
        }
    }

    /// Parse a status string from the DB. Unknown values fall back to pending.
    pub fn parse(s: &str) -> Self {
        match s {
            "open" => Self::Open,
            "closed" => Self::Closed,
            _ => Self::Pending,
        }
    }
}

/// A sticky integration session.
///
/// Once set, further messages route directly to this integration,
/// bypassing normal dispatch (how far it bypasses depends on the kind —
/// an assistant binding makes the conversation fully opaque).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrationBinding {
    pub integration_id: Uuid,
    pub kind: IntegrationKind,
}

/// One tenant's ongoing exchange with one contact on one channel.
///
/// Both the dispatcher and the triage rule engine mutate this record;
/// the engine serializes access per conversation so the two never race.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub channel_id: Uuid,
    pub contact_id: Uuid,
    /// Transport-level recipient address (phone number, account handle).
    pub contact_address: String,
    pub status: ConversationStatus,
    pub assigned_queue_id: Option<Uuid>,
    pub assigned_user_id: Option<Uuid>,
    pub is_group: bool,
    /// Sticky integration session, if any.
    pub integration: Option<IntegrationBinding>,
    /// Assistant prompt binding. Orthogonal to `integration`.
    pub prompt_id: Option<Uuid>,
    /// Set when the assigned queue itself behaves as a chatbot sub-menu.
    pub in_bot_menu: bool,
    /// How many times the chatbot menu has run for this conversation.
    pub bot_usage_count: u32,
    /// Last time the chatbot menu ran. Feeds the cool-down.
    pub last_bot_activity_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    /// Create a fresh conversation for a contact on a channel.
    pub fn new(tenant_id: Uuid, channel_id: Uuid, contact_id: Uuid, contact_address: &str) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            channel_id,
            contact_id,
            contact_address: contact_address.to_string(),
            status: ConversationStatus::Pending,
            assigned_queue_id: None,
            assigned_user_id: None,
            is_group: false,
            integration: None,
            prompt_id: None,
            in_bot_menu: false,
            bot_usage_count: 0,
            last_bot_activity_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Clear every piece of automation state.
    ///
    /// A human/queue decision always wins over bots: a triage-rule match
    /// drops the integration session, the prompt binding, and the bot
    /// usage counters in one stroke.
    pub fn clear_automation(&mut self) {
        self.integration = None;
        self.prompt_id = None;
        self.in_bot_menu = false;
        self.bot_usage_count = 0;
        self.last_bot_activity_at = None;
    }
}
