//! Channels and queues — the routing topology.

use chrono::{NaiveTime, Weekday};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One connected messaging account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Channel {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub name: String,
    /// Fallback integration when no queue-level one is configured.
    pub default_integration_id: Option<Uuid>,
    /// Fallback assistant prompt when no queue- or conversation-level one is configured.
    pub default_prompt_id: Option<Uuid>,
    pub greeting_message: Option<String>,
    /// Hard cap on chatbot menu runs per conversation. 0 = unlimited.
    pub max_bot_uses: u32,
    /// Cool-down between chatbot menu runs. 0 = no cool-down.
    pub bot_cooldown_minutes: u32,
}

impl Channel {
    pub fn new(tenant_id: Uuid, name: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            name: name.to_string(),
            default_integration_id: None,
            default_prompt_id: None,
            greeting_message: None,
            max_bot_uses: 0,
            bot_cooldown_minutes: 0,
        }
    }
}

/// One business-hours window for one weekday.
///
/// `start > end` means the window wraps past midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaySchedule {
    pub weekday: Weekday,
    pub start: NaiveTime,
    pub end: NaiveTime,
}

/// One entry of a queue's chatbot sub-menu.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MenuOption {
    /// Shown in the numbered option list.
    pub title: String,
    /// Sent back when the contact picks this option.
    pub body: String,
}

/// A media file attached to a queue greeting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaAttachment {
    pub name: String,
    pub url: String,
}

/// A named routing bucket on a channel.
///
/// `menu_options` being non-empty means the queue itself behaves as a
/// chatbot sub-menu rather than a terminal human queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Queue {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub channel_id: Uuid,
    pub name: String,
    /// Ordinal in the channel menu; also the 1-based numeric selection.
    pub position: u32,
    pub integration_id: Option<Uuid>,
    pub prompt_id: Option<Uuid>,
    pub greeting_message: Option<String>,
    pub out_of_hours_message: Option<String>,
    /// Weekly business hours. Empty = always open.
    pub schedule: Vec<DaySchedule>,
    pub menu_options: Vec<MenuOption>,
    pub media: Option<MediaAttachment>,
}

impl Queue {
    pub fn new(tenant_id: Uuid, channel_id: Uuid, name: &str, position: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            channel_id,
            name: name.to_string(),
            position,
            integration_id: None,
            prompt_id: None,
            greeting_message: None,
            out_of_hours_message: None,
            schedule: Vec::new(),
            menu_options: Vec::new(),
            media: None,
        }
    }

    /// Whether this queue is itself a chatbot sub-menu.
    pub fn has_submenu(&self) -> bool {
        !self.menu_options.is_empty()
    }
}
