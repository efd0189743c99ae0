//! Bot-usage governor — cap and cool-down for the chatbot menu.

use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use crate::model::{Channel, Conversation};

/// Whether the chatbot menu may run for this conversation right now.
///
/// Hard cap first: once `bot_usage_count` reaches the channel's
/// `max_bot_uses` (when non-zero), the menu is denied until an operator
/// resets the counter. Then the soft cool-down: a non-first interaction
/// inside the cool-down window is denied. The very first bot interaction
/// is never cooled down, whatever `last_bot_activity_at` says.
pub fn may_run_bot(conversation: &Conversation, channel: &Channel, now: DateTime<Utc>) -> bool {
    if channel.max_bot_uses > 0 && conversation.bot_usage_count >= channel.max_bot_uses {
        debug!(
            conversation_id = %conversation.id,
            usage = conversation.bot_usage_count,
            max = channel.max_bot_uses,
            "Bot usage cap reached"
        );
        return false;
    }

    if let Some(last) = conversation.last_bot_activity_at
        && channel.bot_cooldown_minutes > 0
        && conversation.bot_usage_count != 0
        && now < last + Duration::minutes(i64::from(channel.bot_cooldown_minutes))
    {
        debug!(
            conversation_id = %conversation.id,
            last_activity = %last,
            cooldown_minutes = channel.bot_cooldown_minutes,
            "Bot cool-down active"
        );
        return false;
    }

    true
}
