//! Routing entities — conversations, channels, queues, triage rules.

pub mod channel;
pub mod conversation;
pub mod rule;

pub use channel::{Channel, DaySchedule, MediaAttachment, MenuOption, Queue};
pub use conversation::{Conversation, ConversationStatus, IntegrationBinding};
pub use rule::TriageRule;
