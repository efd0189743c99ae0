//! Transport abstraction — message I/O with the channel session library.
//!
//! The transport is an external collaborator: it delivers inbound events
//! and exposes one send primitive. Everything else (session management,
//! reconnects, media upload) lives behind it.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::TransportError;
use crate::model::MediaAttachment;

/// An inbound message as delivered by the transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    /// Transport-native message id.
    pub id: String,
    /// Sender address (phone number, account handle).
    pub from: String,
    /// Raw message body.
    pub body: String,
    /// Structured text, when the transport distinguishes it from the body.
    pub text: Option<String>,
    /// Id of the button the contact tapped, if any.
    pub button_reply_id: Option<String>,
    /// Id of the list row the contact picked, if any.
    pub list_reply_id: Option<String>,
    pub received_at: DateTime<Utc>,
}

impl InboundMessage {
    /// Plain-text message with no interactive payload.
    pub fn text(body: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            from: String::new(),
            body: body.to_string(),
            text: None,
            button_reply_id: None,
            list_reply_id: None,
            received_at: Utc::now(),
        }
    }

    /// The message text rules and bots evaluate against.
    pub fn content(&self) -> &str {
        self.text.as_deref().unwrap_or(&self.body)
    }

    /// The menu selection, in priority order: button reply, list reply,
    /// structured text, raw body.
    pub fn selection(&self) -> &str {
        self.button_reply_id
            .as_deref()
            .or(self.list_reply_id.as_deref())
            .or(self.text.as_deref())
            .unwrap_or(&self.body)
    }
}

/// Outbound message content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundContent {
    pub text: String,
    pub media: Option<MediaAttachment>,
}

impl OutboundContent {
    pub fn text(text: &str) -> Self {
        Self {
            text: text.to_string(),
            media: None,
        }
    }
}

/// Handle to a sent message.
#[derive(Debug, Clone)]
pub struct MessageHandle {
    pub id: String,
}

/// Send primitive exposed by the channel transport.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Deliver `content` to `to` on the given channel.
    async fn send_message(
        &self,
        channel_id: Uuid,
        to: &str,
        content: &OutboundContent,
    ) -> Result<MessageHandle, TransportError>;
}
