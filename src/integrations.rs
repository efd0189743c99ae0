//! External bot/flow engines — interfaces only.
//!
//! The dispatcher decides *which* engine to invoke and *when*; how each
//! engine works internally is out of scope. The integration kind is a
//! closed enum so adding a kind is a compile-time-checked extension at
//! every match site.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::error::IntegrationError;
use crate::transport::InboundMessage;

/// The four integration kinds the dispatcher knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntegrationKind {
    FlowBuilder,
    ConversationalBot,
    Assistant,
    ExternalDialog,
}

impl IntegrationKind {
    /// DB / log string for this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FlowBuilder => "flow_builder",
            Self::ConversationalBot => "conversational_bot",
            Self::Assistant => "assistant",
            Self::ExternalDialog => "external_dialog",
        }
    }

    /// Parse a kind string from the DB.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "flow_builder" => Some(Self::FlowBuilder),
            "conversational_bot" => Some(Self::ConversationalBot),
            "assistant" => Some(Self::Assistant),
            "external_dialog" => Some(Self::ExternalDialog),
            _ => None,
        }
    }
}

/// A configured integration instance.
///
/// `config` is opaque here — it is handed to the external engine as-is.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Integration {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub name: String,
    pub kind: IntegrationKind,
    pub config: serde_json::Value,
}

// ── Engine traits ───────────────────────────────────────────────────

/// Flow-builder interpreter. The session stays bound to the conversation.
#[async_trait]
pub trait FlowBuilderEngine: Send + Sync {
    async fn continue_flow(
        &self,
        conversation_id: Uuid,
        message: &InboundMessage,
    ) -> Result<(), IntegrationError>;
}

/// Conversational-bot engine. Returns whether it handled the message.
#[async_trait]
pub trait ConversationalBotEngine: Send + Sync {
    async fn handle(
        &self,
        conversation_id: Uuid,
        message: &InboundMessage,
        config: &serde_json::Value,
    ) -> Result<bool, IntegrationError>;
}

/// LLM assistant session keyed by a prompt.
#[async_trait]
pub trait AssistantEngine: Send + Sync {
    async fn respond(
        &self,
        prompt_id: Uuid,
        conversation_id: Uuid,
        message: &InboundMessage,
    ) -> Result<(), IntegrationError>;
}

/// External dialog service. Invoked non-stickily, with the queue names
/// as context. Returns whether it handled the message.
#[async_trait]
pub trait ExternalDialogEngine: Send + Sync {
    async fn handle(
        &self,
        conversation_id: Uuid,
        message: &InboundMessage,
        queue_names: &[String],
    ) -> Result<bool, IntegrationError>;
}

/// The full set of engine clients the dispatcher can invoke.
#[derive(Clone)]
pub struct IntegrationSet {
    pub flow_builder: Arc<dyn FlowBuilderEngine>,
    pub bot: Arc<dyn ConversationalBotEngine>,
    pub assistant: Arc<dyn AssistantEngine>,
    pub dialog: Arc<dyn ExternalDialogEngine>,
}

/// Run an engine call under the configured timeout.
///
/// Timeouts are a local failure: the caller logs and stops the current
/// step, it never retries or propagates to the contact.
pub(crate) async fn call_with_timeout<T, F>(
    kind: &'static str,
    timeout: Duration,
    fut: F,
) -> Result<T, IntegrationError>
where
    F: Future<Output = Result<T, IntegrationError>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => {
            warn!(kind, ?timeout, "Integration call timed out");
            Err(IntegrationError::Timeout { kind, timeout })
        }
    }
}
