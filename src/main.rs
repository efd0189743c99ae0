//! Demo binary — wires the engine to a console transport and logging
//! engine stubs, seeds a two-queue demo tenant, and routes stdin lines
//! as inbound messages.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use uuid::Uuid;

use convo_router::config::EngineConfig;
use convo_router::engine::RoutingEngine;
use convo_router::error::{IntegrationError, TransportError};
use convo_router::integrations::{
    AssistantEngine, ConversationalBotEngine, ExternalDialogEngine, FlowBuilderEngine,
    IntegrationSet,
};
use convo_router::model::{Channel, Conversation, Queue};
use convo_router::store::{Database, LibSqlBackend};
use convo_router::transport::{InboundMessage, MessageHandle, OutboundContent, Transport};

// Fixed demo ids so re-runs against a file database stay stable.
const DEMO_TENANT: Uuid = Uuid::from_u128(0xA1);
const DEMO_CHANNEL: Uuid = Uuid::from_u128(0xA2);
const DEMO_QUEUE_SALES: Uuid = Uuid::from_u128(0xA3);
const DEMO_QUEUE_SUPPORT: Uuid = Uuid::from_u128(0xA4);
const DEMO_CONTACT: Uuid = Uuid::from_u128(0xA5);
const DEMO_CONVERSATION: Uuid = Uuid::from_u128(0xA6);

/// Transport that prints outbound messages to stdout.
struct ConsoleTransport;

#[async_trait]
impl Transport for ConsoleTransport {
    async fn send_message(
        &self,
        _channel_id: Uuid,
        to: &str,
        content: &OutboundContent,
    ) -> Result<MessageHandle, TransportError> {
        println!("→ {to}:\n{}\n", content.text);
        Ok(MessageHandle {
            id: Uuid::new_v4().to_string(),
        })
    }
}

/// Engine stub that only logs what would have been invoked.
struct LoggingEngines;

#[async_trait]
impl FlowBuilderEngine for LoggingEngines {
    async fn continue_flow(
        &self,
        conversation_id: Uuid,
        _message: &InboundMessage,
    ) -> Result<(), IntegrationError> {
        println!("[flow-builder] continue {conversation_id}");
        Ok(())
    }
}

#[async_trait]
impl ConversationalBotEngine for LoggingEngines {
    async fn handle(
        &self,
        conversation_id: Uuid,
        _message: &InboundMessage,
        _config: &serde_json::Value,
    ) -> Result<bool, IntegrationError> {
        println!("[bot] handle {conversation_id}");
        Ok(true)
    }
}

#[async_trait]
impl AssistantEngine for LoggingEngines {
    async fn respond(
        &self,
        prompt_id: Uuid,
        conversation_id: Uuid,
        _message: &InboundMessage,
    ) -> Result<(), IntegrationError> {
        println!("[assistant] respond prompt={prompt_id} conversation={conversation_id}");
        Ok(())
    }
}

#[async_trait]
impl ExternalDialogEngine for LoggingEngines {
    async fn handle(
        &self,
        conversation_id: Uuid,
        _message: &InboundMessage,
        queue_names: &[String],
    ) -> Result<bool, IntegrationError> {
        println!("[dialog] handle {conversation_id} queues={queue_names:?}");
        Ok(false)
    }
}

/// Seed the demo tenant: one channel, Sales + Support queues, one
/// conversation for the console contact.
async fn seed_demo(store: &LibSqlBackend) -> anyhow::Result<()> {
    let mut channel = Channel::new(DEMO_TENANT, "demo");
    channel.id = DEMO_CHANNEL;
    channel.greeting_message = Some("Welcome to the demo desk!".into());
    store.insert_channel(&channel).await?;

    let mut sales = Queue::new(DEMO_TENANT, DEMO_CHANNEL, "Sales", 1);
    sales.id = DEMO_QUEUE_SALES;
    sales.greeting_message = Some("Sales here — what can we do for you?".into());
    store.insert_queue(&sales).await?;

    let mut support = Queue::new(DEMO_TENANT, DEMO_CHANNEL, "Support", 2);
    support.id = DEMO_QUEUE_SUPPORT;
    support.greeting_message = Some("Support here — describe the issue.".into());
    store.insert_queue(&support).await?;

    if store.load_conversation(DEMO_CONVERSATION).await.is_err() {
        let mut conversation =
            Conversation::new(DEMO_TENANT, DEMO_CHANNEL, DEMO_CONTACT, "+15550001");
        conversation.id = DEMO_CONVERSATION;
        store.insert_conversation(&conversation).await?;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let db_path = std::env::var("CONVO_ROUTER_DB")
        .unwrap_or_else(|_| "./data/convo-router.db".to_string());
    let store = Arc::new(LibSqlBackend::new_local(std::path::Path::new(&db_path)).await?);
    seed_demo(&store).await?;

    eprintln!("convo-router v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("  Database: {db_path}");
    eprintln!("  Type a message and press Enter. /quit to exit.\n");

    let engine = RoutingEngine::new(
        Arc::clone(&store) as Arc<dyn Database>,
        Arc::new(ConsoleTransport),
        IntegrationSet {
            flow_builder: Arc::new(LoggingEngines),
            bot: Arc::new(LoggingEngines),
            assistant: Arc::new(LoggingEngines),
            dialog: Arc::new(LoggingEngines),
        },
        EngineConfig::default(),
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim().to_string();
        if line.is_empty() {
            continue;
        }
        if line == "/quit" {
            break;
        }
        let mut message = InboundMessage::text(&line);
        message.from = "+15550001".into();
        engine.on_inbound_message(DEMO_CONVERSATION, message).await;
    }

    Ok(())
}
