//! The per-message routing state machine.
//!
//! Entry is computed fresh per message from the conversation's current
//! bindings and the channel's queue count — nothing is cached between
//! messages. External calls (transport sends, bot engines) are bounded
//! by the configured timeout; failures are logged and the affected step
//! is skipped or the turn stops, but nothing is retried.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::dedup::{Dedup, DedupKey, DedupKind};
use crate::dispatch::menu;
use crate::engine::EngineEvent;
use crate::error::Result;
use crate::governor;
use crate::integrations::{
    self, Integration, IntegrationKind, IntegrationSet,
};
use crate::model::{
    Channel, Conversation, ConversationStatus, IntegrationBinding, MediaAttachment, Queue,
};
use crate::schedule;
use crate::store::Database;
use crate::transport::{InboundMessage, OutboundContent, Transport};

/// Per-tenant setting enabling the channel greeting. Provisioned enabled.
pub const SETTING_GREETING: &str = "greeting";
/// Per-tenant setting restricting the chatbot to a single contact
/// address (testing guard). Provisioned empty = no restriction.
pub const SETTING_TEST_CONTACT: &str = "chatbot_test_contact";

const GREETING_ENABLED: &str = "enabled";

/// Queue/integration dispatcher.
pub struct Dispatcher {
    store: Arc<dyn Database>,
    transport: Arc<dyn Transport>,
    integrations: IntegrationSet,
    /// In-process dedup: out-of-hours and queue-position notices.
    notice_dedup: Arc<dyn Dedup>,
    /// DB-backed dedup: greetings.
    greeting_dedup: Arc<dyn Dedup>,
    events: broadcast::Sender<EngineEvent>,
    config: EngineConfig,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn Database>,
        transport: Arc<dyn Transport>,
        integrations: IntegrationSet,
        notice_dedup: Arc<dyn Dedup>,
        greeting_dedup: Arc<dyn Dedup>,
        events: broadcast::Sender<EngineEvent>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            transport,
            integrations,
            notice_dedup,
            greeting_dedup,
            events,
            config,
        }
    }

    /// Decide what owns the conversation next and act on it.
    pub async fn dispatch(
        &self,
        conversation: &mut Conversation,
        channel: &Channel,
        queues: &[Queue],
        message: &InboundMessage,
        now: DateTime<Utc>,
    ) -> Result<()> {
        // Sticky sessions first.
        if let Some(binding) = conversation.integration {
            match binding.kind {
                IntegrationKind::FlowBuilder => {
                    let call = self
                        .integrations
                        .flow_builder
                        .continue_flow(conversation.id, message);
                    if let Err(e) = integrations::call_with_timeout(
                        "flow_builder",
                        self.config.external_call_timeout,
                        call,
                    )
                    .await
                    {
                        warn!(
                            conversation_id = %conversation.id,
                            error = %e,
                            "Flow-builder continuation failed"
                        );
                    }
                    return Ok(());
                }
                IntegrationKind::Assistant => {
                    // The conversation is opaque to the dispatcher until
                    // the binding is cleared externally.
                    debug!(
                        conversation_id = %conversation.id,
                        "Assistant session active, deferring"
                    );
                    return Ok(());
                }
                // Bot and dialog bindings are re-resolved by the normal
                // flow below.
                IntegrationKind::ConversationalBot | IntegrationKind::ExternalDialog => {}
            }
        }

        // Conversations already parked in a queue: resolve a sub-menu
        // option if the queue is one, otherwise they belong to a human.
        if let Some(queue_id) = conversation.assigned_queue_id {
            if conversation.in_bot_menu
                && let Some(queue) = queues.iter().find(|q| q.id == queue_id)
                && queue.has_submenu()
            {
                return self.answer_submenu(conversation, queue, message).await;
            }
            debug!(
                conversation_id = %conversation.id,
                queue_id = %queue_id,
                "Conversation already queued, nothing to dispatch"
            );
            return Ok(());
        }

        match queues.len() {
            0 => {
                self.dispatch_no_queue(conversation, channel, queues, message)
                    .await
            }
            1 => {
                self.dispatch_single_queue(conversation, channel, &queues[0], message, now)
                    .await
            }
            _ => {
                self.dispatch_multi_queue(conversation, channel, queues, message, now)
                    .await
            }
        }
    }

    // ── Zero queues ─────────────────────────────────────────────────

    async fn dispatch_no_queue(
        &self,
        conversation: &mut Conversation,
        channel: &Channel,
        queues: &[Queue],
        message: &InboundMessage,
    ) -> Result<()> {
        let integration_id = channel
            .default_integration_id
            .or(conversation.integration.map(|b| b.integration_id));
        if let Some(id) = integration_id {
            let integration = self.store.load_integration(id).await?;
            if self
                .run_integration(conversation, channel, &integration, queues, message)
                .await?
            {
                return Ok(());
            }
        }

        if let Some(prompt_id) = conversation.prompt_id.or(channel.default_prompt_id) {
            return self.forward_assistant(conversation, prompt_id, message).await;
        }

        debug!(
            conversation_id = %conversation.id,
            "No queues and no integration, nothing to dispatch"
        );
        Ok(())
    }

    // ── Exactly one queue ───────────────────────────────────────────

    async fn dispatch_single_queue(
        &self,
        conversation: &mut Conversation,
        channel: &Channel,
        queue: &Queue,
        message: &InboundMessage,
        now: DateTime<Utc>,
    ) -> Result<()> {
        // One fresh-greeting decision per pass, checked against persisted
        // message history so it survives restarts.
        let greeting_fresh = self
            .greeting_dedup
            .check_and_mark(
                &DedupKey::new(conversation.id, DedupKind::Greeting),
                self.config.greeting_window,
                now,
            )
            .await;

        if let Some(greeting) = non_trivial(channel.greeting_message.as_deref()) {
            let enabled = self
                .store
                .get_or_create_setting(channel.tenant_id, SETTING_GREETING, GREETING_ENABLED)
                .await?
                == GREETING_ENABLED;
            if enabled && greeting_fresh {
                self.send(conversation, greeting, None).await;
            }
        }

        // Integration precedence: queue over channel default. Group chats
        // and already-bound conversations skip it.
        if let Some(id) = queue.integration_id.or(channel.default_integration_id)
            && !conversation.is_group
            && conversation.integration.is_none()
        {
            if greeting_fresh
                && let Some(queue_greeting) = non_trivial(queue.greeting_message.as_deref())
            {
                self.send(conversation, queue_greeting, None).await;
            }
            let integration = self.store.load_integration(id).await?;
            if self
                .run_integration(
                    conversation,
                    channel,
                    &integration,
                    std::slice::from_ref(queue),
                    message,
                )
                .await?
            {
                return Ok(());
            }
        }

        // Prompt precedence: queue, then conversation, then channel.
        if let Some(prompt_id) = queue
            .prompt_id
            .or(conversation.prompt_id)
            .or(channel.default_prompt_id)
        {
            if greeting_fresh
                && let Some(queue_greeting) = non_trivial(queue.greeting_message.as_deref())
            {
                self.send(conversation, queue_greeting, None).await;
            }
            return self.forward_assistant(conversation, prompt_id, message).await;
        }

        // Plain single queue: assign and report the position.
        self.assign_to_queue(conversation, queue, now).await?;
        if queue.has_submenu() {
            let text = menu::render_submenu(queue);
            self.send(conversation, &text, None).await;
        }
        Ok(())
    }

    // ── Two or more queues ──────────────────────────────────────────

    async fn dispatch_multi_queue(
        &self,
        conversation: &mut Conversation,
        channel: &Channel,
        queues: &[Queue],
        message: &InboundMessage,
        now: DateTime<Utc>,
    ) -> Result<()> {
        // A menu is outstanding once it has been presented; until then
        // nothing is treated as a selection.
        if conversation.last_bot_activity_at.is_some()
            && let Some(queue) = menu::resolve_queue_selection(queues, message.selection())
        {
            return self
                .finish_menu_selection(conversation, channel, queue, message, now)
                .await;
        }

        if conversation.last_bot_activity_at.is_some() {
            // An unparseable menu reply is silently dropped; the menu
            // cycle below runs again, governor permitting.
            debug!(
                conversation_id = %conversation.id,
                selection = message.selection(),
                "Unresolvable menu selection"
            );
        }

        self.present_queue_menu(conversation, channel, queues, now)
            .await
    }

    async fn present_queue_menu(
        &self,
        conversation: &mut Conversation,
        channel: &Channel,
        queues: &[Queue],
        now: DateTime<Utc>,
    ) -> Result<()> {
        if !governor::may_run_bot(conversation, channel, now) {
            return Ok(());
        }

        let restricted = self
            .store
            .get_or_create_setting(channel.tenant_id, SETTING_TEST_CONTACT, "")
            .await?;
        if !restricted.is_empty() && conversation.contact_address != restricted {
            debug!(
                conversation_id = %conversation.id,
                "Chatbot restricted to a test contact, skipping menu"
            );
            return Ok(());
        }

        let text = menu::render_queue_menu(channel.greeting_message.as_deref(), queues);
        if self.send(conversation, &text, None).await {
            conversation.bot_usage_count += 1;
            conversation.last_bot_activity_at = Some(now);
            self.store.save_conversation(conversation).await?;
            info!(
                conversation_id = %conversation.id,
                queue_count = queues.len(),
                usage = conversation.bot_usage_count,
                "Queue menu sent"
            );
        }
        Ok(())
    }

    /// A menu reply resolved to a queue.
    async fn finish_menu_selection(
        &self,
        conversation: &mut Conversation,
        channel: &Channel,
        queue: &Queue,
        message: &InboundMessage,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if conversation.integration.is_none() && queue.integration_id.is_none() {
            conversation.bot_usage_count = 0;
            self.assign_to_queue(conversation, queue, now).await?;
        }

        if queue.has_submenu() {
            let text = menu::render_submenu(queue);
            self.send(conversation, &text, None).await;
            return Ok(());
        }

        // Business-hours gate. Assignment is cleared back to unassigned;
        // the notice itself is rate-limited in-process, so the guarantee
        // is best-effort across restarts.
        if let Some(out_of_hours) = non_trivial(queue.out_of_hours_message.as_deref())
            && !schedule::is_within_hours(&queue.schedule, now)
        {
            let key = DedupKey::new(conversation.id, DedupKind::OutOfHours);
            if self
                .notice_dedup
                .check_and_mark(&key, self.config.notice_window, now)
                .await
            {
                self.send(conversation, out_of_hours, None).await;
            }
            conversation.assigned_queue_id = None;
            conversation.in_bot_menu = false;
            self.store.save_conversation(conversation).await?;
            info!(
                conversation_id = %conversation.id,
                queue = %queue.name,
                "Outside business hours, queue assignment cleared"
            );
            return Ok(());
        }

        // Integration resolution: queue over the existing binding.
        if let Some(id) = queue
            .integration_id
            .or(conversation.integration.map(|b| b.integration_id))
        {
            let integration = self.store.load_integration(id).await?;
            if self
                .run_integration(
                    conversation,
                    channel,
                    &integration,
                    std::slice::from_ref(queue),
                    message,
                )
                .await?
            {
                self.send_queue_position(conversation, queue, now).await;
                return Ok(());
            }
        }

        // Prompt resolution.
        if let Some(prompt_id) = queue
            .prompt_id
            .or(conversation.prompt_id)
            .or(channel.default_prompt_id)
        {
            if let Some(queue_greeting) = non_trivial(queue.greeting_message.as_deref()) {
                self.send(conversation, queue_greeting, None).await;
            }
            return self.forward_assistant(conversation, prompt_id, message).await;
        }

        // Plain queue: greeting plus any attached media, then the
        // conversation waits for a human agent.
        match (
            non_trivial(queue.greeting_message.as_deref()),
            queue.media.as_ref(),
        ) {
            (Some(greeting), media) => {
                self.send(conversation, greeting, media).await;
            }
            (None, Some(media)) => {
                self.send(conversation, &media.name, Some(media)).await;
            }
            (None, None) => {}
        }
        Ok(())
    }

    /// Answer a message for a conversation sitting inside a queue's
    /// sub-menu. Unresolvable input is dropped.
    async fn answer_submenu(
        &self,
        conversation: &mut Conversation,
        queue: &Queue,
        message: &InboundMessage,
    ) -> Result<()> {
        match menu::resolve_menu_option(&queue.menu_options, message.selection()) {
            Some(option) => {
                self.send(conversation, &option.body, None).await;
                Ok(())
            }
            None => {
                debug!(
                    conversation_id = %conversation.id,
                    selection = message.selection(),
                    "Unresolvable sub-menu selection"
                );
                Ok(())
            }
        }
    }

    // ── Shared steps ────────────────────────────────────────────────

    /// Park the conversation in a queue and send the one-time position
    /// notice.
    async fn assign_to_queue(
        &self,
        conversation: &mut Conversation,
        queue: &Queue,
        now: DateTime<Utc>,
    ) -> Result<()> {
        conversation.status = ConversationStatus::Pending;
        conversation.assigned_queue_id = Some(queue.id);
        conversation.in_bot_menu = queue.has_submenu();
        self.store.save_conversation(conversation).await?;
        info!(
            conversation_id = %conversation.id,
            queue_id = %queue.id,
            queue = %queue.name,
            "Conversation assigned to queue"
        );
        let _ = self.events.send(EngineEvent::ConversationRouted {
            conversation_id: conversation.id,
            queue_id: Some(queue.id),
        });
        self.send_queue_position(conversation, queue, now).await;
        Ok(())
    }

    /// Dispatch one integration per kind. Returns whether the turn is
    /// finished; external-dialog reports "not handled" to let the caller
    /// fall through.
    async fn run_integration(
        &self,
        conversation: &mut Conversation,
        channel: &Channel,
        integration: &Integration,
        queues: &[Queue],
        message: &InboundMessage,
    ) -> Result<bool> {
        let timeout = self.config.external_call_timeout;
        match integration.kind {
            IntegrationKind::FlowBuilder => {
                self.bind(conversation, integration).await?;
                let call = self
                    .integrations
                    .flow_builder
                    .continue_flow(conversation.id, message);
                if let Err(e) =
                    integrations::call_with_timeout("flow_builder", timeout, call).await
                {
                    warn!(
                        conversation_id = %conversation.id,
                        error = %e,
                        "Flow-builder start failed"
                    );
                }
                Ok(true)
            }
            IntegrationKind::ConversationalBot => {
                self.bind(conversation, integration).await?;
                let call =
                    self.integrations
                        .bot
                        .handle(conversation.id, message, &integration.config);
                match integrations::call_with_timeout("conversational_bot", timeout, call).await {
                    Ok(handled) => {
                        debug!(
                            conversation_id = %conversation.id,
                            handled,
                            "Conversational bot ran"
                        );
                    }
                    Err(e) => {
                        warn!(
                            conversation_id = %conversation.id,
                            error = %e,
                            "Conversational bot failed"
                        );
                    }
                }
                Ok(true)
            }
            IntegrationKind::Assistant => {
                // Binding the session makes the conversation opaque from
                // the next message on.
                self.bind(conversation, integration).await?;
                match conversation.prompt_id.or(channel.default_prompt_id) {
                    Some(prompt_id) => {
                        self.forward_assistant(conversation, prompt_id, message)
                            .await?;
                    }
                    None => {
                        warn!(
                            conversation_id = %conversation.id,
                            integration_id = %integration.id,
                            "Assistant integration without a resolvable prompt"
                        );
                    }
                }
                Ok(true)
            }
            IntegrationKind::ExternalDialog => {
                let queue_names: Vec<String> = queues.iter().map(|q| q.name.clone()).collect();
                let call =
                    self.integrations
                        .dialog
                        .handle(conversation.id, message, &queue_names);
                match integrations::call_with_timeout("external_dialog", timeout, call).await {
                    Ok(handled) => Ok(handled),
                    Err(e) => {
                        warn!(
                            conversation_id = %conversation.id,
                            error = %e,
                            "External dialog failed"
                        );
                        // Failure stops this turn; it is not a fall-through.
                        Ok(true)
                    }
                }
            }
        }
    }

    /// Record a sticky integration session on the conversation.
    async fn bind(
        &self,
        conversation: &mut Conversation,
        integration: &Integration,
    ) -> Result<()> {
        conversation.integration = Some(IntegrationBinding {
            integration_id: integration.id,
            kind: integration.kind,
        });
        self.store.save_conversation(conversation).await?;
        info!(
            conversation_id = %conversation.id,
            integration_id = %integration.id,
            kind = integration.kind.as_str(),
            "Conversation bound to integration"
        );
        Ok(())
    }

    /// Bind the prompt and hand the message to the assistant.
    async fn forward_assistant(
        &self,
        conversation: &mut Conversation,
        prompt_id: Uuid,
        message: &InboundMessage,
    ) -> Result<()> {
        if conversation.prompt_id != Some(prompt_id) {
            conversation.prompt_id = Some(prompt_id);
            self.store.save_conversation(conversation).await?;
        }
        let call = self
            .integrations
            .assistant
            .respond(prompt_id, conversation.id, message);
        if let Err(e) = integrations::call_with_timeout(
            "assistant",
            self.config.external_call_timeout,
            call,
        )
        .await
        {
            warn!(
                conversation_id = %conversation.id,
                prompt_id = %prompt_id,
                error = %e,
                "Assistant call failed"
            );
        }
        Ok(())
    }

    /// One-time queue-position notice: how many other conversations wait
    /// unassigned in the queue, floor 1.
    async fn send_queue_position(
        &self,
        conversation: &Conversation,
        queue: &Queue,
        now: DateTime<Utc>,
    ) {
        let key = DedupKey::new(conversation.id, DedupKind::QueuePosition);
        if !self
            .notice_dedup
            .check_and_mark(&key, self.config.notice_window, now)
            .await
        {
            return;
        }

        let position = match self
            .store
            .count_pending_in_queue(queue.id, conversation.id)
            .await
        {
            Ok(count) => count.max(1),
            Err(e) => {
                warn!(
                    conversation_id = %conversation.id,
                    queue_id = %queue.id,
                    error = %e,
                    "Failed to count queue occupancy"
                );
                return;
            }
        };

        let text = format!(
            "*{}* — you are number {} in line. An agent will be with you shortly.",
            queue.name, position
        );
        self.send(conversation, &text, None).await;
    }

    /// Send to the conversation's contact. Failures and timeouts are
    /// logged and swallowed; returns whether the transport accepted the
    /// message. Successful sends are recorded so the DB-backed greeting
    /// dedup sees them.
    async fn send(
        &self,
        conversation: &Conversation,
        text: &str,
        media: Option<&MediaAttachment>,
    ) -> bool {
        let content = OutboundContent {
            text: text.to_string(),
            media: media.cloned(),
        };
        let fut = self.transport.send_message(
            conversation.channel_id,
            &conversation.contact_address,
            &content,
        );
        match tokio::time::timeout(self.config.external_call_timeout, fut).await {
            Ok(Ok(_handle)) => {
                if let Err(e) = self
                    .store
                    .record_outbound_message(conversation.id, text)
                    .await
                {
                    warn!(
                        conversation_id = %conversation.id,
                        error = %e,
                        "Failed to record outbound message"
                    );
                }
                true
            }
            Ok(Err(e)) => {
                warn!(
                    conversation_id = %conversation.id,
                    error = %e,
                    "Transport send failed"
                );
                false
            }
            Err(_) => {
                warn!(conversation_id = %conversation.id, "Transport send timed out");
                false
            }
        }
    }
}

/// Treat blank and whitespace-only strings as absent.
fn non_trivial(text: Option<&str>) -> Option<&str> {
    text.map(str::trim).filter(|t| !t.is_empty())
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use chrono::{Duration, NaiveTime, TimeZone, Weekday};
    use uuid::Uuid;

    use super::*;
    use crate::dedup::MemoryDedup;
    use crate::dedup::StoreDedup;
    use crate::error::{IntegrationError, TransportError};
    use crate::integrations::{
        AssistantEngine, ConversationalBotEngine, ExternalDialogEngine, FlowBuilderEngine,
    };
    use crate::model::{DaySchedule, MenuOption};
    use crate::store::MemoryBackend;
    use crate::transport::MessageHandle;

    // ── Test doubles ────────────────────────────────────────────────

    /// Transport that records every send.
    #[derive(Default)]
    struct RecordingTransport {
        sent: Mutex<Vec<String>>,
        fail: bool,
    }

    impl RecordingTransport {
        fn failing() -> Self {
            Self {
                sent: Mutex::new(Vec::new()),
                fail: true,
            }
        }

        fn sent(&self) -> Vec<String> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn send_message(
            &self,
            channel_id: Uuid,
            _to: &str,
            content: &OutboundContent,
        ) -> std::result::Result<MessageHandle, TransportError> {
            if self.fail {
                return Err(TransportError::Disconnected { channel_id });
            }
            self.sent.lock().unwrap().push(content.text.clone());
            Ok(MessageHandle {
                id: Uuid::new_v4().to_string(),
            })
        }
    }

    /// Engine stubs that count invocations.
    #[derive(Default)]
    struct EngineCounters {
        flow: AtomicUsize,
        bot: AtomicUsize,
        assistant: AtomicUsize,
        dialog: AtomicUsize,
    }

    struct StubFlow(Arc<EngineCounters>);
    #[async_trait]
    impl FlowBuilderEngine for StubFlow {
        async fn continue_flow(
            &self,
            _conversation_id: Uuid,
            _message: &InboundMessage,
        ) -> std::result::Result<(), IntegrationError> {
            self.0.flow.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct StubBot(Arc<EngineCounters>);
    #[async_trait]
    impl ConversationalBotEngine for StubBot {
        async fn handle(
            &self,
            _conversation_id: Uuid,
            _message: &InboundMessage,
            _config: &serde_json::Value,
        ) -> std::result::Result<bool, IntegrationError> {
            self.0.bot.fetch_add(1, Ordering::SeqCst);
            Ok(true)
        }
    }

    struct StubAssistant(Arc<EngineCounters>);
    #[async_trait]
    impl AssistantEngine for StubAssistant {
        async fn respond(
            &self,
            _prompt_id: Uuid,
            _conversation_id: Uuid,
            _message: &InboundMessage,
        ) -> std::result::Result<(), IntegrationError> {
            self.0.assistant.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct StubDialog {
        counters: Arc<EngineCounters>,
        handled: bool,
    }
    #[async_trait]
    impl ExternalDialogEngine for StubDialog {
        async fn handle(
            &self,
            _conversation_id: Uuid,
            _message: &InboundMessage,
            _queue_names: &[String],
        ) -> std::result::Result<bool, IntegrationError> {
            self.counters.dialog.fetch_add(1, Ordering::SeqCst);
            Ok(self.handled)
        }
    }

    struct Fixture {
        store: Arc<MemoryBackend>,
        transport: Arc<RecordingTransport>,
        counters: Arc<EngineCounters>,
        dispatcher: Dispatcher,
        channel: Channel,
        conversation: Conversation,
    }

    fn integration_set(counters: &Arc<EngineCounters>, dialog_handled: bool) -> IntegrationSet {
        IntegrationSet {
            flow_builder: Arc::new(StubFlow(Arc::clone(counters))),
            bot: Arc::new(StubBot(Arc::clone(counters))),
            assistant: Arc::new(StubAssistant(Arc::clone(counters))),
            dialog: Arc::new(StubDialog {
                counters: Arc::clone(counters),
                handled: dialog_handled,
            }),
        }
    }

    async fn fixture_with(transport: RecordingTransport, dialog_handled: bool) -> Fixture {
        let store = Arc::new(MemoryBackend::new());
        let transport = Arc::new(transport);
        let counters = Arc::new(EngineCounters::default());
        let (events, _) = broadcast::channel(16);
        let config = EngineConfig::default();

        let dispatcher = Dispatcher::new(
            Arc::clone(&store) as Arc<dyn Database>,
            Arc::clone(&transport) as Arc<dyn Transport>,
            integration_set(&counters, dialog_handled),
            Arc::new(MemoryDedup::new(config.dedup_capacity)),
            Arc::new(StoreDedup::new(Arc::clone(&store) as Arc<dyn Database>)),
            events,
            config,
        );

        let tenant_id = Uuid::new_v4();
        let channel = Channel::new(tenant_id, "main");
        let conversation =
            Conversation::new(tenant_id, channel.id, Uuid::new_v4(), "+15550001");
        store.insert_channel(channel.clone()).await;
        store.insert_conversation(conversation.clone()).await;

        Fixture {
            store,
            transport,
            counters,
            dispatcher,
            channel,
            conversation,
        }
    }

    async fn fixture() -> Fixture {
        fixture_with(RecordingTransport::default(), false).await
    }

    fn integration(tenant_id: Uuid, kind: IntegrationKind) -> Integration {
        Integration {
            id: Uuid::new_v4(),
            tenant_id,
            name: format!("{} test", kind.as_str()),
            kind,
            config: serde_json::json!({}),
        }
    }

    fn two_queues(f: &Fixture) -> Vec<Queue> {
        vec![
            Queue::new(f.channel.tenant_id, f.channel.id, "Sales", 1),
            Queue::new(f.channel.tenant_id, f.channel.id, "Support", 2),
        ]
    }

    async fn dispatch(
        f: &mut Fixture,
        queues: &[Queue],
        body: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut message = InboundMessage::text(body);
        message.from = f.conversation.contact_address.clone();
        f.dispatcher
            .dispatch(&mut f.conversation, &f.channel, queues, &message, now)
            .await
    }

    // ── Sticky sessions ─────────────────────────────────────────────

    #[tokio::test]
    async fn sticky_flow_builder_forwards_without_sends() {
        let mut f = fixture().await;
        f.conversation.integration = Some(IntegrationBinding {
            integration_id: Uuid::new_v4(),
            kind: IntegrationKind::FlowBuilder,
        });
        let queues = two_queues(&f);

        dispatch(&mut f, &queues, "anything", Utc::now()).await.unwrap();

        assert_eq!(f.counters.flow.load(Ordering::SeqCst), 1);
        assert!(f.transport.sent().is_empty());
    }

    #[tokio::test]
    async fn sticky_assistant_is_fully_opaque() {
        let mut f = fixture().await;
        f.conversation.integration = Some(IntegrationBinding {
            integration_id: Uuid::new_v4(),
            kind: IntegrationKind::Assistant,
        });
        let queues = two_queues(&f);

        for body in ["hello", "1", "support"] {
            dispatch(&mut f, &queues, body, Utc::now()).await.unwrap();
        }

        assert!(f.conversation.assigned_queue_id.is_none());
        assert!(f.transport.sent().is_empty());
        assert_eq!(f.counters.assistant.load(Ordering::SeqCst), 0);
    }

    // ── Zero queues ─────────────────────────────────────────────────

    #[tokio::test]
    async fn no_queue_channel_integration_binds_and_forwards() {
        let mut f = fixture().await;
        let bot = integration(f.channel.tenant_id, IntegrationKind::ConversationalBot);
        f.channel.default_integration_id = Some(bot.id);
        f.store.insert_integration(bot.clone()).await;

        dispatch(&mut f, &[], "hi", Utc::now()).await.unwrap();

        assert_eq!(f.counters.bot.load(Ordering::SeqCst), 1);
        let binding = f.conversation.integration.unwrap();
        assert_eq!(binding.integration_id, bot.id);
        assert_eq!(binding.kind, IntegrationKind::ConversationalBot);
    }

    #[tokio::test]
    async fn no_queue_channel_prompt_goes_to_assistant() {
        let mut f = fixture().await;
        let prompt_id = Uuid::new_v4();
        f.channel.default_prompt_id = Some(prompt_id);

        dispatch(&mut f, &[], "hi", Utc::now()).await.unwrap();

        assert_eq!(f.counters.assistant.load(Ordering::SeqCst), 1);
        assert_eq!(f.conversation.prompt_id, Some(prompt_id));
    }

    #[tokio::test]
    async fn no_queue_no_integration_does_nothing() {
        let mut f = fixture().await;
        dispatch(&mut f, &[], "hi", Utc::now()).await.unwrap();
        assert!(f.transport.sent().is_empty());
        assert!(f.conversation.integration.is_none());
    }

    // ── Single queue ────────────────────────────────────────────────

    #[tokio::test]
    async fn single_plain_queue_assigns_and_sends_position() {
        let mut f = fixture().await;
        let queue = Queue::new(f.channel.tenant_id, f.channel.id, "Support", 1);
        f.store.insert_queue(queue.clone()).await;

        dispatch(&mut f, std::slice::from_ref(&queue), "hello", Utc::now())
            .await
            .unwrap();

        assert_eq!(f.conversation.status, ConversationStatus::Pending);
        assert_eq!(f.conversation.assigned_queue_id, Some(queue.id));
        let sent = f.transport.sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].contains("number 1"));
    }

    #[tokio::test]
    async fn channel_greeting_suppressed_by_recent_outbound() {
        let mut f = fixture().await;
        f.channel.greeting_message = Some("Welcome to Acme!".into());
        let queue = Queue::new(f.channel.tenant_id, f.channel.id, "Support", 1);

        // A send was recorded moments ago — greeting must not repeat.
        f.store
            .record_outbound_message(f.conversation.id, "earlier reply")
            .await
            .unwrap();

        dispatch(&mut f, std::slice::from_ref(&queue), "hello", Utc::now())
            .await
            .unwrap();

        let sent = f.transport.sent();
        assert!(sent.iter().all(|m| !m.contains("Welcome to Acme!")));
    }

    #[tokio::test]
    async fn channel_greeting_sent_when_history_is_quiet() {
        let mut f = fixture().await;
        f.channel.greeting_message = Some("Welcome to Acme!".into());
        let queue = Queue::new(f.channel.tenant_id, f.channel.id, "Support", 1);

        dispatch(&mut f, std::slice::from_ref(&queue), "hello", Utc::now())
            .await
            .unwrap();

        let sent = f.transport.sent();
        assert!(sent.iter().any(|m| m.contains("Welcome to Acme!")));
    }

    #[tokio::test]
    async fn single_queue_integration_binds_and_skips_assignment() {
        let mut f = fixture().await;
        let flow = integration(f.channel.tenant_id, IntegrationKind::FlowBuilder);
        f.store.insert_integration(flow.clone()).await;
        let mut queue = Queue::new(f.channel.tenant_id, f.channel.id, "Bot", 1);
        queue.integration_id = Some(flow.id);

        dispatch(&mut f, std::slice::from_ref(&queue), "hello", Utc::now())
            .await
            .unwrap();

        assert_eq!(f.counters.flow.load(Ordering::SeqCst), 1);
        assert!(f.conversation.integration.is_some());
        assert!(f.conversation.assigned_queue_id.is_none());
    }

    #[tokio::test]
    async fn group_chat_skips_integration_and_queues_normally() {
        let mut f = fixture().await;
        f.conversation.is_group = true;
        let flow = integration(f.channel.tenant_id, IntegrationKind::FlowBuilder);
        f.store.insert_integration(flow.clone()).await;
        let mut queue = Queue::new(f.channel.tenant_id, f.channel.id, "Bot", 1);
        queue.integration_id = Some(flow.id);

        dispatch(&mut f, std::slice::from_ref(&queue), "hello", Utc::now())
            .await
            .unwrap();

        assert_eq!(f.counters.flow.load(Ordering::SeqCst), 0);
        assert!(f.conversation.integration.is_none());
        assert_eq!(f.conversation.assigned_queue_id, Some(queue.id));
    }

    #[tokio::test]
    async fn single_queue_prompt_forwards_to_assistant() {
        let mut f = fixture().await;
        let prompt_id = Uuid::new_v4();
        let mut queue = Queue::new(f.channel.tenant_id, f.channel.id, "Concierge", 1);
        queue.prompt_id = Some(prompt_id);

        dispatch(&mut f, std::slice::from_ref(&queue), "hello", Utc::now())
            .await
            .unwrap();

        assert_eq!(f.counters.assistant.load(Ordering::SeqCst), 1);
        assert_eq!(f.conversation.prompt_id, Some(prompt_id));
        assert!(f.conversation.assigned_queue_id.is_none());
    }

    #[tokio::test]
    async fn external_dialog_unhandled_falls_through_to_assignment() {
        let mut f = fixture_with(RecordingTransport::default(), false).await;
        let dialog = integration(f.channel.tenant_id, IntegrationKind::ExternalDialog);
        f.store.insert_integration(dialog.clone()).await;
        let mut queue = Queue::new(f.channel.tenant_id, f.channel.id, "Desk", 1);
        queue.integration_id = Some(dialog.id);

        dispatch(&mut f, std::slice::from_ref(&queue), "hello", Utc::now())
            .await
            .unwrap();

        assert_eq!(f.counters.dialog.load(Ordering::SeqCst), 1);
        // Not handled: the queue path takes over.
        assert_eq!(f.conversation.assigned_queue_id, Some(queue.id));
    }

    #[tokio::test]
    async fn external_dialog_handled_finishes_the_turn() {
        let mut f = fixture_with(RecordingTransport::default(), true).await;
        let dialog = integration(f.channel.tenant_id, IntegrationKind::ExternalDialog);
        f.store.insert_integration(dialog.clone()).await;
        let mut queue = Queue::new(f.channel.tenant_id, f.channel.id, "Desk", 1);
        queue.integration_id = Some(dialog.id);

        dispatch(&mut f, std::slice::from_ref(&queue), "hello", Utc::now())
            .await
            .unwrap();

        assert_eq!(f.counters.dialog.load(Ordering::SeqCst), 1);
        assert!(f.conversation.assigned_queue_id.is_none());
        // Dialog is non-sticky.
        assert!(f.conversation.integration.is_none());
    }

    // ── Multi queue: menu cycle ─────────────────────────────────────

    #[tokio::test]
    async fn first_message_presents_numbered_menu() {
        let mut f = fixture().await;
        let queues = two_queues(&f);

        dispatch(&mut f, &queues, "hello", Utc::now()).await.unwrap();

        let sent = f.transport.sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].contains("[1] Sales"));
        assert!(sent[0].contains("[2] Support"));
        assert_eq!(f.conversation.bot_usage_count, 1);
        assert!(f.conversation.last_bot_activity_at.is_some());
    }

    #[tokio::test]
    async fn menu_reply_by_number_assigns_queue() {
        let mut f = fixture().await;
        let queues = two_queues(&f);
        let now = Utc::now();

        dispatch(&mut f, &queues, "hello", now).await.unwrap();
        dispatch(&mut f, &queues, "1", now + Duration::seconds(30))
            .await
            .unwrap();

        assert_eq!(f.conversation.status, ConversationStatus::Pending);
        assert_eq!(f.conversation.assigned_queue_id, Some(queues[0].id));
        assert_eq!(f.conversation.bot_usage_count, 0);
        let sent = f.transport.sent();
        assert!(sent.last().unwrap().contains("Sales"));
        assert!(sent.last().unwrap().contains("number 1"));
    }

    #[tokio::test]
    async fn menu_reply_by_name_assigns_queue() {
        let mut f = fixture().await;
        let queues = two_queues(&f);
        let now = Utc::now();

        dispatch(&mut f, &queues, "hello", now).await.unwrap();
        dispatch(&mut f, &queues, "support", now + Duration::seconds(30))
            .await
            .unwrap();

        assert_eq!(f.conversation.assigned_queue_id, Some(queues[1].id));
    }

    #[tokio::test]
    async fn first_message_is_not_treated_as_selection() {
        let mut f = fixture().await;
        let queues = two_queues(&f);

        // "2" would resolve as a selection, but no menu is outstanding.
        dispatch(&mut f, &queues, "2", Utc::now()).await.unwrap();

        assert!(f.conversation.assigned_queue_id.is_none());
        assert!(f.transport.sent()[0].contains("[1] Sales"));
    }

    #[tokio::test]
    async fn bot_cap_suppresses_fourth_menu() {
        let mut f = fixture().await;
        f.channel.max_bot_uses = 3;
        let queues = two_queues(&f);
        let now = Utc::now();

        for (i, body) in ["hello", "junk", "more junk", "again"].iter().enumerate() {
            dispatch(&mut f, &queues, body, now + Duration::seconds(i as i64))
                .await
                .unwrap();
        }

        // Three menus went out; the fourth message produced nothing.
        assert_eq!(f.transport.sent().len(), 3);
        assert_eq!(f.conversation.bot_usage_count, 3);
    }

    #[tokio::test]
    async fn cooldown_blocks_repeat_menu_but_not_first() {
        let mut f = fixture().await;
        f.channel.bot_cooldown_minutes = 60;
        let queues = two_queues(&f);
        let now = Utc::now();

        // First interaction is exempt even with a stale activity stamp.
        f.conversation.last_bot_activity_at = Some(now - Duration::minutes(1));
        dispatch(&mut f, &queues, "hello", now).await.unwrap();
        assert_eq!(f.transport.sent().len(), 1);

        // Second run inside the window is denied.
        dispatch(&mut f, &queues, "junk", now + Duration::minutes(5))
            .await
            .unwrap();
        assert_eq!(f.transport.sent().len(), 1);

        // And allowed once the window passes.
        dispatch(&mut f, &queues, "junk", now + Duration::minutes(61))
            .await
            .unwrap();
        assert_eq!(f.transport.sent().len(), 2);
    }

    #[tokio::test]
    async fn restricted_test_contact_disables_menu_for_others() {
        let mut f = fixture().await;
        f.store
            .set_setting(f.channel.tenant_id, SETTING_TEST_CONTACT, "+19990000")
            .await;
        let queues = two_queues(&f);

        dispatch(&mut f, &queues, "hello", Utc::now()).await.unwrap();
        assert!(f.transport.sent().is_empty());

        // The configured contact still gets the menu.
        f.conversation.contact_address = "+19990000".into();
        dispatch(&mut f, &queues, "hello", Utc::now()).await.unwrap();
        assert_eq!(f.transport.sent().len(), 1);
    }

    #[tokio::test]
    async fn failed_menu_send_does_not_count_usage() {
        let mut f = fixture_with(RecordingTransport::failing(), false).await;
        let queues = two_queues(&f);

        dispatch(&mut f, &queues, "hello", Utc::now()).await.unwrap();

        assert_eq!(f.conversation.bot_usage_count, 0);
        assert!(f.conversation.last_bot_activity_at.is_none());
    }

    // ── Menu selection outcomes ─────────────────────────────────────

    #[tokio::test]
    async fn out_of_hours_selection_clears_assignment_and_rate_limits() {
        let mut f = fixture().await;
        let mut queues = two_queues(&f);
        queues[0].out_of_hours_message = Some("We are closed, back Monday 9:00.".into());
        queues[0].schedule = vec![DaySchedule {
            weekday: Weekday::Mon,
            start: NaiveTime::parse_from_str("09:00", "%H:%M").unwrap(),
            end: NaiveTime::parse_from_str("18:00", "%H:%M").unwrap(),
        }];
        // Monday 20:00 UTC.
        let now = chrono::Utc.with_ymd_and_hms(2026, 8, 3, 20, 0, 0).unwrap();

        dispatch(&mut f, &queues, "hello", now).await.unwrap();
        dispatch(&mut f, &queues, "1", now + Duration::seconds(30))
            .await
            .unwrap();

        assert!(f.conversation.assigned_queue_id.is_none());
        let closed_count = |sent: &[String]| {
            sent.iter().filter(|m| m.contains("We are closed")).count()
        };
        assert_eq!(closed_count(&f.transport.sent()), 1);

        // Selecting again two minutes later: assignment cleared again,
        // but the notice is suppressed by the in-process dedup.
        dispatch(&mut f, &queues, "1", now + Duration::minutes(2))
            .await
            .unwrap();
        assert!(f.conversation.assigned_queue_id.is_none());
        assert_eq!(closed_count(&f.transport.sent()), 1);
    }

    #[tokio::test]
    async fn in_hours_selection_is_not_gated() {
        let mut f = fixture().await;
        let mut queues = two_queues(&f);
        queues[0].out_of_hours_message = Some("Closed.".into());
        queues[0].schedule = vec![DaySchedule {
            weekday: Weekday::Mon,
            start: NaiveTime::parse_from_str("09:00", "%H:%M").unwrap(),
            end: NaiveTime::parse_from_str("18:00", "%H:%M").unwrap(),
        }];
        // Monday 10:00 UTC.
        let now = chrono::Utc.with_ymd_and_hms(2026, 8, 3, 10, 0, 0).unwrap();

        dispatch(&mut f, &queues, "hello", now).await.unwrap();
        dispatch(&mut f, &queues, "1", now + Duration::seconds(30))
            .await
            .unwrap();

        assert_eq!(f.conversation.assigned_queue_id, Some(queues[0].id));
    }

    #[tokio::test]
    async fn selected_queue_greeting_and_media_are_sent() {
        let mut f = fixture().await;
        let mut queues = two_queues(&f);
        queues[1].greeting_message = Some("Support here, how can we help?".into());
        queues[1].media = Some(MediaAttachment {
            name: "faq.pdf".into(),
            url: "https://files.example/faq.pdf".into(),
        });
        let now = Utc::now();

        dispatch(&mut f, &queues, "hello", now).await.unwrap();
        dispatch(&mut f, &queues, "2", now + Duration::seconds(30))
            .await
            .unwrap();

        let sent = f.transport.sent();
        assert!(sent.iter().any(|m| m.contains("Support here")));
    }

    #[tokio::test]
    async fn submenu_queue_presents_options_then_answers() {
        let mut f = fixture().await;
        let mut queues = two_queues(&f);
        queues[1].menu_options = vec![
            MenuOption {
                title: "Opening hours".into(),
                body: "We are open 9:00-18:00, Monday to Friday.".into(),
            },
            MenuOption {
                title: "Address".into(),
                body: "1 Main Street.".into(),
            },
        ];
        let now = Utc::now();

        dispatch(&mut f, &queues, "hello", now).await.unwrap();
        dispatch(&mut f, &queues, "2", now + Duration::seconds(10))
            .await
            .unwrap();

        assert_eq!(f.conversation.assigned_queue_id, Some(queues[1].id));
        assert!(f.conversation.in_bot_menu);
        let sent = f.transport.sent();
        assert!(sent.last().unwrap().contains("[1] Opening hours"));

        // Option reply gets the canned body.
        dispatch(&mut f, &queues, "1", now + Duration::seconds(20))
            .await
            .unwrap();
        let sent = f.transport.sent();
        assert!(sent.last().unwrap().contains("We are open 9:00-18:00"));

        // Garbage inside the sub-menu is dropped.
        let before = f.transport.sent().len();
        dispatch(&mut f, &queues, "blah", now + Duration::seconds(30))
            .await
            .unwrap();
        assert_eq!(f.transport.sent().len(), before);
    }

    #[tokio::test]
    async fn selected_queue_with_integration_binds_instead_of_assigning() {
        let mut f = fixture().await;
        let flow = integration(f.channel.tenant_id, IntegrationKind::FlowBuilder);
        f.store.insert_integration(flow.clone()).await;
        let mut queues = two_queues(&f);
        queues[0].integration_id = Some(flow.id);
        let now = Utc::now();

        dispatch(&mut f, &queues, "hello", now).await.unwrap();
        dispatch(&mut f, &queues, "1", now + Duration::seconds(10))
            .await
            .unwrap();

        assert_eq!(f.counters.flow.load(Ordering::SeqCst), 1);
        assert!(f.conversation.integration.is_some());
        assert!(f.conversation.assigned_queue_id.is_none());
        // The position notice still goes out after a successful dispatch.
        assert!(f.transport.sent().last().unwrap().contains("number 1"));
    }

    #[tokio::test]
    async fn queued_conversation_without_submenu_is_left_alone() {
        let mut f = fixture().await;
        let queues = two_queues(&f);
        f.conversation.assigned_queue_id = Some(queues[0].id);
        f.conversation.status = ConversationStatus::Pending;

        dispatch(&mut f, &queues, "are you there?", Utc::now())
            .await
            .unwrap();

        assert!(f.transport.sent().is_empty());
    }
}
