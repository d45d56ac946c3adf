//! Typed conversational layer over the raw [`MessageBus`].
//!
//! [`AIMessageBus`] is what the rest of the orchestrator talks to: it turns
//! the typed shapes from [`envelope`](crate::agentmesh::envelope) into wire
//! envelopes, stamps sender IDs and fresh envelope IDs, runs the optional
//! best-effort [`GraphHook`], and forwards to the underlying transport.
//! Subscriptions and queue preparation delegate straight through.
//!
//! Logging is centralized here: intent, correlation ID, and payload length at
//! info level; payload contents only at debug level.

use crate::agentmesh::envelope::{
    AIToAgentMessage, AgentToAIMessage, AgentToAgentMessage, ConversationContext, Message,
    MessageType, UserToAIMessage,
};
use crate::agentmesh::message_bus::{BusError, MessageBus, AI_ORCHESTRATOR_ID};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::error::Error;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::RwLock;

/// Best-effort observer invoked for every envelope the typed bus sends.
///
/// Collaborators use this to mirror bus traffic into a graph store. Failures
/// are logged and never fail the send.
#[async_trait]
pub trait GraphHook: Send + Sync {
    async fn store_message(&self, envelope: &Message) -> Result<(), Box<dyn Error + Send + Sync>>;
}

/// Typed send/receive facade over a [`MessageBus`].
pub struct AIMessageBus {
    bus: Arc<dyn MessageBus>,
    graph_hook: Option<Arc<dyn GraphHook>>,
    /// Bus-level conversation sessions, metadata only.
    conversations: RwLock<HashMap<String, ConversationContext>>,
}

impl AIMessageBus {
    pub fn new(bus: Arc<dyn MessageBus>) -> Self {
        Self {
            bus,
            graph_hook: None,
            conversations: RwLock::new(HashMap::new()),
        }
    }

    /// Attach a graph hook (builder pattern).
    pub fn with_graph_hook(mut self, hook: Arc<dyn GraphHook>) -> Self {
        self.graph_hook = Some(hook);
        self
    }

    /// Send an AI planner instruction to a worker agent.
    pub async fn send_to_agent(&self, msg: &AIToAgentMessage) -> Result<(), BusError> {
        let mut envelope = Message::new(
            AI_ORCHESTRATOR_ID,
            &msg.agent_id,
            &msg.content,
            MessageType::AiToAgent,
            &msg.correlation_id,
        );
        envelope.metadata = msg.context.clone();
        envelope
            .metadata
            .insert("intent".to_string(), Value::from(msg.intent.clone()));
        envelope.metadata.insert(
            "timeout_secs".to_string(),
            Value::from(msg.timeout.as_secs()),
        );

        log::info!(
            "AI -> agent '{}': intent='{}' correlation={} len={}",
            msg.agent_id,
            msg.intent,
            msg.correlation_id,
            msg.content.len()
        );
        self.send_envelope(envelope).await
    }

    /// Send a worker agent's reply back to the AI planner.
    pub async fn send_to_ai(&self, msg: &AgentToAIMessage) -> Result<(), BusError> {
        let mut envelope = Message::new(
            &msg.agent_id,
            AI_ORCHESTRATOR_ID,
            &msg.content,
            msg.message_type,
            &msg.correlation_id,
        );
        envelope.metadata = msg.context.clone();
        if msg.needs_help {
            envelope
                .metadata
                .insert("needs_help".to_string(), Value::from(true));
        }

        log::info!(
            "agent '{}' -> AI: correlation={} needs_help={} len={}",
            msg.agent_id,
            msg.correlation_id,
            msg.needs_help,
            msg.content.len()
        );
        self.send_envelope(envelope).await
    }

    /// Send a direct agent-to-agent coordination message.
    pub async fn send_agent_to_agent(&self, msg: &AgentToAgentMessage) -> Result<(), BusError> {
        let mut envelope = Message::new(
            &msg.from,
            &msg.to,
            &msg.content,
            MessageType::AgentToAgent,
            &msg.correlation_id,
        );
        envelope.metadata = msg.context.clone();
        envelope
            .metadata
            .insert("purpose".to_string(), Value::from(msg.purpose.clone()));

        log::info!(
            "agent '{}' -> agent '{}': purpose='{}' correlation={}",
            msg.from,
            msg.to,
            msg.purpose,
            msg.correlation_id
        );
        self.send_envelope(envelope).await
    }

    /// Send a user request to the AI planner.
    pub async fn send_user_to_ai(&self, msg: &UserToAIMessage) -> Result<(), BusError> {
        let mut envelope = Message::new(
            &msg.user_id,
            AI_ORCHESTRATOR_ID,
            &msg.content,
            MessageType::Request,
            &msg.correlation_id,
        );
        envelope.metadata = msg.context.clone();
        if !msg.intent.is_empty() {
            envelope
                .metadata
                .insert("intent".to_string(), Value::from(msg.intent.clone()));
        }
        if !msg.session_id.is_empty() {
            envelope
                .metadata
                .insert("session_id".to_string(), Value::from(msg.session_id.clone()));
        }

        log::info!(
            "user '{}' -> AI: correlation={} len={}",
            msg.user_id,
            msg.correlation_id,
            msg.content.len()
        );
        self.send_envelope(envelope).await
    }

    /// Send a pre-built envelope through the hook, logging, and transport.
    ///
    /// The typed senders above all funnel through here; helpers that need an
    /// unusual envelope shape (such as the agent-completed event publisher)
    /// use it directly.
    pub async fn send_envelope(&self, envelope: Message) -> Result<(), BusError> {
        log::debug!(
            "envelope {} [{}] '{}' -> '{}': {}",
            envelope.id,
            envelope.message_type,
            envelope.from_id,
            envelope.to_id,
            envelope.content
        );

        if let Some(hook) = &self.graph_hook {
            // Best-effort: a failing hook must never fail the dialog.
            if let Err(e) = hook.store_message(&envelope).await {
                log::warn!("graph hook failed for envelope {}: {}", envelope.id, e);
            }
        }

        self.touch_conversation_for(&envelope).await;
        self.bus.send_message(envelope).await
    }

    /// Start consuming a participant's queue. Delegates to the transport.
    pub async fn subscribe(&self, participant_id: &str) -> Result<mpsc::Receiver<Message>, BusError> {
        self.bus.subscribe(participant_id).await
    }

    /// Cancel a participant's consumer. Delegates to the transport.
    pub async fn unsubscribe(&self, participant_id: &str) -> Result<(), BusError> {
        self.bus.unsubscribe(participant_id).await
    }

    /// Declare a participant's queue without consuming. Delegates to the
    /// transport.
    pub async fn prepare_agent_queue(&self, agent_id: &str) -> Result<(), BusError> {
        self.bus.prepare_agent_queue(agent_id).await
    }

    /// Envelopes recorded for a correlation ID (transport-dependent).
    pub async fn get_conversation_history(
        &self,
        correlation_id: &str,
    ) -> Result<Vec<Message>, BusError> {
        self.bus.get_conversation_history(correlation_id).await
    }

    /// `Ok` while the underlying transport is healthy.
    pub async fn health_check(&self) -> Result<(), BusError> {
        self.bus.health_check().await
    }

    /// Register a conversation session for grouping multi-turn dialogues.
    pub async fn track_conversation<I, S>(&self, conversation_id: &str, participants: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let ctx = ConversationContext::new(conversation_id, participants);
        self.conversations
            .write()
            .await
            .insert(conversation_id.to_string(), ctx);
    }

    /// Snapshot of a tracked conversation, if any.
    pub async fn conversation(&self, conversation_id: &str) -> Option<ConversationContext> {
        self.conversations.read().await.get(conversation_id).cloned()
    }

    async fn touch_conversation_for(&self, envelope: &Message) {
        let mut conversations = self.conversations.write().await;
        if let Some(ctx) = conversations.get_mut(&envelope.correlation_id) {
            ctx.add_participant(envelope.from_id.clone());
            ctx.add_participant(envelope.to_id.clone());
            ctx.touch();
        }
    }
}
