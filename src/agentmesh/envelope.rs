//! Conversational envelopes exchanged through the agent message bus.
//!
//! The wire type is [`Message`]: a flat JSON record with a unique envelope ID,
//! a correlation ID that groups request/response pairs, sender and recipient
//! keys, free-text content, a tagged [`MessageType`], and open metadata. A
//! single enum drives every routing policy — there is no envelope inheritance.
//!
//! On top of the raw envelope sit the typed shapes the orchestrator actually
//! speaks: [`AIToAgentMessage`], [`AgentToAIMessage`], [`AgentToAgentMessage`],
//! and [`UserToAIMessage`]. The typed bus converts between them and [`Message`]
//! at the send/receive boundary.
//!
//! # Example
//!
//! ```rust
//! use agentmesh::envelope::{Message, MessageType};
//!
//! let msg = Message::new(
//!     "ai-orchestrator",
//!     "text-processor",
//!     "Count the words in this text",
//!     MessageType::AiToAgent,
//!     "conv-user1-1234",
//! );
//!
//! assert_eq!(msg.to_id, "text-processor");
//! assert!(!msg.id.is_empty());
//!
//! // The wire payload is plain JSON with RFC-3339 UTC timestamps.
//! let json = serde_json::to_string(&msg).unwrap();
//! let back: Message = serde_json::from_str(&json).unwrap();
//! assert_eq!(back, msg);
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::error::Error;
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Default timeout applied to an AI→Agent request when the caller does not
/// override it.
pub const DEFAULT_AGENT_TIMEOUT: Duration = Duration::from_secs(30);

/// Semantic kind of an envelope. Routing policies switch on this enum; the
/// containers themselves carry no behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    /// A generic request awaiting a response.
    Request,
    /// A response to an earlier request with the same correlation ID.
    Response,
    /// A follow-up question asking the counterpart to clarify.
    Clarification,
    /// One-way informational message; no reply expected.
    Notification,
    /// Agent-to-agent coordination traffic.
    AgentToAgent,
    /// An instruction from the AI planner to a worker agent.
    AiToAgent,
    /// A worker agent's reply back to the AI planner.
    AgentToAi,
    /// Terminal message closing a dialogue.
    Completion,
    /// Event notifying that an agent finished an execution step.
    AgentCompleted,
    /// An error report travelling through the bus.
    Error,
    /// A standing instruction (configuration-style, not conversational).
    Instruction,
}

impl MessageType {
    /// Wire name of the variant, as used in broker headers and JSON bodies.
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Request => "REQUEST",
            MessageType::Response => "RESPONSE",
            MessageType::Clarification => "CLARIFICATION",
            MessageType::Notification => "NOTIFICATION",
            MessageType::AgentToAgent => "AGENT_TO_AGENT",
            MessageType::AiToAgent => "AI_TO_AGENT",
            MessageType::AgentToAi => "AGENT_TO_AI",
            MessageType::Completion => "COMPLETION",
            MessageType::AgentCompleted => "AGENT_COMPLETED",
            MessageType::Error => "ERROR",
            MessageType::Instruction => "INSTRUCTION",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Validation failures raised by envelope constructors and validators.
#[derive(Debug, Clone)]
pub enum EnvelopeError {
    /// A required field was empty.
    MissingField(&'static str),
}

impl fmt::Display for EnvelopeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnvelopeError::MissingField(field) => write!(f, "required field is empty: {}", field),
        }
    }
}

impl Error for EnvelopeError {}

/// The wire envelope exchanged through the raw message bus.
///
/// Invariants: `id` is globally unique, `correlation_id` groups a request with
/// its replies, and `to_id` is the recipient key the bus routes on. Envelopes
/// are created on send and destroyed after acknowledged delivery (or
/// dead-lettered).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Globally unique envelope ID (UUID v4).
    pub id: String,

    /// Correlation key tying this envelope to its request/response pair.
    pub correlation_id: String,

    /// Participant ID of the sender.
    pub from_id: String,

    /// Participant ID of the recipient; the bus routing key.
    pub to_id: String,

    /// Free-text payload.
    pub content: String,

    /// Semantic kind driving routing policy.
    pub message_type: MessageType,

    /// Open key-value metadata travelling with the envelope.
    #[serde(default)]
    pub metadata: HashMap<String, Value>,

    /// UTC creation time, serialized RFC-3339.
    pub timestamp: DateTime<Utc>,
}

impl Message {
    /// Create an envelope with a fresh UUID and the current UTC timestamp.
    pub fn new(
        from_id: impl Into<String>,
        to_id: impl Into<String>,
        content: impl Into<String>,
        message_type: MessageType,
        correlation_id: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            correlation_id: correlation_id.into(),
            from_id: from_id.into(),
            to_id: to_id.into(),
            content: content.into(),
            message_type,
            metadata: HashMap::new(),
            timestamp: Utc::now(),
        }
    }

    /// Attach a metadata entry (builder pattern).
    ///
    /// # Example
    ///
    /// ```rust
    /// use agentmesh::envelope::{Message, MessageType};
    ///
    /// let msg = Message::new("a", "b", "hi", MessageType::Notification, "c1")
    ///     .with_metadata("intent", "greeting");
    /// assert_eq!(msg.metadata["intent"], "greeting");
    /// ```
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Copy this envelope for a different recipient, with a fresh envelope ID.
    ///
    /// Used by fan-out publishing: every recipient gets its own uniquely
    /// identified copy while correlation and content are preserved.
    pub fn rekeyed_for(&self, recipient: impl Into<String>) -> Self {
        let mut copy = self.clone();
        copy.id = Uuid::new_v4().to_string();
        copy.to_id = recipient.into();
        copy
    }

    /// Check the envelope's required fields.
    pub fn validate(&self) -> Result<(), EnvelopeError> {
        if self.id.is_empty() {
            return Err(EnvelopeError::MissingField("id"));
        }
        if self.from_id.is_empty() {
            return Err(EnvelopeError::MissingField("from_id"));
        }
        if self.to_id.is_empty() {
            return Err(EnvelopeError::MissingField("to_id"));
        }
        Ok(())
    }
}

/// An instruction from the AI planner to a single worker agent.
///
/// Constructed by the engine after the AI emits a `SEND_EVENT:` directive and
/// converted to a raw [`Message`] by the typed bus.
#[derive(Debug, Clone)]
pub struct AIToAgentMessage {
    /// Target agent ID (the recipient queue key).
    pub agent_id: String,
    /// Natural-language instruction for the agent.
    pub content: String,
    /// The planner's goal for this instruction.
    pub intent: String,
    /// Correlation key the reply must carry.
    pub correlation_id: String,
    /// Context entries copied into envelope metadata (original request,
    /// user ID, requested action).
    pub context: HashMap<String, Value>,
    /// How long the planner will wait for the reply.
    pub timeout: Duration,
}

impl AIToAgentMessage {
    /// Create an instruction with the default 30-second reply timeout.
    pub fn new(
        agent_id: impl Into<String>,
        content: impl Into<String>,
        intent: impl Into<String>,
        correlation_id: impl Into<String>,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            content: content.into(),
            intent: intent.into(),
            correlation_id: correlation_id.into(),
            context: HashMap::new(),
            timeout: DEFAULT_AGENT_TIMEOUT,
        }
    }

    /// Attach a context entry (builder pattern).
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Override the reply timeout (builder pattern).
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// A worker agent's reply to the AI planner.
#[derive(Debug, Clone)]
pub struct AgentToAIMessage {
    /// ID of the replying agent.
    pub agent_id: String,
    /// Reply text.
    pub content: String,
    /// Kind of the reply envelope (normally [`MessageType::AgentToAi`]).
    pub message_type: MessageType,
    /// Correlation key matching the outstanding request.
    pub correlation_id: String,
    /// Envelope metadata carried along as reply context.
    pub context: HashMap<String, Value>,
    /// Whether the agent asked for help rather than completing the task.
    pub needs_help: bool,
}

impl AgentToAIMessage {
    /// Create a plain reply.
    pub fn new(
        agent_id: impl Into<String>,
        content: impl Into<String>,
        correlation_id: impl Into<String>,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            content: content.into(),
            message_type: MessageType::AgentToAi,
            correlation_id: correlation_id.into(),
            context: HashMap::new(),
            needs_help: false,
        }
    }

    /// Attach a context entry (builder pattern).
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Mark the reply as a help request (builder pattern).
    pub fn with_needs_help(mut self, needs_help: bool) -> Self {
        self.needs_help = needs_help;
        self
    }

    /// Project a raw envelope into a typed reply.
    ///
    /// Copies `from_id`, `content`, and `correlation_id`, takes the envelope
    /// metadata as the reply context, and reads an optional boolean
    /// `needs_help` metadata entry.
    pub fn from_envelope(envelope: &Message) -> Self {
        let needs_help = envelope
            .metadata
            .get("needs_help")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        Self {
            agent_id: envelope.from_id.clone(),
            content: envelope.content.clone(),
            message_type: envelope.message_type,
            correlation_id: envelope.correlation_id.clone(),
            context: envelope.metadata.clone(),
            needs_help,
        }
    }
}

/// Direct agent-to-agent coordination message.
#[derive(Debug, Clone)]
pub struct AgentToAgentMessage {
    /// Sending agent ID.
    pub from: String,
    /// Receiving agent ID.
    pub to: String,
    /// Message text.
    pub content: String,
    /// Correlation key shared by the coordination exchange.
    pub correlation_id: String,
    /// Context entries copied into envelope metadata.
    pub context: HashMap<String, Value>,
    /// Why the sender is contacting the receiver.
    pub purpose: String,
}

impl AgentToAgentMessage {
    pub fn new(
        from: impl Into<String>,
        to: impl Into<String>,
        content: impl Into<String>,
        correlation_id: impl Into<String>,
        purpose: impl Into<String>,
    ) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            content: content.into(),
            correlation_id: correlation_id.into(),
            context: HashMap::new(),
            purpose: purpose.into(),
        }
    }

    /// Attach a context entry (builder pattern).
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

/// A user request entering the orchestrator.
#[derive(Debug, Clone)]
pub struct UserToAIMessage {
    /// Stable user ID.
    pub user_id: String,
    /// The user's text.
    pub content: String,
    /// Correlation key for the conversation turn.
    pub correlation_id: String,
    /// Context entries copied into envelope metadata.
    pub context: HashMap<String, Value>,
    /// Detected or declared intent, if any.
    pub intent: String,
    /// Client session ID, if any.
    pub session_id: String,
}

impl UserToAIMessage {
    pub fn new(
        user_id: impl Into<String>,
        content: impl Into<String>,
        correlation_id: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            content: content.into(),
            correlation_id: correlation_id.into(),
            context: HashMap::new(),
            intent: String::new(),
            session_id: String::new(),
        }
    }

    /// Attach a context entry (builder pattern).
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Set the intent (builder pattern).
    pub fn with_intent(mut self, intent: impl Into<String>) -> Self {
        self.intent = intent.into();
        self
    }

    /// Set the session ID (builder pattern).
    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = session_id.into();
        self
    }
}

/// Event published when an agent finishes an execution step.
///
/// This is the bridge between the execution engine and the synthesis event
/// handler: the engine publishes one per stored agent reply, the handler
/// checks plan completeness on receipt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentCompletedEvent {
    /// Execution plan the step belongs to.
    pub plan_id: String,
    /// The completed step.
    pub step_id: String,
    /// The agent that completed it.
    pub agent_id: String,
}

impl AgentCompletedEvent {
    pub fn new(
        plan_id: impl Into<String>,
        step_id: impl Into<String>,
        agent_id: impl Into<String>,
    ) -> Self {
        Self {
            plan_id: plan_id.into(),
            step_id: step_id.into(),
            agent_id: agent_id.into(),
        }
    }
}

/// Bus-level session metadata grouping the participants of a conversation.
///
/// Carries no domain logic: the typed bus tracks these so that multi-turn
/// dialogues can be grouped and aged out, nothing more.
#[derive(Debug, Clone)]
pub struct ConversationContext {
    /// Stable conversation ID (usually the first correlation ID of the turn).
    pub conversation_id: String,
    /// Participant IDs seen in this conversation.
    pub participants: HashSet<String>,
    /// Free-form context entries.
    pub context: HashMap<String, Value>,
    /// When the conversation started.
    pub start_time: DateTime<Utc>,
    /// Last time any envelope touched this conversation.
    pub last_activity: DateTime<Utc>,
}

impl ConversationContext {
    /// Start a conversation with the given participants.
    pub fn new<I, S>(conversation_id: impl Into<String>, participants: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let now = Utc::now();
        Self {
            conversation_id: conversation_id.into(),
            participants: participants.into_iter().map(Into::into).collect(),
            context: HashMap::new(),
            start_time: now,
            last_activity: now,
        }
    }

    /// Record activity, refreshing `last_activity`.
    pub fn touch(&mut self) {
        self.last_activity = Utc::now();
    }

    /// Add a participant, returning whether it was new.
    pub fn add_participant(&mut self, participant_id: impl Into<String>) -> bool {
        self.participants.insert(participant_id.into())
    }

    /// Whether the given ID participates in this conversation.
    pub fn has_participant(&self, participant_id: &str) -> bool {
        self.participants.contains(participant_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_ids_are_unique() {
        let a = Message::new("x", "y", "one", MessageType::Request, "c1");
        let b = Message::new("x", "y", "two", MessageType::Request, "c1");
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn json_round_trip_preserves_all_kinds() {
        let kinds = [
            MessageType::Request,
            MessageType::Response,
            MessageType::Clarification,
            MessageType::Notification,
            MessageType::AgentToAgent,
            MessageType::AiToAgent,
            MessageType::AgentToAi,
            MessageType::Completion,
            MessageType::AgentCompleted,
            MessageType::Error,
            MessageType::Instruction,
        ];

        for kind in kinds.iter() {
            let msg = Message::new("from", "to", "payload", *kind, "corr-1")
                .with_metadata("k", "v");
            let json = serde_json::to_string(&msg).unwrap();
            let back: Message = serde_json::from_str(&json).unwrap();
            assert_eq!(back, msg);
        }
    }

    #[test]
    fn message_type_wire_names() {
        assert_eq!(MessageType::AiToAgent.as_str(), "AI_TO_AGENT");
        assert_eq!(MessageType::AgentCompleted.as_str(), "AGENT_COMPLETED");
        let json = serde_json::to_string(&MessageType::AgentToAi).unwrap();
        assert_eq!(json, "\"AGENT_TO_AI\"");
    }

    #[test]
    fn rekeyed_copy_gets_fresh_id() {
        let msg = Message::new("a", "b", "hi", MessageType::Notification, "c1");
        let copy = msg.rekeyed_for("c");
        assert_ne!(copy.id, msg.id);
        assert_eq!(copy.to_id, "c");
        assert_eq!(copy.correlation_id, msg.correlation_id);
        assert_eq!(copy.content, msg.content);
    }

    #[test]
    fn validate_rejects_empty_recipient() {
        let mut msg = Message::new("a", "b", "hi", MessageType::Request, "c1");
        msg.to_id.clear();
        assert!(msg.validate().is_err());
    }

    #[test]
    fn reply_projection_reads_needs_help() {
        let envelope = Message::new("worker-1", "ai-orchestrator", "done", MessageType::AgentToAi, "c9")
            .with_metadata("needs_help", true)
            .with_metadata("success", false);

        let reply = AgentToAIMessage::from_envelope(&envelope);
        assert_eq!(reply.agent_id, "worker-1");
        assert_eq!(reply.correlation_id, "c9");
        assert!(reply.needs_help);
        assert_eq!(reply.context["success"], false);
    }

    #[test]
    fn conversation_context_tracks_participants() {
        let mut ctx = ConversationContext::new("conv-1", vec!["ai-orchestrator", "worker-1"]);
        assert!(ctx.has_participant("worker-1"));
        assert!(ctx.add_participant("worker-2"));
        assert!(!ctx.add_participant("worker-2"));
        assert_eq!(ctx.participants.len(), 3);
    }

    #[test]
    fn completed_event_round_trips() {
        let event = AgentCompletedEvent::new("plan-1", "step-1", "worker-1");
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"plan_id\":\"plan-1\""));
        let back: AgentCompletedEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }
}
