//! Raw message bus abstraction and its in-memory implementation.
//!
//! [`MessageBus`] is the transport seam of the orchestrator: durable
//! per-recipient delivery keyed by `Message::to_id`, subscriptions that yield
//! a stream of envelopes, fan-out publishing, and queue preparation separated
//! from consumption. The broker-backed implementation lives in
//! [`amqp_bus`](crate::agentmesh::amqp_bus); [`InMemoryMessageBus`] is its
//! process-local equivalent for tests and embedded use.
//!
//! The bus is transport, not storage: conversation history is only retained
//! by the in-memory implementation so tests can assert delivery.
//!
//! # Example
//!
//! ```rust,no_run
//! use agentmesh::envelope::{Message, MessageType};
//! use agentmesh::message_bus::{InMemoryMessageBus, MessageBus};
//!
//! # async {
//! let bus = InMemoryMessageBus::new();
//!
//! // Sends before the recipient subscribes land in its pending queue.
//! let msg = Message::new("ai-orchestrator", "worker-1", "hello", MessageType::AiToAgent, "c1");
//! bus.send_message(msg.clone()).await.unwrap();
//!
//! let mut stream = bus.subscribe("worker-1").await.unwrap();
//! let delivered = stream.recv().await.unwrap();
//! assert_eq!(delivered, msg);
//! # };
//! ```

use crate::agentmesh::envelope::Message;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::error::Error;
use std::fmt;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::RwLock;

/// Participant ID of the AI planner's global reply queue.
pub const AI_ORCHESTRATOR_ID: &str = "ai-orchestrator";

/// Participant ID used by the execution variant of the engine.
pub const AI_EXECUTION_ID: &str = "ai-execution";

/// Per-message TTL applied by the broker implementation, in milliseconds.
pub const MESSAGE_TTL_MS: u64 = 300_000;

/// Bound of each subscriber's delivery channel. A full channel errors the
/// sender instead of blocking it.
pub const SUBSCRIBER_CHANNEL_CAPACITY: usize = 100;

/// Transport-level failures surfaced by bus operations.
#[derive(Debug, Clone)]
pub enum BusError {
    /// Establishing the broker connection failed.
    Connect(String),
    /// The bus is not connected (or has been closed).
    NotConnected,
    /// Publishing an envelope failed.
    Publish(String),
    /// The participant already holds an active subscription
    /// (in-memory bus only; the broker accepts repeated subscribes).
    AlreadySubscribed(String),
    /// The subscriber's delivery channel is full.
    SubscriberFull(String),
    /// No tracked consumer exists for the participant.
    NotSubscribed(String),
    /// Envelope could not be serialized for the wire.
    Serialization(String),
    /// Broker topology declaration failed.
    Topology(String),
}

impl fmt::Display for BusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BusError::Connect(msg) => write!(f, "bus connect failed: {}", msg),
            BusError::NotConnected => write!(f, "bus is not connected"),
            BusError::Publish(msg) => write!(f, "publish failed: {}", msg),
            BusError::AlreadySubscribed(id) => {
                write!(f, "participant '{}' is already subscribed", id)
            }
            BusError::SubscriberFull(id) => {
                write!(f, "subscriber channel for '{}' is full", id)
            }
            BusError::NotSubscribed(id) => {
                write!(f, "participant '{}' has no active subscription", id)
            }
            BusError::Serialization(msg) => write!(f, "envelope serialization failed: {}", msg),
            BusError::Topology(msg) => write!(f, "topology declaration failed: {}", msg),
        }
    }
}

impl Error for BusError {}

/// Durable per-recipient message transport.
///
/// Implementations route by `Message::to_id`, hand subscribers a bounded
/// channel of envelopes, and keep topology setup (`prepare_agent_queue`)
/// separate from consumption (`subscribe`).
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Route one envelope to its recipient's queue.
    async fn send_message(&self, msg: Message) -> Result<(), BusError>;

    /// Fan an envelope out to several recipients, re-keying a copy per
    /// recipient with a fresh envelope ID.
    async fn publish_message(&self, msg: &Message, recipients: &[String]) -> Result<(), BusError>;

    /// Start consuming the participant's queue. The returned channel closes
    /// when the subscription is cancelled or the bus shuts down.
    async fn subscribe(&self, participant_id: &str) -> Result<mpsc::Receiver<Message>, BusError>;

    /// Cancel the participant's tracked consumer.
    async fn unsubscribe(&self, participant_id: &str) -> Result<(), BusError>;

    /// Declare and bind the participant's queue without consuming from it.
    async fn prepare_agent_queue(&self, agent_id: &str) -> Result<(), BusError>;

    /// Envelopes recorded for a correlation ID. The broker implementation
    /// returns an empty list; the in-memory implementation returns stored
    /// copies for tests.
    async fn get_conversation_history(&self, correlation_id: &str)
        -> Result<Vec<Message>, BusError>;

    /// `Ok` while the bus can deliver, `Err` while disconnected.
    async fn health_check(&self) -> Result<(), BusError>;

    /// Shut the bus down, closing all subscriber streams.
    async fn close(&self) -> Result<(), BusError>;
}

#[derive(Default)]
struct InMemoryState {
    /// Active subscriber channels keyed by participant ID.
    subscribers: HashMap<String, mpsc::Sender<Message>>,
    /// Undelivered envelopes for prepared-but-unconsumed queues.
    pending: HashMap<String, VecDeque<Message>>,
    /// Dead-lettered envelopes keyed by `<recipient>.dlq`.
    dead_letters: HashMap<String, Vec<Message>>,
    /// Every envelope ever sent, for history lookups in tests.
    history: Vec<Message>,
    closed: bool,
}

/// Process-local [`MessageBus`] mirroring the broker semantics.
///
/// Differences from the broker implementation are deliberate and documented:
/// double-subscribing the same participant is a caller error here (the broker
/// tolerates it with fresh consumer tags), and conversation history is
/// retained so tests can assert on delivered envelopes.
pub struct InMemoryMessageBus {
    state: RwLock<InMemoryState>,
}

impl InMemoryMessageBus {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(InMemoryState::default()),
        }
    }

    /// Envelopes that were dead-lettered for the given recipient.
    pub async fn dead_letters(&self, recipient: &str) -> Vec<Message> {
        let state = self.state.read().await;
        state
            .dead_letters
            .get(&format!("{}.dlq", recipient))
            .cloned()
            .unwrap_or_default()
    }

    async fn dead_letter(state: &mut InMemoryState, msg: Message) {
        let key = format!("{}.dlq", msg.to_id);
        log::debug!(
            "dead-lettering envelope {} for '{}' (correlation {})",
            msg.id,
            msg.to_id,
            msg.correlation_id
        );
        state.dead_letters.entry(key).or_default().push(msg);
    }
}

impl Default for InMemoryMessageBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageBus for InMemoryMessageBus {
    async fn send_message(&self, msg: Message) -> Result<(), BusError> {
        let mut state = self.state.write().await;
        if state.closed {
            return Err(BusError::NotConnected);
        }

        state.history.push(msg.clone());

        if let Some(tx) = state.subscribers.get(&msg.to_id) {
            return match tx.try_send(msg) {
                Ok(()) => Ok(()),
                // Back-pressure is an error to the sender, never a block.
                Err(TrySendError::Full(rejected)) => {
                    Err(BusError::SubscriberFull(rejected.to_id))
                }
                Err(TrySendError::Closed(returned)) => {
                    // Receiver was dropped without unsubscribing; fall back
                    // to the pending queue like an unconsumed durable queue.
                    let recipient = returned.to_id.clone();
                    state.subscribers.remove(&recipient);
                    state.pending.entry(recipient).or_default().push_back(returned);
                    Ok(())
                }
            };
        }

        state
            .pending
            .entry(msg.to_id.clone())
            .or_default()
            .push_back(msg);
        Ok(())
    }

    async fn publish_message(&self, msg: &Message, recipients: &[String]) -> Result<(), BusError> {
        for recipient in recipients {
            self.send_message(msg.rekeyed_for(recipient.clone())).await?;
        }
        Ok(())
    }

    async fn subscribe(&self, participant_id: &str) -> Result<mpsc::Receiver<Message>, BusError> {
        let mut state = self.state.write().await;
        if state.closed {
            return Err(BusError::NotConnected);
        }
        if state.subscribers.contains_key(participant_id) {
            return Err(BusError::AlreadySubscribed(participant_id.to_string()));
        }

        let (tx, rx) = mpsc::channel(SUBSCRIBER_CHANNEL_CAPACITY);

        // Drain the pending queue first so pre-subscription sends are not
        // lost; overflow beyond the channel bound dead-letters.
        if let Some(mut queued) = state.pending.remove(participant_id) {
            while let Some(msg) = queued.pop_front() {
                if let Err(TrySendError::Full(overflow)) = tx.try_send(msg) {
                    Self::dead_letter(&mut state, overflow).await;
                }
            }
        }

        state.subscribers.insert(participant_id.to_string(), tx);
        log::debug!("in-memory subscription started for '{}'", participant_id);
        Ok(rx)
    }

    async fn unsubscribe(&self, participant_id: &str) -> Result<(), BusError> {
        let mut state = self.state.write().await;
        match state.subscribers.remove(participant_id) {
            Some(_) => Ok(()),
            None => Err(BusError::NotSubscribed(participant_id.to_string())),
        }
    }

    async fn prepare_agent_queue(&self, agent_id: &str) -> Result<(), BusError> {
        let mut state = self.state.write().await;
        if state.closed {
            return Err(BusError::NotConnected);
        }
        state.pending.entry(agent_id.to_string()).or_default();
        Ok(())
    }

    async fn get_conversation_history(
        &self,
        correlation_id: &str,
    ) -> Result<Vec<Message>, BusError> {
        let state = self.state.read().await;
        Ok(state
            .history
            .iter()
            .filter(|m| m.correlation_id == correlation_id)
            .cloned()
            .collect())
    }

    async fn health_check(&self) -> Result<(), BusError> {
        let state = self.state.read().await;
        if state.closed {
            Err(BusError::NotConnected)
        } else {
            Ok(())
        }
    }

    async fn close(&self) -> Result<(), BusError> {
        let mut state = self.state.write().await;
        state.closed = true;
        // Dropping the senders closes every subscriber stream.
        state.subscribers.clear();
        state.pending.clear();
        Ok(())
    }
}
