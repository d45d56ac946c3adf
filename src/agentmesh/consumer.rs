//! Single global subscriber that demultiplexes agent replies.
//!
//! Exactly one [`GlobalMessageConsumer`] subscribes to the planner's queue
//! (`ai-orchestrator` by default). Every inbound `AGENT_TO_AI` envelope is
//! projected to an [`AgentToAIMessage`] and handed to the
//! [`CorrelationTracker`]; everything else is skipped. Per-request listeners
//! are never created against the broker — this one loop is what lets the
//! core hold many concurrent conversations over a single consumer.

use crate::agentmesh::ai_bus::AIMessageBus;
use crate::agentmesh::correlation::CorrelationTracker;
use crate::agentmesh::envelope::{AgentToAIMessage, Message, MessageType};
use crate::agentmesh::message_bus::{BusError, AI_ORCHESTRATOR_ID};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Demultiplexes the planner's reply queue into the correlation tracker.
pub struct GlobalMessageConsumer {
    bus: Arc<AIMessageBus>,
    tracker: Arc<CorrelationTracker>,
    participant_id: String,
}

impl GlobalMessageConsumer {
    pub fn new(bus: Arc<AIMessageBus>, tracker: Arc<CorrelationTracker>) -> Self {
        Self {
            bus,
            tracker,
            participant_id: AI_ORCHESTRATOR_ID.to_string(),
        }
    }

    /// Consume a different participant queue, e.g. `ai-execution`
    /// (builder pattern).
    pub fn with_participant_id(mut self, participant_id: impl Into<String>) -> Self {
        self.participant_id = participant_id.into();
        self
    }

    /// Subscribe and loop until the context is cancelled or the upstream
    /// stream closes.
    pub async fn run(&self, ctx: CancellationToken) -> Result<(), BusError> {
        let mut stream = self.bus.subscribe(&self.participant_id).await?;
        log::info!("global consumer started on '{}'", self.participant_id);

        loop {
            tokio::select! {
                _ = ctx.cancelled() => break,
                next = stream.recv() => match next {
                    Some(envelope) => self.dispatch(envelope).await,
                    None => {
                        log::warn!(
                            "subscription stream for '{}' closed",
                            self.participant_id
                        );
                        break;
                    }
                }
            }
        }

        log::info!("global consumer on '{}' stopped", self.participant_id);
        Ok(())
    }

    /// Spawn [`run`](Self::run) on the runtime.
    pub fn spawn(self: Arc<Self>, ctx: CancellationToken) -> JoinHandle<Result<(), BusError>> {
        tokio::spawn(async move { self.run(ctx).await })
    }

    async fn dispatch(&self, envelope: Message) {
        if envelope.message_type != MessageType::AgentToAi {
            log::debug!(
                "ignoring {} envelope {} on '{}'",
                envelope.message_type,
                envelope.id,
                self.participant_id
            );
            return;
        }

        let reply = AgentToAIMessage::from_envelope(&envelope);
        let routed = self.tracker.route_response(reply).await;
        if routed {
            log::debug!(
                "delivered reply for correlation '{}' from '{}'",
                envelope.correlation_id,
                envelope.from_id
            );
        } else {
            log::debug!(
                "reply for correlation '{}' had no waiter",
                envelope.correlation_id
            );
        }
    }
}
