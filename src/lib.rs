// src/lib.rs

// Import the top-level `agentmesh` module.
pub mod agentmesh;

// Surface the submodules at the crate root so callers write
// agentmesh::envelope::Message instead of agentmesh::agentmesh::envelope::Message.
pub use crate::agentmesh::{
    ai_bus, amqp_bus, consumer, coordinator, correlation, engine, envelope, execution,
    message_bus, provider, synthesis,
};

// Re-exporting key items for easier external access.
pub use crate::agentmesh::ai_bus::{AIMessageBus, GraphHook};
pub use crate::agentmesh::consumer::GlobalMessageConsumer;
pub use crate::agentmesh::coordinator::{ExecutionCoordinator, ExecutionStats};
pub use crate::agentmesh::correlation::CorrelationTracker;
pub use crate::agentmesh::engine::{
    AgentDescriptor, ConversationEngine, ExecutionEngine, ExecutionTask,
};
pub use crate::agentmesh::envelope::{
    AIToAgentMessage, AgentCompletedEvent, AgentToAIMessage, Message, MessageType,
};
pub use crate::agentmesh::execution::{
    AgentResult, ExecutionPlanRepository, InMemoryPlanRepository, ResultStatus, StepStatus,
};
pub use crate::agentmesh::message_bus::{BusError, InMemoryMessageBus, MessageBus};
pub use crate::agentmesh::provider::AIProvider;
pub use crate::agentmesh::synthesis::{
    publish_agent_completed_event, ResultSynthesizer, SynthesisEventHandler,
};
