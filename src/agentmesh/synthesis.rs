//! AI-driven synthesis of stored execution results.
//!
//! When the last step of a plan completes, the per-step [`AgentResult`]s are
//! turned into one user-facing report by the AI. Three pieces cooperate:
//!
//! - [`publish_agent_completed_event`] — called by the execution engine after
//!   each stored reply; puts an `agent.completed` event on the
//!   `synthesis-coordination` channel.
//! - [`SynthesisEventHandler`] — listens on that channel, asks the
//!   coordinator whether the plan is now complete, and triggers synthesis at
//!   most once per plan (single-flight guard).
//! - [`ResultSynthesizer`] — loads the plan's results and asks the AI for an
//!   executive-summary-led report.
//!
//! One poison event must never kill the listener: malformed payloads and
//! handler errors are logged and the loop continues.

use crate::agentmesh::ai_bus::AIMessageBus;
use crate::agentmesh::coordinator::ExecutionCoordinator;
use crate::agentmesh::envelope::{AgentCompletedEvent, Message, MessageType};
use crate::agentmesh::execution::{ExecutionPlanRepository, SynthesisContext};
use crate::agentmesh::message_bus::{BusError, AI_EXECUTION_ID};
use crate::agentmesh::provider::AIProvider;
use std::collections::HashSet;
use std::error::Error;
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Participant ID of the synthesis coordination channel.
pub const SYNTHESIS_COORDINATION_ID: &str = "synthesis-coordination";

/// Failures raised while synthesizing a plan's results.
#[derive(Debug, Clone)]
pub enum SynthesisError {
    /// The plan has no stored results to synthesize.
    NoResults(String),
    /// The AI returned empty or whitespace-only output.
    EmptyResponse(String),
    /// Loading results from the repository failed.
    Repository(String),
    /// The AI provider call failed.
    Provider(String),
    /// The assembled synthesis context failed validation.
    InvalidContext(String),
}

impl fmt::Display for SynthesisError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SynthesisError::NoResults(plan_id) => {
                write!(f, "no agent results stored for plan '{}'", plan_id)
            }
            SynthesisError::EmptyResponse(plan_id) => {
                write!(f, "AI produced an empty synthesis for plan '{}'", plan_id)
            }
            SynthesisError::Repository(msg) => write!(f, "loading results failed: {}", msg),
            SynthesisError::Provider(msg) => write!(f, "synthesis AI call failed: {}", msg),
            SynthesisError::InvalidContext(msg) => {
                write!(f, "synthesis context rejected: {}", msg)
            }
        }
    }
}

impl Error for SynthesisError {}

/// Publish an `agent.completed` event to the synthesis coordination channel.
///
/// The envelope carries `message_type = AGENT_COMPLETED`, correlation
/// `synthesis-<plan_id>`, and the event fields mirrored into metadata so
/// observers need not parse the body.
pub async fn publish_agent_completed_event(
    bus: &AIMessageBus,
    plan_id: &str,
    step_id: &str,
    agent_id: &str,
) -> Result<(), BusError> {
    let event = AgentCompletedEvent::new(plan_id, step_id, agent_id);
    let payload =
        serde_json::to_string(&event).map_err(|e| BusError::Serialization(e.to_string()))?;

    let envelope = Message::new(
        AI_EXECUTION_ID,
        SYNTHESIS_COORDINATION_ID,
        payload,
        MessageType::AgentCompleted,
        format!("synthesis-{}", plan_id),
    )
    .with_metadata("event_type", "agent.completed")
    .with_metadata("plan_id", plan_id)
    .with_metadata("step_id", step_id)
    .with_metadata("agent_id", agent_id);

    log::info!(
        "publishing agent.completed for plan '{}' step '{}' (agent '{}')",
        plan_id,
        step_id,
        agent_id
    );
    bus.send_envelope(envelope).await
}

/// Turns a plan's stored [`AgentResult`](crate::agentmesh::execution::AgentResult)s
/// into one report via the AI.
pub struct ResultSynthesizer {
    provider: Arc<dyn AIProvider>,
    repository: Arc<dyn ExecutionPlanRepository>,
}

impl ResultSynthesizer {
    pub fn new(
        provider: Arc<dyn AIProvider>,
        repository: Arc<dyn ExecutionPlanRepository>,
    ) -> Self {
        Self {
            provider,
            repository,
        }
    }

    /// Load every stored result of the plan and synthesize a report.
    ///
    /// Fails when no results are stored and when the AI answers with
    /// whitespace only.
    pub async fn synthesize_results(&self, plan_id: &str) -> Result<String, SynthesisError> {
        let results = self
            .repository
            .get_agent_results_by_execution_plan(plan_id)
            .await
            .map_err(|e| SynthesisError::Repository(e.to_string()))?;
        if results.is_empty() {
            return Err(SynthesisError::NoResults(plan_id.to_string()));
        }

        let total = results.len();
        let successful = results
            .iter()
            .filter(|r| r.status == crate::agentmesh::execution::ResultStatus::Success)
            .count();
        let context = SynthesisContext::new(plan_id, results)
            .with_metadata("total_results", serde_json::json!(total))
            .with_metadata("successful_results", serde_json::json!(successful));
        context
            .validate()
            .map_err(|e| SynthesisError::InvalidContext(e.to_string()))?;

        let system_prompt = "You are synthesizing the results of a completed execution plan \
             into a single report for the user. Lead with an executive summary. \
             Weave the per-agent outcomes into one coherent narrative — do not \
             simply concatenate them. Reference each agent by its ID, state each \
             result's status and timestamp, incorporate the structured metadata, \
             and acknowledge any failures explicitly.";

        let mut user_prompt = format!(
            "Execution plan: {}\nTotal results: {}\nSuccessful results: {}\n\n",
            context.execution_plan_id,
            context.results.len(),
            successful
        );
        for result in &context.results {
            user_prompt.push_str(&format!(
                "Agent: {}\nStep: {}\nStatus: {}\nTimestamp: {}\nMetadata: {}\nOutput:\n{}\n\n",
                result.agent_id,
                result.execution_step_id,
                result.status,
                result.timestamp.to_rfc3339(),
                serde_json::to_string(&result.metadata).unwrap_or_else(|_| "{}".to_string()),
                result.content
            ));
        }

        let text = self
            .provider
            .call_ai(system_prompt, &user_prompt)
            .await
            .map_err(|e| SynthesisError::Provider(e.to_string()))?;
        if text.trim().is_empty() {
            return Err(SynthesisError::EmptyResponse(plan_id.to_string()));
        }

        log::info!(
            "synthesized {} result(s) for plan '{}' into {} chars",
            context.results.len(),
            plan_id,
            text.len()
        );
        Ok(text)
    }
}

/// Reacts to `agent.completed` events and triggers synthesis exactly once
/// per plan.
pub struct SynthesisEventHandler {
    coordinator: Arc<ExecutionCoordinator>,
    bus: Arc<AIMessageBus>,
    participant_id: String,
    /// Plans whose synthesis already succeeded. Guarded by an async mutex
    /// held across the synthesis call, so two racing completion events
    /// cannot both trigger it.
    synthesized: Mutex<HashSet<String>>,
}

impl SynthesisEventHandler {
    pub fn new(coordinator: Arc<ExecutionCoordinator>, bus: Arc<AIMessageBus>) -> Self {
        Self {
            coordinator,
            bus,
            participant_id: SYNTHESIS_COORDINATION_ID.to_string(),
            synthesized: Mutex::new(HashSet::new()),
        }
    }

    /// Listen on a different coordination channel (builder pattern).
    pub fn with_participant_id(mut self, participant_id: impl Into<String>) -> Self {
        self.participant_id = participant_id.into();
        self
    }

    /// Handle one completion event.
    ///
    /// Returns the synthesized report when this event completed the plan and
    /// won the single-flight race; an empty string otherwise. Coordinator and
    /// synthesis errors propagate — a failed synthesis leaves the plan
    /// unmarked so a later event can retry it.
    pub async fn handle_agent_completed(
        &self,
        event: &AgentCompletedEvent,
    ) -> Result<String, Box<dyn Error + Send + Sync>> {
        let mut synthesized = self.synthesized.lock().await;
        if synthesized.contains(&event.plan_id) {
            log::debug!("plan '{}' already synthesized; ignoring event", event.plan_id);
            return Ok(String::new());
        }

        if !self
            .coordinator
            .is_execution_plan_complete(&event.plan_id)
            .await?
        {
            log::debug!(
                "plan '{}' not yet complete after step '{}'",
                event.plan_id,
                event.step_id
            );
            return Ok(String::new());
        }

        let text = self
            .coordinator
            .trigger_synthesis_when_complete(&event.plan_id)
            .await?;
        if !text.is_empty() {
            synthesized.insert(event.plan_id.clone());
        }
        Ok(text)
    }

    /// Subscribe to the coordination channel and dispatch completion events
    /// until the context is cancelled or the stream closes.
    pub async fn start_event_listener(&self, ctx: CancellationToken) -> Result<(), BusError> {
        let mut stream = self.bus.subscribe(&self.participant_id).await?;
        log::info!("synthesis event listener started on '{}'", self.participant_id);

        loop {
            tokio::select! {
                _ = ctx.cancelled() => break,
                next = stream.recv() => match next {
                    Some(envelope) => self.dispatch(envelope).await,
                    None => break,
                }
            }
        }

        log::info!("synthesis event listener stopped");
        Ok(())
    }

    async fn dispatch(&self, envelope: Message) {
        if envelope.message_type != MessageType::AgentCompleted {
            return;
        }

        let event: AgentCompletedEvent = match serde_json::from_str(&envelope.content) {
            Ok(event) => event,
            Err(e) => {
                // Malformed payloads are skipped, not fatal.
                log::warn!(
                    "malformed agent.completed payload on envelope {}: {}",
                    envelope.id,
                    e
                );
                return;
            }
        };

        match self.handle_agent_completed(&event).await {
            Ok(text) if !text.is_empty() => {
                log::info!(
                    "plan '{}' synthesized after step '{}' ({} chars)",
                    event.plan_id,
                    event.step_id,
                    text.len()
                );
            }
            Ok(_) => {}
            Err(e) => {
                // One failing event must not kill the listener.
                log::error!(
                    "handling agent.completed for plan '{}' failed: {}",
                    event.plan_id,
                    e
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agentmesh::execution::{
        AgentResult, ExecutionStep, InMemoryPlanRepository, ResultStatus, StepStatus,
    };
    use crate::agentmesh::message_bus::InMemoryMessageBus;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingProvider {
        calls: AtomicUsize,
        response: String,
    }

    impl CountingProvider {
        fn new(response: &str) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                response: response.to_string(),
            }
        }
    }

    #[async_trait]
    impl AIProvider for CountingProvider {
        async fn call_ai(
            &self,
            _system_prompt: &str,
            _user_prompt: &str,
        ) -> Result<String, Box<dyn Error + Send + Sync>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.response.clone())
        }
    }

    async fn seed_completed_step(repo: &InMemoryPlanRepository, plan: &str, step: &str) {
        repo.insert_step(ExecutionStep::new(step, plan, 1, "step", "agent"))
            .await;
        repo.update_step(step, StepStatus::Assigned).await.unwrap();
        repo.update_step(step, StepStatus::Executing).await.unwrap();
        repo.update_step(step, StepStatus::Completed).await.unwrap();
        let result = AgentResult::new(step, "agent", "output", ResultStatus::Success).unwrap();
        repo.store_agent_result(&result).await.unwrap();
    }

    #[tokio::test]
    async fn synthesize_fails_without_results() {
        let repo = Arc::new(InMemoryPlanRepository::new());
        let provider = Arc::new(CountingProvider::new("report"));
        let synthesizer = ResultSynthesizer::new(provider, repo);

        match synthesizer.synthesize_results("empty-plan").await {
            Err(SynthesisError::NoResults(plan)) => assert_eq!(plan, "empty-plan"),
            other => panic!("expected NoResults, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn synthesize_rejects_whitespace_output() {
        let repo = Arc::new(InMemoryPlanRepository::new());
        seed_completed_step(&repo, "plan-1", "s1").await;

        let provider = Arc::new(CountingProvider::new("   \n  "));
        let synthesizer = ResultSynthesizer::new(provider, repo);

        assert!(matches!(
            synthesizer.synthesize_results("plan-1").await,
            Err(SynthesisError::EmptyResponse(_))
        ));
    }

    #[tokio::test]
    async fn synthesis_prompt_carries_agent_results() {
        struct PromptCapture(Mutex<String>);

        #[async_trait]
        impl AIProvider for PromptCapture {
            async fn call_ai(
                &self,
                _system_prompt: &str,
                user_prompt: &str,
            ) -> Result<String, Box<dyn Error + Send + Sync>> {
                *self.0.lock().await = user_prompt.to_string();
                Ok("report".to_string())
            }
        }

        let repo = Arc::new(InMemoryPlanRepository::new());
        seed_completed_step(&repo, "plan-1", "s1").await;

        let capture = Arc::new(PromptCapture(Mutex::new(String::new())));
        let synthesizer = ResultSynthesizer::new(capture.clone(), repo);
        synthesizer.synthesize_results("plan-1").await.unwrap();

        let prompt = capture.0.lock().await.clone();
        assert!(prompt.contains("Agent: agent"));
        assert!(prompt.contains("Status: SUCCESS"));
        assert!(prompt.contains("output"));
    }

    #[tokio::test]
    async fn handler_synthesizes_once_per_plan() {
        let repo = Arc::new(InMemoryPlanRepository::new());
        seed_completed_step(&repo, "plan-1", "s1").await;

        let provider = Arc::new(CountingProvider::new("the report"));
        let synthesizer = Arc::new(ResultSynthesizer::new(provider.clone(), repo.clone()));
        let coordinator = Arc::new(ExecutionCoordinator::new(repo, synthesizer));
        let bus = Arc::new(AIMessageBus::new(Arc::new(InMemoryMessageBus::new())));
        let handler = SynthesisEventHandler::new(coordinator, bus);

        let event = AgentCompletedEvent::new("plan-1", "s1", "agent");
        let first = handler.handle_agent_completed(&event).await.unwrap();
        let second = handler.handle_agent_completed(&event).await.unwrap();

        assert_eq!(first, "the report");
        assert_eq!(second, "");
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn listener_skips_malformed_payloads_and_keeps_going() {
        let repo = Arc::new(InMemoryPlanRepository::new());
        seed_completed_step(&repo, "plan-1", "s1").await;

        let provider = Arc::new(CountingProvider::new("the report"));
        let synthesizer = Arc::new(ResultSynthesizer::new(provider.clone(), repo.clone()));
        let coordinator = Arc::new(ExecutionCoordinator::new(repo, synthesizer));
        let raw = Arc::new(InMemoryMessageBus::new());
        let bus = Arc::new(AIMessageBus::new(raw.clone()));
        let handler = Arc::new(SynthesisEventHandler::new(coordinator, bus.clone()));

        let ctx = CancellationToken::new();
        let listener = {
            let handler = handler.clone();
            let ctx = ctx.clone();
            tokio::spawn(async move { handler.start_event_listener(ctx).await })
        };

        // Poison event first: AGENT_COMPLETED type but garbage body.
        let poison = Message::new(
            AI_EXECUTION_ID,
            SYNTHESIS_COORDINATION_ID,
            "not json at all",
            MessageType::AgentCompleted,
            "synthesis-plan-1",
        );
        bus.send_envelope(poison).await.unwrap();

        // Then a real one; the listener must still be alive to process it.
        publish_agent_completed_event(&bus, "plan-1", "s1", "agent")
            .await
            .unwrap();

        // Give the listener a moment to drain both envelopes.
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);

        ctx.cancel();
        listener.await.unwrap().unwrap();
    }
}
