//! AI conversation and execution engine.
//!
//! The engine is the planner-side driver of a dialogue: it prompts the AI
//! with the available agents and two strictly-shaped response formats, parses
//! the directive out of the AI's text, dispatches instructions through the
//! typed bus, and waits on the correlation tracker for each agent's reply.
//! It is stateless per call — everything a turn needs travels in the prompts
//! and the correlation registration.
//!
//! The AI may answer in exactly two shapes:
//!
//! ```text
//! SEND_EVENT:
//! Agent: <agent-id>
//! Action: <capability>
//! Content: <natural-language instruction>
//! Intent: <goal>
//! ```
//!
//! or
//!
//! ```text
//! USER_RESPONSE:
//! <text to return to the user>
//! ```
//!
//! Absence of both markers is a valid state, not an error: the raw AI text
//! is returned to the user verbatim.
//!
//! [`ExecutionEngine`] runs the same dialogue with per-step side effects: it
//! stores an [`AgentResult`] for every agent reply, advances the step through
//! its lifecycle, and publishes an `agent.completed` event for the synthesis
//! coordinator. All of those side effects are best-effort; only AI, bus-send,
//! and wait failures are fatal to the call.

use crate::agentmesh::ai_bus::AIMessageBus;
use crate::agentmesh::correlation::{
    conversation_correlation_id, execution_correlation_id, CorrelationTracker,
};
use crate::agentmesh::envelope::{AIToAgentMessage, AgentToAIMessage};
use crate::agentmesh::execution::{
    AgentResult, ExecutionPlanRepository, ResultStatus, StepStatus,
};
use crate::agentmesh::provider::AIProvider;
use crate::agentmesh::synthesis::publish_agent_completed_event;
use async_trait::async_trait;
use serde_json::Value;
use std::error::Error;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Result alias for engine entry points.
pub type EngineResult<T> = Result<T, Box<dyn Error + Send + Sync>>;

const SEND_EVENT_MARKER: &str = "SEND_EVENT:";
const USER_RESPONSE_MARKER: &str = "USER_RESPONSE:";

/// Default bound on AI<->agent round-trips within one user request.
pub const DEFAULT_MAX_TURNS: usize = 10;

/// Failures raised by the engine itself.
#[derive(Debug, Clone)]
pub enum EngineError {
    /// `process_with_agents` was called with an empty agent context.
    NoAgents,
    /// The AI provider call failed.
    Provider(String),
    /// Sending the agent instruction failed; fatal to the current call.
    Bus(String),
    /// Waiting for the agent's reply failed (timeout, cancellation, expiry).
    AgentWait {
        agent_id: String,
        correlation_id: String,
        reason: String,
    },
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::NoAgents => write!(f, "no agents available in the agent context"),
            EngineError::Provider(msg) => write!(f, "AI provider call failed: {}", msg),
            EngineError::Bus(msg) => write!(f, "agent message send failed: {}", msg),
            EngineError::AgentWait {
                agent_id,
                correlation_id,
                reason,
            } => write!(
                f,
                "agent '{}' did not answer request '{}': {}",
                agent_id, correlation_id, reason
            ),
        }
    }
}

impl Error for EngineError {}

/// One agent as presented to the AI planner.
#[derive(Debug, Clone)]
pub struct AgentDescriptor {
    /// Stable agent ID, also its queue key.
    pub id: String,
    /// What the agent can do, in prose the AI can reason about.
    pub description: String,
}

impl AgentDescriptor {
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
        }
    }
}

/// A parsed `SEND_EVENT:` directive.
#[derive(Debug, Clone, PartialEq)]
pub struct SendEventDirective {
    pub agent: String,
    pub action: String,
    pub content: String,
    pub intent: String,
}

/// A directive extracted from AI output. `None` from the parser means the
/// raw text stands as the user response.
#[derive(Debug, Clone, PartialEq)]
pub enum Directive {
    SendEvent(SendEventDirective),
    UserResponse(String),
}

/// Scan AI output for one of the two directive shapes.
///
/// `SEND_EVENT:` wins when present; a malformed event block (no agent) is
/// treated as "no directive". Labels match at line starts after trimming,
/// values accumulate across lines until the next known label, and unknown
/// labels are ignored.
pub fn parse_directive(text: &str) -> Option<Directive> {
    if text.contains(SEND_EVENT_MARKER) {
        return parse_send_event(text).map(Directive::SendEvent);
    }
    if text.contains(USER_RESPONSE_MARKER) {
        return Some(Directive::UserResponse(extract_user_response(text)));
    }
    None
}

#[derive(Clone, Copy, PartialEq)]
enum EventLabel {
    Agent,
    Action,
    Content,
    Intent,
}

fn parse_send_event(text: &str) -> Option<SendEventDirective> {
    let mut agent = String::new();
    let mut action = String::new();
    let mut content = String::new();
    let mut intent = String::new();
    let mut current: Option<EventLabel> = None;
    let mut in_block = false;

    for line in text.lines() {
        let trimmed = line.trim();
        if !in_block {
            in_block = trimmed.starts_with(SEND_EVENT_MARKER);
            continue;
        }

        let matched = [
            ("Agent:", EventLabel::Agent),
            ("Action:", EventLabel::Action),
            ("Content:", EventLabel::Content),
            ("Intent:", EventLabel::Intent),
        ]
        .iter()
        .find_map(|(prefix, label)| trimmed.strip_prefix(prefix).map(|rest| (*label, rest)));

        match (matched, current) {
            (Some((label, rest)), _) => {
                let target = match label {
                    EventLabel::Agent => &mut agent,
                    EventLabel::Action => &mut action,
                    EventLabel::Content => &mut content,
                    EventLabel::Intent => &mut intent,
                };
                *target = rest.trim().to_string();
                current = Some(label);
            }
            (None, Some(label)) if !trimmed.is_empty() => {
                // Continuation line of a multi-line value.
                let target = match label {
                    EventLabel::Agent => &mut agent,
                    EventLabel::Action => &mut action,
                    EventLabel::Content => &mut content,
                    EventLabel::Intent => &mut intent,
                };
                if !target.is_empty() {
                    target.push('\n');
                }
                target.push_str(trimmed);
            }
            _ => {}
        }
    }

    if agent.is_empty() {
        // Malformed event block: no target agent.
        return None;
    }
    Some(SendEventDirective {
        agent,
        action,
        content,
        intent,
    })
}

fn extract_user_response(text: &str) -> String {
    let start = match text.find(USER_RESPONSE_MARKER) {
        Some(idx) => idx + USER_RESPONSE_MARKER.len(),
        None => return text.trim().to_string(),
    };
    let after = &text[start..];
    // Extraction stops at a subsequent SEND_EVENT block.
    let end = after.find(SEND_EVENT_MARKER).unwrap_or(after.len());
    after[..end].trim().to_string()
}

fn build_system_prompt(agents: &[AgentDescriptor]) -> String {
    let mut prompt = String::from(
        "You are an AI orchestrator. You coordinate worker agents to fulfill \
         the user's request, then answer the user.\n\nAvailable agents:\n",
    );
    for agent in agents {
        prompt.push_str(&format!("- {}: {}\n", agent.id, agent.description));
    }
    prompt.push_str(
        "\nRespond in exactly one of these two shapes.\n\n\
         To instruct an agent:\n\
         SEND_EVENT:\n\
         Agent: <agent-id>\n\
         Action: <capability>\n\
         Content: <natural-language instruction>\n\
         Intent: <goal>\n\n\
         To answer the user:\n\
         USER_RESPONSE:\n\
         <text to return to the user>\n",
    );
    prompt
}

/// Correlation ID family used by an engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorrelationScope {
    /// `conv-<userID>-<uuid>` — interactive conversations.
    Conversation,
    /// `exec-<userID>-<uuid>` — execution-plan runs.
    Execution,
}

impl CorrelationScope {
    fn new_id(self, user_id: &str) -> String {
        match self {
            CorrelationScope::Conversation => conversation_correlation_id(user_id),
            CorrelationScope::Execution => execution_correlation_id(user_id),
        }
    }
}

/// Point where an agent instruction has been sent but not yet answered.
pub struct AgentDispatch<'a> {
    pub user_id: &'a str,
    pub correlation_id: &'a str,
    pub directive: &'a SendEventDirective,
}

/// A completed AI->agent->AI exchange.
pub struct AgentExchange<'a> {
    pub user_id: &'a str,
    pub correlation_id: &'a str,
    pub directive: &'a SendEventDirective,
    pub reply: &'a AgentToAIMessage,
}

/// Observer of dialogue progress. Both methods default to no-ops; the
/// execution engine hooks them for its per-step side effects.
#[async_trait]
pub trait DialogueObserver: Send + Sync {
    async fn on_agent_dispatch(&self, _dispatch: &AgentDispatch<'_>) {}
    async fn on_agent_reply(&self, _exchange: &AgentExchange<'_>) {}
}

/// Drives one AI dialogue with the worker agents.
pub struct ConversationEngine {
    provider: Arc<dyn AIProvider>,
    bus: Arc<AIMessageBus>,
    tracker: Arc<CorrelationTracker>,
    observer: Option<Arc<dyn DialogueObserver>>,
    scope: CorrelationScope,
    agent_timeout: Duration,
    max_turns: usize,
}

impl ConversationEngine {
    pub fn new(
        provider: Arc<dyn AIProvider>,
        bus: Arc<AIMessageBus>,
        tracker: Arc<CorrelationTracker>,
    ) -> Self {
        Self {
            provider,
            bus,
            tracker,
            observer: None,
            scope: CorrelationScope::Conversation,
            agent_timeout: crate::agentmesh::envelope::DEFAULT_AGENT_TIMEOUT,
            max_turns: DEFAULT_MAX_TURNS,
        }
    }

    /// Override the per-agent reply timeout (builder pattern).
    pub fn with_agent_timeout(mut self, timeout: Duration) -> Self {
        self.agent_timeout = timeout;
        self
    }

    /// Override the round-trip bound (builder pattern).
    pub fn with_max_turns(mut self, max_turns: usize) -> Self {
        self.max_turns = max_turns;
        self
    }

    /// Attach a dialogue observer (builder pattern).
    pub fn with_observer(mut self, observer: Arc<dyn DialogueObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Select the correlation ID family (builder pattern).
    pub fn with_correlation_scope(mut self, scope: CorrelationScope) -> Self {
        self.scope = scope;
        self
    }

    /// Fulfill one user request, dispatching to agents as the AI directs.
    ///
    /// Loops AI call -> directive -> agent round-trip until the AI answers
    /// with `USER_RESPONSE:` (or with no directive at all, in which case the
    /// raw AI text is returned). Each agent round-trip registers a fresh
    /// correlation ID before the send and is cleaned up on every exit path.
    pub async fn process_with_agents(
        &self,
        ctx: &CancellationToken,
        user_input: &str,
        user_id: &str,
        agents: &[AgentDescriptor],
    ) -> EngineResult<String> {
        if agents.is_empty() {
            return Err(Box::new(EngineError::NoAgents));
        }

        let system_prompt = build_system_prompt(agents);
        let mut prompt = user_input.to_string();
        let mut transcript = String::new();
        let mut last_response = String::new();

        for turn in 1..=self.max_turns {
            let response = self
                .provider
                .call_ai(&system_prompt, &prompt)
                .await
                .map_err(|e| EngineError::Provider(e.to_string()))?;

            match parse_directive(&response) {
                None => return Ok(response),
                Some(Directive::UserResponse(text)) => return Ok(text),
                Some(Directive::SendEvent(directive)) => {
                    let reply = self
                        .run_agent_round_trip(ctx, user_input, user_id, &directive)
                        .await?;

                    log::info!(
                        "turn {}: agent '{}' answered ({} chars)",
                        turn,
                        directive.agent,
                        reply.content.len()
                    );

                    transcript.push_str(&format!(
                        "\nAgent '{}' replied:\n{}\n",
                        directive.agent, reply.content
                    ));
                    prompt = format!(
                        "{}\n{}\nEither instruct another agent with SEND_EVENT: or \
                         answer the user with USER_RESPONSE:.",
                        user_input, transcript
                    );
                    last_response = response;
                }
            }
        }

        log::warn!(
            "dialogue for user '{}' hit the {}-turn bound without USER_RESPONSE",
            user_id,
            self.max_turns
        );
        Ok(last_response)
    }

    /// Send one instruction and wait for the correlated reply.
    async fn run_agent_round_trip(
        &self,
        ctx: &CancellationToken,
        user_input: &str,
        user_id: &str,
        directive: &SendEventDirective,
    ) -> EngineResult<AgentToAIMessage> {
        let correlation_id = self.scope.new_id(user_id);

        // Register before the send so a fast reply cannot race the waiter.
        let mut rx = self
            .tracker
            .register_request(&correlation_id, user_id, self.agent_timeout)
            .await;

        let outbound = AIToAgentMessage::new(
            &directive.agent,
            &directive.content,
            &directive.intent,
            &correlation_id,
        )
        .with_timeout(self.agent_timeout)
        .with_context("user_request", user_input)
        .with_context("user_id", user_id)
        .with_context("action", directive.action.clone());

        if let Err(e) = self.bus.send_to_agent(&outbound).await {
            self.tracker.cleanup_request(&correlation_id).await;
            return Err(Box::new(EngineError::Bus(e.to_string())));
        }

        if let Some(observer) = &self.observer {
            observer
                .on_agent_dispatch(&AgentDispatch {
                    user_id,
                    correlation_id: &correlation_id,
                    directive,
                })
                .await;
        }

        let reply = self
            .tracker
            .await_response(&correlation_id, &mut rx, ctx, self.agent_timeout)
            .await
            .map_err(|e| EngineError::AgentWait {
                agent_id: directive.agent.clone(),
                correlation_id: correlation_id.clone(),
                reason: e.to_string(),
            })?;

        if let Some(observer) = &self.observer {
            observer
                .on_agent_reply(&AgentExchange {
                    user_id,
                    correlation_id: &correlation_id,
                    directive,
                    reply: &reply,
                })
                .await;
        }

        Ok(reply)
    }
}

/// Plan/step binding for an execution run, passed explicitly through the
/// agent context. When absent, the engine falls back to using the
/// correlation ID as the step ID.
#[derive(Debug, Clone)]
pub struct ExecutionTask {
    pub plan_id: String,
    pub step_id: String,
}

impl ExecutionTask {
    pub fn new(plan_id: impl Into<String>, step_id: impl Into<String>) -> Self {
        Self {
            plan_id: plan_id.into(),
            step_id: step_id.into(),
        }
    }
}

/// Execution variant of the engine: same dialogue, plus per-step recording.
///
/// After every agent reply it stores an [`AgentResult`] (status derived from
/// the reply context: `success: false` means `Failed`), advances the bound
/// step to `Completed`, and publishes an `agent.completed` event. Storage and
/// publish failures are logged and never fail the dialog.
pub struct ExecutionEngine {
    provider: Arc<dyn AIProvider>,
    bus: Arc<AIMessageBus>,
    tracker: Arc<CorrelationTracker>,
    repository: Arc<dyn ExecutionPlanRepository>,
    agent_timeout: Duration,
    max_turns: usize,
}

impl ExecutionEngine {
    pub fn new(
        provider: Arc<dyn AIProvider>,
        bus: Arc<AIMessageBus>,
        tracker: Arc<CorrelationTracker>,
        repository: Arc<dyn ExecutionPlanRepository>,
    ) -> Self {
        Self {
            provider,
            bus,
            tracker,
            repository,
            agent_timeout: crate::agentmesh::envelope::DEFAULT_AGENT_TIMEOUT,
            max_turns: DEFAULT_MAX_TURNS,
        }
    }

    /// Override the per-agent reply timeout (builder pattern).
    pub fn with_agent_timeout(mut self, timeout: Duration) -> Self {
        self.agent_timeout = timeout;
        self
    }

    /// Override the round-trip bound (builder pattern).
    pub fn with_max_turns(mut self, max_turns: usize) -> Self {
        self.max_turns = max_turns;
        self
    }

    /// Run one execution-plan step dialogue.
    pub async fn process_execution(
        &self,
        ctx: &CancellationToken,
        user_input: &str,
        user_id: &str,
        agents: &[AgentDescriptor],
        task: Option<ExecutionTask>,
    ) -> EngineResult<String> {
        let recorder = Arc::new(ExecutionRecorder {
            repository: Arc::clone(&self.repository),
            bus: Arc::clone(&self.bus),
            task,
        });

        let engine = ConversationEngine::new(
            Arc::clone(&self.provider),
            Arc::clone(&self.bus),
            Arc::clone(&self.tracker),
        )
        .with_correlation_scope(CorrelationScope::Execution)
        .with_agent_timeout(self.agent_timeout)
        .with_max_turns(self.max_turns)
        .with_observer(recorder);

        engine
            .process_with_agents(ctx, user_input, user_id, agents)
            .await
    }
}

/// Observer that records execution side effects for each exchange.
struct ExecutionRecorder {
    repository: Arc<dyn ExecutionPlanRepository>,
    bus: Arc<AIMessageBus>,
    task: Option<ExecutionTask>,
}

#[async_trait]
impl DialogueObserver for ExecutionRecorder {
    async fn on_agent_dispatch(&self, dispatch: &AgentDispatch<'_>) {
        let task = match &self.task {
            Some(task) => task,
            None => return,
        };
        // March the step toward Executing; a step that is already past a
        // stage re-asserts it as a no-op.
        for status in [StepStatus::Assigned, StepStatus::Executing].iter() {
            if let Err(e) = self.repository.update_step(&task.step_id, *status).await {
                log::warn!(
                    "step '{}' -> {} failed (correlation {}): {}",
                    task.step_id,
                    status,
                    dispatch.correlation_id,
                    e
                );
            }
        }
    }

    async fn on_agent_reply(&self, exchange: &AgentExchange<'_>) {
        let step_id = self
            .task
            .as_ref()
            .map(|t| t.step_id.clone())
            // Fallback: the correlation ID doubles as the step ID.
            .unwrap_or_else(|| exchange.correlation_id.to_string());

        let failed = exchange.reply.context.get("success").and_then(Value::as_bool)
            == Some(false);
        let status = if failed {
            ResultStatus::Failed
        } else {
            ResultStatus::Success
        };

        match AgentResult::new(&step_id, &exchange.reply.agent_id, &exchange.reply.content, status)
        {
            Ok(result) => {
                if let Err(e) = self.repository.store_agent_result(&result).await {
                    log::warn!("storing result for step '{}' failed: {}", step_id, e);
                }
            }
            Err(e) => log::warn!("could not build result for step '{}': {}", step_id, e),
        }

        let task = match &self.task {
            Some(task) => task,
            None => {
                log::debug!(
                    "no execution task bound for correlation '{}'; skipping completion event",
                    exchange.correlation_id
                );
                return;
            }
        };

        if let Err(e) = self
            .repository
            .update_step(&task.step_id, StepStatus::Completed)
            .await
        {
            log::warn!("step '{}' -> COMPLETED failed: {}", task.step_id, e);
        }

        if let Err(e) = publish_agent_completed_event(
            &self.bus,
            &task.plan_id,
            &task.step_id,
            &exchange.reply.agent_id,
        )
        .await
        {
            log::warn!(
                "agent.completed publish failed for plan '{}': {}",
                task.plan_id,
                e
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_event_takes_precedence_and_parses_labels() {
        let text = "Thinking...\nSEND_EVENT:\nAgent: text-processor\nAction: count\n\
                    Content: Count the words\nIntent: word count";
        match parse_directive(text) {
            Some(Directive::SendEvent(d)) => {
                assert_eq!(d.agent, "text-processor");
                assert_eq!(d.action, "count");
                assert_eq!(d.content, "Count the words");
                assert_eq!(d.intent, "word count");
            }
            other => panic!("expected SendEvent, got {:?}", other),
        }
    }

    #[test]
    fn multi_line_values_accumulate_until_the_next_label() {
        let text = "SEND_EVENT:\nAgent: worker\nContent: first line\nsecond line\n\
                    third line\nIntent: done";
        match parse_directive(text) {
            Some(Directive::SendEvent(d)) => {
                assert_eq!(d.content, "first line\nsecond line\nthird line");
                assert_eq!(d.intent, "done");
            }
            other => panic!("expected SendEvent, got {:?}", other),
        }
    }

    #[test]
    fn labels_match_after_leading_whitespace() {
        let text = "SEND_EVENT:\n  Agent: worker\n\tAction: run";
        match parse_directive(text) {
            Some(Directive::SendEvent(d)) => {
                assert_eq!(d.agent, "worker");
                assert_eq!(d.action, "run");
            }
            other => panic!("expected SendEvent, got {:?}", other),
        }
    }

    #[test]
    fn event_without_agent_is_no_directive() {
        let text = "SEND_EVENT:\nAction: run\nContent: something";
        assert_eq!(parse_directive(text), None);
    }

    #[test]
    fn user_response_is_extracted() {
        let text = "USER_RESPONSE:\nThe text contains 3 words.";
        assert_eq!(
            parse_directive(text),
            Some(Directive::UserResponse(
                "The text contains 3 words.".to_string()
            ))
        );
    }

    #[test]
    fn user_response_stops_at_a_subsequent_send_event() {
        let text = "USER_RESPONSE:\nHere is the answer.\nSEND_EVENT:\nAgent: w";
        // SEND_EVENT is present, so it wins; drop it and the extraction rule
        // is observable.
        let extracted = extract_user_response("USER_RESPONSE:\nHere is the answer.\nTrailing");
        assert_eq!(extracted, "Here is the answer.\nTrailing");
        match parse_directive(text) {
            Some(Directive::SendEvent(d)) => assert_eq!(d.agent, "w"),
            other => panic!("expected SendEvent, got {:?}", other),
        }

        let stops = extract_user_response(
            "USER_RESPONSE:\nVisible part.\nSEND_EVENT:\nAgent: hidden",
        );
        assert_eq!(stops, "Visible part.");
    }

    #[test]
    fn absent_markers_mean_verbatim_text() {
        assert_eq!(parse_directive("Just some plain prose."), None);
    }

    #[test]
    fn unknown_labels_inside_an_event_become_continuations() {
        let text = "SEND_EVENT:\nAgent: worker\nContent: line one\nNote: extra detail";
        match parse_directive(text) {
            Some(Directive::SendEvent(d)) => {
                assert_eq!(d.agent, "worker");
                assert_eq!(d.content, "line one\nNote: extra detail");
            }
            other => panic!("expected SendEvent, got {:?}", other),
        }
    }

    #[test]
    fn system_prompt_enumerates_agents_and_shapes() {
        let agents = vec![
            AgentDescriptor::new("text-processor", "Counts and transforms text"),
            AgentDescriptor::new("mailer", "Sends email"),
        ];
        let prompt = build_system_prompt(&agents);
        assert!(prompt.contains("- text-processor: Counts and transforms text"));
        assert!(prompt.contains("- mailer: Sends email"));
        assert!(prompt.contains("SEND_EVENT:"));
        assert!(prompt.contains("USER_RESPONSE:"));
    }
}
