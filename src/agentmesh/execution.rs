//! Read-side execution model: plans, steps, stored agent results.
//!
//! The core never owns plan persistence — a collaborator implements
//! [`ExecutionPlanRepository`] — but it reads step statuses, writes
//! [`AgentResult`]s, and advances steps through the canonical state machine
//! `Pending -> Assigned -> Executing -> Completed`. Completion of a plan is
//! always derived from these records, never stored on the plan itself.
//!
//! [`InMemoryPlanRepository`] is a reference implementation used by the
//! integration tests and by embedders that have no graph store.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Alias for collaborator-defined repository errors.
pub type RepositoryResult<T> = Result<T, Box<dyn Error + Send + Sync>>;

/// Validation and state-machine failures from the execution model.
#[derive(Debug, Clone)]
pub enum DomainError {
    /// A required field was empty.
    MissingField(&'static str),
    /// A status string did not name a known value.
    UnknownStatus(String),
    /// A step status change violated the state machine.
    IllegalTransition { from: StepStatus, to: StepStatus },
    /// A referenced step does not exist.
    StepNotFound(String),
    /// A synthesis context failed validation.
    InvalidSynthesisContext(&'static str),
}

impl fmt::Display for DomainError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DomainError::MissingField(field) => write!(f, "required field is empty: {}", field),
            DomainError::UnknownStatus(s) => write!(f, "unknown status value: {}", s),
            DomainError::IllegalTransition { from, to } => {
                write!(f, "illegal step transition {} -> {}", from, to)
            }
            DomainError::StepNotFound(id) => write!(f, "execution step not found: {}", id),
            DomainError::InvalidSynthesisContext(reason) => {
                write!(f, "invalid synthesis context: {}", reason)
            }
        }
    }
}

impl Error for DomainError {}

/// Outcome of one agent execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResultStatus {
    Success,
    Failed,
    Partial,
}

impl ResultStatus {
    /// Parse a wire status string. Unknown values are a validation error.
    pub fn parse(value: &str) -> Result<Self, DomainError> {
        match value {
            "SUCCESS" => Ok(ResultStatus::Success),
            "FAILED" => Ok(ResultStatus::Failed),
            "PARTIAL" => Ok(ResultStatus::Partial),
            other => Err(DomainError::UnknownStatus(other.to_string())),
        }
    }
}

impl fmt::Display for ResultStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResultStatus::Success => f.write_str("SUCCESS"),
            ResultStatus::Failed => f.write_str("FAILED"),
            ResultStatus::Partial => f.write_str("PARTIAL"),
        }
    }
}

/// The persisted outcome of one step/agent execution.
///
/// `status == Success` is the sole condition under which the step counts as
/// done toward synthesis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentResult {
    /// Generated result ID (UUID v4).
    pub id: String,
    /// The execution step this result belongs to.
    pub execution_step_id: String,
    /// The agent that produced it.
    pub agent_id: String,
    /// The agent's output.
    pub content: String,
    /// Outcome classification.
    pub status: ResultStatus,
    /// Free-form metadata (agent-reported context, tallies).
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
    /// UTC creation time.
    pub timestamp: DateTime<Utc>,
}

impl AgentResult {
    /// Create a validated result with a generated ID and current timestamp.
    pub fn new(
        execution_step_id: impl Into<String>,
        agent_id: impl Into<String>,
        content: impl Into<String>,
        status: ResultStatus,
    ) -> Result<Self, DomainError> {
        let execution_step_id = execution_step_id.into();
        let agent_id = agent_id.into();
        if execution_step_id.is_empty() {
            return Err(DomainError::MissingField("execution_step_id"));
        }
        if agent_id.is_empty() {
            return Err(DomainError::MissingField("agent_id"));
        }
        Ok(Self {
            id: Uuid::new_v4().to_string(),
            execution_step_id,
            agent_id,
            content: content.into(),
            status,
            metadata: HashMap::new(),
            timestamp: Utc::now(),
        })
    }

    /// Attach a metadata entry (builder pattern).
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Lifecycle of an execution step. The canonical path is
/// `Pending -> Assigned -> Executing -> Completed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    Pending,
    Assigned,
    Executing,
    Completed,
    Failed,
}

impl StepStatus {
    /// Whether moving to `next` is a legal transition. Re-asserting the
    /// current status is a no-op, not a violation.
    pub fn can_transition_to(self, next: StepStatus) -> bool {
        if self == next {
            return true;
        }
        matches!(
            (self, next),
            (StepStatus::Pending, StepStatus::Assigned)
                | (StepStatus::Assigned, StepStatus::Executing)
                | (StepStatus::Executing, StepStatus::Completed)
                | (StepStatus::Assigned, StepStatus::Failed)
                | (StepStatus::Executing, StepStatus::Failed)
        )
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StepStatus::Pending => "PENDING",
            StepStatus::Assigned => "ASSIGNED",
            StepStatus::Executing => "EXECUTING",
            StepStatus::Completed => "COMPLETED",
            StepStatus::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

/// Read-side view of one step of an execution plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionStep {
    pub id: String,
    pub plan_id: String,
    pub step_number: usize,
    pub description: String,
    pub assigned_agent: String,
    pub status: StepStatus,
}

impl ExecutionStep {
    pub fn new(
        id: impl Into<String>,
        plan_id: impl Into<String>,
        step_number: usize,
        description: impl Into<String>,
        assigned_agent: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            plan_id: plan_id.into(),
            step_number,
            description: description.into(),
            assigned_agent: assigned_agent.into(),
            status: StepStatus::Pending,
        }
    }
}

/// Read-side view of an execution plan. Completion is derived from steps and
/// stored results, never recorded here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub id: String,
    pub name: String,
    pub steps: Vec<ExecutionStep>,
}

/// The material handed to the result synthesizer: every stored result of a
/// plan, in step order.
#[derive(Debug, Clone)]
pub struct SynthesisContext {
    pub execution_plan_id: String,
    pub results: Vec<AgentResult>,
    pub created_at: DateTime<Utc>,
    pub metadata: HashMap<String, Value>,
}

impl SynthesisContext {
    pub fn new(execution_plan_id: impl Into<String>, results: Vec<AgentResult>) -> Self {
        Self {
            execution_plan_id: execution_plan_id.into(),
            results,
            created_at: Utc::now(),
            metadata: HashMap::new(),
        }
    }

    /// Attach a metadata entry (builder pattern).
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Check the context invariants: non-empty plan ID and a real timestamp.
    pub fn validate(&self) -> Result<(), DomainError> {
        if self.execution_plan_id.is_empty() {
            return Err(DomainError::InvalidSynthesisContext("empty plan id"));
        }
        if self.created_at == Utc.timestamp_opt(0, 0).unwrap() {
            return Err(DomainError::InvalidSynthesisContext("zero timestamp"));
        }
        Ok(())
    }

    /// Only the results that completed successfully.
    pub fn get_successful_results(&self) -> Vec<&AgentResult> {
        self.results
            .iter()
            .filter(|r| r.status == ResultStatus::Success)
            .collect()
    }
}

/// Persistence seam for plans, steps, and agent results. Implemented by an
/// external collaborator; [`InMemoryPlanRepository`] is the reference.
#[async_trait]
pub trait ExecutionPlanRepository: Send + Sync {
    /// All steps of a plan, in step order.
    async fn get_steps_by_plan_id(&self, plan_id: &str) -> RepositoryResult<Vec<ExecutionStep>>;

    /// Stored results for one step.
    async fn get_agent_results_by_execution_step(
        &self,
        step_id: &str,
    ) -> RepositoryResult<Vec<AgentResult>>;

    /// Stored results for a whole plan, in step order.
    async fn get_agent_results_by_execution_plan(
        &self,
        plan_id: &str,
    ) -> RepositoryResult<Vec<AgentResult>>;

    /// Persist one agent result.
    async fn store_agent_result(&self, result: &AgentResult) -> RepositoryResult<()>;

    /// Advance a step's status. Illegal transitions fail.
    async fn update_step(&self, step_id: &str, status: StepStatus) -> RepositoryResult<()>;
}

#[derive(Default)]
struct RepositoryState {
    /// Steps keyed by step ID.
    steps: HashMap<String, ExecutionStep>,
    /// Results keyed by step ID, in arrival order.
    results: HashMap<String, Vec<AgentResult>>,
}

/// In-memory [`ExecutionPlanRepository`].
pub struct InMemoryPlanRepository {
    state: RwLock<RepositoryState>,
}

impl InMemoryPlanRepository {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(RepositoryState::default()),
        }
    }

    /// Seed the repository with a plan's steps.
    pub async fn insert_plan(&self, plan: &ExecutionPlan) {
        let mut state = self.state.write().await;
        for step in &plan.steps {
            state.steps.insert(step.id.clone(), step.clone());
        }
    }

    /// Seed the repository with a single step.
    pub async fn insert_step(&self, step: ExecutionStep) {
        self.state.write().await.steps.insert(step.id.clone(), step);
    }
}

impl Default for InMemoryPlanRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExecutionPlanRepository for InMemoryPlanRepository {
    async fn get_steps_by_plan_id(&self, plan_id: &str) -> RepositoryResult<Vec<ExecutionStep>> {
        let state = self.state.read().await;
        let mut steps: Vec<ExecutionStep> = state
            .steps
            .values()
            .filter(|s| s.plan_id == plan_id)
            .cloned()
            .collect();
        steps.sort_by_key(|s| s.step_number);
        Ok(steps)
    }

    async fn get_agent_results_by_execution_step(
        &self,
        step_id: &str,
    ) -> RepositoryResult<Vec<AgentResult>> {
        let state = self.state.read().await;
        Ok(state.results.get(step_id).cloned().unwrap_or_default())
    }

    async fn get_agent_results_by_execution_plan(
        &self,
        plan_id: &str,
    ) -> RepositoryResult<Vec<AgentResult>> {
        let steps = self.get_steps_by_plan_id(plan_id).await?;
        let state = self.state.read().await;
        let mut results = Vec::new();
        for step in steps {
            if let Some(step_results) = state.results.get(&step.id) {
                results.extend(step_results.iter().cloned());
            }
        }
        Ok(results)
    }

    async fn store_agent_result(&self, result: &AgentResult) -> RepositoryResult<()> {
        let mut state = self.state.write().await;
        state
            .results
            .entry(result.execution_step_id.clone())
            .or_default()
            .push(result.clone());
        Ok(())
    }

    async fn update_step(&self, step_id: &str, status: StepStatus) -> RepositoryResult<()> {
        let mut state = self.state.write().await;
        let step = state
            .steps
            .get_mut(step_id)
            .ok_or_else(|| DomainError::StepNotFound(step_id.to_string()))?;
        if !step.status.can_transition_to(status) {
            return Err(Box::new(DomainError::IllegalTransition {
                from: step.status,
                to: status,
            }));
        }
        step.status = status;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_result_requires_step_and_agent() {
        assert!(AgentResult::new("", "worker-1", "out", ResultStatus::Success).is_err());
        assert!(AgentResult::new("s1", "", "out", ResultStatus::Success).is_err());

        let result = AgentResult::new("s1", "worker-1", "out", ResultStatus::Success).unwrap();
        assert!(!result.id.is_empty());
        assert_eq!(result.status, ResultStatus::Success);
    }

    #[test]
    fn result_status_parses_known_values_only() {
        assert_eq!(ResultStatus::parse("SUCCESS").unwrap(), ResultStatus::Success);
        assert_eq!(ResultStatus::parse("PARTIAL").unwrap(), ResultStatus::Partial);
        assert!(ResultStatus::parse("DONE").is_err());
    }

    #[test]
    fn canonical_path_is_legal_and_shortcuts_are_not() {
        assert!(StepStatus::Pending.can_transition_to(StepStatus::Assigned));
        assert!(StepStatus::Assigned.can_transition_to(StepStatus::Executing));
        assert!(StepStatus::Executing.can_transition_to(StepStatus::Completed));
        assert!(StepStatus::Executing.can_transition_to(StepStatus::Executing));

        assert!(!StepStatus::Pending.can_transition_to(StepStatus::Completed));
        assert!(!StepStatus::Completed.can_transition_to(StepStatus::Pending));
        assert!(!StepStatus::Completed.can_transition_to(StepStatus::Executing));
    }

    #[test]
    fn synthesis_context_filters_successful_results() {
        let ok = AgentResult::new("s1", "a1", "fine", ResultStatus::Success).unwrap();
        let bad = AgentResult::new("s2", "a2", "broke", ResultStatus::Failed).unwrap();
        let ctx = SynthesisContext::new("plan-1", vec![ok.clone(), bad]);

        ctx.validate().unwrap();
        let successful = ctx.get_successful_results();
        assert_eq!(successful.len(), 1);
        assert_eq!(successful[0].id, ok.id);
    }

    #[test]
    fn synthesis_context_rejects_empty_plan_id() {
        let ctx = SynthesisContext::new("", Vec::new());
        assert!(ctx.validate().is_err());
    }

    #[tokio::test]
    async fn repository_enforces_the_state_machine() {
        let repo = InMemoryPlanRepository::new();
        repo.insert_step(ExecutionStep::new("s1", "plan-1", 1, "first", "worker-1"))
            .await;

        repo.update_step("s1", StepStatus::Assigned).await.unwrap();
        repo.update_step("s1", StepStatus::Executing).await.unwrap();

        // Jumping back to Pending is illegal.
        assert!(repo.update_step("s1", StepStatus::Pending).await.is_err());

        repo.update_step("s1", StepStatus::Completed).await.unwrap();
        let steps = repo.get_steps_by_plan_id("plan-1").await.unwrap();
        assert_eq!(steps[0].status, StepStatus::Completed);
    }

    #[tokio::test]
    async fn plan_results_come_back_in_step_order() {
        let repo = InMemoryPlanRepository::new();
        repo.insert_step(ExecutionStep::new("s2", "plan-1", 2, "second", "b"))
            .await;
        repo.insert_step(ExecutionStep::new("s1", "plan-1", 1, "first", "a"))
            .await;

        let r2 = AgentResult::new("s2", "b", "two", ResultStatus::Success).unwrap();
        let r1 = AgentResult::new("s1", "a", "one", ResultStatus::Success).unwrap();
        repo.store_agent_result(&r2).await.unwrap();
        repo.store_agent_result(&r1).await.unwrap();

        let results = repo.get_agent_results_by_execution_plan("plan-1").await.unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].content, "one");
        assert_eq!(results[1].content, "two");
    }

    #[tokio::test]
    async fn updating_a_missing_step_fails() {
        let repo = InMemoryPlanRepository::new();
        assert!(repo.update_step("ghost", StepStatus::Assigned).await.is_err());
    }
}
