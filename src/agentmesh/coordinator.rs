//! Execution-plan completion coordination.
//!
//! The coordinator owns one question: is every step of a plan `Completed`
//! with every stored result `Success`? It derives the answer from the
//! repository on each call — completion is never cached or stored — and
//! triggers the result synthesizer exactly when the answer is yes. It
//! performs no reordering and no partial synthesis.

use crate::agentmesh::execution::{ExecutionPlanRepository, ResultStatus, StepStatus};
use crate::agentmesh::synthesis::ResultSynthesizer;
use std::error::Error;
use std::sync::Arc;

/// Per-plan progress tallies for partially completed plans.
///
/// Safe on empty plans: all counts are zero and the completion percentage
/// is `0.0`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionStats {
    pub total_steps: usize,
    pub completed_steps: usize,
    pub pending_steps: usize,
    pub successful_results: usize,
    pub failed_results: usize,
    pub partial_results: usize,
    /// `completed_steps / total_steps`, in percent.
    pub completion_percent: f32,
}

/// Derives plan completeness and triggers synthesis.
pub struct ExecutionCoordinator {
    repository: Arc<dyn ExecutionPlanRepository>,
    synthesizer: Arc<ResultSynthesizer>,
}

impl ExecutionCoordinator {
    pub fn new(
        repository: Arc<dyn ExecutionPlanRepository>,
        synthesizer: Arc<ResultSynthesizer>,
    ) -> Self {
        Self {
            repository,
            synthesizer,
        }
    }

    /// Whether every step of the plan is `Completed` and every stored result
    /// of those steps is `Success`.
    pub async fn is_execution_plan_complete(
        &self,
        plan_id: &str,
    ) -> Result<bool, Box<dyn Error + Send + Sync>> {
        let steps = self.repository.get_steps_by_plan_id(plan_id).await?;

        for step in &steps {
            if step.status != StepStatus::Completed {
                log::debug!(
                    "plan '{}' incomplete: step '{}' is {}",
                    plan_id,
                    step.id,
                    step.status
                );
                return Ok(false);
            }
        }

        for step in &steps {
            let results = self
                .repository
                .get_agent_results_by_execution_step(&step.id)
                .await?;
            if results.iter().any(|r| r.status != ResultStatus::Success) {
                log::debug!(
                    "plan '{}' incomplete: step '{}' has a non-success result",
                    plan_id,
                    step.id
                );
                return Ok(false);
            }
        }

        Ok(true)
    }

    /// Synthesize the plan's results if — and only if — it is complete.
    ///
    /// Returns an empty string for an incomplete plan; that is not an error.
    /// Synthesis failures surface.
    pub async fn trigger_synthesis_when_complete(
        &self,
        plan_id: &str,
    ) -> Result<String, Box<dyn Error + Send + Sync>> {
        if !self.is_execution_plan_complete(plan_id).await? {
            return Ok(String::new());
        }
        log::info!("plan '{}' is complete; synthesizing results", plan_id);
        let text = self.synthesizer.synthesize_results(plan_id).await?;
        Ok(text)
    }

    /// Tally progress for a plan that may only be partially complete.
    pub async fn handle_partial_completion(
        &self,
        plan_id: &str,
    ) -> Result<ExecutionStats, Box<dyn Error + Send + Sync>> {
        let steps = self.repository.get_steps_by_plan_id(plan_id).await?;
        let mut stats = ExecutionStats {
            total_steps: steps.len(),
            ..ExecutionStats::default()
        };

        for step in &steps {
            match step.status {
                StepStatus::Completed => stats.completed_steps += 1,
                StepStatus::Pending | StepStatus::Assigned => stats.pending_steps += 1,
                _ => {}
            }

            let results = self
                .repository
                .get_agent_results_by_execution_step(&step.id)
                .await?;
            for result in results {
                match result.status {
                    ResultStatus::Success => stats.successful_results += 1,
                    ResultStatus::Failed => stats.failed_results += 1,
                    ResultStatus::Partial => stats.partial_results += 1,
                }
            }
        }

        if stats.total_steps > 0 {
            stats.completion_percent =
                stats.completed_steps as f32 / stats.total_steps as f32 * 100.0;
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agentmesh::execution::{
        AgentResult, ExecutionStep, InMemoryPlanRepository,
    };
    use crate::agentmesh::provider::AIProvider;
    use async_trait::async_trait;

    struct StaticProvider(&'static str);

    #[async_trait]
    impl AIProvider for StaticProvider {
        async fn call_ai(
            &self,
            _system_prompt: &str,
            _user_prompt: &str,
        ) -> Result<String, Box<dyn Error + Send + Sync>> {
            Ok(self.0.to_string())
        }
    }

    async fn seeded_repo() -> Arc<InMemoryPlanRepository> {
        let repo = Arc::new(InMemoryPlanRepository::new());
        repo.insert_step(ExecutionStep::new("s1", "plan-1", 1, "first", "a"))
            .await;
        repo.insert_step(ExecutionStep::new("s2", "plan-1", 2, "second", "b"))
            .await;
        repo
    }

    async fn complete_step(repo: &InMemoryPlanRepository, step_id: &str, status: ResultStatus) {
        repo.update_step(step_id, StepStatus::Assigned).await.unwrap();
        repo.update_step(step_id, StepStatus::Executing).await.unwrap();
        repo.update_step(step_id, StepStatus::Completed).await.unwrap();
        let result = AgentResult::new(step_id, "agent", "output", status).unwrap();
        repo.store_agent_result(&result).await.unwrap();
    }

    fn coordinator(repo: Arc<InMemoryPlanRepository>) -> ExecutionCoordinator {
        let synthesizer = Arc::new(ResultSynthesizer::new(
            Arc::new(StaticProvider("Executive summary: everything worked.")),
            repo.clone(),
        ));
        ExecutionCoordinator::new(repo, synthesizer)
    }

    #[tokio::test]
    async fn incomplete_steps_mean_incomplete_plan() {
        let repo = seeded_repo().await;
        complete_step(&repo, "s1", ResultStatus::Success).await;

        let coord = coordinator(repo);
        assert!(!coord.is_execution_plan_complete("plan-1").await.unwrap());
        assert_eq!(
            coord.trigger_synthesis_when_complete("plan-1").await.unwrap(),
            ""
        );
    }

    #[tokio::test]
    async fn failed_results_mean_incomplete_plan() {
        let repo = seeded_repo().await;
        complete_step(&repo, "s1", ResultStatus::Success).await;
        complete_step(&repo, "s2", ResultStatus::Failed).await;

        let coord = coordinator(repo);
        assert!(!coord.is_execution_plan_complete("plan-1").await.unwrap());
    }

    #[tokio::test]
    async fn complete_plan_triggers_synthesis() {
        let repo = seeded_repo().await;
        complete_step(&repo, "s1", ResultStatus::Success).await;
        complete_step(&repo, "s2", ResultStatus::Success).await;

        let coord = coordinator(repo);
        assert!(coord.is_execution_plan_complete("plan-1").await.unwrap());
        let text = coord.trigger_synthesis_when_complete("plan-1").await.unwrap();
        assert!(text.contains("Executive summary"));
    }

    #[tokio::test]
    async fn completion_is_monotonic_without_changes() {
        let repo = seeded_repo().await;
        complete_step(&repo, "s1", ResultStatus::Success).await;
        complete_step(&repo, "s2", ResultStatus::Success).await;

        let coord = coordinator(repo);
        assert!(coord.is_execution_plan_complete("plan-1").await.unwrap());
        assert!(coord.is_execution_plan_complete("plan-1").await.unwrap());
    }

    #[tokio::test]
    async fn partial_stats_tally_steps_and_results() {
        let repo = seeded_repo().await;
        complete_step(&repo, "s1", ResultStatus::Success).await;

        let coord = coordinator(repo);
        let stats = coord.handle_partial_completion("plan-1").await.unwrap();
        assert_eq!(stats.total_steps, 2);
        assert_eq!(stats.completed_steps, 1);
        assert_eq!(stats.pending_steps, 1);
        assert_eq!(stats.successful_results, 1);
        assert_eq!(stats.failed_results, 0);
        assert!((stats.completion_percent - 50.0).abs() < f32::EPSILON);
    }

    #[tokio::test]
    async fn partial_stats_are_safe_on_an_empty_plan() {
        let repo = Arc::new(InMemoryPlanRepository::new());
        let coord = coordinator(repo);
        let stats = coord.handle_partial_completion("no-such-plan").await.unwrap();
        assert_eq!(stats, ExecutionStats::default());
    }
}
