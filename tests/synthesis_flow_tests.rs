use agentmesh::envelope::AgentToAIMessage;
use agentmesh::execution::ExecutionStep;
use agentmesh::synthesis::SYNTHESIS_COORDINATION_ID;
use agentmesh::{
    publish_agent_completed_event, AIMessageBus, AIProvider, AgentCompletedEvent, AgentDescriptor,
    AgentResult, CorrelationTracker, ExecutionCoordinator, ExecutionEngine,
    ExecutionPlanRepository, ExecutionTask, GlobalMessageConsumer, InMemoryMessageBus,
    InMemoryPlanRepository, MessageType, ResultStatus, ResultSynthesizer, StepStatus,
    SynthesisEventHandler,
};
use async_trait::async_trait;
use std::error::Error;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

struct CountingSynthesisProvider {
    calls: AtomicUsize,
}

#[async_trait]
impl AIProvider for CountingSynthesisProvider {
    async fn call_ai(
        &self,
        _system_prompt: &str,
        _user_prompt: &str,
    ) -> Result<String, Box<dyn Error + Send + Sync>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok("Executive summary: all three steps completed successfully.".to_string())
    }
}

async fn seed_plan(repo: &InMemoryPlanRepository, plan_id: &str, step_ids: &[&str]) {
    for (number, step_id) in step_ids.iter().enumerate() {
        repo.insert_step(ExecutionStep::new(
            *step_id,
            plan_id,
            number + 1,
            format!("step {}", number + 1),
            "healthcare-agent",
        ))
        .await;
    }
}

async fn complete_step(repo: &InMemoryPlanRepository, step_id: &str) {
    repo.update_step(step_id, StepStatus::Assigned).await.unwrap();
    repo.update_step(step_id, StepStatus::Executing).await.unwrap();
    repo.update_step(step_id, StepStatus::Completed).await.unwrap();
    let result =
        AgentResult::new(step_id, "healthcare-agent", "step output", ResultStatus::Success)
            .unwrap();
    repo.store_agent_result(&result).await.unwrap();
}

/// Scenario: plan `healthcare-plan-123` with steps s1, s2, s3. Completion
/// events arrive in order; only the event that completes the plan triggers
/// synthesis, and it triggers exactly once.
#[tokio::test]
async fn synthesis_fires_exactly_once_when_the_last_step_completes() {
    let _ = env_logger::try_init();
    let repo = Arc::new(InMemoryPlanRepository::new());
    seed_plan(&repo, "healthcare-plan-123", &["s1", "s2", "s3"]).await;

    let provider = Arc::new(CountingSynthesisProvider {
        calls: AtomicUsize::new(0),
    });
    let synthesizer = Arc::new(ResultSynthesizer::new(provider.clone(), repo.clone()));
    let coordinator = Arc::new(ExecutionCoordinator::new(repo.clone(), synthesizer));
    let bus = Arc::new(AIMessageBus::new(Arc::new(InMemoryMessageBus::new())));
    let handler = SynthesisEventHandler::new(coordinator, bus);

    for &step_id in ["s1", "s2", "s3"].iter() {
        complete_step(&repo, step_id).await;
        let event = AgentCompletedEvent::new("healthcare-plan-123", step_id, "healthcare-agent");
        let text = handler.handle_agent_completed(&event).await.unwrap();

        if step_id == "s3" {
            assert!(!text.is_empty(), "final event should synthesize");
        } else {
            assert!(text.is_empty(), "event for {} should not synthesize", step_id);
        }
    }
    assert_eq!(provider.calls.load(Ordering::SeqCst), 1);

    // A late duplicate is absorbed by the single-flight guard.
    let duplicate = AgentCompletedEvent::new("healthcare-plan-123", "s3", "healthcare-agent");
    let text = handler.handle_agent_completed(&duplicate).await.unwrap();
    assert!(text.is_empty());
    assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn racing_completion_events_synthesize_once() {
    let _ = env_logger::try_init();
    let repo = Arc::new(InMemoryPlanRepository::new());
    seed_plan(&repo, "plan-race", &["s1"]).await;
    complete_step(&repo, "s1").await;

    let provider = Arc::new(CountingSynthesisProvider {
        calls: AtomicUsize::new(0),
    });
    let synthesizer = Arc::new(ResultSynthesizer::new(provider.clone(), repo.clone()));
    let coordinator = Arc::new(ExecutionCoordinator::new(repo.clone(), synthesizer));
    let bus = Arc::new(AIMessageBus::new(Arc::new(InMemoryMessageBus::new())));
    let handler = Arc::new(SynthesisEventHandler::new(coordinator, bus));

    let mut handles = Vec::new();
    for _ in 0..5 {
        let handler = handler.clone();
        handles.push(tokio::spawn(async move {
            let event = AgentCompletedEvent::new("plan-race", "s1", "healthcare-agent");
            handler.handle_agent_completed(&event).await.unwrap()
        }));
    }

    let mut non_empty = 0;
    for handle in handles {
        if !handle.await.unwrap().is_empty() {
            non_empty += 1;
        }
    }
    assert_eq!(non_empty, 1);
    assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
}

/// The end-to-end event path: the listener consumes events published through
/// the typed bus and synthesizes when the plan becomes complete.
#[tokio::test]
async fn event_listener_drives_synthesis_over_the_bus() {
    let _ = env_logger::try_init();
    let repo = Arc::new(InMemoryPlanRepository::new());
    seed_plan(&repo, "plan-listener", &["s1", "s2"]).await;

    let provider = Arc::new(CountingSynthesisProvider {
        calls: AtomicUsize::new(0),
    });
    let synthesizer = Arc::new(ResultSynthesizer::new(provider.clone(), repo.clone()));
    let coordinator = Arc::new(ExecutionCoordinator::new(repo.clone(), synthesizer));
    let bus = Arc::new(AIMessageBus::new(Arc::new(InMemoryMessageBus::new())));
    let handler = Arc::new(SynthesisEventHandler::new(coordinator, bus.clone()));

    let ctx = CancellationToken::new();
    let listener = {
        let handler = handler.clone();
        let ctx = ctx.clone();
        tokio::spawn(async move { handler.start_event_listener(ctx).await })
    };

    complete_step(&repo, "s1").await;
    publish_agent_completed_event(&bus, "plan-listener", "s1", "healthcare-agent")
        .await
        .unwrap();

    complete_step(&repo, "s2").await;
    publish_agent_completed_event(&bus, "plan-listener", "s2", "healthcare-agent")
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(provider.calls.load(Ordering::SeqCst), 1);

    ctx.cancel();
    listener.await.unwrap().unwrap();
}

/// Planner for the execution engine: one instruction, then a user response.
struct ExecutionPlanner;

#[async_trait]
impl AIProvider for ExecutionPlanner {
    async fn call_ai(
        &self,
        _system_prompt: &str,
        user_prompt: &str,
    ) -> Result<String, Box<dyn Error + Send + Sync>> {
        if user_prompt.contains("replied:") {
            Ok("USER_RESPONSE:\nStep handled.".to_string())
        } else {
            Ok("SEND_EVENT:\n\
                Agent: healthcare-agent\n\
                Action: analyze\n\
                Content: Analyze the patient record\n\
                Intent: complete step one"
                .to_string())
        }
    }
}

/// Full execution round-trip: the engine stores the agent result, marches
/// the step to Completed, and publishes the completion event.
#[tokio::test]
async fn execution_engine_records_results_and_publishes_completion() {
    let _ = env_logger::try_init();
    let raw = Arc::new(InMemoryMessageBus::new());
    let bus = Arc::new(AIMessageBus::new(raw));
    let tracker = Arc::new(CorrelationTracker::new());
    let repo = Arc::new(InMemoryPlanRepository::new());
    seed_plan(&repo, "plan-exec", &["s1"]).await;

    let ctx = CancellationToken::new();
    let consumer = Arc::new(GlobalMessageConsumer::new(bus.clone(), tracker.clone()));
    consumer.spawn(ctx.clone());

    // Observe the synthesis coordination channel directly.
    let mut events = bus.subscribe(SYNTHESIS_COORDINATION_ID).await.unwrap();

    // Stub agent.
    let mut agent_stream = bus.subscribe("healthcare-agent").await.unwrap();
    {
        let bus = bus.clone();
        tokio::spawn(async move {
            while let Some(envelope) = agent_stream.recv().await {
                if envelope.message_type != MessageType::AiToAgent {
                    continue;
                }
                let reply = AgentToAIMessage::new(
                    "healthcare-agent",
                    "Record analyzed: no anomalies",
                    &envelope.correlation_id,
                );
                bus.send_to_ai(&reply).await.unwrap();
            }
        });
    }

    let engine = ExecutionEngine::new(
        Arc::new(ExecutionPlanner),
        bus.clone(),
        tracker.clone(),
        repo.clone(),
    )
    .with_agent_timeout(Duration::from_secs(5));

    let answer = engine
        .process_execution(
            &ctx,
            "Analyze the record",
            "clinician1",
            &[AgentDescriptor::new("healthcare-agent", "Analyzes records")],
            Some(ExecutionTask::new("plan-exec", "s1")),
        )
        .await
        .unwrap();
    assert_eq!(answer, "Step handled.");

    // The step was marched to Completed and its result stored as Success.
    let steps = repo.get_steps_by_plan_id("plan-exec").await.unwrap();
    assert_eq!(steps[0].status, StepStatus::Completed);
    let results = repo.get_agent_results_by_execution_step("s1").await.unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].status, ResultStatus::Success);
    assert_eq!(results[0].agent_id, "healthcare-agent");

    // The completion event went out on the coordination channel.
    let event_envelope = events.recv().await.unwrap();
    assert_eq!(event_envelope.message_type, MessageType::AgentCompleted);
    assert_eq!(event_envelope.correlation_id, "synthesis-plan-exec");
    let event: AgentCompletedEvent = serde_json::from_str(&event_envelope.content).unwrap();
    assert_eq!(event.plan_id, "plan-exec");
    assert_eq!(event.step_id, "s1");
    assert_eq!(event.agent_id, "healthcare-agent");

    ctx.cancel();
}

/// A reply whose context marks `success: false` is stored as a Failed result
/// and keeps the plan incomplete.
#[tokio::test]
async fn failed_agent_reply_is_stored_as_failed() {
    let _ = env_logger::try_init();
    let raw = Arc::new(InMemoryMessageBus::new());
    let bus = Arc::new(AIMessageBus::new(raw));
    let tracker = Arc::new(CorrelationTracker::new());
    let repo = Arc::new(InMemoryPlanRepository::new());
    seed_plan(&repo, "plan-fail", &["s1"]).await;

    let ctx = CancellationToken::new();
    let consumer = Arc::new(GlobalMessageConsumer::new(bus.clone(), tracker.clone()));
    consumer.spawn(ctx.clone());

    let mut agent_stream = bus.subscribe("healthcare-agent").await.unwrap();
    {
        let bus = bus.clone();
        tokio::spawn(async move {
            while let Some(envelope) = agent_stream.recv().await {
                if envelope.message_type != MessageType::AiToAgent {
                    continue;
                }
                let reply = AgentToAIMessage::new(
                    "healthcare-agent",
                    "Could not read the record",
                    &envelope.correlation_id,
                )
                .with_context("success", false);
                bus.send_to_ai(&reply).await.unwrap();
            }
        });
    }

    let engine = ExecutionEngine::new(
        Arc::new(ExecutionPlanner),
        bus.clone(),
        tracker.clone(),
        repo.clone(),
    )
    .with_agent_timeout(Duration::from_secs(5));

    engine
        .process_execution(
            &ctx,
            "Analyze the record",
            "clinician1",
            &[AgentDescriptor::new("healthcare-agent", "Analyzes records")],
            Some(ExecutionTask::new("plan-fail", "s1")),
        )
        .await
        .unwrap();

    let results = repo.get_agent_results_by_execution_step("s1").await.unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].status, ResultStatus::Failed);

    // Failed results keep the plan away from synthesis.
    let provider = Arc::new(CountingSynthesisProvider {
        calls: AtomicUsize::new(0),
    });
    let synthesizer = Arc::new(ResultSynthesizer::new(provider.clone(), repo.clone()));
    let coordinator = Arc::new(ExecutionCoordinator::new(repo.clone(), synthesizer));
    assert!(!coordinator.is_execution_plan_complete("plan-fail").await.unwrap());

    ctx.cancel();
}
