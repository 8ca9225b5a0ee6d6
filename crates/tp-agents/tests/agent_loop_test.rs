use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tp_agents::agent_loop::{AgentLoopConfig, AgentLoopEngine, AgentLoopError, PromptHandle};
use tp_agents::state_machine::LoopState;
use tp_agents::store::InMemoryAgentStore;
use tp_bridge::event_bus::EventBus;
use tp_core::notification::{SessionNotification, SessionUpdate};
use tp_core::types::{StopReason, TokenUsage, ToolCallStatus};
use tp_harness::provider::{ProviderError, Response, ScriptedProvider, ToolCall};

fn engine() -> AgentLoopEngine {
    AgentLoopEngine::new(EventBus::new(), Arc::new(InMemoryAgentStore::new()))
}

fn loop_config(provider: &Arc<ScriptedProvider>, cwd: &std::path::Path) -> AgentLoopConfig {
    AgentLoopConfig::new(
        provider.clone(),
        cwd,
        &tp_core::config::AgentLoopConfig::default(),
    )
}

fn kinds(updates: &[SessionNotification]) -> Vec<&str> {
    updates.iter().filter_map(|n| n.kind()).collect()
}

fn turn_complete(updates: &[SessionNotification]) -> (StopReason, Option<TokenUsage>, Option<u32>) {
    match updates.last().and_then(|n| n.known()) {
        Some(SessionUpdate::TurnComplete {
            stop_reason,
            usage,
            step_count,
        }) => (*stop_reason, *usage, *step_count),
        other => panic!("last update is not turn_complete: {other:?}"),
    }
}

async fn run(handle: PromptHandle) -> (Vec<SessionNotification>, tp_agents::agent_loop::TurnOutcome) {
    tokio::time::timeout(Duration::from_secs(20), handle.collect())
        .await
        .expect("turn did not finish")
        .unwrap()
}

/// Wait until the turn has reached the model, so a cancel lands mid-call.
async fn wait_for_calls(provider: &ScriptedProvider, n: usize) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while provider.call_count() < n {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("provider was never called");
}

#[tokio::test]
async fn streams_updates_in_causal_order() {
    let dir = tempfile::tempdir().unwrap();
    let provider = Arc::new(ScriptedProvider::new("scripted"));
    provider
        .push_response(
            Response::tool_calls(vec![ToolCall::new(
                "call-1",
                "write_file",
                json!({"path": "notes/a.txt", "content": "hi"}),
            )])
            .with_thinking("write the file first")
            .with_usage(10, 5),
        )
        .push_response(Response::text("wrote notes/a.txt").with_usage(3, 2));

    let engine = engine();
    engine.create_session("s1", loop_config(&provider, dir.path())).unwrap();
    let (updates, outcome) = run(engine.prompt("s1", "write a note").unwrap()).await;

    assert_eq!(
        kinds(&updates),
        vec![
            "agent_thought_chunk",
            "tool_call",
            "tool_call_update",
            "agent_message_chunk",
            "turn_complete",
        ]
    );
    match updates[1].known() {
        Some(SessionUpdate::ToolCall { tool_call_id, status, .. }) => {
            assert_eq!(tool_call_id, "call-1");
            assert_eq!(*status, ToolCallStatus::Pending);
        }
        other => panic!("unexpected {other:?}"),
    }
    match updates[2].known() {
        Some(SessionUpdate::ToolCallUpdate { tool_call_id, status, .. }) => {
            assert_eq!(tool_call_id, "call-1");
            assert_eq!(*status, ToolCallStatus::Completed);
        }
        other => panic!("unexpected {other:?}"),
    }

    let usage = TokenUsage {
        input_tokens: 13,
        output_tokens: 7,
    };
    assert_eq!(turn_complete(&updates), (StopReason::EndTurn, Some(usage), Some(2)));
    assert_eq!(outcome.state, LoopState::Done);
    assert_eq!(outcome.final_text, "wrote notes/a.txt");
    assert_eq!(
        std::fs::read_to_string(dir.path().join("notes/a.txt")).unwrap(),
        "hi"
    );
    assert!(!engine.is_busy("s1"));
}

#[tokio::test]
async fn step_ceiling_ends_turn_with_max_steps() {
    let dir = tempfile::tempdir().unwrap();
    let provider = Arc::new(ScriptedProvider::repeating(
        "looping",
        Response::tool_calls(vec![ToolCall::new("c", "list_directory", json!({}))]),
    ));
    let engine = engine();
    engine
        .create_session("s1", loop_config(&provider, dir.path()).with_max_steps(3))
        .unwrap();

    let (updates, outcome) = run(engine.prompt("s1", "loop forever").unwrap()).await;

    assert_eq!(outcome.stop_reason, StopReason::MaxSteps);
    assert_eq!(outcome.state, LoopState::Failed);
    assert_eq!(outcome.step_count, 3);
    assert_eq!(provider.call_count(), 3);
    assert!(!kinds(&updates).contains(&"error"));
    assert_eq!(turn_complete(&updates).0, StopReason::MaxSteps);
    assert_eq!(engine.state("s1").unwrap().step_count, 3);
}

#[tokio::test]
async fn wall_clock_limit_ends_turn_with_timeout() {
    let dir = tempfile::tempdir().unwrap();
    let provider = Arc::new(ScriptedProvider::new("slow"));
    provider.push_delayed(Duration::from_secs(10), Response::text("too late"));
    let engine = engine();
    engine
        .create_session(
            "s1",
            loop_config(&provider, dir.path()).with_total_timeout(Duration::from_millis(100)),
        )
        .unwrap();

    let (updates, outcome) = run(engine.prompt("s1", "hurry").unwrap()).await;
    assert_eq!(outcome.stop_reason, StopReason::Timeout);
    assert_eq!(outcome.state, LoopState::Failed);
    assert_eq!(kinds(&updates), vec!["turn_complete"]);
}

#[tokio::test]
async fn cancel_stops_the_model_call_silently() {
    let dir = tempfile::tempdir().unwrap();
    let provider = Arc::new(ScriptedProvider::new("slow"));
    provider.push_delayed(Duration::from_secs(30), Response::text("never"));
    let engine = engine();
    engine.create_session("s1", loop_config(&provider, dir.path())).unwrap();

    let handle = engine.prompt("s1", "think hard").unwrap();
    wait_for_calls(&provider, 1).await;
    assert!(engine.cancel("s1").unwrap());

    let (updates, outcome) = run(handle).await;
    assert_eq!(outcome.stop_reason, StopReason::Cancelled);
    assert_eq!(outcome.state, LoopState::Failed);
    assert_eq!(kinds(&updates), vec!["turn_complete"]);
    assert!(!engine.cancel("s1").unwrap());
}

#[tokio::test]
async fn cancel_interrupts_a_running_tool() {
    let dir = tempfile::tempdir().unwrap();
    let provider = Arc::new(ScriptedProvider::new("shell"));
    provider.push_response(Response::tool_calls(vec![
        ToolCall::new("long", "bash", json!({"command": "sleep 30"})),
        ToolCall::new("after", "bash", json!({"command": "echo skipped"})),
    ]));
    let engine = engine();
    engine.create_session("s1", loop_config(&provider, dir.path())).unwrap();

    let handle = engine.prompt("s1", "run it").unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    engine.cancel("s1").unwrap();

    let (updates, outcome) = run(handle).await;
    assert_eq!(outcome.stop_reason, StopReason::Cancelled);
    assert_eq!(kinds(&updates), vec!["tool_call", "tool_call_update", "turn_complete"]);
    match updates[1].known() {
        Some(SessionUpdate::ToolCallUpdate { status, .. }) => {
            assert_eq!(*status, ToolCallStatus::Failed)
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn one_turn_at_a_time() {
    let dir = tempfile::tempdir().unwrap();
    let provider = Arc::new(ScriptedProvider::new("slow"));
    provider
        .push_delayed(Duration::from_secs(30), Response::text("slow"))
        .push_response(Response::text("fast"));
    let engine = engine();
    engine.create_session("s1", loop_config(&provider, dir.path())).unwrap();

    let first = engine.prompt("s1", "one").unwrap();
    assert!(engine.is_busy("s1"));
    assert!(matches!(
        engine.prompt("s1", "two"),
        Err(AgentLoopError::Busy(_))
    ));

    // The slow step must be consumed by the first turn, not the third.
    wait_for_calls(&provider, 1).await;
    engine.cancel("s1").unwrap();
    let (_, cancelled) = run(first).await;
    assert_eq!(cancelled.stop_reason, StopReason::Cancelled);

    let (_, outcome) = run(engine.prompt("s1", "three").unwrap()).await;
    assert_eq!(outcome.stop_reason, StopReason::EndTurn);
    assert_eq!(outcome.final_text, "fast");
}

#[tokio::test]
async fn provider_error_emits_error_then_fails() {
    let dir = tempfile::tempdir().unwrap();
    let provider = Arc::new(ScriptedProvider::new("broken"));
    provider.push_error(ProviderError::Api("upstream exploded".into()));
    let engine = engine();
    engine.create_session("s1", loop_config(&provider, dir.path())).unwrap();

    let (updates, outcome) = run(engine.prompt("s1", "hello").unwrap()).await;
    assert_eq!(kinds(&updates), vec!["error", "turn_complete"]);
    match updates[0].known() {
        Some(SessionUpdate::Error { message }) => assert!(message.contains("upstream exploded")),
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(outcome.stop_reason, StopReason::Error);
    assert_eq!(outcome.state, LoopState::Failed);
}

#[tokio::test]
async fn tool_errors_are_results_and_the_loop_continues() {
    let dir = tempfile::tempdir().unwrap();
    let provider = Arc::new(ScriptedProvider::new("clumsy"));
    provider
        .push_response(Response::tool_calls(vec![
            ToolCall::new("a", "no_such_tool", json!({})),
            ToolCall::new("b", "read_file", json!({"path": "../../etc/passwd"})),
            ToolCall {
                id: "c".into(),
                name: "read_file".into(),
                arguments: "{not json".into(),
            },
        ]))
        .push_response(Response::text("recovered"));
    let engine = engine();
    engine.create_session("s1", loop_config(&provider, dir.path())).unwrap();

    let (updates, outcome) = run(engine.prompt("s1", "try things").unwrap()).await;
    assert_eq!(outcome.stop_reason, StopReason::EndTurn);

    let failed = updates
        .iter()
        .filter(|n| {
            matches!(
                n.known(),
                Some(SessionUpdate::ToolCallUpdate {
                    status: ToolCallStatus::Failed,
                    ..
                })
            )
        })
        .count();
    assert_eq!(failed, 3);

    // Every call got a result message before the next model step.
    let request = provider.last_request().unwrap();
    let results: Vec<_> = request
        .iter()
        .filter(|m| m.tool_call_id.is_some())
        .map(|m| m.content.as_str())
        .collect();
    assert_eq!(results.len(), 3);
    assert!(results.iter().all(|r| r.starts_with("error:")));
    assert!(results[0].contains("unknown tool"));
    assert!(results[1].contains("outside the working directory"));
}

#[tokio::test]
async fn history_persists_across_turns() {
    let dir = tempfile::tempdir().unwrap();
    let provider = Arc::new(ScriptedProvider::repeating("echo", Response::text("ok")));
    let engine = engine();
    engine
        .create_session(
            "s1",
            loop_config(&provider, dir.path()).with_system_prompt("you are terse"),
        )
        .unwrap();

    run(engine.prompt("s1", "first").unwrap()).await;
    let (_, second) = run(engine.prompt("s1", "second").unwrap()).await;

    // Each turn gets a fresh state machine.
    assert_eq!(second.step_count, 1);
    let contents: Vec<String> = provider
        .last_request()
        .unwrap()
        .into_iter()
        .map(|m| m.content)
        .collect();
    assert_eq!(contents, vec!["you are terse", "first", "ok", "second"]);
}

#[tokio::test]
async fn close_session_cancels_the_running_turn() {
    let dir = tempfile::tempdir().unwrap();
    let provider = Arc::new(ScriptedProvider::new("slow"));
    provider.push_delayed(Duration::from_secs(30), Response::text("never"));
    let engine = engine();
    engine.create_session("s1", loop_config(&provider, dir.path())).unwrap();

    let handle = engine.prompt("s1", "hello").unwrap();
    wait_for_calls(&provider, 1).await;
    assert!(engine.close_session("s1"));
    let (_, outcome) = run(handle).await;
    assert_eq!(outcome.stop_reason, StopReason::Cancelled);
    assert!(engine.list_sessions().is_empty());
}
