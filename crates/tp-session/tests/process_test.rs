use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tp_core::config::{Config, PresetConfig, ProviderKind};
use tp_core::notification::{SessionNotification, SessionUpdate};
use tp_core::types::StopReason;
use tp_session::process::{CreateSessionRequest, ProcessSupervisor};
use tp_session::terminal::TerminalSupervisor;
use tp_session::ProcessError;

/// A stdio ACP agent in plain sh. Request ids are pulled out with sed; the
/// agent answers initialize, session/new and session/prompt, rejects modes,
/// and exits with status 3 when asked to `die`.
const SH_AGENT: &str = r#"
while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9][0-9]*\).*/\1/p')
  case "$line" in
    *'"method":"initialize"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"protocolVersion":1}}\n' "$id" ;;
    *'"method":"session/new"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"sessionId":"sh-session"}}\n' "$id" ;;
    *'"method":"session/set_mode"'*)
      printf '{"jsonrpc":"2.0","id":%s,"error":{"code":-32601,"message":"no modes"}}\n' "$id" ;;
    *'"text":"die"'*)
      exit 3 ;;
    *'"method":"session/prompt"'*)
      printf '{"jsonrpc":"2.0","method":"session/update","params":{"sessionId":"sh-session","update":{"sessionUpdate":"agent_message_chunk","content":{"type":"text","text":"hello"}}}}\n'
      printf '{"jsonrpc":"2.0","id":%s,"result":{"stopReason":"end_turn"}}\n' "$id" ;;
  esac
done
"#;

fn config_with(presets: Vec<PresetConfig>) -> Arc<Config> {
    Arc::new(Config {
        presets,
        ..Config::default()
    })
}

fn sh_preset(id: &str, script: &str) -> PresetConfig {
    PresetConfig {
        id: id.to_string(),
        provider: ProviderKind::Acp {
            command: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            env: HashMap::new(),
        },
    }
}

fn supervisor(config: Arc<Config>) -> ProcessSupervisor {
    let terminals = TerminalSupervisor::new(&config.terminal);
    ProcessSupervisor::new(config, terminals)
}

#[tokio::test]
async fn stdio_session_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let procs = supervisor(config_with(vec![sh_preset("mock", SH_AGENT)]));
    let (tx, rx) = flume::unbounded::<SessionNotification>();

    let provider_id = procs
        .create_session(
            CreateSessionRequest::new("caller-1", dir.path(), "mock").with_mode("architect"),
            tx,
        )
        .await
        .expect("session created despite unsupported mode");
    assert_eq!(provider_id, "sh-session");

    let info = procs.get_process("caller-1").expect("tracked");
    assert_eq!(info.preset_id, "mock");
    assert_eq!(info.provider_kind, "acp");
    assert!(info.pid.is_some());
    assert_eq!(procs.get_preset_id("caller-1").as_deref(), Some("mock"));
    assert!(!procs.is_claude_code_session("caller-1"));

    let outcome = procs.prompt("caller-1", "hi there").await.unwrap();
    assert_eq!(outcome.stop_reason, StopReason::EndTurn);

    let received: Vec<SessionNotification> = rx.try_iter().collect();
    assert!(received.iter().all(|n| n.session_id == "caller-1"));
    assert_eq!(received[0].kind(), Some("agent_message_chunk"));
    assert!(matches!(
        received.last().and_then(|n| n.known()),
        Some(SessionUpdate::TurnComplete {
            stop_reason: StopReason::EndTurn,
            ..
        })
    ));

    // best effort, never surfaces
    procs.set_session_mode("caller-1", "plan").await;
    procs.set_session_mode("nobody", "plan").await;

    procs.kill_session("caller-1").await;
    assert!(procs.get_process("caller-1").is_none());
    assert!(procs.get_provider_session_id("caller-1").is_none());
    // idempotent
    procs.kill_session("caller-1").await;
}

#[tokio::test]
async fn unknown_preset_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let procs = supervisor(config_with(vec![]));
    let (tx, _rx) = flume::unbounded();
    let err = procs
        .create_session(CreateSessionRequest::new("s", dir.path(), "nope"), tx)
        .await
        .unwrap_err();
    assert!(matches!(err, ProcessError::UnknownPreset(id) if id == "nope"));
}

#[tokio::test]
async fn missing_binary_is_a_spawn_failure() {
    let dir = tempfile::tempdir().unwrap();
    let procs = supervisor(config_with(vec![PresetConfig {
        id: "ghost".into(),
        provider: ProviderKind::Acp {
            command: "definitely-not-an-agent-binary".into(),
            args: vec![],
            env: HashMap::new(),
        },
    }]));
    let (tx, _rx) = flume::unbounded();
    let err = procs
        .create_session(CreateSessionRequest::new("s", dir.path(), "ghost"), tx)
        .await
        .unwrap_err();
    assert!(matches!(err, ProcessError::SpawnFailure { .. }));
    assert!(procs.get_process("s").is_none());
}

#[tokio::test]
async fn agent_exiting_during_handshake_fails_fast() {
    let dir = tempfile::tempdir().unwrap();
    let procs = supervisor(config_with(vec![sh_preset("quitter", "exit 1")]));
    let (tx, _rx) = flume::unbounded();
    let err = procs
        .create_session(CreateSessionRequest::new("s", dir.path(), "quitter"), tx)
        .await
        .unwrap_err();
    assert!(matches!(err, ProcessError::SpawnFailure { .. }), "{err}");
}

#[tokio::test]
async fn unexpected_exit_fails_pending_prompt() {
    let dir = tempfile::tempdir().unwrap();
    let procs = supervisor(config_with(vec![sh_preset("mock", SH_AGENT)]));
    let (tx, _rx) = flume::unbounded();
    procs
        .create_session(CreateSessionRequest::new("s", dir.path(), "mock"), tx)
        .await
        .unwrap();

    let err = tokio::time::timeout(Duration::from_secs(5), procs.prompt("s", "die"))
        .await
        .expect("prompt resolved")
        .unwrap_err();
    assert!(matches!(err, ProcessError::ProcessExitedUnexpectedly(_)));
    // stays tracked until killed
    assert!(procs.get_process("s").is_some());
    procs.kill_session("s").await;
}

#[tokio::test]
async fn prompt_on_unknown_session() {
    let procs = supervisor(config_with(vec![]));
    assert!(matches!(
        procs.prompt("missing", "hi").await,
        Err(ProcessError::SessionNotFound(_))
    ));
    assert!(procs.cancel("missing").await.is_err());
}

#[tokio::test]
async fn recreating_a_session_replaces_the_entry() {
    let dir = tempfile::tempdir().unwrap();
    let procs = supervisor(config_with(vec![sh_preset("mock", SH_AGENT)]));
    let (tx, _rx) = flume::unbounded();

    procs
        .create_session(CreateSessionRequest::new("s", dir.path(), "mock"), tx.clone())
        .await
        .unwrap();
    let first_pid = procs.get_process("s").unwrap().pid;
    procs
        .create_session(CreateSessionRequest::new("s", dir.path(), "mock"), tx)
        .await
        .unwrap();
    let second_pid = procs.get_process("s").unwrap().pid;

    assert_ne!(first_pid, second_pid);
    assert_eq!(procs.list_sessions().len(), 1);
    procs.kill_all().await;
    assert!(procs.list_sessions().is_empty());
}

// ---------------------------------------------------------------------------
// TCP provider
// ---------------------------------------------------------------------------

async fn send(writer: &mut tokio::net::tcp::OwnedWriteHalf, frame: Value) {
    writer
        .write_all(format!("{frame}\n").as_bytes())
        .await
        .unwrap();
}

/// Fake ACP agent on a socket. During a prompt it asks the client to write a
/// file, waits for the answer, then streams an update and finishes the turn.
async fn serve_fake_agent(listener: TcpListener) {
    let (stream, _) = listener.accept().await.unwrap();
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();

    while let Ok(Some(line)) = lines.next_line().await {
        let msg: Value = serde_json::from_str(&line).unwrap();
        let id = msg["id"].clone();
        match msg["method"].as_str() {
            Some("initialize") => {
                send(&mut write, json!({"jsonrpc":"2.0","id":id,"result":{"protocolVersion":1}})).await
            }
            Some("session/new") => {
                send(&mut write, json!({"jsonrpc":"2.0","id":id,"result":{"sessionId":"tcp-session"}})).await
            }
            Some("session/prompt") => {
                send(
                    &mut write,
                    json!({"jsonrpc":"2.0","id":900,"method":"fs/write_text_file",
                           "params":{"sessionId":"tcp-session","path":"notes/out.txt","content":"written"}}),
                )
                .await;
                // the client's reply to our request
                let reply: Value =
                    serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
                assert_eq!(reply["id"], 900);
                assert!(reply.get("error").is_none(), "{reply}");

                send(
                    &mut write,
                    json!({"jsonrpc":"2.0","method":"session/update","params":{"sessionId":"tcp-session",
                           "update":{"sessionUpdate":"agent_thought_chunk","content":{"type":"text","text":"done"}}}}),
                )
                .await;
                send(
                    &mut write,
                    json!({"jsonrpc":"2.0","id":id,"result":{"stopReason":"end_turn",
                           "usage":{"inputTokens":5,"outputTokens":7}}}),
                )
                .await;
            }
            Some("session/cancel") => {}
            _ => {}
        }
    }
}

#[tokio::test]
async fn tcp_session_serves_agent_requests() {
    let dir = tempfile::tempdir().unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();
    let server = tokio::spawn(serve_fake_agent(listener));

    let procs = supervisor(config_with(vec![PresetConfig {
        id: "remote".into(),
        provider: ProviderKind::Tcp { address },
    }]));
    let (tx, rx) = flume::unbounded();

    let provider_id = procs
        .create_session(CreateSessionRequest::new("caller", dir.path(), "remote"), tx)
        .await
        .unwrap();
    assert_eq!(provider_id, "tcp-session");
    assert_eq!(procs.get_process("caller").unwrap().provider_kind, "tcp");

    let outcome = procs.prompt("caller", "write the notes").await.unwrap();
    assert_eq!(outcome.stop_reason, StopReason::EndTurn);
    assert_eq!(outcome.usage.unwrap().total(), 12);
    assert_eq!(
        std::fs::read_to_string(dir.path().join("notes/out.txt")).unwrap(),
        "written"
    );

    let kinds: Vec<String> = rx
        .try_iter()
        .filter_map(|n: SessionNotification| n.kind().map(str::to_string))
        .collect();
    assert_eq!(kinds, vec!["agent_thought_chunk", "turn_complete"]);

    procs.cancel("caller").await.unwrap();
    procs.kill_session("caller").await;
    assert!(procs.get_process("caller").is_none());
    server.abort();
}
