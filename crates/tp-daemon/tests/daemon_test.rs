use std::sync::Arc;
use std::time::Duration;

use tp_agents::context::{AppContext, NativeSessionRequest};
use tp_bridge::protocol::{AgentEvent, AgentEventType};
use tp_core::config::Config;
use tp_daemon::daemon::{Daemon, SessionCounts};
use tp_harness::shutdown::DrainResult;

#[tokio::test]
async fn run_returns_after_shutdown_and_stops_sessions() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = Arc::new(AppContext::in_memory(Config::default()));
    ctx.start_native_session(NativeSessionRequest::new("s1", dir.path()))
        .unwrap();

    let daemon = Daemon::with_context(ctx.clone())
        .with_heartbeat(Duration::from_millis(20))
        .with_shutdown_grace(Duration::from_secs(5));
    let shutdown = daemon.shutdown_handle();

    let running = tokio::spawn(async move { daemon.run().await });
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(SessionCounts::collect(&ctx).loops, 1);

    // Events flow through the logging tap without disturbing anything.
    ctx.bus
        .emit(AgentEvent::new(AgentEventType::AgentCreated, "a1", "alpha"));

    shutdown.trigger();
    let drained = tokio::time::timeout(Duration::from_secs(10), running)
        .await
        .expect("daemon did not stop")
        .unwrap()
        .unwrap();

    assert_eq!(drained, DrainResult::Complete(3));
    assert_eq!(
        SessionCounts::collect(&ctx),
        SessionCounts {
            processes: 0,
            loops: 0,
            terminals: 0,
            running_terminals: 0,
        }
    );
}
