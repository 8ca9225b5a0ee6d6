use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tp_agents::context::AppContext;
use tp_bridge::event_bus::EventBus;
use tp_core::config::Config;
use tp_harness::shutdown::{DrainResult, ShutdownSignal};
use tracing::{debug, error, info, warn};

/// How often the session summary is logged.
pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(60);

/// How long background tasks get to finish after shutdown is triggered.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Snapshot of what the context is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionCounts {
    pub processes: usize,
    pub loops: usize,
    pub terminals: usize,
    pub running_terminals: usize,
}

impl SessionCounts {
    pub fn collect(ctx: &AppContext) -> Self {
        let terminals = ctx.terminals.list(None);
        Self {
            processes: ctx.processes.list_sessions().len(),
            loops: ctx.agent_loop.list_sessions().len(),
            terminals: terminals.len(),
            running_terminals: terminals.iter().filter(|t| t.exit_code.is_none()).count(),
        }
    }
}

pub struct Daemon {
    ctx: Arc<AppContext>,
    heartbeat: Duration,
    shutdown_grace: Duration,
}

impl Daemon {
    pub fn new(config: Config) -> Self {
        Self::with_context(Arc::new(AppContext::in_memory(config)))
    }

    pub fn with_context(ctx: Arc<AppContext>) -> Self {
        Self {
            ctx,
            heartbeat: DEFAULT_HEARTBEAT,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }

    pub fn with_heartbeat(mut self, interval: Duration) -> Self {
        self.heartbeat = interval;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn context(&self) -> &Arc<AppContext> {
        &self.ctx
    }

    /// Returns a handle that can be used to trigger shutdown from another task.
    pub fn shutdown_handle(&self) -> ShutdownSignal {
        self.ctx.shutdown_signal().clone()
    }

    /// Run the background tasks until shutdown is triggered, then stop every
    /// session and drain.
    pub async fn run(&self) -> Result<DrainResult> {
        self.ctx.spawn_dispatcher();

        let bus = self.ctx.bus.clone();
        self.ctx
            .tasks
            .spawn("event-log", move |signal| log_events(bus, signal));

        let ctx = Arc::clone(&self.ctx);
        let interval = self.heartbeat;
        self.ctx
            .tasks
            .spawn("heartbeat", move |signal| heartbeat(ctx, interval, signal));

        let failures = self.ctx.tasks.failures();
        let signal = self.shutdown_handle();
        info!(presets = self.ctx.config.presets.len(), "daemon running");
        loop {
            tokio::select! {
                _ = signal.wait() => break,
                Ok(failure) = failures.recv_async() => {
                    error!(task = %failure.name, error = %failure.error, "background task failed");
                }
            }
        }

        let drained = self.ctx.shutdown(self.shutdown_grace).await;
        match &drained {
            DrainResult::Complete(n) => info!(tasks = n, "daemon stopped"),
            DrainResult::Timeout { finished, aborted } => {
                warn!(finished, aborted, "daemon stopped with tasks aborted")
            }
        }
        Ok(drained)
    }
}

/// Mirror every coordination event into the log.
async fn log_events(bus: EventBus, signal: ShutdownSignal) -> Result<()> {
    let events = bus.tap();
    loop {
        tokio::select! {
            _ = signal.wait() => return Ok(()),
            event = events.recv_async() => {
                let Ok(event) = event else {
                    return Ok(());
                };
                info!(
                    event_type = %event.event_type,
                    agent_id = %event.agent_id,
                    agent_name = %event.agent_name,
                    workspace_id = %event.workspace_id,
                    target = event.target_agent_id().unwrap_or_default(),
                    "agent event"
                );
            }
        }
    }
}

async fn heartbeat(ctx: Arc<AppContext>, interval: Duration, signal: ShutdownSignal) -> Result<()> {
    let mut ticker = tokio::time::interval(interval);
    // The first tick is immediate.
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = signal.wait() => return Ok(()),
            _ = ticker.tick() => {
                let counts = SessionCounts::collect(&ctx);
                info!(
                    processes = counts.processes,
                    loops = counts.loops,
                    terminals = counts.terminals,
                    running_terminals = counts.running_terminals,
                    "heartbeat"
                );
                for (session_id, resolved) in ctx.configs.list() {
                    debug!(
                        session_id = %session_id,
                        provider = %resolved.provider,
                        model = resolved.resolved_model.as_deref().unwrap_or("<provider default>"),
                        "session model"
                    );
                }
            }
        }
    }
}
