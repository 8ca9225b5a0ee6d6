use std::fmt;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// LoopState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    Init,
    Acting,
    Done,
    Failed,
}

impl LoopState {
    /// Done and Failed are absorbing.
    pub fn is_terminal(&self) -> bool {
        matches!(self, LoopState::Done | LoopState::Failed)
    }
}

impl fmt::Display for LoopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            LoopState::Init => "Init",
            LoopState::Acting => "Acting",
            LoopState::Done => "Done",
            LoopState::Failed => "Failed",
        };
        write!(f, "{}", label)
    }
}

// ---------------------------------------------------------------------------
// LoopEvent
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopEvent {
    /// A prompt arrived.
    Start,
    /// One model step is about to run.
    Step,
    /// The model finished without requesting tools.
    Finish,
    /// Error, cancellation or limit breach.
    Fail,
}

impl fmt::Display for LoopEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            LoopEvent::Start => "Start",
            LoopEvent::Step => "Step",
            LoopEvent::Finish => "Finish",
            LoopEvent::Fail => "Fail",
        };
        write!(f, "{}", label)
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum StateMachineError {
    #[error("invalid transition: cannot apply {event} in state {state}")]
    InvalidTransition { state: LoopState, event: LoopEvent },

    /// A step was requested with the step budget already spent.
    #[error("step limit of {max_steps} reached")]
    StepLimit { max_steps: u32 },
}

// ---------------------------------------------------------------------------
// AgentLoopState
// ---------------------------------------------------------------------------

/// Serializable view of an [`AgentLoopState`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoopSnapshot {
    pub state: LoopState,
    pub step_count: u32,
    pub max_steps: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub last_step_at: Option<DateTime<Utc>>,
}

/// State of one turn of the agent loop.
///
/// Valid transitions:
/// - Init   + Start  -> Acting
/// - Init   + Fail   -> Failed
/// - Acting + Step   -> Acting (step_count + 1, refused at the ceiling)
/// - Acting + Finish -> Done
/// - Acting + Fail   -> Failed
#[derive(Debug, Clone)]
pub struct AgentLoopState {
    current: LoopState,
    step_count: u32,
    max_steps: u32,
    total_timeout: Duration,
    started: Option<Instant>,
    started_at: Option<DateTime<Utc>>,
    last_step_at: Option<DateTime<Utc>>,
    history: Vec<(LoopState, LoopEvent, LoopState)>,
}

impl AgentLoopState {
    pub fn new(max_steps: u32, total_timeout: Duration) -> Self {
        Self {
            current: LoopState::Init,
            step_count: 0,
            max_steps,
            total_timeout,
            started: None,
            started_at: None,
            last_step_at: None,
            history: Vec::new(),
        }
    }

    pub fn state(&self) -> LoopState {
        self.current
    }

    pub fn step_count(&self) -> u32 {
        self.step_count
    }

    pub fn max_steps(&self) -> u32 {
        self.max_steps
    }

    pub fn history(&self) -> &[(LoopState, LoopEvent, LoopState)] {
        &self.history
    }

    /// Time since `Start`; zero before the turn started.
    pub fn elapsed(&self) -> Duration {
        self.started.map(|s| s.elapsed()).unwrap_or_default()
    }

    /// Wall-clock budget left in this turn.
    pub fn remaining(&self) -> Duration {
        self.total_timeout.saturating_sub(self.elapsed())
    }

    pub fn transition(&mut self, event: LoopEvent) -> Result<LoopState, StateMachineError> {
        let next = match (self.current, event) {
            (LoopState::Init, LoopEvent::Start) => {
                self.started = Some(Instant::now());
                self.started_at = Some(Utc::now());
                LoopState::Acting
            }
            (LoopState::Acting, LoopEvent::Step) => {
                if self.step_count >= self.max_steps {
                    return Err(StateMachineError::StepLimit {
                        max_steps: self.max_steps,
                    });
                }
                self.step_count += 1;
                self.last_step_at = Some(Utc::now());
                LoopState::Acting
            }
            (LoopState::Acting, LoopEvent::Finish) => LoopState::Done,
            (LoopState::Init | LoopState::Acting, LoopEvent::Fail) => LoopState::Failed,
            _ => {
                return Err(StateMachineError::InvalidTransition {
                    state: self.current,
                    event,
                });
            }
        };

        let from = self.current;
        self.current = next;
        self.history.push((from, event, next));
        tracing::trace!(from = %from, event = %event, to = %next, step = self.step_count, "loop state transition");
        Ok(next)
    }

    /// `Some(reason)` iff the step budget is spent or the turn ran out of time.
    pub fn check_limits(&self) -> Option<String> {
        if self.step_count >= self.max_steps {
            return Some(format!(
                "step limit reached ({}/{} steps)",
                self.step_count, self.max_steps
            ));
        }
        let elapsed = self.elapsed();
        if elapsed >= self.total_timeout {
            return Some(format!(
                "time limit reached ({}ms of {}ms)",
                elapsed.as_millis(),
                self.total_timeout.as_millis()
            ));
        }
        None
    }

    pub fn snapshot(&self) -> LoopSnapshot {
        LoopSnapshot {
            state: self.current,
            step_count: self.step_count,
            max_steps: self.max_steps,
            started_at: self.started_at,
            last_step_at: self.last_step_at,
        }
    }
}
