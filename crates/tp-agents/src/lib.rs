//! Native agents and the application context.
//!
//! [`agent_loop::AgentLoopEngine`] runs an agent in-process: a bounded,
//! step-limited loop of model calls and tool calls. [`config_resolver`]
//! decides which model each session uses, [`agent_tools`] lets native agents
//! coordinate through the event bus, and [`context::AppContext`] wires every
//! component together once at startup.

pub mod agent_loop;
pub mod agent_tools;
pub mod config_resolver;
pub mod context;
pub mod state_machine;
pub mod store;
