//! Agent processes and the terminals they run.
//!
//! [`process::ProcessSupervisor`] spawns or connects agent providers (ACP over
//! stdio or TCP, Claude Code over stream-json) and drives their sessions.
//! [`terminal::TerminalSupervisor`] owns shell commands those agents ask the
//! client to run. Each supervisor is the only component that terminates the
//! processes it started.

pub mod adapter;
pub mod client;
pub mod error;
pub mod process;
pub mod rpc;
pub mod terminal;

pub use error::{ProcessError, Result};
