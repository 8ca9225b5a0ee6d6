//! Long-running host for the troupe orchestration layer.
//!
//! Builds the [`tp_agents::context::AppContext`], runs the background tasks
//! that watch it, and tears everything down on shutdown.

pub mod daemon;
