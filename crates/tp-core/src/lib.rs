//! Shared vocabulary for the troupe workspace.
//!
//! Every component that talks to a caller (process sessions, terminals, the
//! native agent loop) emits the same [`notification::SessionNotification`]
//! envelope, and every component reads its knobs from the same
//! [`config::Config`]. Keeping both here lets the leaf crates stay
//! independent of one another.

pub mod config;
pub mod notification;
pub mod paths;
pub mod types;
