//! In-process coordination between agents.
//!
//! Agents never talk to each other directly. Everything that one agent needs
//! to know about another (it was created, it was handed a task, it submitted
//! a report, it sent a message) travels as an [`protocol::AgentEvent`]
//! through the [`event_bus::EventBus`], which is also where multi-agent
//! synchronization happens:
//!
//! - durable and one-shot subscriptions with per-agent buffers
//! - wait groups that fire once every expected agent has reported
//! - pre-subscriptions, a future that resolves on the first matching event

pub mod event_bus;
pub mod protocol;
