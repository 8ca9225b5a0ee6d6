//! Logging setup shared by troupe binaries and tests.
//!
//! Library crates only emit `tracing` events; installing a subscriber is the
//! job of whoever owns `main`.

pub mod logging;
