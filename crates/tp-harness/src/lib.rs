//! Execution layer under the native agent loop: providers, tools and task supervision.
//!
//! - [`provider`]: the model-caller trait and its message vocabulary
//! - [`tools`]: coding tools (files, search, shell) confined to a working root
//! - [`shutdown`]: cooperative shutdown and supervised background tasks

pub mod provider;
pub mod shutdown;
pub mod tools;
