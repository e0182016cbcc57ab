//! Side-effecting adapters: configuration, capability backends, cost, events.

pub mod capability;
pub mod command;
pub mod config;
pub mod cost;
pub mod notifier;
pub mod process;
pub mod prompt;
