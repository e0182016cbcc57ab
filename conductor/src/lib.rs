//! Execution backbone for an autonomous multi-agent task platform.
//!
//! Work requests are admitted through a governed queue, routed by intent,
//! and executed either as a single capability call or as a bounded
//! verify/diagnose/fix loop. Every decision is recorded in a per-task trace.
//!
//! - **[`core`]**: Pure, deterministic logic (lifecycle table, routing,
//!   failure signatures, budget arithmetic). No I/O.
//! - **[`io`]**: Side-effecting adapters (config, capability backends, cost,
//!   lifecycle events, prompts). Behind traits so tests can script them.
//!
//! Stateful components ([`trace`], [`queue`], [`task`], [`orchestrator`],
//! [`healing`], [`watchdog`]) coordinate the two.

pub mod core;
pub mod exit_codes;
pub mod healing;
pub mod io;
pub mod logging;
pub mod orchestrator;
pub mod queue;
pub mod task;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod trace;
pub mod watchdog;
