//! Deterministic, pure logic shared by the conductor components.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data and return deterministic outputs suitable for tests.

pub mod budget;
pub mod lifecycle;
pub mod routing;
pub mod signature;
pub mod types;
