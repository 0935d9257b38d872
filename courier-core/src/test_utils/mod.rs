//! Test utilities shared by unit and integration tests
//!
//! Fixtures wire a complete engine against [`MemoryStore`](crate::store::MemoryStore)
//! and a [`ManualClock`](crate::clock::ManualClock); the recorders stand in for
//! the push and transport ports.

pub mod async_helpers;
pub mod fixtures;
pub mod recorders;

pub use async_helpers::*;
pub use fixtures::*;
pub use recorders::*;
