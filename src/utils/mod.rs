//! Pure utility functions.
//!
//! Stateless helpers shared across the bus and its binaries.

pub mod bootstrap;
pub mod retry;
