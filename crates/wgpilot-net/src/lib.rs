//! Per-subnet host address allocation.
//!
//! This crate owns a single pure function: given a subnet and the set of
//! host addresses already in use, return the next free one. It holds no
//! state of its own — serializing concurrent allocation within a network
//! is the caller's job (see `wgpilot-core`'s per-network mutex).

pub mod allocator;
pub mod error;

pub use allocator::{next_free_host, server_host};
pub use error::{AllocatorError, Result};
