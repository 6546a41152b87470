//! Document Backend Abstractions
//!
//! The registry talks to databases only through the traits in [`core`].
//! [`memory`] provides an in-process implementation used for development
//! and tests.

pub mod core;
pub mod memory;

pub use core::*;
pub use memory::{MemoryBackend, MemoryCollection, MemoryConnection, UNIQUE_INDEXES_OPTION};
