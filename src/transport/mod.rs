//! Connection implementations.
//!
//! This module provides concrete implementations of the domain-level
//! [`HubConnection`](crate::HubConnection) trait. The hub core never depends
//! on connection-specific types.

mod memory;
mod pending;

pub use memory::{MemoryConnection, RawPeer, STREAMING_NOT_SUPPORTED};
