//! The `broker` module is the heart of the pub/sub system.
//!
//! It owns the registry of connected clients, the registry of topics and
//! the bookkeeping of deliveries awaiting acknowledgement. Both registries
//! are sharded concurrent maps, so the broker is shared as a plain
//! `Arc<Broker>` without an outer lock.

pub mod engine;
pub mod inflight;
pub mod topic;

pub use engine::Broker;

#[cfg(test)]
mod tests;
