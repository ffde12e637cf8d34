//! In-memory store implementations.
//!
//! Each store keeps its rows in a [`dashmap::DashMap`] and resolves
//! same-key races through the map's per-entry locking, the in-process
//! equivalent of an atomic upsert. Cloning a store shares its rows, which
//! lets a test drop every service and build fresh ones over the same data
//! to stand in for a process restart.

mod idempotency;
mod job;

pub use idempotency::MemoryIdempotencyStore;
pub use job::MemoryJobStore;
