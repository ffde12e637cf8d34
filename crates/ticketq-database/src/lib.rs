//! # ticketq-database
//!
//! Durable stores for the job queue: the store traits the queue core is
//! written against, their PostgreSQL repositories, and in-memory
//! implementations for single-node runs and tests.

pub mod connection;
pub mod memory;
pub mod migration;
pub mod repositories;
pub mod store;

pub use connection::DatabasePool;
pub use store::{ClaimOutcome, IdempotencyRecordStore, JobStore};
