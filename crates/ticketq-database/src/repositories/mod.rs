//! PostgreSQL repository implementations of the store traits.

pub mod idempotency;
pub mod job;

pub use idempotency::IdempotencyRepository;
pub use job::JobRepository;
