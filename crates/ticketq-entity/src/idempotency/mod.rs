//! Idempotency record entities.

pub mod model;

pub use model::IdempotencyRecord;
