//! # ticketq-entity
//!
//! Domain entity models for the TicketToken job queue. Every struct in this
//! crate represents a database table row or a domain value object. All
//! entities derive `Debug`, `Clone`, `Serialize`, `Deserialize`, and database
//! entities additionally derive `sqlx::FromRow`.

pub mod idempotency;
pub mod job;
