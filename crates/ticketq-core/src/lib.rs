//! # ticketq-core
//!
//! Core crate for the TicketToken job queue. Contains the cache provider
//! trait, configuration schemas, and the unified error system.
//!
//! This crate has **no** internal dependencies on other ticketq crates.

pub mod config;
pub mod error;
pub mod result;
pub mod traits;

pub use error::AppError;
pub use result::AppResult;
