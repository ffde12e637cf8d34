//! Core traits defined in `ticketq-core` and implemented by other crates.

pub mod cache;

pub use cache::CacheProvider;
