//! Integration tests for the job queue reliability layer.

mod helpers;

mod idempotency_test;
mod limiter_test;
mod monitor_test;
mod recovery_test;
