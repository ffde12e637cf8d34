//! Idempotency key derivation.
//!
//! A key names the business intent of a job, so two submissions meaning the
//! same thing collapse onto one execution. Each job type registers a pure
//! function picking the identifying fields out of its payload. Types with
//! no registered function, or payloads missing the fields, fall back to a
//! hash of the job type and the canonical payload.

use std::collections::HashMap;

use serde::Deserialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use ticketq_entity::job::payload::{
    AnalyticsPayload, EmailPayload, MintPayload, PaymentPayload, RefundPayload,
};

/// Pure function deriving a key from a job payload.
pub type KeyDeriver = fn(&Value) -> Option<String>;

/// Registry mapping job types to their key derivation.
#[derive(Debug, Clone, Default)]
pub struct KeyDerivationRegistry {
    derivers: HashMap<String, KeyDeriver>,
}

impl KeyDerivationRegistry {
    /// Create an empty registry. Every job type hashes its payload.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the derivations for the built-in ticketing job types.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("payment-process", payment_key);
        registry.register("refund-process", refund_key);
        registry.register("daily-email", email_key);
        registry.register("send-email", email_key);
        registry.register("nft-mint", mint_key);
        registry.register("analytics-event", analytics_key);
        registry
    }

    /// Register (or replace) the derivation for a job type.
    pub fn register(&mut self, job_type: impl Into<String>, deriver: KeyDeriver) {
        self.derivers.insert(job_type.into(), deriver);
    }

    /// Whether a job type has its own derivation.
    pub fn has_deriver(&self, job_type: &str) -> bool {
        self.derivers.contains_key(job_type)
    }

    /// Derive the idempotency key for a job.
    pub fn derive(&self, job_type: &str, payload: &Value) -> String {
        self.derivers
            .get(job_type)
            .and_then(|derive| derive(payload))
            .unwrap_or_else(|| fallback_key(job_type, payload))
    }
}

/// SHA-256 (hex) of the canonical JSON form of a payload.
///
/// Object keys serialize in sorted order, so field order in the
/// submission does not change the hash.
pub fn request_hash(payload: &Value) -> String {
    hex::encode(Sha256::digest(payload.to_string().as_bytes()))
}

fn fallback_key(job_type: &str, payload: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(job_type.as_bytes());
    hasher.update(b":");
    hasher.update(payload.to_string().as_bytes());
    format!("{job_type}-{}", hex::encode(hasher.finalize()))
}

fn payment_key(payload: &Value) -> Option<String> {
    let p = PaymentPayload::deserialize(payload).ok()?;
    Some(format!(
        "payment-{}-{}-{}-{}",
        p.venue_id, p.user_id, p.event_id, p.amount
    ))
}

fn refund_key(payload: &Value) -> Option<String> {
    let p = RefundPayload::deserialize(payload).ok()?;
    Some(format!("refund-{}", p.transaction_id))
}

fn email_key(payload: &Value) -> Option<String> {
    let p = EmailPayload::deserialize(payload).ok()?;
    Some(format!("email-{}-{}-{}", p.template, p.recipient, p.date))
}

fn mint_key(payload: &Value) -> Option<String> {
    let p = MintPayload::deserialize(payload).ok()?;
    Some(format!("mint-{}", p.ticket_id))
}

fn analytics_key(payload: &Value) -> Option<String> {
    let p = AnalyticsPayload::deserialize(payload).ok()?;
    Some(format!("analytics-{}", p.event_id))
}
