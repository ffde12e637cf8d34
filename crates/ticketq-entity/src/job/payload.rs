//! Typed payloads for job types whose idempotency key is derived from fields.
//!
//! Producers send free-form JSON; these structs pick out only the fields
//! that identify the business intent. Extra fields are ignored.

use serde::{Deserialize, Serialize};

/// `payment-process`: capture a ticket payment.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentPayload {
    /// Venue selling the tickets.
    pub venue_id: String,
    /// Purchasing user.
    pub user_id: String,
    /// Event the tickets are for.
    pub event_id: String,
    /// Amount, kept in its textual JSON form so `100` and `100.0` stay distinct.
    pub amount: serde_json::Number,
}

/// `refund-process`: refund a captured transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefundPayload {
    /// Processor transaction being refunded.
    pub transaction_id: String,
}

/// `daily-email` / `send-email`: templated email to one recipient.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailPayload {
    /// Template identifier.
    pub template: String,
    /// Recipient address.
    pub recipient: String,
    /// Calendar date (YYYY-MM-DD) the message belongs to.
    pub date: String,
}

/// `nft-mint`: mint the on-chain ticket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MintPayload {
    /// Ticket being minted.
    pub ticket_id: String,
}

/// `analytics-event`: record one analytics event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyticsPayload {
    /// Producer-assigned event identifier.
    pub event_id: String,
}
