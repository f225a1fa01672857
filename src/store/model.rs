//! Order ledger records and the status state machine.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::pipeline::types::ParsedRecipient;

/// Credential set an order was (or will be) placed with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderMode {
    Test,
    Live,
}

impl OrderMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Test => "test",
            Self::Live => "live",
        }
    }
}

impl fmt::Display for OrderMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "test" => Ok(Self::Test),
            "live" => Ok(Self::Live),
            other => Err(format!("unknown order mode '{other}'")),
        }
    }
}

/// Lifecycle of an order record.
///
/// Edges: `processing → {sent, failed}`, `sent → {delivered, returned}`.
/// `failed`, `delivered` and `returned` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Processing,
    Sent,
    Delivered,
    Failed,
    Returned,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Processing => "processing",
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::Failed => "failed",
            Self::Returned => "returned",
        }
    }

    /// Whether `self → next` is a permitted edge.
    pub fn can_transition_to(&self, next: OrderStatus) -> bool {
        matches!(
            (self, next),
            (Self::Processing, Self::Sent)
                | (Self::Processing, Self::Failed)
                | (Self::Sent, Self::Delivered)
                | (Self::Sent, Self::Returned)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed | Self::Delivered | Self::Returned)
    }

    /// Map a print-mail provider lifecycle string onto a ledger status.
    ///
    /// Returns `None` for intermediate provider states (`ready`, `rendered`,
    /// `submitted`, `processed`, ...) that don't move the ledger.
    pub fn from_provider_status(status: &str) -> Option<Self> {
        match status.trim().to_ascii_lowercase().as_str() {
            "delivered" | "completed" => Some(Self::Delivered),
            "returned" | "returned_to_sender" => Some(Self::Returned),
            _ => None,
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "processing" => Ok(Self::Processing),
            "sent" => Ok(Self::Sent),
            "delivered" => Ok(Self::Delivered),
            "failed" => Ok(Self::Failed),
            "returned" => Ok(Self::Returned),
            other => Err(format!("unknown order status '{other}'")),
        }
    }
}

/// A persisted order, one per inbound message id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRecord {
    pub id: String,
    /// Inbound message id; the idempotency key.
    pub message_id: String,
    pub sender_email: String,
    /// Snapshot of the parsed address, absent when parsing never produced one.
    pub recipient: Option<ParsedRecipient>,
    pub provider_order_id: Option<String>,
    pub mode: OrderMode,
    pub forced_test_mode: bool,
    pub status: OrderStatus,
    /// Present iff `status == Failed`.
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields supplied by the orchestrator when creating a record.
#[derive(Debug, Clone)]
pub struct NewOrderRecord {
    pub message_id: String,
    pub sender_email: String,
    pub recipient: Option<ParsedRecipient>,
    pub mode: OrderMode,
    pub forced_test_mode: bool,
}
