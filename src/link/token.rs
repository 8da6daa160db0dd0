//! Outbound command tokens.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use serde_json::Value;

use crate::link::proto::TransactionId;

static NEXT_TRANSACTION_ID: AtomicU64 = AtomicU64::new(1);

/// Allocates a transaction id that is unique for the lifetime of the process.
pub fn next_transaction_id() -> TransactionId {
    TransactionId::from(NEXT_TRANSACTION_ID.fetch_add(1, Ordering::Relaxed))
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TokenHeaders {
    #[serde(rename = "transactionID")]
    pub transaction_id: TransactionId,
    pub command: String,
}

/// A command sent to the device, correlated to its response by
/// `headers.transactionID`.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Token {
    pub headers: TokenHeaders,
    pub body: Value,
}

impl Token {
    /// Builds a token with a freshly allocated transaction id.
    pub fn new(command: impl Into<String>, body: Value) -> Self {
        Self::with_transaction_id(next_transaction_id(), command, body)
    }

    /// Builds a token with a caller-supplied transaction id.
    ///
    /// The caller is responsible for keeping the id unique among in-flight
    /// requests; a clash is rejected when the token is sent.
    pub fn with_transaction_id(
        transaction_id: TransactionId,
        command: impl Into<String>,
        body: Value,
    ) -> Self {
        Self {
            headers: TokenHeaders {
                transaction_id,
                command: command.into(),
            },
            body,
        }
    }

    pub fn transaction_id(&self) -> &TransactionId {
        &self.headers.transaction_id
    }

    pub fn command(&self) -> &str {
        &self.headers.command
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}
