//! # Collaborator Interfaces
//!
//! Everything the settlement core consumes but does not own:
//!
//! - `ResultsProvider`: ranked-metric source for a finished unit
//! - `WalletPaymentService`: Lightning wallet provider, paid through idempotency keys
//! - `NotificationService`: fire-and-forget user notifications
//! - `AlertSink`: operational alerting for failed distributions
//!
//! Services are passed in as `Arc<dyn Trait>` so tests can swap in doubles.

pub mod alerts;
pub mod notification;

pub use alerts::{DistributionAlert, TracingAlertSink};
pub use notification::{
    notify_logged, Notification, NotificationError, NotificationPayload, TracingNotifier,
    NOTIFICATION_SCHEMA_VERSION,
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::settlement::planner::ParticipantResult;

// ============================================================================
// RESULTS
// ============================================================================

/// Errors from the results aggregation collaborator
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResultsError {
    #[error("Results not ready for unit {0}")]
    NotReady(String),

    #[error("Results provider unavailable: {0}")]
    Unavailable(String),
}

/// Source of participant results for a unit that reached settlement
#[async_trait]
pub trait ResultsProvider: Send + Sync {
    /// Results of the unit, or `NotReady` while data is still being collected
    async fn get_results(&self, unit_id: &str) -> Result<Vec<ParticipantResult>, ResultsError>;
}

// ============================================================================
// WALLET PAYMENTS
// ============================================================================

/// One payout request sent to the wallet provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentRequest {
    pub recipient_user_id: String,
    pub amount_sats: u64,
    /// `distribution_id:user_id`; a repeated call with the same key must not pay again
    pub idempotency_key: String,
    pub memo: String,
}

/// Successful payment confirmation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentReceipt {
    pub transaction_hash: String,
}

/// Per-recipient payment failure kinds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum PaymentError {
    /// Network error or timeout; retried with backoff
    #[error("Transient payment failure: {0}")]
    Transient(String),

    #[error("Insufficient funds: {0}")]
    InsufficientFunds(String),

    #[error("Invalid recipient: {0}")]
    InvalidRecipient(String),

    /// Provider throttled the request; retried with backoff
    #[error("Rate limited: {0}")]
    RateLimited(String),
}

impl PaymentError {
    /// Transient kinds are retried locally, the rest fail the recipient at once
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::RateLimited(_))
    }
}

/// External Lightning wallet payment interface
#[async_trait]
pub trait WalletPaymentService: Send + Sync {
    async fn pay(&self, request: &PaymentRequest) -> Result<PaymentReceipt, PaymentError>;
}

// ============================================================================
// NOTIFICATIONS & ALERTS
// ============================================================================

/// User notification delivery. Callers log failures and move on.
#[async_trait]
pub trait NotificationService: Send + Sync {
    async fn notify(&self, notification: Notification) -> Result<(), NotificationError>;
}

/// Operational alerting for distributions that need operator attention
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn raise(&self, alert: DistributionAlert);
}
