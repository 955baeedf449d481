//! Distribution Records - Idempotent Units of Payout Work
//!
//! A record is created once per settlement pass and reused by every retry.
//! Its `distribution_id` is derived from the unit id and the pass number, so
//! re-planning after a crash produces the same id and the same idempotency
//! keys (`distribution_id:user_id`).
//!
//! ## Status rules:
//! - no recipients, or all `paid` → `completed` (terminal, immutable)
//! - some `pending` → `pending` if nothing was attempted yet, else `executing`
//! - otherwise → `partially_failed` if anyone was paid, else `failed`

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::planner::{DistributionMethod, PayoutPlan};
use super::unit::CompetitiveUnit;
use crate::integration::PaymentError;

/// Payment status of one recipient
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecipientStatus {
    Pending,
    Paid,
    Failed,
}

/// Overall status of a distribution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistributionStatus {
    /// Created, no payment attempted
    Pending,
    /// Payments dispatched, or an execution was interrupted
    Executing,
    /// Every recipient paid (terminal)
    Completed,
    /// Some paid, some failed, none pending
    PartiallyFailed,
    /// Nobody paid, none pending
    Failed,
}

impl DistributionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Executing => "executing",
            Self::Completed => "completed",
            Self::PartiallyFailed => "partially_failed",
            Self::Failed => "failed",
        }
    }

    /// Statuses that warrant an operator alert
    pub fn needs_attention(self) -> bool {
        matches!(self, Self::PartiallyFailed | Self::Failed)
    }
}

impl fmt::Display for DistributionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One payee of a distribution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentRecipient {
    pub user_id: String,
    pub amount: u64,
    pub position: u32,
    /// Human-readable justification ("Position #1", "Winner")
    pub reason: String,
    pub status: RecipientStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_hash: Option<String>,
    /// Last failure, cleared once paid
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<PaymentError>,
    /// Wallet calls made across all executions
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paid_at: Option<DateTime<Utc>>,
}

impl PaymentRecipient {
    /// Recipients still owed money
    pub fn needs_payment(&self) -> bool {
        self.status != RecipientStatus::Paid
    }

    pub(crate) fn mark_paid(&mut self, transaction_hash: String, at: DateTime<Utc>) {
        self.status = RecipientStatus::Paid;
        self.transaction_hash = Some(transaction_hash);
        self.failure = None;
        self.paid_at = Some(at);
    }

    pub(crate) fn mark_failed(&mut self, error: PaymentError) {
        self.status = RecipientStatus::Failed;
        self.failure = Some(error);
    }
}

/// Persisted, idempotent batch of payments for one settlement pass
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistributionRecord {
    pub distribution_id: String,
    pub source_unit_id: String,
    /// Team credited with the arbitration fee
    pub team_id: String,
    /// 1 for the first pass, incremented by every resettle
    pub settlement_pass: u32,
    pub method: DistributionMethod,
    pub total_prize: u64,
    pub team_fee: u64,
    pub recipients: Vec<PaymentRecipient>,
    pub overall_status: DistributionStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Set when a later pass replaced this record
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub superseded_by: Option<String>,
    /// Optimistic concurrency counter, bumped by every store update
    #[serde(default)]
    pub revision: u64,
}

impl DistributionRecord {
    /// Stable id for `(unit_id, pass)`: "dist_" + first 32 hex chars of SHA-256
    pub fn derive_distribution_id(unit_id: &str, pass: u32) -> String {
        let hash = Sha256::digest(format!("distribution|{}|{}", unit_id, pass).as_bytes());
        format!("dist_{}", &hex::encode(hash)[..32])
    }

    /// Seed a pending record from a plan
    pub fn from_plan(
        unit: &CompetitiveUnit,
        pass: u32,
        plan: &PayoutPlan,
        now: DateTime<Utc>,
    ) -> Self {
        let recipients = plan
            .entries
            .iter()
            .map(|entry| PaymentRecipient {
                user_id: entry.recipient_user_id.clone(),
                amount: entry.amount,
                position: entry.position,
                reason: entry.reason.clone(),
                status: RecipientStatus::Pending,
                transaction_hash: None,
                failure: None,
                attempts: 0,
                paid_at: None,
            })
            .collect();

        let mut record = Self {
            distribution_id: Self::derive_distribution_id(&unit.id, pass),
            source_unit_id: unit.id.clone(),
            team_id: unit.team_id.clone(),
            settlement_pass: pass,
            method: plan.method,
            total_prize: plan.total_prize,
            team_fee: plan.team_fee,
            recipients,
            overall_status: DistributionStatus::Pending,
            created_at: now,
            completed_at: None,
            superseded_by: None,
            revision: 0,
        };
        record.refresh_status(now);
        record
    }

    /// Key the wallet provider deduplicates on
    pub fn idempotency_key(&self, user_id: &str) -> String {
        format!("{}:{}", self.distribution_id, user_id)
    }

    pub fn recipient(&self, user_id: &str) -> Option<&PaymentRecipient> {
        self.recipients.iter().find(|r| r.user_id == user_id)
    }

    pub(crate) fn recipient_mut(&mut self, user_id: &str) -> Option<&mut PaymentRecipient> {
        self.recipients.iter_mut().find(|r| r.user_id == user_id)
    }

    /// Status implied by the recipient statuses
    pub fn recompute_status(&self) -> DistributionStatus {
        let mut paid = 0usize;
        let mut failed = 0usize;
        let mut pending = 0usize;
        let mut attempted = false;
        for r in &self.recipients {
            match r.status {
                RecipientStatus::Paid => paid += 1,
                RecipientStatus::Failed => failed += 1,
                RecipientStatus::Pending => pending += 1,
            }
            attempted |= r.attempts > 0;
        }

        if paid == self.recipients.len() {
            DistributionStatus::Completed
        } else if pending > 0 {
            if attempted || paid > 0 || failed > 0 {
                DistributionStatus::Executing
            } else {
                DistributionStatus::Pending
            }
        } else if paid > 0 {
            DistributionStatus::PartiallyFailed
        } else {
            DistributionStatus::Failed
        }
    }

    /// Apply `recompute_status` and stamp `completed_at` on completion
    pub fn refresh_status(&mut self, now: DateTime<Utc>) {
        self.overall_status = self.recompute_status();
        if self.overall_status == DistributionStatus::Completed && self.completed_at.is_none() {
            self.completed_at = Some(now);
        }
    }

    pub fn is_active(&self) -> bool {
        self.superseded_by.is_none()
    }

    /// Completed or superseded records never change again
    pub fn is_immutable(&self) -> bool {
        self.overall_status == DistributionStatus::Completed || self.superseded_by.is_some()
    }

    /// A retry may target this record
    pub fn is_retryable(&self) -> bool {
        !self.is_immutable() && self.recipients.iter().any(|r| r.needs_payment())
    }

    /// Whether a fresh settlement pass may replace this record. Only when no
    /// money can have moved: nobody paid, and no failure that might have
    /// settled on the provider side (transient kinds are ambiguous).
    pub fn is_supersedable(&self) -> bool {
        self.is_active()
            && matches!(
                self.overall_status,
                DistributionStatus::Pending | DistributionStatus::Failed
            )
            && self.recipients.iter().all(|r| match r.status {
                RecipientStatus::Paid => false,
                RecipientStatus::Pending => r.attempts == 0,
                RecipientStatus::Failed => r.failure.as_ref().map_or(false, |e| !e.is_transient()),
            })
    }

    pub fn paid_total(&self) -> u64 {
        self.recipients
            .iter()
            .filter(|r| r.status == RecipientStatus::Paid)
            .map(|r| r.amount)
            .sum()
    }

    pub fn summary(&self) -> DistributionSummary {
        DistributionSummary::from_recipients(&self.recipients)
    }
}

/// Counts and amounts by recipient status
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DistributionSummary {
    pub total_count: usize,
    pub paid_count: usize,
    pub failed_count: usize,
    pub pending_count: usize,
    pub total_amount: u64,
    pub paid_amount: u64,
    pub failed_amount: u64,
    pub pending_amount: u64,
    /// `paid_count / total_count`, 1.0 for an empty distribution
    pub success_rate: f64,
    pub has_partial_failures: bool,
}

impl DistributionSummary {
    pub fn from_recipients(recipients: &[PaymentRecipient]) -> Self {
        let mut summary = Self {
            total_count: recipients.len(),
            paid_count: 0,
            failed_count: 0,
            pending_count: 0,
            total_amount: 0,
            paid_amount: 0,
            failed_amount: 0,
            pending_amount: 0,
            success_rate: 1.0,
            has_partial_failures: false,
        };
        for r in recipients {
            summary.total_amount += r.amount;
            match r.status {
                RecipientStatus::Paid => {
                    summary.paid_count += 1;
                    summary.paid_amount += r.amount;
                }
                RecipientStatus::Failed => {
                    summary.failed_count += 1;
                    summary.failed_amount += r.amount;
                }
                RecipientStatus::Pending => {
                    summary.pending_count += 1;
                    summary.pending_amount += r.amount;
                }
            }
        }
        if summary.total_count > 0 {
            summary.success_rate = summary.paid_count as f64 / summary.total_count as f64;
        }
        summary.has_partial_failures = summary.failed_count > 0 && summary.paid_count > 0;
        summary
    }
}

impl fmt::Display for DistributionSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{} paid ({} sats), {} failed ({} sats), {} pending ({} sats)",
            self.paid_count,
            self.total_count,
            self.paid_amount,
            self.failed_count,
            self.failed_amount,
            self.pending_count,
            self.pending_amount
        )
    }
}
