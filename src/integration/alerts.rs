//! Operational alerts for distributions that did not fully pay out.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::error;

use super::AlertSink;
use crate::settlement::record::{DistributionStatus, DistributionSummary};

/// Raised when a distribution ends `partially_failed` or `failed`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DistributionAlert {
    pub distribution_id: String,
    pub unit_id: String,
    pub status: DistributionStatus,
    pub summary: DistributionSummary,
    /// `user_id: reason` per failed recipient
    pub failures: Vec<String>,
}

/// Alert sink that logs at error level
#[derive(Debug, Default, Clone)]
pub struct TracingAlertSink;

#[async_trait]
impl AlertSink for TracingAlertSink {
    async fn raise(&self, alert: DistributionAlert) {
        error!(
            distribution_id = %alert.distribution_id,
            unit_id = %alert.unit_id,
            status = %alert.status,
            paid = alert.summary.paid_count,
            failed = alert.summary.failed_count,
            failed_sats = alert.summary.failed_amount,
            "🚨 Distribution needs operator attention: {}",
            alert.failures.join(", ")
        );
    }
}
