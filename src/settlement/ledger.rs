//! Team ledger bookkeeping.
//!
//! Arbitration fees are never paid through the wallet: they are recorded
//! against the hosting team's existing balance. Entry ids are deterministic,
//! so appending the same entry twice is a no-op.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::record::DistributionRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerEntryKind {
    /// Fee retained by the hosting team, once per unit
    ArbitrationFee,
    /// Prize money paid out by a completed distribution
    PrizeDistributed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub entry_id: String,
    pub team_id: String,
    pub kind: LedgerEntryKind,
    pub amount: u64,
    pub unit_id: String,
    pub distribution_id: String,
    pub created_at: DateTime<Utc>,
}

impl LedgerEntry {
    /// Fee credit. Keyed by unit so a resettle cannot credit it again.
    pub fn arbitration_fee(record: &DistributionRecord, now: DateTime<Utc>) -> Self {
        Self {
            entry_id: format!("fee:{}", record.source_unit_id),
            team_id: record.team_id.clone(),
            kind: LedgerEntryKind::ArbitrationFee,
            amount: record.team_fee,
            unit_id: record.source_unit_id.clone(),
            distribution_id: record.distribution_id.clone(),
            created_at: now,
        }
    }

    pub fn prize_distributed(record: &DistributionRecord, now: DateTime<Utc>) -> Self {
        Self {
            entry_id: format!("paid:{}", record.distribution_id),
            team_id: record.team_id.clone(),
            kind: LedgerEntryKind::PrizeDistributed,
            amount: record.paid_total(),
            unit_id: record.source_unit_id.clone(),
            distribution_id: record.distribution_id.clone(),
            created_at: now,
        }
    }
}

/// Totals of a team's ledger entries
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeamLedgerSummary {
    pub team_id: String,
    pub arbitration_fees: u64,
    pub prizes_distributed: u64,
    pub entry_count: usize,
}

impl TeamLedgerSummary {
    pub fn from_entries(team_id: &str, entries: &[LedgerEntry]) -> Self {
        let mut summary = Self {
            team_id: team_id.to_string(),
            arbitration_fees: 0,
            prizes_distributed: 0,
            entry_count: 0,
        };
        for entry in entries.iter().filter(|e| e.team_id == team_id) {
            summary.entry_count += 1;
            match entry.kind {
                LedgerEntryKind::ArbitrationFee => summary.arbitration_fees += entry.amount,
                LedgerEntryKind::PrizeDistributed => summary.prizes_distributed += entry.amount,
            }
        }
        summary
    }
}
