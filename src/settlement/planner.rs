//! Payout Planner - Pure Prize Split Computation
//!
//! Turns a prize pool, an arbitration fee and the ranked results of a unit
//! into an ordered list of `(recipient, amount, reason)` entries.
//!
//! ## Rules:
//! - `team_fee = floor(total_prize * fee_percent / 100)`, the rest is distributed
//! - Every split is integer satoshi arithmetic, done in `u128` so it cannot overflow
//! - Rounding leftovers go to a single, deterministically chosen recipient
//! - No clock, no randomness: identical inputs give byte-identical plans

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

// ============================================================================
// RESULTS & RANKING
// ============================================================================

/// Measured metric of one participant (distance, workouts, ...)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantResult {
    pub user_id: String,
    /// Higher is better
    pub value: f64,
}

impl ParticipantResult {
    pub fn new(user_id: impl Into<String>, value: f64) -> Self {
        Self {
            user_id: user_id.into(),
            value,
        }
    }
}

/// A result with its derived competition rank (1 = best)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedResult {
    pub user_id: String,
    pub value: f64,
    pub rank: u32,
}

/// Order results by value descending, then user id ascending, and assign
/// standard competition ranks (ties share a rank, the next rank skips).
pub fn rank_results(results: &[ParticipantResult]) -> Result<Vec<RankedResult>, PlanningError> {
    let mut seen = BTreeSet::new();
    for result in results {
        if result.user_id.trim().is_empty() {
            return Err(PlanningError::InvalidResult {
                user_id: result.user_id.clone(),
                reason: "empty user id".to_string(),
            });
        }
        if !result.value.is_finite() {
            return Err(PlanningError::InvalidResult {
                user_id: result.user_id.clone(),
                reason: format!("non-finite value {}", result.value),
            });
        }
        if !seen.insert(result.user_id.as_str()) {
            return Err(PlanningError::DuplicateParticipant(result.user_id.clone()));
        }
    }

    let mut sorted: Vec<(&str, f64)> = results
        .iter()
        // -0.0 and 0.0 must compare equal under total_cmp
        .map(|r| (r.user_id.as_str(), if r.value == 0.0 { 0.0 } else { r.value }))
        .collect();
    sorted.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(b.0)));

    let mut ranked: Vec<RankedResult> = Vec::with_capacity(sorted.len());
    for (index, (user_id, value)) in sorted.into_iter().enumerate() {
        let rank = match ranked.last() {
            Some(prev) if prev.value == value => prev.rank,
            _ => index as u32 + 1,
        };
        ranked.push(RankedResult {
            user_id: user_id.to_string(),
            value,
            rank,
        });
    }
    Ok(ranked)
}

// ============================================================================
// POLICY & PLAN
// ============================================================================

/// How the distributable pool is split
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum PayoutPolicy {
    /// Even split across every ranked participant
    Equal,
    /// Caller-supplied integer weight per user; unweighted users get nothing
    Weighted { weights: BTreeMap<String, u64> },
    /// Weights by finishing position, e.g. `[50, 30, 20]` for the podium
    Positional { weights: Vec<u64> },
    /// Whole pool to the single rank-1 participant
    WinnerTakeAll,
}

impl PayoutPolicy {
    /// Method recorded on the distribution
    pub fn method(&self) -> DistributionMethod {
        match self {
            Self::Equal => DistributionMethod::Equal,
            Self::Weighted { .. } | Self::Positional { .. } => DistributionMethod::Weighted,
            Self::WinnerTakeAll => DistributionMethod::Custom,
        }
    }
}

/// Distribution method stored on a `DistributionRecord`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistributionMethod {
    Equal,
    Weighted,
    Custom,
}

impl fmt::Display for DistributionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Equal => "equal",
            Self::Weighted => "weighted",
            Self::Custom => "custom",
        };
        f.write_str(s)
    }
}

/// One line of a payout plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanEntry {
    pub recipient_user_id: String,
    pub amount: u64,
    /// Competition rank of the recipient
    pub position: u32,
    pub reason: String,
}

/// Planner output. Not persisted directly, it seeds a `DistributionRecord`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayoutPlan {
    pub method: DistributionMethod,
    pub total_prize: u64,
    pub team_fee: u64,
    pub entries: Vec<PlanEntry>,
}

impl PayoutPlan {
    fn empty(method: DistributionMethod, total_prize: u64, team_fee: u64) -> Self {
        Self {
            method,
            total_prize,
            team_fee,
            entries: Vec::new(),
        }
    }

    pub fn distributed_total(&self) -> u64 {
        self.entries.iter().map(|e| e.amount).sum()
    }

    /// Pool left unassigned after the fee and all entries
    pub fn remainder(&self) -> u64 {
        self.total_prize
            .saturating_sub(self.team_fee)
            .saturating_sub(self.distributed_total())
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Planning failures. Only `EmptyPool` is recoverable (it yields an empty plan).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum PlanningError {
    #[error("Prize pool is empty")]
    EmptyPool,

    #[error("No eligible recipients")]
    NoEligibleRecipients,

    #[error("Ambiguous winner: {tied:?} share rank 1")]
    AmbiguousWinner { tied: Vec<String> },

    #[error("Duplicate participant: {0}")]
    DuplicateParticipant(String),

    #[error("Invalid result for {user_id}: {reason}")]
    InvalidResult { user_id: String, reason: String },

    #[error("Invalid arbitration fee: {0}%")]
    InvalidFeePercent(u8),
}

impl PlanningError {
    /// Fatal errors abort the settlement pass before any money moves
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::EmptyPool)
    }
}

// ============================================================================
// PLANNER
// ============================================================================

/// Stateless payout planner
pub struct PayoutPlanner;

impl PayoutPlanner {
    /// `floor(total_prize * fee_percent / 100)`
    pub fn team_fee(total_prize: u64, fee_percent: u8) -> u64 {
        let fee = total_prize as u128 * fee_percent.min(100) as u128 / 100;
        fee as u64
    }

    /// Compute the team fee and the distribution plan.
    ///
    /// Errors are checked in a fixed order: fee range, empty results, result
    /// validity, empty pool, then policy-specific failures.
    pub fn plan(
        total_prize: u64,
        fee_percent: u8,
        policy: &PayoutPolicy,
        results: &[ParticipantResult],
    ) -> Result<PayoutPlan, PlanningError> {
        if fee_percent > 100 {
            return Err(PlanningError::InvalidFeePercent(fee_percent));
        }
        if results.is_empty() {
            return Err(PlanningError::NoEligibleRecipients);
        }
        let ranked = rank_results(results)?;
        if total_prize == 0 {
            return Err(PlanningError::EmptyPool);
        }

        let method = policy.method();
        let team_fee = Self::team_fee(total_prize, fee_percent);
        let remaining = total_prize - team_fee;
        if remaining == 0 {
            return Ok(PayoutPlan::empty(method, total_prize, team_fee));
        }

        let mut entries = match policy {
            PayoutPolicy::Equal => split_equal(remaining, &ranked),
            PayoutPolicy::Weighted { weights } => {
                let weighted: Vec<(&RankedResult, u64)> = ranked
                    .iter()
                    .filter_map(|r| match weights.get(&r.user_id) {
                        Some(&w) if w > 0 => Some((r, w)),
                        _ => None,
                    })
                    .collect();
                split_weighted(remaining, &weighted, |r| {
                    format!("Weighted share, position #{}", r.rank)
                })?
            }
            PayoutPolicy::Positional { weights } => {
                let weighted: Vec<(&RankedResult, u64)> = ranked
                    .iter()
                    .zip(weights.iter().copied())
                    .filter(|(_, w)| *w > 0)
                    .collect();
                split_weighted(remaining, &weighted, |r| format!("Position #{}", r.rank))?
            }
            PayoutPolicy::WinnerTakeAll => {
                let leaders: Vec<&RankedResult> = ranked.iter().filter(|r| r.rank == 1).collect();
                if leaders.len() > 1 {
                    return Err(PlanningError::AmbiguousWinner {
                        tied: leaders.iter().map(|r| r.user_id.clone()).collect(),
                    });
                }
                leaders
                    .first()
                    .map(|winner| {
                        vec![PlanEntry {
                            recipient_user_id: winner.user_id.clone(),
                            amount: remaining,
                            position: winner.rank,
                            reason: "Winner".to_string(),
                        }]
                    })
                    .unwrap_or_default()
            }
        };

        entries.retain(|e| e.amount > 0);
        Ok(PayoutPlan {
            method,
            total_prize,
            team_fee,
            entries,
        })
    }

    /// Like `plan`, but a zero pool yields an empty plan instead of `EmptyPool`
    pub fn plan_or_empty(
        total_prize: u64,
        fee_percent: u8,
        policy: &PayoutPolicy,
        results: &[ParticipantResult],
    ) -> Result<PayoutPlan, PlanningError> {
        match Self::plan(total_prize, fee_percent, policy, results) {
            Err(PlanningError::EmptyPool) => Ok(PayoutPlan::empty(policy.method(), 0, 0)),
            other => other,
        }
    }
}

/// Even split; the division remainder goes to the first entry in ranked order
fn split_equal(remaining: u64, ranked: &[RankedResult]) -> Vec<PlanEntry> {
    let count = ranked.len() as u64;
    let base = remaining / count;
    let leftover = remaining % count;

    ranked
        .iter()
        .enumerate()
        .map(|(i, r)| PlanEntry {
            recipient_user_id: r.user_id.clone(),
            amount: if i == 0 { base + leftover } else { base },
            position: r.rank,
            reason: format!("Equal share, position #{}", r.rank),
        })
        .collect()
}

/// `floor(remaining * w / sum(w))` per recipient; the rounding leftover goes
/// to the first recipient (ranked order) holding the largest weight
fn split_weighted(
    remaining: u64,
    weighted: &[(&RankedResult, u64)],
    reason: impl Fn(&RankedResult) -> String,
) -> Result<Vec<PlanEntry>, PlanningError> {
    if weighted.is_empty() {
        return Err(PlanningError::NoEligibleRecipients);
    }
    let weight_sum: u128 = weighted.iter().map(|(_, w)| *w as u128).sum();

    let mut entries: Vec<PlanEntry> = weighted
        .iter()
        .map(|(r, w)| PlanEntry {
            recipient_user_id: r.user_id.clone(),
            amount: (remaining as u128 * *w as u128 / weight_sum) as u64,
            position: r.rank,
            reason: reason(r),
        })
        .collect();

    let assigned: u64 = entries.iter().map(|e| e.amount).sum();
    let leftover = remaining - assigned;
    if leftover > 0 {
        let mut top = 0;
        for (i, (_, w)) in weighted.iter().enumerate() {
            if *w > weighted[top].1 {
                top = i;
            }
        }
        entries[top].amount += leftover;
    }
    Ok(entries)
}
