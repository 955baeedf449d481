//! Competitive Units - Events and Challenges
//!
//! A competitive unit is the thing a prize is paid out for. Its status only
//! moves forward through the lifecycle guarded by `SettlementStateMachine`,
//! and every change is appended to `history` (units are never deleted).

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::planner::PayoutPolicy;

/// Arbitration fee applied when a challenge does not specify one
pub const DEFAULT_ARBITRATION_FEE_PERCENT: u8 = 10;

/// Lifecycle status of a competitive unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitStatus {
    /// Created, waiting for start date or acceptance
    Pending,
    /// Challenge accepted by every challenged party
    Accepted,
    /// Challenge declined (terminal)
    Declined,
    /// Competition running
    Active,
    /// Competition finished, eligible for settlement (terminal)
    Completed,
    /// Called off before completion (terminal)
    Cancelled,
}

impl UnitStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Declined | Self::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Accepted => "accepted",
            Self::Declined => "declined",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for UnitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Peer-to-peer challenge terms
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChallengeTerms {
    pub challenger_id: String,
    pub challenged_user_ids: Vec<String>,
    /// Challenged users that have accepted so far
    #[serde(default)]
    pub accepted_by: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ChallengeTerms {
    pub fn new(challenger_id: impl Into<String>, challenged_user_ids: Vec<String>) -> Self {
        Self {
            challenger_id: challenger_id.into(),
            challenged_user_ids,
            accepted_by: BTreeSet::new(),
            message: None,
        }
    }

    pub fn is_challenged(&self, user_id: &str) -> bool {
        self.challenged_user_ids.iter().any(|id| id == user_id)
    }

    pub fn all_accepted(&self) -> bool {
        !self.challenged_user_ids.is_empty()
            && self
                .challenged_user_ids
                .iter()
                .all(|id| self.accepted_by.contains(id))
    }

    /// Challenger first, then challenged users in the order given
    pub fn participants(&self) -> Vec<String> {
        let mut all = vec![self.challenger_id.clone()];
        all.extend(self.challenged_user_ids.iter().cloned());
        all
    }
}

/// What kind of competition a unit is
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UnitKind {
    /// Team event, starts on its start date
    Event,
    /// Challenge, starts once every challenged party accepted
    Challenge(ChallengeTerms),
}

impl UnitKind {
    pub fn is_challenge(&self) -> bool {
        matches!(self, Self::Challenge(_))
    }

    pub fn challenge(&self) -> Option<&ChallengeTerms> {
        match self {
            Self::Challenge(terms) => Some(terms),
            Self::Event => None,
        }
    }
}

/// One entry of the append-only status history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusChange {
    pub from: UnitStatus,
    pub to: UnitStatus,
    pub at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// Why a settlement pass stopped without creating a distribution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementFailure {
    pub reason: String,
    pub at: DateTime<Utc>,
}

/// An event or challenge with a prize pool in satoshis
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompetitiveUnit {
    pub id: String,
    pub name: String,
    pub kind: UnitKind,
    /// Hosting team; receives the arbitration fee
    pub team_id: String,
    pub status: UnitStatus,
    /// Entry fee per participant in sats
    pub entry_fee: u64,
    /// Prize pool in sats
    pub prize_pool: u64,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub participant_count: u32,
    /// Share of the prize pool kept by the hosting team (0-100)
    pub arbitration_fee_percent: u8,
    pub payout_policy: PayoutPolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settlement_failure: Option<SettlementFailure>,
    #[serde(default)]
    pub history: Vec<StatusChange>,
    pub created_at: DateTime<Utc>,
}

impl CompetitiveUnit {
    /// New pending team event
    pub fn event(
        id: impl Into<String>,
        name: impl Into<String>,
        team_id: impl Into<String>,
        prize_pool: u64,
        start_date: DateTime<Utc>,
        end_date: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            kind: UnitKind::Event,
            team_id: team_id.into(),
            status: UnitStatus::Pending,
            entry_fee: 0,
            prize_pool,
            start_date,
            end_date,
            participant_count: 0,
            arbitration_fee_percent: 0,
            payout_policy: PayoutPolicy::Equal,
            settlement_failure: None,
            history: Vec::new(),
            created_at: Utc::now(),
        }
    }

    /// New pending challenge. Every participant stakes `stake` sats and the
    /// whole pot goes to the winner minus the arbitration fee.
    pub fn challenge(
        id: impl Into<String>,
        team_id: impl Into<String>,
        terms: ChallengeTerms,
        stake: u64,
        start_date: DateTime<Utc>,
        end_date: DateTime<Utc>,
    ) -> Self {
        let participant_count = terms.challenged_user_ids.len() as u32 + 1;
        let id = id.into();
        Self {
            name: format!("Challenge {}", id),
            id,
            kind: UnitKind::Challenge(terms),
            team_id: team_id.into(),
            status: UnitStatus::Pending,
            entry_fee: stake,
            prize_pool: stake.saturating_mul(participant_count as u64),
            start_date,
            end_date,
            participant_count,
            arbitration_fee_percent: DEFAULT_ARBITRATION_FEE_PERCENT,
            payout_policy: PayoutPolicy::WinnerTakeAll,
            settlement_failure: None,
            history: Vec::new(),
            created_at: Utc::now(),
        }
    }

    pub fn with_arbitration_fee(mut self, percent: u8) -> Self {
        self.arbitration_fee_percent = percent;
        self
    }

    pub fn with_payout_policy(mut self, policy: PayoutPolicy) -> Self {
        self.payout_policy = policy;
        self
    }

    pub fn with_entry_fee(mut self, entry_fee: u64) -> Self {
        self.entry_fee = entry_fee;
        self
    }

    pub fn with_participant_count(mut self, count: u32) -> Self {
        self.participant_count = count;
        self
    }

    /// Arbitration fee in sats for the current prize pool
    pub fn arbitration_fee_amount(&self) -> u64 {
        super::planner::PayoutPlanner::team_fee(self.prize_pool, self.arbitration_fee_percent)
    }

    /// Field-level invariants checked when a unit is registered
    pub fn validate(&self) -> Result<(), String> {
        if self.id.trim().is_empty() {
            return Err("unit id is empty".to_string());
        }
        if self.arbitration_fee_percent > 100 {
            return Err(format!(
                "arbitration fee {}% is above 100%",
                self.arbitration_fee_percent
            ));
        }
        if self.end_date < self.start_date {
            return Err("end date is before start date".to_string());
        }
        if let UnitKind::Challenge(terms) = &self.kind {
            if terms.challenged_user_ids.is_empty() {
                return Err("challenge has no challenged users".to_string());
            }
            if terms.is_challenged(&terms.challenger_id) {
                return Err("challenger cannot challenge themselves".to_string());
            }
        }
        Ok(())
    }

    /// Move to `to` and append the change to the history
    pub(crate) fn record_transition(
        &mut self,
        to: UnitStatus,
        at: DateTime<Utc>,
        actor: Option<String>,
        note: Option<String>,
    ) {
        self.history.push(StatusChange {
            from: self.status,
            to,
            at,
            actor,
            note,
        });
        self.status = to;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn terms() -> ChallengeTerms {
        ChallengeTerms::new("alice", vec!["bob".to_string(), "carol".to_string()])
    }

    #[test]
    fn test_challenge_pot_and_defaults() {
        let start = Utc::now();
        let unit = CompetitiveUnit::challenge("ch_1", "team_1", terms(), 1_000, start, start + Duration::days(7));

        assert_eq!(unit.participant_count, 3);
        assert_eq!(unit.prize_pool, 3_000);
        assert_eq!(unit.arbitration_fee_percent, DEFAULT_ARBITRATION_FEE_PERCENT);
        assert_eq!(unit.arbitration_fee_amount(), 300);
        assert_eq!(unit.payout_policy, PayoutPolicy::WinnerTakeAll);
        assert!(unit.validate().is_ok());
    }

    #[test]
    fn test_all_accepted_requires_every_challenged_user() {
        let mut terms = terms();
        assert!(!terms.all_accepted());

        terms.accepted_by.insert("bob".to_string());
        assert!(!terms.all_accepted());

        terms.accepted_by.insert("carol".to_string());
        assert!(terms.all_accepted());
        assert_eq!(terms.participants(), vec!["alice", "bob", "carol"]);
    }

    #[test]
    fn test_validate_rejects_bad_fee_and_dates() {
        let start = Utc::now();
        let unit = CompetitiveUnit::event("ev_1", "5K", "team_1", 100, start, start + Duration::days(1))
            .with_arbitration_fee(101);
        assert!(unit.validate().unwrap_err().contains("above 100%"));

        let unit = CompetitiveUnit::event("ev_2", "5K", "team_1", 100, start, start - Duration::days(1));
        assert!(unit.validate().is_err());
    }

    #[test]
    fn test_record_transition_appends_history() {
        let start = Utc::now();
        let mut unit = CompetitiveUnit::event("ev_1", "5K", "team_1", 100, start, start);
        unit.record_transition(UnitStatus::Active, start, None, None);
        unit.record_transition(UnitStatus::Completed, start, None, Some("end date".into()));

        assert_eq!(unit.status, UnitStatus::Completed);
        assert_eq!(unit.history.len(), 2);
        assert_eq!(unit.history[0].from, UnitStatus::Pending);
        assert_eq!(unit.history[1].to, UnitStatus::Completed);
    }

    #[test]
    fn test_status_terminal_set() {
        assert!(UnitStatus::Completed.is_terminal());
        assert!(UnitStatus::Declined.is_terminal());
        assert!(UnitStatus::Cancelled.is_terminal());
        assert!(!UnitStatus::Accepted.is_terminal());
        assert_eq!(UnitStatus::Active.to_string(), "active");
    }
}
