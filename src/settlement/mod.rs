//! Settlement Module - Prize Settlement & Distribution
//!
//! Tracks competitive units (events, challenges) to completion, computes who
//! is owed what from the prize pool, and pays it out through an external
//! wallet without ever paying a recipient twice.
//!
//! ## Flow:
//! 1. `SettlementStateMachine` moves a unit to `completed` and emits `SettlementRequested`
//! 2. `SettlementOrchestrator` loads the results and runs `PayoutPlanner`
//! 3. A `DistributionRecord` is persisted (one active record per unit)
//! 4. `DistributionExecutor` pays every unpaid recipient concurrently
//! 5. The record is updated, notifications go out, failures raise an alert
//!
//! ## Safety:
//! - Idempotency keys (`distribution_id:user_id`) make every payment retry-safe
//! - Retries only target recipients that are not `paid`
//! - One settlement pass per unit, one execution per record, at a time
//! - Completed records are immutable

pub mod executor;
pub mod ledger;
pub mod orchestrator;
pub mod planner;
pub mod record;
pub mod state_machine;
pub mod unit;

pub use executor::{DistributionExecutor, ExecutionError, ExecutionReport, ExecutorSettings};
pub use ledger::{LedgerEntry, LedgerEntryKind, TeamLedgerSummary};
pub use orchestrator::{SettlementOrchestrator, SettlementOutcome};
pub use planner::{
    rank_results, DistributionMethod, ParticipantResult, PayoutPlan, PayoutPlanner, PayoutPolicy,
    PlanEntry, PlanningError, RankedResult,
};
pub use record::{
    DistributionRecord, DistributionStatus, DistributionSummary, PaymentRecipient, RecipientStatus,
};
pub use state_machine::{
    CompletionTrigger, SettlementRequested, SettlementStateMachine, Transition, TransitionError,
};
pub use unit::{
    ChallengeTerms, CompetitiveUnit, SettlementFailure, StatusChange, UnitKind, UnitStatus,
    DEFAULT_ARBITRATION_FEE_PERCENT,
};

use crate::integration::ResultsError;
use crate::storage::StoreError;

/// Result type for settlement operations
pub type SettlementResult<T> = Result<T, SettlementError>;

/// Settlement errors surfaced to callers
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SettlementError {
    #[error("Planning failed: {0}")]
    Planning(#[from] PlanningError),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("Execution failed: {0}")]
    Execution(#[from] ExecutionError),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Results error: {0}")]
    Results(#[from] ResultsError),

    #[error("Unit not found: {0}")]
    UnitNotFound(String),

    #[error("Invalid unit: {0}")]
    InvalidUnit(String),

    #[error("Unit {unit_id} is {status}, not completed")]
    NotSettleable { unit_id: String, status: UnitStatus },

    #[error("Distribution not found: {0}")]
    DistributionNotFound(String),

    #[error("Distribution {distribution_id} is {status} and cannot be retried")]
    NotRetryable {
        distribution_id: String,
        status: DistributionStatus,
    },

    #[error("Distribution {distribution_id} ({status}) cannot be superseded")]
    NotSupersedable {
        distribution_id: String,
        status: DistributionStatus,
    },
}
