//! Prize Settlement Engine
//!
//! Settles competitions (team events, peer challenges) and pays prize pools
//! out in satoshis through an external Lightning wallet provider.
//!
//! ## Architecture
//!
//! - **Lifecycle**: `SettlementStateMachine` guards unit transitions
//! - **Planning**: `PayoutPlanner` is pure integer-satoshi arithmetic
//! - **Execution**: `DistributionExecutor` pays recipients concurrently with idempotency keys
//! - **Coordination**: `SettlementOrchestrator` runs one settlement pass per unit at a time
//! - **Storage**: ReDB (ACID) + DashMap cache, or in-memory for tests

pub mod config;
pub mod integration;
pub mod logging;
pub mod settlement;
pub mod storage;

// Infrastructure
#[path = "../runtime/mod.rs"]
pub mod runtime;

// ============================================================================
// PUBLIC API
// ============================================================================

// Settlement core
pub use settlement::{
    rank_results, ChallengeTerms, CompetitiveUnit, CompletionTrigger, DistributionExecutor,
    DistributionMethod, DistributionRecord, DistributionStatus, DistributionSummary,
    ExecutionError, ExecutionReport, ExecutorSettings, LedgerEntry, LedgerEntryKind,
    ParticipantResult, PaymentRecipient, PayoutPlan, PayoutPlanner, PayoutPolicy, PlanEntry,
    PlanningError, RankedResult, RecipientStatus, SettlementError, SettlementOrchestrator,
    SettlementOutcome, SettlementRequested, SettlementResult, SettlementStateMachine,
    TeamLedgerSummary, Transition, TransitionError, UnitKind, UnitStatus,
};

// Collaborators
pub use integration::{
    AlertSink, DistributionAlert, Notification, NotificationError, NotificationPayload,
    NotificationService, PaymentError, PaymentReceipt, PaymentRequest, ResultsError,
    ResultsProvider, TracingAlertSink, TracingNotifier, WalletPaymentService,
};

// Storage
pub use storage::{CreateOutcome, MemoryStore, PersistenceStore, RedbStore, StoreError};

// Runtime
pub use runtime::{CancelToken, RetryPolicy, SettlementLockManager};

// Config & logging
pub use config::{ConfigError, SettlementConfig};
pub use logging::init_tracing;
