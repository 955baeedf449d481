//! Settlement Orchestrator - Top-Level Coordinator
//!
//! ## Flow (one pass, under the unit's advisory lock):
//! 1. Unit must be `completed`; an existing active distribution short-circuits
//! 2. Load participant results (empty → `NoResults`, nothing persisted)
//! 3. Plan the payout (fatal planning errors abort before money moves)
//! 4. Persist the distribution (unique per unit) and credit the team fee
//! 5. Execute, then notify winners and non-winners
//! 6. Partial or total failure raises an operator alert; no automatic retry
//!
//! Exposed operations: `request_settlement`, `retry_distribution`,
//! `get_distribution_status`, plus `resettle` for operator-driven re-planning.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::executor::{DistributionExecutor, ExecutionReport};
use super::ledger::{LedgerEntry, TeamLedgerSummary};
use super::planner::{ParticipantResult, PayoutPlanner};
use super::record::{DistributionRecord, DistributionStatus, RecipientStatus};
use super::state_machine::SettlementRequested;
use super::unit::{CompetitiveUnit, SettlementFailure, UnitStatus};
use super::{SettlementError, SettlementResult};
use crate::integration::{
    notify_logged, AlertSink, DistributionAlert, Notification, NotificationService,
    ResultsProvider,
};
use crate::runtime::{CancelToken, SettlementLockManager};
use crate::storage::{CreateOutcome, PersistenceStore};

/// Non-error result of a settlement request
#[derive(Debug, Clone)]
pub enum SettlementOutcome {
    /// A distribution was executed by this call
    Settled(ExecutionReport),
    /// Results were empty; no distribution was created
    NoResults { unit_id: String },
    /// The unit already has an active distribution; nothing was done
    AlreadySettled {
        distribution_id: String,
        status: DistributionStatus,
    },
}

pub struct SettlementOrchestrator {
    store: Arc<dyn PersistenceStore>,
    results: Arc<dyn ResultsProvider>,
    executor: DistributionExecutor,
    notifier: Arc<dyn NotificationService>,
    alerts: Arc<dyn AlertSink>,
    unit_locks: Arc<SettlementLockManager>,
}

impl SettlementOrchestrator {
    pub fn new(
        store: Arc<dyn PersistenceStore>,
        results: Arc<dyn ResultsProvider>,
        executor: DistributionExecutor,
        notifier: Arc<dyn NotificationService>,
        alerts: Arc<dyn AlertSink>,
    ) -> Self {
        Self {
            store,
            results,
            executor,
            notifier,
            alerts,
            unit_locks: Arc::new(SettlementLockManager::new()),
        }
    }

    /// Per-unit lock table; hand it to `SettlementStateMachine::with_locks`
    pub fn unit_locks(&self) -> Arc<SettlementLockManager> {
        self.unit_locks.clone()
    }

    pub fn executor(&self) -> &DistributionExecutor {
        &self.executor
    }

    // ========================================================================
    // SETTLEMENT
    // ========================================================================

    /// Handle a `SettlementRequested` event from the state machine
    pub async fn on_settlement_requested(
        &self,
        event: &SettlementRequested,
    ) -> SettlementResult<SettlementOutcome> {
        debug!(unit_id = %event.unit_id, requested_at = %event.requested_at, "Settlement requested");
        self.request_settlement(&event.unit_id).await
    }

    /// Settle a completed unit. Idempotent: a unit with an active
    /// distribution yields `AlreadySettled`.
    pub async fn request_settlement(&self, unit_id: &str) -> SettlementResult<SettlementOutcome> {
        self.request_settlement_with(unit_id, &CancelToken::new()).await
    }

    pub async fn request_settlement_with(
        &self,
        unit_id: &str,
        cancel: &CancelToken,
    ) -> SettlementResult<SettlementOutcome> {
        let _guard = self.unit_locks.acquire(unit_id).await;
        let unit = self.load_settleable(unit_id)?;

        if let Some(existing) = self.store.active_distribution_for_unit(unit_id)? {
            // Persisted but never started (crash between create and execute)
            if existing.overall_status == DistributionStatus::Pending {
                info!(distribution_id = %existing.distribution_id, "Resuming unstarted distribution");
                self.credit_fee(&existing, Utc::now())?;
                let results = if existing.settlement_pass == 1 {
                    self.results_for_notices(unit_id).await
                } else {
                    None
                };
                let report = self.executor.execute(&existing, cancel).await?;
                self.after_execution(&unit, &report, results.as_deref()).await;
                return Ok(SettlementOutcome::Settled(report));
            }
            debug!(unit_id = %unit_id, distribution_id = %existing.distribution_id, "Unit already settled");
            return Ok(SettlementOutcome::AlreadySettled {
                distribution_id: existing.distribution_id,
                status: existing.overall_status,
            });
        }

        self.run_pass(unit, None, cancel).await
    }

    /// Replace a distribution that moved no money with a fresh pass.
    ///
    /// Allowed only while the active record is supersedable (nobody paid and
    /// no ambiguous transient failure). Records with payments must be retried.
    pub async fn resettle(&self, unit_id: &str) -> SettlementResult<SettlementOutcome> {
        let _guard = self.unit_locks.acquire(unit_id).await;
        let unit = self.load_settleable(unit_id)?;

        let current = self.store.active_distribution_for_unit(unit_id)?;
        if let Some(ref record) = current {
            if !record.is_supersedable() {
                return Err(SettlementError::NotSupersedable {
                    distribution_id: record.distribution_id.clone(),
                    status: record.overall_status,
                });
            }
        }
        self.run_pass(unit, current, &CancelToken::new()).await
    }

    /// Results → plan → persist → execute → notify
    async fn run_pass(
        &self,
        mut unit: CompetitiveUnit,
        current: Option<DistributionRecord>,
        cancel: &CancelToken,
    ) -> SettlementResult<SettlementOutcome> {
        let now = Utc::now();

        let results = self.results.get_results(&unit.id).await?;
        if results.is_empty() {
            warn!(unit_id = %unit.id, "No results; settlement not started");
            self.record_failure(&mut unit, "no results", now)?;
            return Ok(SettlementOutcome::NoResults { unit_id: unit.id });
        }

        let plan = match PayoutPlanner::plan_or_empty(
            unit.prize_pool,
            unit.arbitration_fee_percent,
            &unit.payout_policy,
            &results,
        ) {
            Ok(plan) => plan,
            Err(e) => {
                error!(unit_id = %unit.id, error = %e, "Payout planning failed");
                self.record_failure(&mut unit, &e.to_string(), now)?;
                return Err(e.into());
            }
        };

        let pass = match &current {
            Some(record) => record.settlement_pass + 1,
            None => self.store.distributions_for_unit(&unit.id)?.len() as u32 + 1,
        };
        let record = DistributionRecord::from_plan(&unit, pass, &plan, now);

        let record = match current {
            Some(current) => {
                self.store.supersede_distribution(&current, &record)?;
                info!(
                    unit_id = %unit.id,
                    old = %current.distribution_id,
                    new = %record.distribution_id,
                    "Distribution superseded"
                );
                record
            }
            None => match self.store.create_distribution(&record)? {
                CreateOutcome::Created(record) => record,
                CreateOutcome::Existing(existing) => {
                    return Ok(SettlementOutcome::AlreadySettled {
                        distribution_id: existing.distribution_id,
                        status: existing.overall_status,
                    })
                }
            },
        };

        if unit.settlement_failure.take().is_some() {
            self.store.update_unit(&unit)?;
        }
        self.credit_fee(&record, now)?;

        info!(
            unit_id = %unit.id,
            distribution_id = %record.distribution_id,
            pass = pass,
            method = %record.method,
            total_prize = record.total_prize,
            team_fee = record.team_fee,
            recipients = record.recipients.len(),
            "📋 Distribution planned"
        );

        let report = self.executor.execute(&record, cancel).await?;
        let non_winners = if pass == 1 { Some(results.as_slice()) } else { None };
        self.after_execution(&unit, &report, non_winners).await;
        Ok(SettlementOutcome::Settled(report))
    }

    // ========================================================================
    // RETRY & QUERIES
    // ========================================================================

    /// Re-run a distribution for recipients that are not paid yet. Same
    /// distribution id, same idempotency keys; paid recipients are untouched.
    pub async fn retry_distribution(&self, distribution_id: &str) -> SettlementResult<ExecutionReport> {
        self.retry_distribution_with(distribution_id, &CancelToken::new())
            .await
    }

    pub async fn retry_distribution_with(
        &self,
        distribution_id: &str,
        cancel: &CancelToken,
    ) -> SettlementResult<ExecutionReport> {
        let unit_id = self.get_distribution_status(distribution_id)?.source_unit_id;
        let _guard = self.unit_locks.acquire(&unit_id).await;

        let record = self.get_distribution_status(distribution_id)?;
        if !record.is_retryable() {
            return Err(SettlementError::NotRetryable {
                distribution_id: record.distribution_id,
                status: record.overall_status,
            });
        }
        let unit = self
            .store
            .get_unit(&unit_id)?
            .ok_or_else(|| SettlementError::UnitNotFound(unit_id.clone()))?;

        info!(
            distribution_id = %distribution_id,
            status = %record.overall_status,
            unpaid = record.recipients.iter().filter(|r| r.needs_payment()).count(),
            "🔁 Retrying distribution"
        );
        let report = self.executor.execute(&record, cancel).await?;
        self.after_execution(&unit, &report, None).await;
        Ok(report)
    }

    pub fn get_distribution_status(&self, distribution_id: &str) -> SettlementResult<DistributionRecord> {
        self.store
            .get_distribution(distribution_id)?
            .ok_or_else(|| SettlementError::DistributionNotFound(distribution_id.to_string()))
    }

    /// Every pass for the unit, superseded ones included
    pub fn distributions_for_unit(&self, unit_id: &str) -> SettlementResult<Vec<DistributionRecord>> {
        Ok(self.store.distributions_for_unit(unit_id)?)
    }

    pub fn team_ledger_summary(&self, team_id: &str) -> SettlementResult<TeamLedgerSummary> {
        let entries = self.store.ledger_entries(team_id)?;
        Ok(TeamLedgerSummary::from_entries(team_id, &entries))
    }

    /// Consume `SettlementRequested` events until every sender is dropped
    pub fn spawn_listener(
        self: Arc<Self>,
        mut events: mpsc::Receiver<SettlementRequested>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match self.on_settlement_requested(&event).await {
                    Ok(SettlementOutcome::Settled(report)) => {
                        debug!(unit_id = %event.unit_id, status = %report.record.overall_status, "Settlement pass done")
                    }
                    Ok(other) => debug!(unit_id = %event.unit_id, outcome = ?other, "Settlement pass skipped"),
                    Err(e) => error!(unit_id = %event.unit_id, error = %e, "Settlement pass failed"),
                }
            }
            info!("Settlement listener stopped");
        })
    }

    // ========================================================================
    // HELPERS
    // ========================================================================

    fn load_settleable(&self, unit_id: &str) -> SettlementResult<CompetitiveUnit> {
        let unit = self
            .store
            .get_unit(unit_id)?
            .ok_or_else(|| SettlementError::UnitNotFound(unit_id.to_string()))?;
        if unit.status != UnitStatus::Completed {
            return Err(SettlementError::NotSettleable {
                unit_id: unit.id,
                status: unit.status,
            });
        }
        Ok(unit)
    }

    fn record_failure(
        &self,
        unit: &mut CompetitiveUnit,
        reason: &str,
        now: DateTime<Utc>,
    ) -> SettlementResult<()> {
        unit.settlement_failure = Some(SettlementFailure {
            reason: reason.to_string(),
            at: now,
        });
        self.store.update_unit(unit)?;
        Ok(())
    }

    /// Notifications, completion bookkeeping and alerting. Never fails the
    /// pass: the record is already persisted.
    /// Credit the arbitration fee once per unit; later calls are no-ops
    fn credit_fee(&self, record: &DistributionRecord, now: DateTime<Utc>) -> SettlementResult<()> {
        if record.team_fee == 0 {
            return Ok(());
        }
        let entry = LedgerEntry::arbitration_fee(record, now);
        if self.store.append_ledger_entry(&entry)? {
            info!(
                team_id = %entry.team_id,
                amount = entry.amount,
                unit_id = %record.source_unit_id,
                "Arbitration fee credited"
            );
        }
        Ok(())
    }

    /// Results used only to notify non-winners; unavailable results skip the notices
    async fn results_for_notices(&self, unit_id: &str) -> Option<Vec<ParticipantResult>> {
        match self.results.get_results(unit_id).await {
            Ok(results) => Some(results),
            Err(e) => {
                warn!(unit_id = %unit_id, error = %e, "Results unavailable; skipping non-winner notices");
                None
            }
        }
    }

    async fn after_execution(
        &self,
        unit: &CompetitiveUnit,
        report: &ExecutionReport,
        non_winners_of: Option<&[ParticipantResult]>,
    ) {
        let record = &report.record;

        for user_id in &report.newly_paid {
            if let Some(recipient) = record.recipient(user_id) {
                notify_logged(
                    self.notifier.as_ref(),
                    Notification::prize_awarded(
                        user_id,
                        &unit.id,
                        &unit.name,
                        &record.distribution_id,
                        recipient.amount,
                        recipient.position,
                        recipient.transaction_hash.clone(),
                    ),
                )
                .await;
            }
        }

        if let Some(results) = non_winners_of {
            for result in results.iter().filter(|r| record.recipient(&r.user_id).is_none()) {
                notify_logged(
                    self.notifier.as_ref(),
                    Notification::competition_completed(&result.user_id, &unit.id, &unit.name),
                )
                .await;
            }
        }

        if record.overall_status == DistributionStatus::Completed {
            if record.paid_total() > 0 {
                let entry = LedgerEntry::prize_distributed(record, Utc::now());
                if let Err(e) = self.store.append_ledger_entry(&entry) {
                    error!(distribution_id = %record.distribution_id, error = %e, "Failed to record prize payout in team ledger");
                }
            }
            info!(unit_id = %unit.id, distribution_id = %record.distribution_id, paid = record.paid_total(), "🏆 Distribution completed");
        }

        if record.overall_status.needs_attention() {
            let failures = record
                .recipients
                .iter()
                .filter(|r| r.status == RecipientStatus::Failed)
                .map(|r| match &r.failure {
                    Some(e) => format!("{}: {}", r.user_id, e),
                    None => r.user_id.clone(),
                })
                .collect();
            self.alerts
                .raise(DistributionAlert {
                    distribution_id: record.distribution_id.clone(),
                    unit_id: unit.id.clone(),
                    status: record.overall_status,
                    summary: report.summary.clone(),
                    failures,
                })
                .await;
        }
    }
}
