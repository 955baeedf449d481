//! Settlement State Machine - Unit Lifecycle Guards
//!
//! ```text
//!   event:      pending ──────────────▶ active ──▶ completed
//!   challenge:  pending ──▶ accepted ──▶ active ──▶ completed
//!               pending ──▶ declined
//!   any non-terminal state ──▶ cancelled
//! ```
//!
//! Every transition runs under the unit's advisory lock, so it cannot race a
//! settlement pass for the same unit. Reaching `completed` emits one
//! `SettlementRequested`; a repeated completion signal is a no-op once a
//! distribution exists for the unit.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::record::DistributionStatus;
use super::unit::{CompetitiveUnit, UnitKind, UnitStatus};
use super::{SettlementError, SettlementResult};
use crate::integration::{
    notify_logged, Notification, NotificationService, ResultsError, ResultsProvider,
};
use crate::runtime::SettlementLockManager;
use crate::storage::PersistenceStore;

/// Emitted when a unit reaches `completed`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementRequested {
    pub unit_id: String,
    pub requested_at: DateTime<Utc>,
}

/// Why `complete` is being called
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionTrigger {
    /// Scheduler noticed the end date passed
    EndDateReached,
    /// Explicit early completion; needs ranked results already available
    Early,
}

/// Result of `complete`
#[derive(Debug, Clone)]
pub struct Transition {
    pub unit: CompetitiveUnit,
    /// `None` when the completion was a duplicate no-op
    pub settlement: Option<SettlementRequested>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("Invalid transition for {unit_id}: {from} -> {to} ({reason})")]
    InvalidTransition {
        unit_id: String,
        from: UnitStatus,
        to: UnitStatus,
        reason: String,
    },

    #[error("User {user_id} is not a challenged party of {unit_id}")]
    NotChallenged { unit_id: String, user_id: String },
}

fn invalid(unit: &CompetitiveUnit, to: UnitStatus, reason: impl Into<String>) -> SettlementError {
    TransitionError::InvalidTransition {
        unit_id: unit.id.clone(),
        from: unit.status,
        to,
        reason: reason.into(),
    }
    .into()
}

pub struct SettlementStateMachine {
    store: Arc<dyn PersistenceStore>,
    results: Arc<dyn ResultsProvider>,
    notifier: Arc<dyn NotificationService>,
    events: Option<mpsc::Sender<SettlementRequested>>,
    locks: Arc<SettlementLockManager>,
}

impl SettlementStateMachine {
    pub fn new(
        store: Arc<dyn PersistenceStore>,
        results: Arc<dyn ResultsProvider>,
        notifier: Arc<dyn NotificationService>,
    ) -> Self {
        Self {
            store,
            results,
            notifier,
            events: None,
            locks: Arc::new(SettlementLockManager::new()),
        }
    }

    /// Send every `SettlementRequested` on this channel
    pub fn with_events(mut self, events: mpsc::Sender<SettlementRequested>) -> Self {
        self.events = Some(events);
        self
    }

    /// Share the per-unit lock table with the orchestrator
    pub fn with_locks(mut self, locks: Arc<SettlementLockManager>) -> Self {
        self.locks = locks;
        self
    }

    /// Whether the lifecycle graph has an edge `from -> to` for this kind of unit
    pub fn check_edge(kind: &UnitKind, from: UnitStatus, to: UnitStatus) -> Result<(), &'static str> {
        use UnitStatus::*;

        if from.is_terminal() {
            return Err("unit is in a terminal state");
        }
        match (from, to, kind.is_challenge()) {
            (_, Cancelled, _) => Ok(()),
            (Pending, Active, false) => Ok(()),
            (Pending, Active, true) => Err("challenge must be accepted first"),
            (Pending, Accepted, true) | (Pending, Declined, true) => Ok(()),
            (Pending, Accepted, false) | (Pending, Declined, false) => {
                Err("only challenges can be accepted or declined")
            }
            (Accepted, Active, true) => Ok(()),
            (Active, Completed, _) => Ok(()),
            _ => Err("no such transition"),
        }
    }

    async fn load(&self, unit_id: &str) -> SettlementResult<CompetitiveUnit> {
        self.store
            .get_unit(unit_id)?
            .ok_or_else(|| SettlementError::UnitNotFound(unit_id.to_string()))
    }

    fn ensure_edge(unit: &CompetitiveUnit, to: UnitStatus) -> SettlementResult<()> {
        Self::check_edge(&unit.kind, unit.status, to).map_err(|reason| invalid(unit, to, reason))
    }

    /// Register a new pending unit
    pub async fn create_unit(&self, unit: CompetitiveUnit) -> SettlementResult<CompetitiveUnit> {
        unit.validate().map_err(SettlementError::InvalidUnit)?;
        if unit.status != UnitStatus::Pending {
            return Err(SettlementError::InvalidUnit(format!(
                "new unit {} must be pending, not {}",
                unit.id, unit.status
            )));
        }
        self.store.insert_unit(&unit)?;
        info!(unit_id = %unit.id, team_id = %unit.team_id, prize_pool = unit.prize_pool, "Unit created");
        Ok(unit)
    }

    /// Record a challenged user's acceptance; the challenge moves to
    /// `accepted` once every challenged user accepted
    pub async fn accept(
        &self,
        unit_id: &str,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> SettlementResult<CompetitiveUnit> {
        let guard = self.locks.acquire(unit_id).await;
        let mut unit = self.load(unit_id).await?;
        Self::ensure_edge(&unit, UnitStatus::Accepted)?;

        let (challenger, all_accepted, newly_accepted) = match &mut unit.kind {
            UnitKind::Challenge(terms) if terms.is_challenged(user_id) => {
                let newly = terms.accepted_by.insert(user_id.to_string());
                (terms.challenger_id.clone(), terms.all_accepted(), newly)
            }
            _ => {
                return Err(TransitionError::NotChallenged {
                    unit_id: unit_id.to_string(),
                    user_id: user_id.to_string(),
                }
                .into())
            }
        };
        if !newly_accepted {
            return Ok(unit);
        }

        if all_accepted {
            unit.record_transition(
                UnitStatus::Accepted,
                now,
                Some(user_id.to_string()),
                Some("all challenged users accepted".to_string()),
            );
        }
        self.store.update_unit(&unit)?;
        drop(guard);

        info!(unit_id = %unit_id, user_id = %user_id, status = %unit.status, "Challenge accepted");
        notify_logged(
            self.notifier.as_ref(),
            Notification::challenge_accepted(&challenger, unit_id, user_id),
        )
        .await;
        Ok(unit)
    }

    /// A challenged user declines; the challenge ends as `declined`
    pub async fn decline(
        &self,
        unit_id: &str,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> SettlementResult<CompetitiveUnit> {
        let guard = self.locks.acquire(unit_id).await;
        let mut unit = self.load(unit_id).await?;
        Self::ensure_edge(&unit, UnitStatus::Declined)?;

        let challenger = match unit.kind.challenge() {
            Some(terms) if terms.is_challenged(user_id) => terms.challenger_id.clone(),
            _ => {
                return Err(TransitionError::NotChallenged {
                    unit_id: unit_id.to_string(),
                    user_id: user_id.to_string(),
                }
                .into())
            }
        };

        unit.record_transition(UnitStatus::Declined, now, Some(user_id.to_string()), None);
        self.store.update_unit(&unit)?;
        drop(guard);

        info!(unit_id = %unit_id, user_id = %user_id, "Challenge declined");
        notify_logged(
            self.notifier.as_ref(),
            Notification::challenge_declined(&challenger, unit_id, user_id),
        )
        .await;
        Ok(unit)
    }

    /// Start the competition. Events need `now >= start_date`; challenges
    /// need to be `accepted`.
    pub async fn activate(&self, unit_id: &str, now: DateTime<Utc>) -> SettlementResult<CompetitiveUnit> {
        let _guard = self.locks.acquire(unit_id).await;
        let mut unit = self.load(unit_id).await?;
        Self::ensure_edge(&unit, UnitStatus::Active)?;

        if !unit.kind.is_challenge() && now < unit.start_date {
            return Err(invalid(&unit, UnitStatus::Active, "start date not reached"));
        }

        unit.record_transition(UnitStatus::Active, now, None, None);
        self.store.update_unit(&unit)?;
        info!(unit_id = %unit_id, "Unit active");
        Ok(unit)
    }

    /// Finish the competition and request settlement
    pub async fn complete(
        &self,
        unit_id: &str,
        trigger: CompletionTrigger,
        now: DateTime<Utc>,
    ) -> SettlementResult<Transition> {
        let guard = self.locks.acquire(unit_id).await;
        let mut unit = self.load(unit_id).await?;

        if unit.status == UnitStatus::Completed {
            if let Some(record) = self.store.active_distribution_for_unit(unit_id)? {
                debug!(unit_id = %unit_id, distribution_id = %record.distribution_id, "Duplicate completion ignored");
                return Ok(Transition {
                    unit,
                    settlement: None,
                });
            }
            // Completed but never settled (e.g. results were missing): re-emit
            drop(guard);
            let event = SettlementRequested {
                unit_id: unit_id.to_string(),
                requested_at: now,
            };
            self.emit(&event).await;
            return Ok(Transition {
                unit,
                settlement: Some(event),
            });
        }

        Self::ensure_edge(&unit, UnitStatus::Completed)?;
        let note = match trigger {
            CompletionTrigger::EndDateReached => {
                if now < unit.end_date {
                    return Err(invalid(&unit, UnitStatus::Completed, "end date not reached"));
                }
                "end date reached"
            }
            CompletionTrigger::Early => match self.results.get_results(unit_id).await {
                Ok(results) if !results.is_empty() => "early completion",
                Ok(_) | Err(ResultsError::NotReady(_)) => {
                    return Err(invalid(
                        &unit,
                        UnitStatus::Completed,
                        "early completion needs ranked results",
                    ))
                }
                Err(e) => return Err(e.into()),
            },
        };

        unit.record_transition(UnitStatus::Completed, now, None, Some(note.to_string()));
        self.store.update_unit(&unit)?;
        drop(guard);

        info!(unit_id = %unit_id, trigger = ?trigger, "🏁 Unit completed");
        let event = SettlementRequested {
            unit_id: unit_id.to_string(),
            requested_at: now,
        };
        self.emit(&event).await;
        Ok(Transition {
            unit,
            settlement: Some(event),
        })
    }

    /// Call the unit off. Rejected from terminal states and while money for
    /// the unit is in flight or already paid out.
    pub async fn cancel(
        &self,
        unit_id: &str,
        actor: Option<&str>,
        now: DateTime<Utc>,
    ) -> SettlementResult<CompetitiveUnit> {
        let _guard = self.locks.acquire(unit_id).await;
        let mut unit = self.load(unit_id).await?;
        Self::ensure_edge(&unit, UnitStatus::Cancelled)?;

        if let Some(record) = self.store.active_distribution_for_unit(unit_id)? {
            if matches!(
                record.overall_status,
                DistributionStatus::Completed | DistributionStatus::Executing
            ) {
                return Err(invalid(
                    &unit,
                    UnitStatus::Cancelled,
                    format!("distribution {} is {}", record.distribution_id, record.overall_status),
                ));
            }
        }

        unit.record_transition(UnitStatus::Cancelled, now, actor.map(str::to_string), None);
        self.store.update_unit(&unit)?;
        info!(unit_id = %unit_id, actor = ?actor, "Unit cancelled");
        Ok(unit)
    }

    async fn emit(&self, event: &SettlementRequested) {
        if let Some(events) = &self.events {
            if events.send(event.clone()).await.is_err() {
                warn!(unit_id = %event.unit_id, "Settlement listener gone; request not delivered");
            }
        }
    }
}
