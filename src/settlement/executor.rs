//! Distribution Executor - Concurrent, Idempotent Payouts
//!
//! ## Flow:
//! 1. Take the record's execution lock (a second concurrent `execute` is rejected)
//! 2. Reload the record from the store; completed records are returned as-is
//! 3. Mark it `executing` and persist
//! 4. Spawn one task per unpaid recipient, bounded by a semaphore
//! 5. Each task pays with sequential retries and sends ONE outcome on a channel
//! 6. A single collector applies outcomes and persists after each one
//! 7. Recompute the overall status and persist the final record
//!
//! Tasks never touch the record. The collector is its only writer, so there
//! is no shared mutable state between payment tasks.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, error, info, warn};

use super::record::{DistributionRecord, DistributionStatus, DistributionSummary};
use crate::integration::{PaymentError, PaymentReceipt, PaymentRequest, WalletPaymentService};
use crate::runtime::{CancelToken, RetryPolicy, SettlementLockManager};
use crate::storage::{PersistenceStore, StoreError};

/// Default number of payments in flight per distribution
pub const DEFAULT_MAX_CONCURRENT_PAYMENTS: usize = 8;
/// Default timeout of one wallet call
pub const DEFAULT_PAYMENT_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutorSettings {
    /// Worker pool size, sized to the wallet provider's rate limit
    pub max_concurrent_payments: usize,
    /// Per-attempt timeout; a timeout counts as a transient failure
    pub payment_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            max_concurrent_payments: DEFAULT_MAX_CONCURRENT_PAYMENTS,
            payment_timeout: Duration::from_secs(DEFAULT_PAYMENT_TIMEOUT_SECS),
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecutionError {
    #[error("Distribution {0} is already being executed")]
    AlreadyExecuting(String),

    #[error("Distribution {0} has been superseded")]
    Superseded(String),

    #[error("Distribution {0} not found")]
    NotFound(String),

    #[error("Store error while executing {distribution_id}: {error}")]
    Store {
        distribution_id: String,
        #[source]
        error: StoreError,
    },
}

/// What one `execute` call did
#[derive(Debug, Clone)]
pub struct ExecutionReport {
    /// Record as persisted at the end of the run
    pub record: DistributionRecord,
    pub summary: DistributionSummary,
    /// Recipients paid by this run, in completion order
    pub newly_paid: Vec<String>,
    /// Recipients that got at least one wallet call
    pub dispatched: usize,
    /// Recipients left untouched because the run was cancelled
    pub skipped: usize,
}

impl ExecutionReport {
    fn unchanged(record: DistributionRecord) -> Self {
        Self {
            summary: record.summary(),
            record,
            newly_paid: Vec::new(),
            dispatched: 0,
            skipped: 0,
        }
    }
}

/// Message from a payment task to the collector
enum PaymentOutcome {
    Attempted {
        user_id: String,
        attempts: u32,
        result: Result<PaymentReceipt, PaymentError>,
    },
    Skipped,
}

pub struct DistributionExecutor {
    wallet: Arc<dyn WalletPaymentService>,
    store: Arc<dyn PersistenceStore>,
    settings: ExecutorSettings,
    locks: Arc<SettlementLockManager>,
}

impl DistributionExecutor {
    pub fn new(
        wallet: Arc<dyn WalletPaymentService>,
        store: Arc<dyn PersistenceStore>,
        settings: ExecutorSettings,
    ) -> Self {
        Self {
            wallet,
            store,
            settings,
            locks: Arc::new(SettlementLockManager::new()),
        }
    }

    pub fn settings(&self) -> &ExecutorSettings {
        &self.settings
    }

    /// Whether `execute` is currently running for the distribution
    pub fn is_executing(&self, distribution_id: &str) -> bool {
        self.locks.is_locked(distribution_id)
    }

    /// Pay every recipient of `record` that is not `paid` yet.
    ///
    /// The stored copy is authoritative; `record` only names the distribution.
    pub async fn execute(
        &self,
        record: &DistributionRecord,
        cancel: &CancelToken,
    ) -> Result<ExecutionReport, ExecutionError> {
        let distribution_id = record.distribution_id.clone();
        let _guard = self
            .locks
            .try_acquire(&distribution_id)
            .ok_or_else(|| ExecutionError::AlreadyExecuting(distribution_id.clone()))?;

        let store_err = |error: StoreError| ExecutionError::Store {
            distribution_id: distribution_id.clone(),
            error,
        };

        let mut rec = self
            .store
            .get_distribution(&distribution_id)
            .map_err(store_err)?
            .ok_or_else(|| ExecutionError::NotFound(distribution_id.clone()))?;
        if !rec.is_active() {
            return Err(ExecutionError::Superseded(distribution_id.clone()));
        }
        if rec.overall_status == DistributionStatus::Completed {
            return Ok(ExecutionReport::unchanged(rec));
        }

        let targets: Vec<PaymentRequest> = rec
            .recipients
            .iter()
            .filter(|r| r.needs_payment())
            .map(|r| PaymentRequest {
                recipient_user_id: r.user_id.clone(),
                amount_sats: r.amount,
                idempotency_key: rec.idempotency_key(&r.user_id),
                memo: format!("{} ({})", r.reason, rec.source_unit_id),
            })
            .collect();

        if targets.is_empty() {
            let before = rec.overall_status;
            rec.refresh_status(Utc::now());
            if rec.overall_status != before {
                rec.revision = self.store.update_distribution(&rec).map_err(store_err)?;
            }
            return Ok(ExecutionReport::unchanged(rec));
        }

        rec.overall_status = DistributionStatus::Executing;
        rec.revision = self.store.update_distribution(&rec).map_err(store_err)?;
        info!(
            distribution_id = %distribution_id,
            recipients = targets.len(),
            amount = targets.iter().map(|t| t.amount_sats).sum::<u64>(),
            "💸 Executing distribution"
        );

        let (tx, mut rx) = mpsc::channel::<PaymentOutcome>(targets.len());
        let permits = Arc::new(Semaphore::new(self.settings.max_concurrent_payments.max(1)));
        let mut handles = Vec::with_capacity(targets.len());

        for request in targets {
            let tx = tx.clone();
            let permits = permits.clone();
            let wallet = self.wallet.clone();
            let cancel = cancel.clone();
            let settings = self.settings;

            handles.push(tokio::spawn(async move {
                let _permit = match permits.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return,
                };
                if cancel.is_cancelled() {
                    let _ = tx.send(PaymentOutcome::Skipped).await;
                    return;
                }
                let (attempts, result) =
                    pay_with_retry(wallet.as_ref(), &request, &settings, &cancel).await;
                let _ = tx
                    .send(PaymentOutcome::Attempted {
                        user_id: request.recipient_user_id,
                        attempts,
                        result,
                    })
                    .await;
            }));
        }
        drop(tx);

        let mut newly_paid = Vec::new();
        let mut dispatched = 0;
        let mut skipped = 0;

        while let Some(outcome) = rx.recv().await {
            let (user_id, attempts, result) = match outcome {
                PaymentOutcome::Skipped => {
                    skipped += 1;
                    continue;
                }
                PaymentOutcome::Attempted {
                    user_id,
                    attempts,
                    result,
                } => (user_id, attempts, result),
            };
            dispatched += 1;

            let Some(recipient) = rec.recipient_mut(&user_id) else {
                continue;
            };
            recipient.attempts += attempts;
            match result {
                Ok(receipt) => {
                    info!(
                        distribution_id = %distribution_id,
                        user_id = %user_id,
                        amount = recipient.amount,
                        tx = %receipt.transaction_hash,
                        "✅ Recipient paid"
                    );
                    recipient.mark_paid(receipt.transaction_hash, Utc::now());
                    newly_paid.push(user_id);
                }
                Err(e) => {
                    warn!(
                        distribution_id = %distribution_id,
                        user_id = %user_id,
                        attempts = attempts,
                        error = %e,
                        "Recipient payment failed"
                    );
                    recipient.mark_failed(e);
                }
            }

            // Persist every recipient outcome as it lands; the final write
            // below carries everything if one of these fails
            match self.store.update_distribution(&rec) {
                Ok(revision) => rec.revision = revision,
                Err(e) => error!(distribution_id = %distribution_id, error = %e, "Failed to persist recipient outcome"),
            }
        }

        for handle in handles {
            if let Err(e) = handle.await {
                error!(distribution_id = %distribution_id, error = %e, "Payment task aborted");
            }
        }

        rec.refresh_status(Utc::now());
        rec.revision = self.store.update_distribution(&rec).map_err(store_err)?;

        let summary = rec.summary();
        info!(
            distribution_id = %distribution_id,
            status = %rec.overall_status,
            dispatched = dispatched,
            skipped = skipped,
            "Distribution run finished: {}",
            summary
        );

        Ok(ExecutionReport {
            record: rec,
            summary,
            newly_paid,
            dispatched,
            skipped,
        })
    }
}

/// Sequential attempts for one recipient: never two calls in flight for the
/// same idempotency key. Returns the number of wallet calls made.
async fn pay_with_retry(
    wallet: &dyn WalletPaymentService,
    request: &PaymentRequest,
    settings: &ExecutorSettings,
    cancel: &CancelToken,
) -> (u32, Result<PaymentReceipt, PaymentError>) {
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        let result = match tokio::time::timeout(settings.payment_timeout, wallet.pay(request)).await {
            Ok(result) => result,
            Err(_) => Err(PaymentError::Transient(format!(
                "timed out after {}ms",
                settings.payment_timeout.as_millis()
            ))),
        };

        match result {
            Ok(receipt) => return (attempts, Ok(receipt)),
            Err(e)
                if e.is_transient()
                    && settings.retry.allows_retry(attempts)
                    && !cancel.is_cancelled() =>
            {
                let delay = settings.retry.delay_for(attempts - 1);
                debug!(
                    key = %request.idempotency_key,
                    attempt = attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Retrying payment"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return (attempts, Err(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    /// Fails transiently `failures` times, then succeeds
    struct FlakyWallet {
        failures: Mutex<u32>,
    }

    #[async_trait]
    impl WalletPaymentService for FlakyWallet {
        async fn pay(&self, request: &PaymentRequest) -> Result<PaymentReceipt, PaymentError> {
            let mut left = self.failures.lock();
            if *left > 0 {
                *left -= 1;
                return Err(PaymentError::RateLimited("slow down".into()));
            }
            Ok(PaymentReceipt {
                transaction_hash: format!("tx_{}", request.idempotency_key),
            })
        }
    }

    fn request() -> PaymentRequest {
        PaymentRequest {
            recipient_user_id: "alice".into(),
            amount_sats: 100,
            idempotency_key: "dist_1:alice".into(),
            memo: "test".into(),
        }
    }

    fn fast_settings(max_retries: u32) -> ExecutorSettings {
        ExecutorSettings {
            max_concurrent_payments: 2,
            payment_timeout: Duration::from_secs(5),
            retry: RetryPolicy::new(max_retries, Duration::from_millis(1), Duration::from_millis(4)),
        }
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let wallet = FlakyWallet { failures: Mutex::new(2) };
        let (attempts, result) =
            pay_with_retry(&wallet, &request(), &fast_settings(3), &CancelToken::new()).await;

        assert_eq!(attempts, 3);
        assert_eq!(result.unwrap().transaction_hash, "tx_dist_1:alice");
    }

    #[tokio::test]
    async fn test_retries_stop_at_limit() {
        let wallet = FlakyWallet { failures: Mutex::new(10) };
        let (attempts, result) =
            pay_with_retry(&wallet, &request(), &fast_settings(3), &CancelToken::new()).await;

        assert_eq!(attempts, 4);
        assert!(matches!(result, Err(PaymentError::RateLimited(_))));
    }

    #[tokio::test]
    async fn test_cancel_stops_retries() {
        let wallet = FlakyWallet { failures: Mutex::new(10) };
        let cancel = CancelToken::new();
        cancel.cancel();
        let (attempts, result) = pay_with_retry(&wallet, &request(), &fast_settings(3), &cancel).await;

        assert_eq!(attempts, 1);
        assert!(result.is_err());
    }
}
