// ============================================================================
// TEST HELPERS - Shared doubles and fixtures for integration tests
// ============================================================================
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;

use prize_settlement::{
    AlertSink, CompetitiveUnit, CompletionTrigger, DistributionAlert, DistributionExecutor,
    DistributionRecord, ExecutorSettings, MemoryStore, Notification, NotificationError,
    NotificationService, ParticipantResult, PaymentError, PaymentReceipt, PaymentRequest,
    PayoutPlanner, PayoutPolicy, PersistenceStore, ResultsError, ResultsProvider, RetryPolicy,
    SettlementOrchestrator, SettlementStateMachine, WalletPaymentService,
};

// ============================================================================
// WALLET
// ============================================================================

/// Wallet double that behaves like an idempotent provider: a key that
/// already succeeded returns the original receipt without paying again.
#[derive(Default)]
pub struct ScriptedWallet {
    settled: DashMap<String, PaymentReceipt>,
    calls: DashMap<String, u32>,
    /// user id -> failures returned by the next calls, in order
    scripted: Mutex<HashMap<String, VecDeque<PaymentError>>>,
    /// user id -> failure returned by every call
    always: Mutex<HashMap<String, PaymentError>>,
    /// user id -> latency of the next calls, in order
    delays: Mutex<HashMap<String, VecDeque<Duration>>>,
    base_delay: Mutex<Duration>,
    in_flight: DashMap<String, ()>,
    overlap: AtomicBool,
    active: AtomicU32,
    peak: AtomicU32,
    payments_made: AtomicU32,
    paid_sats: AtomicU64,
}

/// Clears the in-flight marker even when the call future is dropped by a timeout
struct InFlight<'a> {
    wallet: &'a ScriptedWallet,
    user_id: String,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.wallet.in_flight.remove(&self.user_id);
        self.wallet.active.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ScriptedWallet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_latency(self, latency: Duration) -> Self {
        *self.base_delay.lock() = latency;
        self
    }

    pub fn fail_next(&self, user_id: &str, errors: Vec<PaymentError>) {
        self.scripted
            .lock()
            .entry(user_id.to_string())
            .or_default()
            .extend(errors);
    }

    pub fn fail_always(&self, user_id: &str, error: PaymentError) {
        self.always.lock().insert(user_id.to_string(), error);
    }

    pub fn heal(&self, user_id: &str) {
        self.always.lock().remove(user_id);
        self.scripted.lock().remove(user_id);
    }

    pub fn delay_next(&self, user_id: &str, delay: Duration) {
        self.delays
            .lock()
            .entry(user_id.to_string())
            .or_default()
            .push_back(delay);
    }

    pub fn calls_for(&self, idempotency_key: &str) -> u32 {
        self.calls.get(idempotency_key).map(|c| *c.value()).unwrap_or(0)
    }

    pub fn total_calls(&self) -> u32 {
        self.calls.iter().map(|c| *c.value()).sum()
    }

    pub fn receipt_for(&self, idempotency_key: &str) -> Option<PaymentReceipt> {
        self.settled.get(idempotency_key).map(|r| r.value().clone())
    }

    /// Distinct keys that actually moved money
    pub fn payments_made(&self) -> u32 {
        self.payments_made.load(Ordering::SeqCst)
    }

    pub fn paid_sats(&self) -> u64 {
        self.paid_sats.load(Ordering::SeqCst)
    }

    pub fn overlap_detected(&self) -> bool {
        self.overlap.load(Ordering::SeqCst)
    }

    /// Highest number of wallet calls seen in flight at once
    pub fn peak_concurrency(&self) -> u32 {
        self.peak.load(Ordering::SeqCst)
    }

    fn next_failure(&self, user_id: &str) -> Option<PaymentError> {
        if let Some(error) = self
            .scripted
            .lock()
            .get_mut(user_id)
            .and_then(|queue| queue.pop_front())
        {
            return Some(error);
        }
        self.always.lock().get(user_id).cloned()
    }

    fn next_delay(&self, user_id: &str) -> Duration {
        self.delays
            .lock()
            .get_mut(user_id)
            .and_then(|queue| queue.pop_front())
            .unwrap_or(*self.base_delay.lock())
    }
}

#[async_trait]
impl WalletPaymentService for ScriptedWallet {
    async fn pay(&self, request: &PaymentRequest) -> Result<PaymentReceipt, PaymentError> {
        *self.calls.entry(request.idempotency_key.clone()).or_insert(0) += 1;

        if self
            .in_flight
            .insert(request.recipient_user_id.clone(), ())
            .is_some()
        {
            self.overlap.store(true, Ordering::SeqCst);
        }
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(active, Ordering::SeqCst);
        let _in_flight = InFlight {
            wallet: self,
            user_id: request.recipient_user_id.clone(),
        };

        let delay = self.next_delay(&request.recipient_user_id);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if let Some(receipt) = self.receipt_for(&request.idempotency_key) {
            return Ok(receipt);
        }
        if let Some(error) = self.next_failure(&request.recipient_user_id) {
            return Err(error);
        }

        let receipt = PaymentReceipt {
            transaction_hash: format!("ln_{}", uuid::Uuid::new_v4().simple()),
        };
        self.settled
            .insert(request.idempotency_key.clone(), receipt.clone());
        self.payments_made.fetch_add(1, Ordering::SeqCst);
        self.paid_sats.fetch_add(request.amount_sats, Ordering::SeqCst);
        Ok(receipt)
    }
}

// ============================================================================
// RESULTS / NOTIFICATIONS / ALERTS
// ============================================================================

/// Results keyed by unit id; unknown units are `NotReady`
#[derive(Default)]
pub struct StaticResults {
    results: DashMap<String, Vec<ParticipantResult>>,
}

impl StaticResults {
    pub fn set(&self, unit_id: &str, results: &[(&str, f64)]) {
        self.results.insert(
            unit_id.to_string(),
            results
                .iter()
                .map(|(user, value)| ParticipantResult::new(*user, *value))
                .collect(),
        );
    }

    pub fn clear(&self, unit_id: &str) {
        self.results.remove(unit_id);
    }
}

#[async_trait]
impl ResultsProvider for StaticResults {
    async fn get_results(&self, unit_id: &str) -> Result<Vec<ParticipantResult>, ResultsError> {
        self.results
            .get(unit_id)
            .map(|r| r.value().clone())
            .ok_or_else(|| ResultsError::NotReady(unit_id.to_string()))
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
    failing: AtomicBool,
}

impl RecordingNotifier {
    /// Make every delivery fail (nothing is recorded)
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().clone()
    }

    pub fn count_kind(&self, kind: &str) -> usize {
        self.sent
            .lock()
            .iter()
            .filter(|n| n.payload.kind() == kind)
            .count()
    }

    pub fn for_user(&self, user_id: &str) -> Vec<Notification> {
        self.sent
            .lock()
            .iter()
            .filter(|n| n.user_id == user_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl NotificationService for RecordingNotifier {
    async fn notify(&self, notification: Notification) -> Result<(), NotificationError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(NotificationError::Delivery("push gateway down".into()));
        }
        self.sent.lock().push(notification);
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingAlerts {
    raised: Mutex<Vec<DistributionAlert>>,
}

impl RecordingAlerts {
    pub fn raised(&self) -> Vec<DistributionAlert> {
        self.raised.lock().clone()
    }
}

#[async_trait]
impl AlertSink for RecordingAlerts {
    async fn raise(&self, alert: DistributionAlert) {
        self.raised.lock().push(alert);
    }
}

// ============================================================================
// FIXTURES
// ============================================================================

/// Millisecond backoff so retry tests stay fast
pub fn fast_settings() -> ExecutorSettings {
    ExecutorSettings {
        max_concurrent_payments: 4,
        payment_timeout: Duration::from_secs(2),
        retry: RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(8)),
    }
}

/// Everything wired together around one store
pub struct Harness {
    pub store: Arc<dyn PersistenceStore>,
    pub wallet: Arc<ScriptedWallet>,
    pub results: Arc<StaticResults>,
    pub notifier: Arc<RecordingNotifier>,
    pub alerts: Arc<RecordingAlerts>,
    pub orchestrator: Arc<SettlementOrchestrator>,
    pub machine: SettlementStateMachine,
}

impl Harness {
    pub fn new() -> Self {
        Self::build(Arc::new(MemoryStore::new()), ScriptedWallet::new(), fast_settings())
    }

    pub fn build(
        store: Arc<dyn PersistenceStore>,
        wallet: ScriptedWallet,
        settings: ExecutorSettings,
    ) -> Self {
        let wallet = Arc::new(wallet);
        let results = Arc::new(StaticResults::default());
        let notifier = Arc::new(RecordingNotifier::default());
        let alerts = Arc::new(RecordingAlerts::default());

        let executor = DistributionExecutor::new(wallet.clone(), store.clone(), settings);
        let orchestrator = Arc::new(SettlementOrchestrator::new(
            store.clone(),
            results.clone(),
            executor,
            notifier.clone(),
            alerts.clone(),
        ));
        let machine = SettlementStateMachine::new(store.clone(), results.clone(), notifier.clone())
            .with_locks(orchestrator.unit_locks());

        Self {
            store,
            wallet,
            results,
            notifier,
            alerts,
            orchestrator,
            machine,
        }
    }

    /// Register an event that started two days ago and ended yesterday
    pub async fn past_event(
        &self,
        id: &str,
        prize_pool: u64,
        fee_percent: u8,
        policy: PayoutPolicy,
    ) -> CompetitiveUnit {
        let now = Utc::now();
        let unit = CompetitiveUnit::event(
            id,
            format!("Event {}", id),
            "team_runstr",
            prize_pool,
            now - ChronoDuration::days(2),
            now - ChronoDuration::days(1),
        )
        .with_arbitration_fee(fee_percent)
        .with_payout_policy(policy);
        self.machine.create_unit(unit).await.unwrap()
    }

    /// Register, start and finish an event, and publish its results
    pub async fn completed_event(
        &self,
        id: &str,
        prize_pool: u64,
        fee_percent: u8,
        policy: PayoutPolicy,
        results: &[(&str, f64)],
    ) -> CompetitiveUnit {
        self.past_event(id, prize_pool, fee_percent, policy).await;
        self.results.set(id, results);
        self.machine.activate(id, Utc::now()).await.unwrap();
        self.machine
            .complete(id, CompletionTrigger::EndDateReached, Utc::now())
            .await
            .unwrap()
            .unit
    }
}

/// Store a completed event and an equal-split pending distribution for it,
/// bypassing the orchestrator
pub fn seed_distribution(
    store: &dyn PersistenceStore,
    unit_id: &str,
    prize_pool: u64,
    users: &[&str],
) -> DistributionRecord {
    let now = Utc::now();
    let unit = CompetitiveUnit::event(
        unit_id,
        format!("Event {}", unit_id),
        "team_runstr",
        prize_pool,
        now - ChronoDuration::days(2),
        now - ChronoDuration::days(1),
    );
    store.insert_unit(&unit).unwrap();

    let results: Vec<ParticipantResult> = users
        .iter()
        .enumerate()
        .map(|(i, user)| ParticipantResult::new(*user, (users.len() - i) as f64))
        .collect();
    let plan = PayoutPlanner::plan(prize_pool, 0, &PayoutPolicy::Equal, &results).unwrap();
    let record = DistributionRecord::from_plan(&unit, 1, &plan, now);
    store.create_distribution(&record).unwrap().into_record()
}
