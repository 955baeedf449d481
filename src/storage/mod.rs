// ============================================================================
// PRIZE SETTLEMENT - PERSISTENCE LAYER
// ============================================================================
//
// Two interchangeable stores behind one synchronous trait:
// - MemoryStore: DashMap tables, for tests and embedding
// - RedbStore:   ReDB (ACID, MVCC) with a DashMap read cache
//
// GUARANTEES:
// - At most one ACTIVE distribution per source unit (unique index on unit id).
//   The "already exists" check and the insert are one atomic step.
// - Optimistic concurrency on distributions: an update must carry the stored
//   revision and bumps it. Stale writers get `Conflict`, never a lost update.
// - Completed or superseded distributions are immutable.
// - Ledger appends are idempotent by entry id.
//
// ============================================================================

pub mod memory;
pub mod redb_store;

pub use memory::MemoryStore;
pub use redb_store::RedbStore;

use thiserror::Error;

use crate::settlement::ledger::LedgerEntry;
use crate::settlement::record::DistributionRecord;
use crate::settlement::unit::CompetitiveUnit;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("Storage backend error: {0}")]
    Backend(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Revision conflict on {id}: expected {expected}, found {found}")]
    Conflict { id: String, expected: u64, found: u64 },

    #[error("Distribution {0} is immutable")]
    Immutable(String),
}

/// Result of `create_distribution`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateOutcome {
    /// Stored as the unit's active distribution
    Created(DistributionRecord),
    /// The unit already had an active distribution; nothing was written
    Existing(DistributionRecord),
}

impl CreateOutcome {
    pub fn record(&self) -> &DistributionRecord {
        match self {
            Self::Created(r) | Self::Existing(r) => r,
        }
    }

    pub fn into_record(self) -> DistributionRecord {
        match self {
            Self::Created(r) | Self::Existing(r) => r,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, Self::Created(_))
    }
}

/// CRUD for units, distributions and the team ledger
pub trait PersistenceStore: Send + Sync {
    // ---- units ----

    /// Fails with `AlreadyExists` for a known id
    fn insert_unit(&self, unit: &CompetitiveUnit) -> StoreResult<()>;
    fn get_unit(&self, unit_id: &str) -> StoreResult<Option<CompetitiveUnit>>;
    /// Fails with `NotFound` for an unknown id
    fn update_unit(&self, unit: &CompetitiveUnit) -> StoreResult<()>;

    // ---- distributions ----

    /// Insert unless the unit already has an active distribution
    fn create_distribution(&self, record: &DistributionRecord) -> StoreResult<CreateOutcome>;
    fn get_distribution(&self, distribution_id: &str) -> StoreResult<Option<DistributionRecord>>;
    fn active_distribution_for_unit(&self, unit_id: &str) -> StoreResult<Option<DistributionRecord>>;
    /// Every pass for the unit, oldest first
    fn distributions_for_unit(&self, unit_id: &str) -> StoreResult<Vec<DistributionRecord>>;
    /// Write `record` if its revision matches the stored one; returns the new revision
    fn update_distribution(&self, record: &DistributionRecord) -> StoreResult<u64>;
    /// Mark `current` superseded and make `replacement` the unit's active distribution
    fn supersede_distribution(
        &self,
        current: &DistributionRecord,
        replacement: &DistributionRecord,
    ) -> StoreResult<()>;

    // ---- ledger ----

    /// Returns false when the entry id was already recorded
    fn append_ledger_entry(&self, entry: &LedgerEntry) -> StoreResult<bool>;
    fn ledger_entries(&self, team_id: &str) -> StoreResult<Vec<LedgerEntry>>;
}

/// Shared precondition of every distribution write
pub(crate) fn check_writable(stored: &DistributionRecord, incoming_revision: u64) -> StoreResult<()> {
    if stored.is_immutable() {
        return Err(StoreError::Immutable(stored.distribution_id.clone()));
    }
    if stored.revision != incoming_revision {
        return Err(StoreError::Conflict {
            id: stored.distribution_id.clone(),
            expected: incoming_revision,
            found: stored.revision,
        });
    }
    Ok(())
}

/// Mark a stored record superseded, after the same checks as an update
pub(crate) fn apply_supersede(
    stored: &mut DistributionRecord,
    current: &DistributionRecord,
    replacement: &DistributionRecord,
) -> StoreResult<()> {
    check_writable(stored, current.revision)?;
    if replacement.source_unit_id != stored.source_unit_id {
        return Err(StoreError::Backend(format!(
            "replacement {} belongs to unit {}, not {}",
            replacement.distribution_id, replacement.source_unit_id, stored.source_unit_id
        )));
    }
    stored.superseded_by = Some(replacement.distribution_id.clone());
    stored.revision += 1;
    Ok(())
}

pub(crate) fn encode<T: serde::Serialize>(value: &T) -> StoreResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| StoreError::Serialization(e.to_string()))
}

pub(crate) fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> StoreResult<T> {
    serde_json::from_slice(bytes).map_err(|e| StoreError::Serialization(e.to_string()))
}
