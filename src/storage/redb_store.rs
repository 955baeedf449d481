// ============================================================================
// REDB-BACKED SETTLEMENT STORE
// ============================================================================
//
// Durable `PersistenceStore`:
// - ReDB holds the source of truth (serde_json bytes per row)
// - A DashMap cache serves repeat reads; it is only written AFTER a commit
//
// Every check-then-write (unique active distribution, revision match,
// supersession) runs inside a single ReDB write transaction. ReDB allows one
// writer at a time, so those checks cannot race.
//
// ============================================================================

use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use redb::{Database, ReadableTable, TableDefinition};
use tracing::{debug, info};

use super::{
    apply_supersede, check_writable, decode, encode, CreateOutcome, PersistenceStore, StoreError,
    StoreResult,
};
use crate::settlement::ledger::LedgerEntry;
use crate::settlement::record::DistributionRecord;
use crate::settlement::unit::CompetitiveUnit;

// ============================================================================
// TABLE DEFINITIONS
// ============================================================================

/// Units: unit id → CompetitiveUnit JSON
const UNITS: TableDefinition<&str, &[u8]> = TableDefinition::new("units");

/// Distributions: distribution id → DistributionRecord JSON
const DISTRIBUTIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("distributions");

/// Unique index: unit id → active distribution id
const ACTIVE_BY_UNIT: TableDefinition<&str, &str> = TableDefinition::new("active_by_unit");

/// Team ledger: entry id → LedgerEntry JSON
const LEDGER: TableDefinition<&str, &[u8]> = TableDefinition::new("ledger");

const DB_FILE: &str = "settlement.redb";

fn backend(e: impl std::fmt::Display) -> StoreError {
    StoreError::Backend(e.to_string())
}

/// ReDB store with a read-through cache. `Clone` shares the same database.
#[derive(Clone)]
pub struct RedbStore {
    db: Arc<Database>,
    path: PathBuf,
    units: Arc<DashMap<String, CompetitiveUnit>>,
    distributions: Arc<DashMap<String, DistributionRecord>>,
}

impl RedbStore {
    /// Create or open `<dir>/settlement.redb`
    pub fn open(dir: impl AsRef<Path>) -> StoreResult<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir).map_err(backend)?;
        let path = dir.join(DB_FILE);
        info!(path = %path.display(), "Opening settlement database");

        let db = Database::create(&path).map_err(backend)?;

        let write_txn = db.begin_write().map_err(backend)?;
        {
            write_txn.open_table(UNITS).map_err(backend)?;
            write_txn.open_table(DISTRIBUTIONS).map_err(backend)?;
            write_txn.open_table(ACTIVE_BY_UNIT).map_err(backend)?;
            write_txn.open_table(LEDGER).map_err(backend)?;
        }
        write_txn.commit().map_err(backend)?;

        Ok(Self {
            db: Arc::new(db),
            path,
            units: Arc::new(DashMap::new()),
            distributions: Arc::new(DashMap::new()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_distribution(&self, distribution_id: &str) -> StoreResult<Option<DistributionRecord>> {
        let read_txn = self.db.begin_read().map_err(backend)?;
        let table = read_txn.open_table(DISTRIBUTIONS).map_err(backend)?;
        let record = match table.get(distribution_id).map_err(backend)? {
            Some(bytes) => Some(decode::<DistributionRecord>(bytes.value())?),
            None => None,
        };
        Ok(record)
    }
}

impl PersistenceStore for RedbStore {
    fn insert_unit(&self, unit: &CompetitiveUnit) -> StoreResult<()> {
        let bytes = encode(unit)?;
        let write_txn = self.db.begin_write().map_err(backend)?;
        {
            let mut table = write_txn.open_table(UNITS).map_err(backend)?;
            let exists = table.get(unit.id.as_str()).map_err(backend)?.is_some();
            if exists {
                return Err(StoreError::AlreadyExists(unit.id.clone()));
            }
            table
                .insert(unit.id.as_str(), bytes.as_slice())
                .map_err(backend)?;
        }
        write_txn.commit().map_err(backend)?;

        self.units.insert(unit.id.clone(), unit.clone());
        Ok(())
    }

    fn get_unit(&self, unit_id: &str) -> StoreResult<Option<CompetitiveUnit>> {
        if let Some(unit) = self.units.get(unit_id) {
            return Ok(Some(unit.value().clone()));
        }

        let read_txn = self.db.begin_read().map_err(backend)?;
        let table = read_txn.open_table(UNITS).map_err(backend)?;
        let unit = match table.get(unit_id).map_err(backend)? {
            Some(bytes) => decode::<CompetitiveUnit>(bytes.value())?,
            None => return Ok(None),
        };
        self.units.insert(unit.id.clone(), unit.clone());
        Ok(Some(unit))
    }

    fn update_unit(&self, unit: &CompetitiveUnit) -> StoreResult<()> {
        let bytes = encode(unit)?;
        let write_txn = self.db.begin_write().map_err(backend)?;
        {
            let mut table = write_txn.open_table(UNITS).map_err(backend)?;
            let exists = table.get(unit.id.as_str()).map_err(backend)?.is_some();
            if !exists {
                return Err(StoreError::NotFound(unit.id.clone()));
            }
            table
                .insert(unit.id.as_str(), bytes.as_slice())
                .map_err(backend)?;
        }
        write_txn.commit().map_err(backend)?;

        self.units.insert(unit.id.clone(), unit.clone());
        Ok(())
    }

    fn create_distribution(&self, record: &DistributionRecord) -> StoreResult<CreateOutcome> {
        let mut stored = record.clone();
        stored.revision = 0;
        let bytes = encode(&stored)?;

        let write_txn = self.db.begin_write().map_err(backend)?;
        {
            let mut index = write_txn.open_table(ACTIVE_BY_UNIT).map_err(backend)?;
            let mut table = write_txn.open_table(DISTRIBUTIONS).map_err(backend)?;

            let active_id = index
                .get(record.source_unit_id.as_str())
                .map_err(backend)?
                .map(|id| id.value().to_string());
            if let Some(active_id) = active_id {
                let existing = match table.get(active_id.as_str()).map_err(backend)? {
                    Some(bytes) => decode::<DistributionRecord>(bytes.value())?,
                    None => return Err(StoreError::NotFound(active_id)),
                };
                return Ok(CreateOutcome::Existing(existing));
            }

            let taken = table
                .get(record.distribution_id.as_str())
                .map_err(backend)?
                .is_some();
            if taken {
                return Err(StoreError::AlreadyExists(record.distribution_id.clone()));
            }

            table
                .insert(stored.distribution_id.as_str(), bytes.as_slice())
                .map_err(backend)?;
            index
                .insert(
                    stored.source_unit_id.as_str(),
                    stored.distribution_id.as_str(),
                )
                .map_err(backend)?;
        }
        write_txn.commit().map_err(backend)?;

        self.distributions
            .insert(stored.distribution_id.clone(), stored.clone());
        debug!(distribution_id = %stored.distribution_id, unit_id = %stored.source_unit_id, "Distribution persisted");
        Ok(CreateOutcome::Created(stored))
    }

    fn get_distribution(&self, distribution_id: &str) -> StoreResult<Option<DistributionRecord>> {
        if let Some(record) = self.distributions.get(distribution_id) {
            return Ok(Some(record.value().clone()));
        }
        let record = self.read_distribution(distribution_id)?;
        if let Some(ref r) = record {
            self.distributions.insert(r.distribution_id.clone(), r.clone());
        }
        Ok(record)
    }

    fn active_distribution_for_unit(&self, unit_id: &str) -> StoreResult<Option<DistributionRecord>> {
        let active_id = {
            let read_txn = self.db.begin_read().map_err(backend)?;
            let index = read_txn.open_table(ACTIVE_BY_UNIT).map_err(backend)?;
            let id = index
                .get(unit_id)
                .map_err(backend)?
                .map(|id| id.value().to_string());
            id
        };
        match active_id {
            Some(id) => self.get_distribution(&id),
            None => Ok(None),
        }
    }

    fn distributions_for_unit(&self, unit_id: &str) -> StoreResult<Vec<DistributionRecord>> {
        let read_txn = self.db.begin_read().map_err(backend)?;
        let table = read_txn.open_table(DISTRIBUTIONS).map_err(backend)?;

        let mut records = Vec::new();
        for row in table.iter().map_err(backend)? {
            let (_, bytes) = row.map_err(backend)?;
            let record: DistributionRecord = decode(bytes.value())?;
            if record.source_unit_id == unit_id {
                records.push(record);
            }
        }
        records.sort_by_key(|r| r.settlement_pass);
        Ok(records)
    }

    fn update_distribution(&self, record: &DistributionRecord) -> StoreResult<u64> {
        let mut next = record.clone();
        next.revision = record.revision + 1;
        let bytes = encode(&next)?;

        let write_txn = self.db.begin_write().map_err(backend)?;
        {
            let mut table = write_txn.open_table(DISTRIBUTIONS).map_err(backend)?;
            let stored = match table.get(record.distribution_id.as_str()).map_err(backend)? {
                Some(bytes) => decode::<DistributionRecord>(bytes.value())?,
                None => return Err(StoreError::NotFound(record.distribution_id.clone())),
            };
            check_writable(&stored, record.revision)?;
            table
                .insert(next.distribution_id.as_str(), bytes.as_slice())
                .map_err(backend)?;
        }
        write_txn.commit().map_err(backend)?;

        let revision = next.revision;
        self.distributions.insert(next.distribution_id.clone(), next);
        Ok(revision)
    }

    fn supersede_distribution(
        &self,
        current: &DistributionRecord,
        replacement: &DistributionRecord,
    ) -> StoreResult<()> {
        let mut fresh = replacement.clone();
        fresh.revision = 0;
        let fresh_bytes = encode(&fresh)?;

        let write_txn = self.db.begin_write().map_err(backend)?;
        let superseded = {
            let mut index = write_txn.open_table(ACTIVE_BY_UNIT).map_err(backend)?;
            let mut table = write_txn.open_table(DISTRIBUTIONS).map_err(backend)?;

            let taken = table
                .get(fresh.distribution_id.as_str())
                .map_err(backend)?
                .is_some();
            if taken {
                return Err(StoreError::AlreadyExists(fresh.distribution_id.clone()));
            }

            let mut stored = match table.get(current.distribution_id.as_str()).map_err(backend)? {
                Some(bytes) => decode::<DistributionRecord>(bytes.value())?,
                None => return Err(StoreError::NotFound(current.distribution_id.clone())),
            };
            apply_supersede(&mut stored, current, &fresh)?;

            let stored_bytes = encode(&stored)?;
            table
                .insert(stored.distribution_id.as_str(), stored_bytes.as_slice())
                .map_err(backend)?;
            table
                .insert(fresh.distribution_id.as_str(), fresh_bytes.as_slice())
                .map_err(backend)?;
            index
                .insert(fresh.source_unit_id.as_str(), fresh.distribution_id.as_str())
                .map_err(backend)?;
            stored
        };
        write_txn.commit().map_err(backend)?;

        self.distributions
            .insert(superseded.distribution_id.clone(), superseded);
        self.distributions
            .insert(fresh.distribution_id.clone(), fresh);
        Ok(())
    }

    fn append_ledger_entry(&self, entry: &LedgerEntry) -> StoreResult<bool> {
        let bytes = encode(entry)?;
        let write_txn = self.db.begin_write().map_err(backend)?;
        {
            let mut table = write_txn.open_table(LEDGER).map_err(backend)?;
            let exists = table.get(entry.entry_id.as_str()).map_err(backend)?.is_some();
            if exists {
                return Ok(false);
            }
            table
                .insert(entry.entry_id.as_str(), bytes.as_slice())
                .map_err(backend)?;
        }
        write_txn.commit().map_err(backend)?;
        Ok(true)
    }

    fn ledger_entries(&self, team_id: &str) -> StoreResult<Vec<LedgerEntry>> {
        let read_txn = self.db.begin_read().map_err(backend)?;
        let table = read_txn.open_table(LEDGER).map_err(backend)?;

        let mut entries = Vec::new();
        for row in table.iter().map_err(backend)? {
            let (_, bytes) = row.map_err(backend)?;
            let entry: LedgerEntry = decode(bytes.value())?;
            if entry.team_id == team_id {
                entries.push(entry);
            }
        }
        entries.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.entry_id.cmp(&b.entry_id))
        });
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settlement::planner::{ParticipantResult, PayoutPlanner, PayoutPolicy};
    use chrono::Utc;

    fn record_for(unit: &CompetitiveUnit, pass: u32) -> DistributionRecord {
        let plan = PayoutPlanner::plan(
            unit.prize_pool,
            unit.arbitration_fee_percent,
            &unit.payout_policy,
            &[ParticipantResult::new("alice", 2.0), ParticipantResult::new("bob", 1.0)],
        )
        .unwrap();
        DistributionRecord::from_plan(unit, pass, &plan, Utc::now())
    }

    #[test]
    fn test_reopen_keeps_records_and_index() {
        let dir = tempfile::tempdir().unwrap();
        let now = Utc::now();
        let unit = CompetitiveUnit::event("ev_1", "5K", "team_1", 1_000, now, now)
            .with_payout_policy(PayoutPolicy::Equal);
        let record = record_for(&unit, 1);

        {
            let store = RedbStore::open(dir.path()).unwrap();
            store.insert_unit(&unit).unwrap();
            assert!(store.create_distribution(&record).unwrap().is_created());
        }

        let store = RedbStore::open(dir.path()).unwrap();
        assert_eq!(store.get_unit("ev_1").unwrap().unwrap().name, "5K");
        let active = store.active_distribution_for_unit("ev_1").unwrap().unwrap();
        assert_eq!(active.distribution_id, record.distribution_id);

        // The unique index survives the reopen
        let again = store.create_distribution(&record_for(&unit, 1)).unwrap();
        assert!(!again.is_created());
    }

    #[test]
    fn test_stale_revision_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = RedbStore::open(dir.path()).unwrap();
        let now = Utc::now();
        let unit = CompetitiveUnit::event("ev_2", "10K", "team_1", 500, now, now);
        let record = store
            .create_distribution(&record_for(&unit, 1))
            .unwrap()
            .into_record();

        let mut first = record.clone();
        first.overall_status = crate::settlement::record::DistributionStatus::Executing;
        assert_eq!(store.update_distribution(&first).unwrap(), 1);

        let err = store.update_distribution(&record).unwrap_err();
        assert_eq!(
            err,
            StoreError::Conflict {
                id: record.distribution_id.clone(),
                expected: 0,
                found: 1
            }
        );
    }
}
