//! In-memory `PersistenceStore`.
//!
//! Distribution creation and supersession take the unit index mutex, so the
//! uniqueness check and the insert cannot interleave with another writer.
//! Updates are atomic per record through the DashMap entry lock.

use std::collections::HashMap;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::debug;

use super::{
    apply_supersede, check_writable, CreateOutcome, PersistenceStore, StoreError, StoreResult,
};
use crate::settlement::ledger::LedgerEntry;
use crate::settlement::record::DistributionRecord;
use crate::settlement::unit::CompetitiveUnit;

#[derive(Debug, Default)]
pub struct MemoryStore {
    units: DashMap<String, CompetitiveUnit>,
    distributions: DashMap<String, DistributionRecord>,
    /// unit id -> active distribution id
    active_by_unit: Mutex<HashMap<String, String>>,
    ledger: DashMap<String, LedgerEntry>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PersistenceStore for MemoryStore {
    fn insert_unit(&self, unit: &CompetitiveUnit) -> StoreResult<()> {
        match self.units.entry(unit.id.clone()) {
            Entry::Occupied(_) => Err(StoreError::AlreadyExists(unit.id.clone())),
            Entry::Vacant(slot) => {
                slot.insert(unit.clone());
                Ok(())
            }
        }
    }

    fn get_unit(&self, unit_id: &str) -> StoreResult<Option<CompetitiveUnit>> {
        Ok(self.units.get(unit_id).map(|u| u.value().clone()))
    }

    fn update_unit(&self, unit: &CompetitiveUnit) -> StoreResult<()> {
        match self.units.get_mut(&unit.id) {
            Some(mut stored) => {
                *stored = unit.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound(unit.id.clone())),
        }
    }

    fn create_distribution(&self, record: &DistributionRecord) -> StoreResult<CreateOutcome> {
        let mut index = self.active_by_unit.lock();

        if let Some(active_id) = index.get(&record.source_unit_id) {
            let existing = self
                .distributions
                .get(active_id)
                .map(|r| r.value().clone())
                .ok_or_else(|| StoreError::NotFound(active_id.clone()))?;
            return Ok(CreateOutcome::Existing(existing));
        }
        if self.distributions.contains_key(&record.distribution_id) {
            return Err(StoreError::AlreadyExists(record.distribution_id.clone()));
        }

        let mut stored = record.clone();
        stored.revision = 0;
        self.distributions
            .insert(stored.distribution_id.clone(), stored.clone());
        index.insert(stored.source_unit_id.clone(), stored.distribution_id.clone());
        debug!(distribution_id = %stored.distribution_id, unit_id = %stored.source_unit_id, "Distribution created");
        Ok(CreateOutcome::Created(stored))
    }

    fn get_distribution(&self, distribution_id: &str) -> StoreResult<Option<DistributionRecord>> {
        Ok(self.distributions.get(distribution_id).map(|r| r.value().clone()))
    }

    fn active_distribution_for_unit(&self, unit_id: &str) -> StoreResult<Option<DistributionRecord>> {
        let active_id = self.active_by_unit.lock().get(unit_id).cloned();
        match active_id {
            Some(id) => self.get_distribution(&id),
            None => Ok(None),
        }
    }

    fn distributions_for_unit(&self, unit_id: &str) -> StoreResult<Vec<DistributionRecord>> {
        let mut records: Vec<DistributionRecord> = self
            .distributions
            .iter()
            .filter(|r| r.source_unit_id == unit_id)
            .map(|r| r.value().clone())
            .collect();
        records.sort_by_key(|r| r.settlement_pass);
        Ok(records)
    }

    fn update_distribution(&self, record: &DistributionRecord) -> StoreResult<u64> {
        let mut stored = self
            .distributions
            .get_mut(&record.distribution_id)
            .ok_or_else(|| StoreError::NotFound(record.distribution_id.clone()))?;
        check_writable(&stored, record.revision)?;

        let mut next = record.clone();
        next.revision = record.revision + 1;
        *stored = next;
        Ok(stored.revision)
    }

    fn supersede_distribution(
        &self,
        current: &DistributionRecord,
        replacement: &DistributionRecord,
    ) -> StoreResult<()> {
        let mut index = self.active_by_unit.lock();
        if self.distributions.contains_key(&replacement.distribution_id) {
            return Err(StoreError::AlreadyExists(replacement.distribution_id.clone()));
        }

        {
            let mut stored = self
                .distributions
                .get_mut(&current.distribution_id)
                .ok_or_else(|| StoreError::NotFound(current.distribution_id.clone()))?;
            apply_supersede(&mut stored, current, replacement)?;
        }

        let mut fresh = replacement.clone();
        fresh.revision = 0;
        self.distributions
            .insert(fresh.distribution_id.clone(), fresh);
        index.insert(
            replacement.source_unit_id.clone(),
            replacement.distribution_id.clone(),
        );
        Ok(())
    }

    fn append_ledger_entry(&self, entry: &LedgerEntry) -> StoreResult<bool> {
        match self.ledger.entry(entry.entry_id.clone()) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(entry.clone());
                Ok(true)
            }
        }
    }

    fn ledger_entries(&self, team_id: &str) -> StoreResult<Vec<LedgerEntry>> {
        let mut entries: Vec<LedgerEntry> = self
            .ledger
            .iter()
            .filter(|e| e.team_id == team_id)
            .map(|e| e.value().clone())
            .collect();
        entries.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.entry_id.cmp(&b.entry_id))
        });
        Ok(entries)
    }
}
