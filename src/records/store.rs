//! Record store: cached records striped over mutex shards, written through
//! to a durable backend.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard};

use crate::demand::{DemandStats, TriggerPolicy};
use crate::node::NodeId;
use crate::packets::Epoch;
use crate::records::{RecordBackend, RecordState, ReconfigurationRecord};
use crate::ring::ring_hash;
use crate::utils::ReconError;

/// Number of lock shards; names hash onto shards.
const NUM_SHARDS: usize = 16;

/// Per-name state machine store. Mutations of one name are serialized by its
/// shard lock; different shards proceed concurrently. Every transition is
/// written to the backend before the cached copy changes, so a failed write
/// leaves the record exactly as it was.
pub struct RecordStore {
    shards: Vec<Mutex<HashMap<String, ReconfigurationRecord>>>,
    backend: Box<dyn RecordBackend>,
}

impl RecordStore {
    /// Opens a store, loading every record the backend holds.
    pub fn open(backend: Box<dyn RecordBackend>) -> Result<Self, ReconError> {
        let shards: Vec<_> =
            (0..NUM_SHARDS).map(|_| Mutex::new(HashMap::new())).collect();
        let store = RecordStore { shards, backend };
        let records = store.backend.scan()?;
        let num_records = records.len();
        for record in records {
            store.lock(&record.name)?.insert(record.name.clone(), record);
        }
        pf_debug!("record store opened with {} records", num_records);
        Ok(store)
    }

    fn lock(
        &self,
        name: &str,
    ) -> Result<MutexGuard<'_, HashMap<String, ReconfigurationRecord>>, ReconError>
    {
        let idx = (ring_hash(name.as_bytes()) % NUM_SHARDS as u64) as usize;
        self.shards[idx]
            .lock()
            .map_err(|_| ReconError::msg(format!("shard of '{}' poisoned", name)))
    }

    /// Applies `f` to a copy of the record of `name`; if `f` accepts, writes
    /// the copy through and publishes it. Returns `Ok(false)` if the record is
    /// missing or `f` rejects.
    fn transition<F>(&self, name: &str, f: F) -> Result<bool, ReconError>
    where
        F: FnOnce(&mut ReconfigurationRecord) -> bool,
    {
        let mut shard = self.lock(name)?;
        let Some(current) = shard.get(name) else {
            return Ok(false);
        };
        let mut next = current.clone();
        if !f(&mut next) {
            return Ok(false);
        }
        self.backend.put(&next)?;
        if next.state != current.state || next.epoch != current.epoch {
            pf_info!(
                "record '{}' {}@{} -> {}@{}",
                name,
                current.state,
                current.epoch,
                next.state,
                next.epoch
            );
        }
        shard.insert(name.into(), next);
        Ok(true)
    }

    /// Reads a copy of the record of `name`.
    pub fn get_record(
        &self,
        name: &str,
    ) -> Result<Option<ReconfigurationRecord>, ReconError> {
        Ok(self.lock(name)?.get(name).cloned())
    }

    /// Creates the record of a new name at epoch 0, waiting for start acks
    /// from `actives`. Returns `Ok(false)` if any record (including a
    /// not-yet-purged tombstone) exists.
    pub fn create_record(
        &self,
        name: &str,
        actives: BTreeSet<NodeId>,
        initial_state: &str,
    ) -> Result<bool, ReconError> {
        let mut shard = self.lock(name)?;
        if shard.contains_key(name) {
            return Ok(false);
        }
        let record =
            ReconfigurationRecord::new_creation(name, actives, initial_state);
        self.backend.put(&record)?;
        pf_info!("record '{}' created {}@0", name, record.state);
        shard.insert(name.into(), record);
        Ok(true)
    }

    /// `Ready -> WaitAckStop` with `new_actives` as candidates, only if the
    /// record is `Ready` at exactly `epoch`. Two racing calls for the same
    /// (name, epoch) cannot both succeed.
    pub fn initiate_reconfiguration(
        &self,
        name: &str,
        epoch: Epoch,
        new_actives: BTreeSet<NodeId>,
        now_ms: u64,
    ) -> Result<bool, ReconError> {
        self.transition(name, |rec| {
            let ok = rec.initiate(epoch, new_actives);
            if ok {
                rec.demand.mark_reconfigured(now_ms);
            }
            ok
        })
    }

    /// Same as `initiate_reconfiguration` with an empty candidate set, which
    /// marks the transition as a deletion.
    pub fn initiate_deletion(
        &self,
        name: &str,
        epoch: Epoch,
    ) -> Result<bool, ReconError> {
        self.transition(name, |rec| rec.initiate(epoch, BTreeSet::new()))
    }

    /// `WaitAckStop -> WaitAckStart` once enough stop acks arrived.
    pub fn stop_acked(&self, name: &str, epoch: Epoch) -> Result<bool, ReconError> {
        self.transition(name, |rec| rec.stop_acked(epoch))
    }

    /// `WaitAckStart -> Ready` at the pending epoch once enough start acks
    /// arrived. `epoch` is the record's epoch before the transition.
    pub fn start_acked(&self, name: &str, epoch: Epoch) -> Result<bool, ReconError> {
        self.transition(name, |rec| rec.start_acked(epoch))
    }

    /// Any state `-> Deleted`.
    pub fn mark_deleted(&self, name: &str) -> Result<bool, ReconError> {
        self.transition(name, |rec| rec.mark_deleted())
    }

    /// Removes a `Deleted` tombstone for good.
    pub fn purge(&self, name: &str) -> Result<bool, ReconError> {
        let mut shard = self.lock(name)?;
        match shard.get(name) {
            Some(rec) if rec.state == RecordState::Deleted => {
                self.backend.delete(name)?;
                shard.remove(name);
                pf_info!("record '{}' purged", name);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Merges a demand report into the stored stats. Returns whether the
    /// accumulated demand crosses the trigger thresholds while the record is
    /// `Ready`; `Ok(false)` if the name is unknown.
    pub fn update_demand_stats(
        &self,
        name: &str,
        report: &DemandStats,
        now_ms: u64,
        policy: &TriggerPolicy,
    ) -> Result<bool, ReconError> {
        let mut triggered = false;
        self.transition(name, |rec| {
            triggered = rec.demand.merge(report, now_ms, policy)
                && rec.state == RecordState::Ready;
            true
        })?;
        Ok(triggered)
    }

    /// Sorted names of the records passing `keep`.
    fn names_where(
        &self,
        keep: impl Fn(&ReconfigurationRecord) -> bool,
    ) -> Result<Vec<String>, ReconError> {
        let mut names = Vec::new();
        for shard in &self.shards {
            let shard = shard
                .lock()
                .map_err(|_| ReconError::msg("record shard poisoned"))?;
            names.extend(
                shard
                    .values()
                    .filter(|rec| keep(rec))
                    .map(|rec| rec.name.clone()),
            );
        }
        names.sort();
        Ok(names)
    }

    /// Names whose record is not `Ready`: candidates for re-driving the
    /// handoff protocol after a restart.
    pub fn get_pending_reconfigurations(&self) -> Result<Vec<String>, ReconError> {
        self.names_where(|rec| rec.state != RecordState::Ready)
    }

    /// Names of every live record.
    pub fn names(&self) -> Result<Vec<String>, ReconError> {
        self.names_where(|rec| rec.state != RecordState::Deleted)
    }

    /// Takes over a record handed over by another reconfigurator, unless the
    /// copy held here is at least as new. Returns the epoch now held.
    pub fn adopt(&self, record: ReconfigurationRecord) -> Result<Epoch, ReconError> {
        let mut shard = self.lock(&record.name)?;
        if let Some(held) = shard.get(&record.name) {
            if held.epoch >= record.epoch {
                return Ok(held.epoch);
            }
        }
        self.backend.put(&record)?;
        pf_info!(
            "record '{}' adopted {}@{}",
            record.name,
            record.state,
            record.epoch
        );
        let epoch = record.epoch;
        shard.insert(record.name.clone(), record);
        Ok(epoch)
    }

    /// Drops the copy of a record handed over to another reconfigurator,
    /// only if it is still `Ready` at `epoch`.
    pub fn release(&self, name: &str, epoch: Epoch) -> Result<bool, ReconError> {
        let mut shard = self.lock(name)?;
        match shard.get(name) {
            Some(rec) if rec.state == RecordState::Ready && rec.epoch == epoch => {
                self.backend.delete(name)?;
                shard.remove(name);
                pf_info!("record '{}' released at epoch {}", name, epoch);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Number of records, tombstones included.
    pub fn len(&self) -> Result<usize, ReconError> {
        let mut len = 0;
        for shard in &self.shards {
            len += shard
                .lock()
                .map_err(|_| ReconError::msg("record shard poisoned"))?
                .len();
        }
        Ok(len)
    }

    pub fn is_empty(&self) -> Result<bool, ReconError> {
        Ok(self.len()? == 0)
    }
}
