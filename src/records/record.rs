//! Reconfiguration record of one service name and its state machine.

use std::collections::BTreeSet;
use std::fmt;

use crate::demand::StoredDemand;
use crate::node::NodeId;
use crate::packets::Epoch;

use serde::{Deserialize, Serialize};

/// Lifecycle state of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordState {
    /// Stable, serving `active_replicas` at `epoch`.
    Ready,

    /// Next epoch proposed; waiting for the old group to stop. A deletion
    /// stays in this state until the old group dropped its final state.
    WaitAckStop,

    /// Waiting for the new group to start the pending epoch.
    WaitAckStart,

    /// Terminal; the record is only a tombstone awaiting purge.
    Deleted,
}

impl fmt::Display for RecordState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Durable per-name record. Fields are public for reading; all mutation goes
/// through the epoch-checked transitions below, applied by `RecordStore`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconfigurationRecord {
    /// Service name.
    pub name: String,

    /// Current epoch; never decreases.
    pub epoch: Epoch,

    /// Lifecycle state.
    pub state: RecordState,

    /// Servers of the current epoch.
    pub active_replicas: BTreeSet<NodeId>,

    /// Candidate servers of the pending epoch; `Some` only while waiting for
    /// stop or start acks. An empty candidate set means deletion.
    pub new_active_replicas: Option<BTreeSet<NodeId>>,

    /// Epoch that the pending transition will land on.
    pub pending_epoch: Option<Epoch>,

    /// Initial state of a name still being created.
    pub initial_state: Option<String>,

    /// Merged demand reports.
    pub demand: StoredDemand,
}

impl ReconfigurationRecord {
    /// Record of a name being created: epoch 0 waiting for start acks from
    /// `actives`, with no previous group.
    pub fn new_creation(
        name: &str,
        actives: BTreeSet<NodeId>,
        initial_state: &str,
    ) -> Self {
        ReconfigurationRecord {
            name: name.into(),
            epoch: 0,
            state: RecordState::WaitAckStart,
            active_replicas: BTreeSet::new(),
            new_active_replicas: Some(actives),
            pending_epoch: Some(0),
            initial_state: Some(initial_state.into()),
            demand: StoredDemand::default(),
        }
    }

    /// True while a deletion is in progress.
    pub fn is_deleting(&self) -> bool {
        self.state == RecordState::WaitAckStop
            && self.new_active_replicas.as_ref().is_some_and(|s| s.is_empty())
    }

    /// True if the record is still being created at epoch 0.
    pub fn is_creating(&self) -> bool {
        self.state == RecordState::WaitAckStart && self.active_replicas.is_empty()
    }

    /// `Ready -> WaitAckStop`, only at exactly `epoch`.
    pub(super) fn initiate(
        &mut self,
        epoch: Epoch,
        new_actives: BTreeSet<NodeId>,
    ) -> bool {
        if self.state != RecordState::Ready || self.epoch != epoch {
            return false;
        }
        self.state = RecordState::WaitAckStop;
        self.new_active_replicas = Some(new_actives);
        self.pending_epoch = Some(epoch + 1);
        true
    }

    /// `WaitAckStop -> WaitAckStart` at `epoch`.
    pub(super) fn stop_acked(&mut self, epoch: Epoch) -> bool {
        if self.state != RecordState::WaitAckStop
            || self.epoch != epoch
            || self.is_deleting()
        {
            return false;
        }
        self.state = RecordState::WaitAckStart;
        true
    }

    /// `WaitAckStart -> Ready`, landing on the pending epoch.
    pub(super) fn start_acked(&mut self, epoch: Epoch) -> bool {
        if self.state != RecordState::WaitAckStart || self.epoch != epoch {
            return false;
        }
        let (Some(new_actives), Some(pending)) =
            (self.new_active_replicas.take(), self.pending_epoch.take())
        else {
            return false;
        };
        self.epoch = pending.max(self.epoch);
        self.active_replicas = new_actives;
        self.initial_state = None;
        self.state = RecordState::Ready;
        true
    }

    /// Any state `-> Deleted`.
    pub(super) fn mark_deleted(&mut self) -> bool {
        if self.state == RecordState::Deleted {
            return false;
        }
        self.state = RecordState::Deleted;
        self.new_active_replicas = None;
        self.pending_epoch = None;
        true
    }
}

#[cfg(test)]
mod record_tests {
    use super::*;

    fn group(ids: &[&str]) -> BTreeSet<NodeId> {
        ids.iter().map(|s| s.parse().unwrap()).collect()
    }

    #[test]
    fn creation_lands_on_zero() {
        let mut rec =
            ReconfigurationRecord::new_creation("alice", group(&["AR0"]), "");
        assert!(rec.is_creating());
        assert!(!rec.start_acked(1));
        assert!(rec.start_acked(0));
        assert_eq!(rec.epoch, 0);
        assert_eq!(rec.state, RecordState::Ready);
        assert_eq!(rec.active_replicas, group(&["AR0"]));
        assert!(rec.new_active_replicas.is_none());
        assert!(rec.initial_state.is_none());
    }

    #[test]
    fn full_cycle_increments() {
        let mut rec =
            ReconfigurationRecord::new_creation("alice", group(&["AR0"]), "");
        assert!(rec.start_acked(0));
        assert!(!rec.initiate(1, group(&["AR1"])));
        assert!(rec.initiate(0, group(&["AR1"])));
        assert!(!rec.initiate(0, group(&["AR2"])));
        assert!(!rec.start_acked(0));
        assert!(rec.stop_acked(0));
        assert!(rec.start_acked(0));
        assert_eq!(rec.epoch, 1);
        assert_eq!(rec.active_replicas, group(&["AR1"]));
        assert!(rec.pending_epoch.is_none());
    }

    #[test]
    fn deletion_intent() {
        let mut rec =
            ReconfigurationRecord::new_creation("alice", group(&["AR0"]), "");
        assert!(rec.start_acked(0));
        assert!(rec.initiate(0, BTreeSet::new()));
        assert!(rec.is_deleting());
        assert!(!rec.stop_acked(0));
        assert!(rec.mark_deleted());
        assert!(!rec.mark_deleted());
        assert_eq!(rec.state, RecordState::Deleted);
    }
}
