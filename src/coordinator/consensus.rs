//! Seam to the external single-group consensus engine.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::node::NodeId;
use crate::packets::Epoch;
use crate::utils::ReconError;

/// Single-group log replication engine the quorum coordinator delegates to.
/// Groups are named; proposals are opaque bytes; decisions come back in log
/// order through `drain_decisions`.
pub trait ConsensusEngine: Send {
    /// Creates (or re-creates at a newer epoch) the group named `group`.
    fn create_group(
        &mut self,
        group: &str,
        epoch: Epoch,
        members: &[NodeId],
    ) -> Result<bool, ReconError>;

    /// Tears down a group; returns whether it existed.
    fn delete_group(&mut self, group: &str) -> bool;

    /// Proposes a payload into the group's log. `Ok(false)` means the
    /// proposal was rejected and will never be decided.
    fn propose(&mut self, group: &str, payload: Vec<u8>) -> Result<bool, ReconError>;

    /// Takes all newly decided `(group, payload)` pairs in decision order.
    fn drain_decisions(&mut self) -> Vec<(String, Vec<u8>)>;
}

/// In-process engine that decides every accepted proposal immediately, in
/// proposal order. Used for single-process deployments and tests; can be
/// told to reject proposals.
#[derive(Debug, Default)]
pub struct LoopbackConsensus {
    /// Map from group name -> (epoch, members).
    groups: HashMap<String, (Epoch, Vec<NodeId>)>,

    /// Decided but not yet drained proposals.
    decided: VecDeque<(String, Vec<u8>)>,

    /// When set, every proposal is rejected.
    reject: Arc<AtomicBool>,
}

impl LoopbackConsensus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared switch that makes the engine reject proposals.
    pub fn reject_switch(&self) -> Arc<AtomicBool> {
        self.reject.clone()
    }

    pub fn has_group(&self, group: &str) -> bool {
        self.groups.contains_key(group)
    }
}

impl ConsensusEngine for LoopbackConsensus {
    fn create_group(
        &mut self,
        group: &str,
        epoch: Epoch,
        members: &[NodeId],
    ) -> Result<bool, ReconError> {
        if let Some((cur, _)) = self.groups.get(group) {
            if *cur > epoch {
                return Ok(false);
            }
        }
        self.groups.insert(group.into(), (epoch, members.to_vec()));
        Ok(true)
    }

    fn delete_group(&mut self, group: &str) -> bool {
        self.groups.remove(group).is_some()
    }

    fn propose(&mut self, group: &str, payload: Vec<u8>) -> Result<bool, ReconError> {
        if self.reject.load(Ordering::SeqCst) || !self.groups.contains_key(group) {
            return Ok(false);
        }
        self.decided.push_back((group.into(), payload));
        Ok(true)
    }

    fn drain_decisions(&mut self) -> Vec<(String, Vec<u8>)> {
        self.decided.drain(..).collect()
    }
}
