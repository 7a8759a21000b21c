//! Quorum-consensus coordinator: every coordinated request is proposed into
//! the consensus log of its name (or of one shared group) and applied only
//! once decided.

use std::collections::HashMap;

use crate::app::Application;
use crate::coordinator::{
    Completion, ConsensusEngine, CoordinatorKind, GroupCore, ReplicaCoordinator,
};
use crate::node::NodeId;
use crate::packets::{AppRequest, Epoch};
use crate::utils::ReconError;

use serde::{Deserialize, Serialize};

use rmp_serde::decode::from_slice as decode_from_slice;
use rmp_serde::encode::to_vec as encode_to_vec;

/// Payload proposed into the consensus log.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Proposal {
    /// Proposer node and its local sequence number, which together identify
    /// the pending completion to fulfill on decision.
    proposer: NodeId,
    seq: u64,

    /// The request itself.
    req: AppRequest,
}

/// Coordinator delegating ordering and durability to a consensus engine.
pub struct QuorumCoordinator {
    core: GroupCore,

    /// The external consensus engine.
    engine: Box<dyn ConsensusEngine>,

    /// If set, all names share this one consensus group (used for
    /// reconfigurator-internal bookkeeping).
    shared_group: Option<String>,

    /// Next proposal sequence number.
    next_seq: u64,

    /// Map from proposal seq -> completion awaiting its decision.
    pending: HashMap<u64, Completion>,
}

impl QuorumCoordinator {
    pub fn new(
        me: NodeId,
        app: Box<dyn Application>,
        engine: Box<dyn ConsensusEngine>,
        shared_group: Option<String>,
    ) -> Self {
        QuorumCoordinator {
            core: GroupCore::new(me, app),
            engine,
            shared_group,
            next_seq: 0,
            pending: HashMap::new(),
        }
    }

    /// Consensus group a name's requests are proposed into.
    fn group_of<'a>(&'a self, name: &'a str) -> &'a str {
        self.shared_group.as_deref().unwrap_or(name)
    }

    /// Number of proposals still waiting for a decision.
    pub fn num_pending(&self) -> usize {
        self.pending.len()
    }
}

impl ReplicaCoordinator for QuorumCoordinator {
    fn kind(&self) -> CoordinatorKind {
        CoordinatorKind::Quorum
    }

    fn core(&self) -> &GroupCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut GroupCore {
        &mut self.core
    }

    fn coordinate_request(
        &mut self,
        req: AppRequest,
        completion: Completion,
    ) -> Result<bool, ReconError> {
        let seq = self.next_seq;
        let name = req.name.clone();
        let payload = encode_to_vec(&Proposal {
            proposer: self.core.me().clone(),
            seq,
            req,
        })?;

        let group = self.group_of(&name).to_string();
        if !self.engine.propose(&group, payload)? {
            pf_warn!("proposal for '{}' rejected by group '{}'", name, group);
            return Ok(false);
        }
        self.next_seq += 1;
        self.pending.insert(seq, completion);
        Ok(true)
    }

    fn create_replica_group(
        &mut self,
        name: &str,
        epoch: Epoch,
        initial_state: &str,
        nodes: &[NodeId],
    ) -> Result<bool, ReconError> {
        let group = self.group_of(name).to_string();
        if !self.engine.create_group(&group, epoch, nodes)? {
            return Ok(false);
        }
        self.core.create_group(name, epoch, initial_state, nodes)
    }

    fn delete_replica_group(&mut self, name: &str) -> bool {
        if self.shared_group.is_none() {
            self.engine.delete_group(name);
        }
        self.core.delete_group(name)
    }

    fn poll(&mut self) -> Result<(), ReconError> {
        for (group, payload) in self.engine.drain_decisions() {
            let proposal: Proposal = decode_from_slice(&payload)?;
            let reply = self.core.execute(&proposal.req);
            pf_trace!("decided in '{}': {:?}", group, proposal.req);
            if proposal.proposer == *self.core.me() {
                if let Some(mut completion) = self.pending.remove(&proposal.seq) {
                    completion.fulfill(reply)?;
                }
            }
        }
        Ok(())
    }
}
