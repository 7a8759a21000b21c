//! Pluggable replica coordinators. Each variant decides how an application
//! request becomes durable across a name's replica group, behind the uniform
//! `ReplicaCoordinator` contract used by the active replica.

use std::collections::HashMap;
use std::fmt;

use crate::app::Application;
use crate::node::NodeId;
use crate::packets::{AppReply, AppRequest, Envelope, Epoch, RequestId};
use crate::utils::ReconError;

mod completion;
mod consensus;
mod lazy;
mod quorum;
mod unreplicated;

pub use completion::Completion;
pub use consensus::{ConsensusEngine, LoopbackConsensus};
pub use lazy::LazyBroadcastCoordinator;
pub use quorum::QuorumCoordinator;
pub use unreplicated::UnreplicatedCoordinator;

/// Enum of supported coordinator variants.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum CoordinatorKind {
    Quorum,
    LazyBroadcast,
    Unreplicated,
}

impl CoordinatorKind {
    /// Parse config string into `CoordinatorKind` enum.
    pub fn parse_name(name: &str) -> Option<Self> {
        match name {
            "Quorum" => Some(Self::Quorum),
            "LazyBroadcast" => Some(Self::LazyBroadcast),
            "Unreplicated" => Some(Self::Unreplicated),
            _ => None,
        }
    }

    /// True if the variant's agreement happens inside one process, so a
    /// request is only as durable as the node that committed it.
    pub fn is_node_local(&self) -> bool {
        matches!(self, Self::Quorum)
    }

    /// Creates a coordinator of this variant on heap. The quorum variant is
    /// backed by an in-process `LoopbackConsensus` engine.
    pub fn new_coordinator(
        &self,
        me: NodeId,
        app: Box<dyn Application>,
    ) -> Box<dyn ReplicaCoordinator> {
        match self {
            Self::Quorum => Box::new(QuorumCoordinator::new(
                me,
                app,
                Box::new(LoopbackConsensus::new()),
                None,
            )),
            Self::LazyBroadcast => {
                Box::new(LazyBroadcastCoordinator::new(me, app))
            }
            Self::Unreplicated => Box::new(UnreplicatedCoordinator::new(me, app)),
        }
    }
}

impl fmt::Display for CoordinatorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Local view of one hosted replica group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupInfo {
    /// Epoch the group serves.
    pub epoch: Epoch,

    /// Members, in ring order.
    pub members: Vec<NodeId>,

    /// Set once the stop request of `epoch` has been applied.
    pub stopped: bool,
}

/// State shared by every coordinator variant: the application, the hosted
/// groups, the final states of stopped epochs, and queued outbound messages.
pub struct GroupCore {
    /// My node ID.
    me: NodeId,

    /// The application.
    app: Box<dyn Application>,

    /// Map from name -> hosted group.
    groups: HashMap<String, GroupInfo>,

    /// Map from (name, epoch) -> final state checkpointed at stop.
    final_states: HashMap<(String, Epoch), String>,

    /// Messages for other nodes, taken by the active replica.
    outbound: Vec<Envelope>,
}

impl GroupCore {
    pub fn new(me: NodeId, app: Box<dyn Application>) -> Self {
        GroupCore {
            me,
            app,
            groups: HashMap::new(),
            final_states: HashMap::new(),
            outbound: Vec::new(),
        }
    }

    pub fn me(&self) -> &NodeId {
        &self.me
    }

    pub fn group(&self, name: &str) -> Option<&GroupInfo> {
        self.groups.get(name)
    }

    /// The application's stop request for `name` at `epoch`.
    pub fn stop_request(&self, name: &str, epoch: Epoch, id: RequestId) -> AppRequest {
        self.app.stop_request(name, epoch, id)
    }

    pub(crate) fn push_outbound(&mut self, env: Envelope) {
        self.outbound.push(env);
    }

    /// True if a live group serves the request's name at its epoch.
    pub fn admits(&self, req: &AppRequest) -> bool {
        match self.groups.get(&req.name) {
            Some(group) => {
                !group.stopped && req.epoch.map_or(true, |e| e == group.epoch)
            }
            None => false,
        }
    }

    /// Applies a request to the local application. A stop request at the
    /// group's epoch checkpoints the final state and marks the group
    /// stopped; repeating it is a no-op success.
    pub fn execute(&mut self, req: &AppRequest) -> AppReply {
        let Some(group) = self.groups.get_mut(&req.name) else {
            return failed_reply(req);
        };

        if !req.is_stop() {
            if group.stopped || req.epoch.is_some_and(|e| e != group.epoch) {
                return failed_reply(req);
            }
            return self.app.handle_request(req);
        }

        let epoch = req.epoch.unwrap_or(group.epoch);
        if epoch != group.epoch {
            return failed_reply(req);
        }
        if !group.stopped {
            let final_state = self.app.get_state(&req.name).unwrap_or_default();
            self.final_states
                .insert((req.name.clone(), epoch), final_state);
            group.stopped = true;
            self.app.delete_state(&req.name);
            pf_info!("stopped '{}' at epoch {}", req.name, epoch);
        }
        self.app.handle_request(req)
    }

    /// Creates or replaces the local group of `name` at `epoch`, seeded with
    /// `state`. Refuses to go back to an older epoch.
    pub fn create_group(
        &mut self,
        name: &str,
        epoch: Epoch,
        state: &str,
        members: &[NodeId],
    ) -> Result<bool, ReconError> {
        if let Some(group) = self.groups.get(name) {
            if group.epoch > epoch || (group.epoch == epoch && !group.stopped) {
                return Ok(group.epoch == epoch);
            }
        }
        self.app.update_state(name, state)?;
        self.groups.insert(
            name.into(),
            GroupInfo {
                epoch,
                members: members.to_vec(),
                stopped: false,
            },
        );
        pf_info!("started '{}' at epoch {} with {:?}", name, epoch, members);
        Ok(true)
    }

    /// Forgets the local group of `name`; returns whether one existed.
    pub fn delete_group(&mut self, name: &str) -> bool {
        let existed = self.groups.remove(name).is_some();
        if existed {
            self.app.delete_state(name);
        }
        existed
    }

    pub fn final_state(&self, name: &str, epoch: Epoch) -> Option<String> {
        self.final_states.get(&(name.to_string(), epoch)).cloned()
    }

    pub fn delete_final_state(&mut self, name: &str, epoch: Epoch) -> bool {
        self.final_states.remove(&(name.to_string(), epoch)).is_some()
    }
}

/// Reply for a request that could not be applied.
pub(crate) fn failed_reply(req: &AppRequest) -> AppReply {
    AppReply {
        id: req.id,
        name: req.name.clone(),
        success: false,
        value: None,
        requester: req.requester.clone(),
    }
}

/// Uniform contract over an application, implemented by every variant.
pub trait ReplicaCoordinator: Send {
    /// Which variant this is.
    fn kind(&self) -> CoordinatorKind;

    fn core(&self) -> &GroupCore;

    fn core_mut(&mut self) -> &mut GroupCore;

    /// Replicates a request with this variant's guarantees. Returns whether
    /// it was accepted; `completion` is fulfilled once the request has been
    /// applied locally, or dropped if it never will be.
    fn coordinate_request(
        &mut self,
        req: AppRequest,
        completion: Completion,
    ) -> Result<bool, ReconError>;

    /// Entry point for requests. Requests not needing coordination are
    /// applied to the local copy directly. Returns `Ok(false)` ("not
    /// handled") if no live group serves the request.
    fn handle_incoming(
        &mut self,
        req: AppRequest,
        mut completion: Completion,
    ) -> Result<bool, ReconError> {
        if !self.core().admits(&req) {
            return Ok(false);
        }
        if req.needs_coordination {
            self.coordinate_request(req, completion)
        } else {
            let reply = self.core_mut().execute(&req);
            completion.fulfill(reply)?;
            Ok(true)
        }
    }

    /// Creates the local replica group of `name` at `epoch`.
    fn create_replica_group(
        &mut self,
        name: &str,
        epoch: Epoch,
        initial_state: &str,
        nodes: &[NodeId],
    ) -> Result<bool, ReconError> {
        self.core_mut().create_group(name, epoch, initial_state, nodes)
    }

    /// Deletes the local replica group of `name`.
    fn delete_replica_group(&mut self, name: &str) -> bool {
        self.core_mut().delete_group(name)
    }

    /// Members of the local replica group of `name`.
    fn replica_group(&self, name: &str) -> Option<Vec<NodeId>> {
        self.core().group(name).map(|g| g.members.clone())
    }

    /// Epoch of the local replica group of `name`, stopped or not.
    fn epoch(&self, name: &str) -> Option<Epoch> {
        self.core().group(name).map(|g| g.epoch)
    }

    /// True if the local group of `name` has applied its stop request.
    fn is_stopped(&self, name: &str) -> bool {
        self.core().group(name).is_some_and(|g| g.stopped)
    }

    fn final_state(&self, name: &str, epoch: Epoch) -> Option<String> {
        self.core().final_state(name, epoch)
    }

    fn delete_final_state(&mut self, name: &str, epoch: Epoch) -> bool {
        self.core_mut().delete_final_state(name, epoch)
    }

    /// Applies a request another member already coordinated.
    fn apply_replicated(&mut self, req: AppRequest) -> bool {
        if !self.core().admits(&req) {
            return false;
        }
        self.core_mut().execute(&req).success
    }

    /// Makes progress on asynchronous coordination, e.g. applying decided
    /// proposals.
    fn poll(&mut self) -> Result<(), ReconError> {
        Ok(())
    }

    /// Takes messages queued for other nodes.
    fn take_outbound(&mut self) -> Vec<Envelope> {
        std::mem::take(&mut self.core_mut().outbound)
    }
}
