//! Wire messages exchanged between clients, active replicas, and
//! reconfigurators. Every protocol message carries a service name and an
//! epoch; `PacketType` is the explicit discriminator used for dispatch and
//! for indexing outstanding protocol tasks.

use std::fmt;

use crate::demand::DemandStats;
use crate::node::{ClientId, NodeConfigChange, NodeDirectory, NodeId};
use crate::records::ReconfigurationRecord;

use serde::{Deserialize, Serialize};

/// Epoch number type.
pub type Epoch = u64;

/// Application request ID type.
pub type RequestId = u64;

/// Name under which node-config messages and their replies travel.
pub const NODE_CONFIG_NAME: &str = "_NODE_CONFIG_";

/// Where a client-originated request entered the system, so that the final
/// reply can be routed back through that node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requester {
    /// Node the client is connected to.
    pub entry: NodeId,

    /// The client's ID at that node.
    pub client: ClientId,
}

/// Operation of an application request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AppOp {
    /// Read a key of the name's record.
    Get { key: String },

    /// Write a key of the name's record.
    Put { key: String, value: String },

    /// Stop the name's replica group at the request's epoch.
    Stop,
}

impl AppOp {
    /// True if the operation mutates state.
    pub fn is_update(&self) -> bool {
        !matches!(self, AppOp::Get { .. })
    }
}

/// Application request routed through a replica coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppRequest {
    /// Request ID, unique per requester.
    pub id: RequestId,

    /// Service name.
    pub name: String,

    /// Target epoch; `None` means whatever epoch is current.
    pub epoch: Option<Epoch>,

    /// Operation to apply.
    pub op: AppOp,

    /// If false, applied to the local copy only.
    pub needs_coordination: bool,

    /// Origin of the request, if it came from a client.
    pub requester: Option<Requester>,
}

impl AppRequest {
    pub fn is_stop(&self) -> bool {
        self.op == AppOp::Stop
    }
}

/// Reply to an application request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppReply {
    /// ID of the corresponding request.
    pub id: RequestId,

    /// Service name.
    pub name: String,

    /// False if the request was not handled.
    pub success: bool,

    /// Result value of a read, if any.
    pub value: Option<String>,

    /// Copied from the request.
    pub requester: Option<Requester>,
}

/// Packet type discriminator.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize,
    Deserialize,
)]
pub enum PacketType {
    CreateServiceName,
    DeleteServiceName,
    RequestActiveReplicas,
    ActiveReplicas,
    ClientReply,
    DemandReport,
    StartEpoch,
    AckStartEpoch,
    StopEpoch,
    AckStopEpoch,
    RequestEpochFinalState,
    EpochFinalState,
    DropEpochFinalState,
    AckDropEpochFinalState,
    AppRequest,
    AppReply,
    Replicate,
    ReconfigureNodeConfig,
    NodeConfig,
    HandoffRecord,
    AckHandoffRecord,
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Every message of the reconfiguration protocol and its client surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ReconMsg {
    /// Client -> reconfigurator: create a name with an initial state.
    CreateServiceName {
        name: String,
        initial_state: String,
        requester: Option<Requester>,
    },

    /// Client -> reconfigurator: delete a name.
    DeleteServiceName {
        name: String,
        requester: Option<Requester>,
    },

    /// Client -> reconfigurator: look up a name's current active replicas.
    RequestActiveReplicas {
        name: String,
        requester: Option<Requester>,
    },

    /// Reconfigurator -> client: answer to `RequestActiveReplicas`.
    ActiveReplicas {
        name: String,
        epoch: Epoch,
        actives: Vec<NodeId>,
        requester: Option<Requester>,
    },

    /// Reconfigurator -> client: outcome of a create or delete.
    ClientReply {
        name: String,
        kind: PacketType,
        success: bool,
        detail: String,
        requester: Option<Requester>,
    },

    /// Active replica -> reconfigurator.
    DemandReport {
        name: String,
        epoch: Epoch,
        stats: DemandStats,
    },

    /// Reconfigurator -> active replica: start `epoch` with `new_group`,
    /// seeded either by `initial_state` (empty `prev_group`) or by the final
    /// state of `prev_epoch` fetched from `prev_group`. `first_candidate`
    /// is the member that acked the stop first, asked before the others.
    StartEpoch {
        name: String,
        epoch: Epoch,
        new_group: Vec<NodeId>,
        prev_group: Vec<NodeId>,
        prev_epoch: Epoch,
        initial_state: Option<String>,
        first_candidate: Option<NodeId>,
        initiator: NodeId,
    },

    /// Active replica -> reconfigurator.
    AckStartEpoch {
        name: String,
        epoch: Epoch,
        responder: NodeId,
    },

    /// Reconfigurator -> active replica.
    StopEpoch {
        name: String,
        epoch: Epoch,
        initiator: NodeId,
    },

    /// Active replica -> reconfigurator.
    AckStopEpoch {
        name: String,
        epoch: Epoch,
        responder: NodeId,
    },

    /// Active replica -> active replica.
    RequestEpochFinalState {
        name: String,
        epoch: Epoch,
        initiator: NodeId,
    },

    /// Active replica -> active replica; `state` is `None` to decline.
    EpochFinalState {
        name: String,
        epoch: Epoch,
        state: Option<String>,
        responder: NodeId,
    },

    /// Reconfigurator -> active replica.
    DropEpochFinalState {
        name: String,
        epoch: Epoch,
        initiator: NodeId,
    },

    /// Active replica -> reconfigurator.
    AckDropEpochFinalState {
        name: String,
        epoch: Epoch,
        responder: NodeId,
    },

    /// Client -> active replica.
    AppRequest(AppRequest),

    /// Active replica -> client.
    AppReply(AppReply),

    /// Active replica -> active replica: lazily broadcast request.
    Replicate(AppRequest),

    /// Client -> reconfigurator: add or remove nodes of either pool.
    ReconfigureNodeConfig {
        change: NodeConfigChange,
        requester: Option<Requester>,
    },

    /// Reconfigurator -> every node: the membership after a change.
    NodeConfig { directory: NodeDirectory },

    /// Reconfigurator -> reconfigurator: a record whose primary moved to
    /// the receiver.
    HandoffRecord {
        record: ReconfigurationRecord,
        initiator: NodeId,
    },

    /// Reconfigurator -> reconfigurator: the record is now held by the
    /// responder.
    AckHandoffRecord {
        name: String,
        epoch: Epoch,
        responder: NodeId,
    },
}

/// Correlation key of a (name, epoch) exchange.
pub fn task_key(name: &str, epoch: Epoch) -> String {
    format!("{}:{}", name, epoch)
}

impl ReconMsg {
    /// Packet type discriminator of this message.
    pub fn packet_type(&self) -> PacketType {
        match self {
            Self::CreateServiceName { .. } => PacketType::CreateServiceName,
            Self::DeleteServiceName { .. } => PacketType::DeleteServiceName,
            Self::RequestActiveReplicas { .. } => {
                PacketType::RequestActiveReplicas
            }
            Self::ActiveReplicas { .. } => PacketType::ActiveReplicas,
            Self::ClientReply { .. } => PacketType::ClientReply,
            Self::DemandReport { .. } => PacketType::DemandReport,
            Self::StartEpoch { .. } => PacketType::StartEpoch,
            Self::AckStartEpoch { .. } => PacketType::AckStartEpoch,
            Self::StopEpoch { .. } => PacketType::StopEpoch,
            Self::AckStopEpoch { .. } => PacketType::AckStopEpoch,
            Self::RequestEpochFinalState { .. } => {
                PacketType::RequestEpochFinalState
            }
            Self::EpochFinalState { .. } => PacketType::EpochFinalState,
            Self::DropEpochFinalState { .. } => PacketType::DropEpochFinalState,
            Self::AckDropEpochFinalState { .. } => {
                PacketType::AckDropEpochFinalState
            }
            Self::AppRequest(_) => PacketType::AppRequest,
            Self::AppReply(_) => PacketType::AppReply,
            Self::Replicate(_) => PacketType::Replicate,
            Self::ReconfigureNodeConfig { .. } => {
                PacketType::ReconfigureNodeConfig
            }
            Self::NodeConfig { .. } => PacketType::NodeConfig,
            Self::HandoffRecord { .. } => PacketType::HandoffRecord,
            Self::AckHandoffRecord { .. } => PacketType::AckHandoffRecord,
        }
    }

    /// Service name this message is about.
    pub fn name(&self) -> &str {
        match self {
            Self::CreateServiceName { name, .. }
            | Self::DeleteServiceName { name, .. }
            | Self::RequestActiveReplicas { name, .. }
            | Self::ActiveReplicas { name, .. }
            | Self::ClientReply { name, .. }
            | Self::DemandReport { name, .. }
            | Self::StartEpoch { name, .. }
            | Self::AckStartEpoch { name, .. }
            | Self::StopEpoch { name, .. }
            | Self::AckStopEpoch { name, .. }
            | Self::RequestEpochFinalState { name, .. }
            | Self::EpochFinalState { name, .. }
            | Self::DropEpochFinalState { name, .. }
            | Self::AckDropEpochFinalState { name, .. }
            | Self::AckHandoffRecord { name, .. } => name,
            Self::AppRequest(req) | Self::Replicate(req) => &req.name,
            Self::AppReply(reply) => &reply.name,
            Self::HandoffRecord { record, .. } => &record.name,
            Self::ReconfigureNodeConfig { .. } | Self::NodeConfig { .. } => {
                NODE_CONFIG_NAME
            }
        }
    }

    /// Epoch this message is about, if it names one.
    pub fn epoch(&self) -> Option<Epoch> {
        match self {
            Self::ActiveReplicas { epoch, .. }
            | Self::DemandReport { epoch, .. }
            | Self::StartEpoch { epoch, .. }
            | Self::AckStartEpoch { epoch, .. }
            | Self::StopEpoch { epoch, .. }
            | Self::AckStopEpoch { epoch, .. }
            | Self::RequestEpochFinalState { epoch, .. }
            | Self::EpochFinalState { epoch, .. }
            | Self::DropEpochFinalState { epoch, .. }
            | Self::AckDropEpochFinalState { epoch, .. }
            | Self::AckHandoffRecord { epoch, .. } => Some(*epoch),
            Self::HandoffRecord { record, .. } => Some(record.epoch),
            Self::AppRequest(req) | Self::Replicate(req) => req.epoch,
            _ => None,
        }
    }

    /// Correlation key `name:epoch`, if the message names an epoch.
    pub fn task_key(&self) -> Option<String> {
        self.epoch().map(|epoch| task_key(self.name(), epoch))
    }

    /// Origin of the client request this message serves, if any.
    pub fn requester(&self) -> Option<&Requester> {
        match self {
            Self::CreateServiceName { requester, .. }
            | Self::DeleteServiceName { requester, .. }
            | Self::RequestActiveReplicas { requester, .. }
            | Self::ActiveReplicas { requester, .. }
            | Self::ClientReply { requester, .. }
            | Self::ReconfigureNodeConfig { requester, .. } => {
                requester.as_ref()
            }
            Self::AppRequest(req) => req.requester.as_ref(),
            Self::AppReply(reply) => reply.requester.as_ref(),
            _ => None,
        }
    }

    /// Stamps the requester on a client-originated message that does not
    /// carry one yet.
    pub fn with_requester(mut self, origin: Requester) -> Self {
        match &mut self {
            Self::CreateServiceName { requester, .. }
            | Self::DeleteServiceName { requester, .. }
            | Self::RequestActiveReplicas { requester, .. }
            | Self::ReconfigureNodeConfig { requester, .. } => {
                requester.get_or_insert(origin);
            }
            Self::AppRequest(req) => {
                req.requester.get_or_insert(origin);
            }
            _ => {}
        }
        self
    }

    /// True for messages that terminate at a client.
    pub fn is_client_reply(&self) -> bool {
        matches!(
            self,
            Self::ActiveReplicas { .. }
                | Self::ClientReply { .. }
                | Self::AppReply(_)
        )
    }
}

/// A message addressed to a node. Cores produce envelopes; the runtime or a
/// test harness delivers them.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub to: NodeId,
    pub msg: ReconMsg,
}

impl Envelope {
    pub fn new(to: NodeId, msg: ReconMsg) -> Self {
        Envelope { to, msg }
    }

    /// Routes a client-bound reply to the node the client entered through.
    /// Returns `None` if the request did not come from a client.
    pub fn to_requester(msg: ReconMsg) -> Option<Self> {
        let to = msg.requester()?.entry.clone();
        Some(Envelope { to, msg })
    }
}
