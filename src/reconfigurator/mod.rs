//! Reconfigurator. Owns the records of the names it is primary for, decides
//! when to reconfigure them, and drives the stop-then-start handoff between
//! old and new active replica groups through protocol tasks.

mod create;
mod delete;
mod demand;
mod membership;
mod placement;
mod recovery;
mod runtime;
mod tasks;

use std::fmt;
use std::sync::Arc;

use crate::demand::TriggerPolicy;
use crate::node::NodeId;
use crate::packets::{Envelope, PacketType, ReconMsg, Requester};
use crate::protask::ProtocolExecutor;
use crate::records::RecordStore;
use crate::ring::RingView;
use crate::utils::ReconError;

use serde::Deserialize;

use tokio::time::{Duration, Instant};

pub use placement::{DemandVotes, KeepCurrent, PlacementPolicy};
pub use runtime::ReconfiguratorNode;

/// Configuration parameters struct.
#[derive(Debug, Clone, Deserialize)]
pub struct ReconfiguratorConfig {
    /// Stop acks needed from the old group: "one", "majority", or "all".
    pub stop_ack_quorum: String,

    /// Start acks needed from the new group before the record is ready.
    pub start_ack_quorum: String,

    /// Drop acks needed before final states count as collected.
    pub drop_ack_quorum: String,

    /// Base restart period of protocol tasks in millisecs.
    pub task_restart_ms: u64,

    /// Cap on the restart period multiplier.
    pub task_max_backoff: u32,

    /// Protocol task tick interval in millisecs.
    pub task_tick_ms: u64,

    /// Requests since the last reconfiguration that trigger the next one.
    pub reconfigure_threshold: u64,

    /// Minimum time between two reconfigurations of a name in millisecs.
    pub min_reconfigure_interval_ms: u64,

    /// Placement policy: "KeepCurrent" or "DemandVotes".
    pub placement: String,

    /// Smallest group "DemandVotes" placement picks.
    pub min_replicas: usize,

    /// Largest group "DemandVotes" placement picks.
    pub max_replicas: usize,

    /// Path to the record store's backing file; empty for in-memory only.
    pub backer_path: String,

    /// Whether to call `fsync()` on every record write.
    pub logger_sync: bool,
}

#[allow(clippy::derivable_impls)]
impl Default for ReconfiguratorConfig {
    fn default() -> Self {
        ReconfiguratorConfig {
            stop_ack_quorum: "majority".into(),
            start_ack_quorum: "majority".into(),
            drop_ack_quorum: "majority".into(),
            task_restart_ms: 1000,
            task_max_backoff: 8,
            task_tick_ms: 100,
            reconfigure_threshold: 1000,
            min_reconfigure_interval_ms: 10000,
            placement: "KeepCurrent".into(),
            min_replicas: 3,
            max_replicas: 5,
            backer_path: "".into(),
            logger_sync: false,
        }
    }
}

/// How many acks out of a group an exchange waits for.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Quorum {
    One,
    Majority,
    All,
}

impl Quorum {
    /// Parse config string into `Quorum` enum.
    pub fn parse_name(name: &str) -> Option<Self> {
        match name {
            "one" => Some(Self::One),
            "majority" => Some(Self::Majority),
            "all" => Some(Self::All),
            _ => None,
        }
    }

    /// Acks needed out of a group of `size`.
    pub fn threshold(&self, size: usize) -> usize {
        match self {
            Self::One => size.min(1),
            Self::Majority => size / 2 + 1,
            Self::All => size,
        }
        .min(size)
    }
}

impl fmt::Display for Quorum {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Node state visible to protocol tasks.
pub struct RcContext {
    /// My node ID.
    pub(crate) me: NodeId,

    /// Current rings.
    pub(crate) rings: Arc<RingView>,

    /// Record store of the names I own.
    pub(crate) store: RecordStore,

    /// Picks the next epoch's active replicas.
    placement: Box<dyn PlacementPolicy>,

    /// When merged demand triggers a reconfiguration.
    trigger: TriggerPolicy,

    stop_quorum: Quorum,
    start_quorum: Quorum,
    drop_quorum: Quorum,
}

impl RcContext {
    /// Client reply routed through the requester's entry node, if the
    /// request came from a client.
    pub(crate) fn client_reply(
        name: &str,
        kind: PacketType,
        success: bool,
        detail: impl ToString,
        requester: Option<Requester>,
    ) -> Option<Envelope> {
        Envelope::to_requester(ReconMsg::ClientReply {
            name: name.into(),
            kind,
            success,
            detail: detail.to_string(),
            requester,
        })
    }
}

/// Reconfigurator core: message handlers over `RcContext` plus the protocol
/// task executor. Produces envelopes; delivering them is up to the caller.
pub struct Reconfigurator {
    ctx: RcContext,
    executor: ProtocolExecutor<RcContext>,

    /// Set after a membership change until every record sits with its
    /// primary on live active replicas.
    reconcile_pending: bool,
}

impl Reconfigurator {
    pub fn new(
        me: NodeId,
        config: &ReconfiguratorConfig,
        rings: Arc<RingView>,
        store: RecordStore,
    ) -> Result<Self, ReconError> {
        let parse_quorum = |field: &str, value: &str| match Quorum::parse_name(value) {
            Some(quorum) => Ok(quorum),
            None => logged_err!("invalid config.{} '{}'", field, value),
        };
        let stop_quorum = parse_quorum("stop_ack_quorum", &config.stop_ack_quorum)?;
        let start_quorum = parse_quorum("start_ack_quorum", &config.start_ack_quorum)?;
        let drop_quorum = parse_quorum("drop_ack_quorum", &config.drop_ack_quorum)?;
        if config.task_restart_ms == 0 {
            return logged_err!(
                "invalid config.task_restart_ms '{}'",
                config.task_restart_ms
            );
        }
        let placement = placement::new_policy(config)?;

        Ok(Reconfigurator {
            ctx: RcContext {
                me,
                rings,
                store,
                placement,
                trigger: TriggerPolicy {
                    reconfigure_threshold: config.reconfigure_threshold,
                    min_interval_ms: config.min_reconfigure_interval_ms,
                },
                stop_quorum,
                start_quorum,
                drop_quorum,
            },
            executor: ProtocolExecutor::new(
                Duration::from_millis(config.task_restart_ms),
                config.task_max_backoff,
            ),
            reconcile_pending: false,
        })
    }

    pub fn id(&self) -> &NodeId {
        &self.ctx.me
    }

    /// The record store.
    pub fn store(&self) -> &RecordStore {
        &self.ctx.store
    }

    /// IDs of outstanding protocol tasks.
    pub fn outstanding_tasks(&self) -> Vec<String> {
        self.executor.outstanding()
    }

    /// Membership version my rings were derived from.
    pub fn rings_version(&self) -> u64 {
        self.ctx.rings.version()
    }

    /// Handles one inbound message; returns the messages to send.
    pub fn handle_msg(&mut self, msg: ReconMsg) -> Result<Vec<Envelope>, ReconError> {
        pf_trace!("recv {:?}", msg);
        match msg {
            ReconMsg::CreateServiceName {
                name,
                initial_state,
                requester,
            } => self.handle_create(name, initial_state, requester),
            ReconMsg::DeleteServiceName { name, requester } => {
                self.handle_delete(name, requester)
            }
            ReconMsg::RequestActiveReplicas { name, requester } => {
                self.handle_lookup(name, requester)
            }
            ReconMsg::DemandReport { name, epoch, stats } => {
                self.handle_demand_report(name, epoch, stats)
            }
            ReconMsg::ReconfigureNodeConfig { change, requester } => {
                self.handle_node_config_change(change, requester)
            }
            ReconMsg::NodeConfig { directory } => self.install_directory(&directory),
            ReconMsg::HandoffRecord { record, initiator } => {
                self.handle_handoff_record(record, initiator)
            }
            ReconMsg::AckStopEpoch { .. }
            | ReconMsg::AckStartEpoch { .. }
            | ReconMsg::AckDropEpochFinalState { .. }
            | ReconMsg::AckHandoffRecord { .. } => {
                Ok(self.executor.handle_event(&msg, &mut self.ctx))
            }
            other => {
                pf_warn!("unexpected {} for '{}'", other.packet_type(), other.name());
                Ok(Vec::new())
            }
        }
    }

    /// Restarts stalled tasks and drops obviated ones, and keeps moving
    /// records after a membership change.
    pub fn on_tick(&mut self, now: Instant) -> Vec<Envelope> {
        let mut sends = self.executor.on_tick(now, &mut self.ctx);
        if self.reconcile_pending {
            match self.reconcile_membership() {
                Ok(more) => sends.extend(more),
                Err(e) => pf_error!("error reconciling membership: {}", e),
            }
        }
        sends
    }

    /// Forwards a client request to the name's primary reconfigurator if
    /// that is not me. Returns `None` if I am the primary.
    fn forward_to_primary(
        &self,
        msg: impl FnOnce() -> ReconMsg,
        name: &str,
    ) -> Option<Result<Vec<Envelope>, ReconError>> {
        let rings = self.ctx.rings.current();
        match rings.reconfigurators.primary(name) {
            Some(primary) if primary == self.ctx.me => None,
            Some(primary) => {
                pf_debug!("forwarding request of '{}' to {}", name, primary);
                Some(Ok(vec![Envelope::new(primary, msg())]))
            }
            None => Some(logged_err!("no reconfigurator owns '{}'", name)),
        }
    }
}
