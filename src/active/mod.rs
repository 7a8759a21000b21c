//! Active-replica epoch manager. Tracks the epoch of every hosted name,
//! answers the reconfigurators' start/stop/drop handshakes, serves
//! application requests through the replica coordinator, and reports demand.

mod epoch;
mod finalstate;
mod request;
mod runtime;

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use crate::coordinator::ReplicaCoordinator;
use crate::demand::DemandProfiler;
use crate::node::NodeId;
use crate::packets::{AppReply, Envelope, Epoch, ReconMsg, RequestId};
use crate::protask::ProtocolExecutor;
use crate::ring::RingView;
use crate::utils::ReconError;

use rand::rngs::StdRng;
use rand::SeedableRng;

use serde::Deserialize;

use tokio::sync::oneshot;
use tokio::time::{Duration, Instant};

pub use runtime::ActiveReplicaNode;

/// Configuration parameters struct.
#[derive(Debug, Clone, Deserialize)]
pub struct ActiveReplicaConfig {
    /// Replica coordinator variant: "Quorum", "LazyBroadcast", or
    /// "Unreplicated".
    pub coordinator: String,

    /// Report a name's demand after this many requests.
    pub report_threshold: u64,

    /// Never send demand reports.
    pub no_reporting: bool,

    /// Base restart period of protocol tasks in millisecs.
    pub task_restart_ms: u64,

    /// Cap on the restart period multiplier.
    pub task_max_backoff: u32,

    /// Protocol task tick interval in millisecs.
    pub task_tick_ms: u64,
}

#[allow(clippy::derivable_impls)]
impl Default for ActiveReplicaConfig {
    fn default() -> Self {
        ActiveReplicaConfig {
            coordinator: "Quorum".into(),
            report_threshold: 100,
            no_reporting: false,
            task_restart_ms: 1000,
            task_max_backoff: 8,
            task_tick_ms: 100,
        }
    }
}

/// A stop request in flight: who to ack once it completes.
struct PendingStop {
    notifiees: BTreeSet<NodeId>,
    rx: oneshot::Receiver<AppReply>,
}

/// A coordinated client request awaiting its completion.
struct PendingReply {
    failed: AppReply,
    rx: oneshot::Receiver<AppReply>,
}

/// Node state visible to protocol tasks.
pub struct ArContext {
    /// My node ID.
    pub(crate) me: NodeId,

    /// Configuration parameters struct.
    pub(crate) config: ActiveReplicaConfig,

    /// Current rings.
    pub(crate) rings: Arc<RingView>,

    /// The replica coordinator wrapping the application.
    pub(crate) coordinator: Box<dyn ReplicaCoordinator>,

    /// Demand profiler.
    profiler: DemandProfiler,

    /// Map from (name, epoch) -> reconfigurators waiting for my start ack.
    start_notifiees: HashMap<(String, Epoch), BTreeSet<NodeId>>,

    /// Map from (name, epoch) -> stop request in flight.
    pending_stops: HashMap<(String, Epoch), PendingStop>,

    /// Coordinated client requests awaiting completion.
    pending_replies: Vec<PendingReply>,

    /// Next ID for internally issued requests.
    next_req_id: RequestId,

    /// Picks which reconfigurator receives a demand report.
    rng: StdRng,
}

impl ArContext {
    /// My epoch of `name`, if I host it.
    pub(crate) fn epoch_of(&self, name: &str) -> Option<Epoch> {
        self.coordinator.epoch(name)
    }

    /// Acks a started epoch to every waiting reconfigurator.
    pub(crate) fn ack_start(&mut self, name: &str, epoch: Epoch) -> Vec<Envelope> {
        let notifiees = self
            .start_notifiees
            .remove(&(name.to_string(), epoch))
            .unwrap_or_default();
        notifiees
            .into_iter()
            .map(|rc| {
                Envelope::new(
                    rc,
                    ReconMsg::AckStartEpoch {
                        name: name.into(),
                        epoch,
                        responder: self.me.clone(),
                    },
                )
            })
            .collect()
    }

    /// Forgets everything kept for a name whose group I no longer host
    /// and whose starts up to `epoch` will never be acked.
    fn forget_name(&mut self, name: &str, epoch: Epoch) {
        self.start_notifiees
            .retain(|(n, e), _| n != name || *e > epoch);
        self.profiler.forget(name);
    }

    fn new_req_id(&mut self) -> RequestId {
        self.next_req_id += 1;
        self.next_req_id
    }
}

/// Active-replica core: message handlers over `ArContext` plus the protocol
/// task executor. Produces envelopes; delivering them is up to the caller.
pub struct ActiveReplica {
    ctx: ArContext,
    executor: ProtocolExecutor<ArContext>,
}

impl ActiveReplica {
    pub fn new(
        me: NodeId,
        config: ActiveReplicaConfig,
        rings: Arc<RingView>,
        coordinator: Box<dyn ReplicaCoordinator>,
    ) -> Result<Self, ReconError> {
        if config.task_restart_ms == 0 {
            return logged_err!(
                "invalid config.task_restart_ms '{}'",
                config.task_restart_ms
            );
        }
        let executor = ProtocolExecutor::new(
            Duration::from_millis(config.task_restart_ms),
            config.task_max_backoff,
        );
        let profiler = DemandProfiler::new(config.report_threshold);
        Ok(ActiveReplica {
            ctx: ArContext {
                me,
                config,
                rings,
                coordinator,
                profiler,
                start_notifiees: HashMap::new(),
                pending_stops: HashMap::new(),
                pending_replies: Vec::new(),
                next_req_id: 0,
                rng: StdRng::from_entropy(),
            },
            executor,
        })
    }

    /// Fixes the seed of the demand report target picker.
    pub fn seed_rng(&mut self, seed: u64) {
        self.ctx.rng = StdRng::seed_from_u64(seed);
    }

    pub fn id(&self) -> &NodeId {
        &self.ctx.me
    }

    /// The replica coordinator.
    pub fn coordinator(&self) -> &dyn ReplicaCoordinator {
        self.ctx.coordinator.as_ref()
    }

    /// IDs of outstanding protocol tasks.
    pub fn outstanding_tasks(&self) -> Vec<String> {
        self.executor.outstanding()
    }

    /// Membership version my rings were derived from.
    pub fn rings_version(&self) -> u64 {
        self.ctx.rings.version()
    }

    /// Number of (name, epoch) starts waiting to be acked.
    pub fn pending_start_acks(&self) -> usize {
        self.ctx.start_notifiees.len()
    }

    /// Number of names with unreported demand.
    pub fn profiled_names(&self) -> usize {
        self.ctx.profiler.len()
    }

    /// Handles one inbound message; returns the messages to send.
    pub fn handle_msg(&mut self, msg: ReconMsg) -> Result<Vec<Envelope>, ReconError> {
        pf_trace!("recv {:?}", msg);
        let mut sends = match msg {
            ReconMsg::StartEpoch { .. } => self.handle_start_epoch(msg)?,
            ReconMsg::StopEpoch {
                name,
                epoch,
                initiator,
            } => self.handle_stop_epoch(name, epoch, initiator)?,
            ReconMsg::DropEpochFinalState {
                name,
                epoch,
                initiator,
            } => self.handle_drop_final_state(name, epoch, initiator),
            ReconMsg::RequestEpochFinalState {
                name,
                epoch,
                initiator,
            } => self.handle_request_final_state(name, epoch, initiator),
            ReconMsg::EpochFinalState { .. } => {
                self.executor.handle_event(&msg, &mut self.ctx)
            }
            ReconMsg::AppRequest(req) => self.handle_app_request(req)?,
            ReconMsg::NodeConfig { directory } => {
                // demand reports follow the new reconfigurator ring
                if !self.ctx.rings.refresh(&directory) {
                    pf_debug!("node config version {} ignored", directory.version());
                }
                Vec::new()
            }
            ReconMsg::Replicate(req) => {
                let name = req.name.clone();
                if !self.ctx.coordinator.apply_replicated(req) {
                    pf_debug!("replicated request for '{}' not applied", name);
                }
                Vec::new()
            }
            other => {
                pf_warn!("unexpected {} for '{}'", other.packet_type(), other.name());
                Vec::new()
            }
        };
        sends.extend(self.after_step()?);
        Ok(sends)
    }

    /// Restarts stalled tasks and drops obviated ones.
    pub fn on_tick(&mut self, now: Instant) -> Result<Vec<Envelope>, ReconError> {
        let mut sends = self.executor.on_tick(now, &mut self.ctx);
        sends.extend(self.after_step()?);
        Ok(sends)
    }

    /// Lets the coordinator make progress, then collects completed stops,
    /// completed client requests, and coordinator traffic.
    fn after_step(&mut self) -> Result<Vec<Envelope>, ReconError> {
        self.ctx.coordinator.poll()?;
        let mut sends = self.drain_stops();
        sends.extend(self.drain_replies());
        sends.extend(self.ctx.coordinator.take_outbound());
        Ok(sends)
    }
}
