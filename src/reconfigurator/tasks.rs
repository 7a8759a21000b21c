//! Reconfigurator -- protocol tasks of the epoch handoff.
//!
//! A reconfiguration of a name at epoch `e` chains three tasks:
//! `WaitAckStopEpoch(e)` stops the old group, `WaitAckStartEpoch(e+1)`
//! starts the new group (which fetches the final state of `e`), and
//! `WaitAckDropEpoch(e)` garbage-collects the final state of `e`. Creation
//! starts directly with `WaitAckStartEpoch(0)` and no previous group;
//! deletion goes from `WaitAckStopEpoch(e)` straight to `WaitAckDropEpoch(e)`
//! and removes the record at the end.
//!
//! `WaitAckHandoff(e)` is unrelated to the epoch chain: it moves a `Ready`
//! record to the name's new primary reconfigurator after the reconfigurator
//! pool changed.

use std::collections::BTreeSet;

use crate::node::NodeId;
use crate::packets::{task_key, Envelope, Epoch, PacketType, ReconMsg, Requester};
use crate::protask::{ProtocolTask, TaskStep};
use crate::reconfigurator::RcContext;
use crate::records::{RecordState, ReconfigurationRecord};

/// Restarts after reaching the start quorum during which stragglers keep
/// getting `StartEpoch`.
const STRAGGLER_RESTARTS: u32 = 5;

/// Sends `make(member)` to every member that has not acked yet.
fn to_unacked(
    group: &[NodeId],
    acked: &BTreeSet<NodeId>,
    make: impl Fn() -> ReconMsg,
) -> Vec<Envelope> {
    group
        .iter()
        .filter(|m| !acked.contains(*m))
        .map(|m| Envelope::new(m.clone(), make()))
        .collect()
}

/// Records an ack if it comes from a group member.
fn record_ack(group: &[NodeId], acked: &mut BTreeSet<NodeId>, responder: &NodeId) -> bool {
    if !group.contains(responder) {
        pf_warn!("ack from non-member {}", responder);
        return false;
    }
    acked.insert(responder.clone())
}

/// Waits for stop acks from the old group of a name at `epoch`.
pub(super) struct WaitAckStopEpoch {
    pub(super) name: String,
    pub(super) epoch: Epoch,

    /// Group being stopped.
    pub(super) prev_group: Vec<NodeId>,

    /// Group of the next epoch; empty for a deletion.
    pub(super) new_group: Vec<NodeId>,

    /// Client to answer when a deletion completes.
    pub(super) requester: Option<Requester>,

    pub(super) acked: BTreeSet<NodeId>,

    /// First member that acked; the new group asks it for the final state
    /// first.
    pub(super) first_acker: Option<NodeId>,
}

impl WaitAckStopEpoch {
    pub(super) fn new(
        name: String,
        epoch: Epoch,
        prev_group: Vec<NodeId>,
        new_group: Vec<NodeId>,
        requester: Option<Requester>,
    ) -> Box<Self> {
        Box::new(WaitAckStopEpoch {
            name,
            epoch,
            prev_group,
            new_group,
            requester,
            acked: BTreeSet::new(),
            first_acker: None,
        })
    }

    fn is_deletion(&self) -> bool {
        self.new_group.is_empty()
    }

    /// Moves on once enough of the old group stopped.
    fn try_finish(&mut self, ctx: &mut RcContext) -> Option<TaskStep<RcContext>> {
        if self.acked.len() < ctx.stop_quorum.threshold(self.prev_group.len()) {
            return None;
        }

        if self.is_deletion() {
            return Some(TaskStep::then(
                Vec::new(),
                WaitAckDropEpoch::new(
                    self.name.clone(),
                    self.epoch,
                    self.prev_group.clone(),
                    true,
                    self.requester.take(),
                ),
            ));
        }

        let proceed = match ctx.store.stop_acked(&self.name, self.epoch) {
            Ok(true) => true,
            // already moved past the stop, e.g. when re-driven after recovery
            Ok(false) => ctx.store.get_record(&self.name).ok().flatten().is_some_and(|rec| {
                rec.state == RecordState::WaitAckStart && rec.epoch == self.epoch
            }),
            Err(e) => {
                pf_error!("error persisting stop of '{}': {}", self.name, e);
                return None;
            }
        };
        if !proceed {
            return Some(TaskStep::Cancel);
        }
        let mut start = WaitAckStartEpoch::new(
            self.name.clone(),
            self.epoch + 1,
            self.new_group.clone(),
            self.prev_group.clone(),
            self.epoch,
            None,
            None,
        );
        start.first_candidate = self.first_acker.clone();
        Some(TaskStep::then(Vec::new(), start))
    }
}

impl ProtocolTask<RcContext> for WaitAckStopEpoch {
    fn kind(&self) -> &'static str {
        "WaitAckStopEpoch"
    }

    fn key(&self) -> String {
        task_key(&self.name, self.epoch)
    }

    fn event_types(&self) -> &'static [PacketType] {
        &[PacketType::AckStopEpoch]
    }

    fn start(&mut self, ctx: &mut RcContext) -> Vec<Envelope> {
        to_unacked(&self.prev_group, &self.acked, || ReconMsg::StopEpoch {
            name: self.name.clone(),
            epoch: self.epoch,
            initiator: ctx.me.clone(),
        })
    }

    fn restart(&mut self, ctx: &mut RcContext) -> TaskStep<RcContext> {
        match self.try_finish(ctx) {
            Some(step) => step,
            None => TaskStep::Pending(self.start(ctx)),
        }
    }

    fn handle_event(&mut self, msg: &ReconMsg, ctx: &mut RcContext) -> TaskStep<RcContext> {
        if let ReconMsg::AckStopEpoch { responder, .. } = msg {
            if record_ack(&self.prev_group, &mut self.acked, responder) {
                pf_debug!("stop ack of '{}':{} from {}", self.name, self.epoch, responder);
                if self.first_acker.is_none() {
                    self.first_acker = Some(responder.clone());
                }
            }
        }
        self.try_finish(ctx)
            .unwrap_or_else(|| TaskStep::Pending(Vec::new()))
    }

    fn is_obviated(&self, ctx: &RcContext) -> bool {
        match ctx.store.get_record(&self.name) {
            Ok(Some(rec)) => rec.epoch != self.epoch || rec.state != RecordState::WaitAckStop,
            Ok(None) => true,
            Err(_) => false,
        }
    }
}

/// Waits for start acks from the new group of a name at `epoch`.
pub(super) struct WaitAckStartEpoch {
    pub(super) name: String,
    pub(super) epoch: Epoch,
    pub(super) new_group: Vec<NodeId>,

    /// Group of the previous epoch; empty for a creation.
    pub(super) prev_group: Vec<NodeId>,
    pub(super) prev_epoch: Epoch,

    /// Initial state of a creation.
    pub(super) initial_state: Option<String>,

    /// Previous-group member known to hold the final state.
    pub(super) first_candidate: Option<NodeId>,

    /// Client to answer when a creation completes.
    pub(super) requester: Option<Requester>,

    pub(super) acked: BTreeSet<NodeId>,

    /// Set once the record landed on `epoch`.
    pub(super) ready: bool,

    /// Restarts since becoming ready.
    pub(super) straggler_restarts: u32,
}

impl WaitAckStartEpoch {
    pub(super) fn new(
        name: String,
        epoch: Epoch,
        new_group: Vec<NodeId>,
        prev_group: Vec<NodeId>,
        prev_epoch: Epoch,
        initial_state: Option<String>,
        requester: Option<Requester>,
    ) -> Box<Self> {
        Box::new(WaitAckStartEpoch {
            name,
            epoch,
            new_group,
            prev_group,
            prev_epoch,
            initial_state,
            first_candidate: None,
            requester,
            acked: BTreeSet::new(),
            ready: false,
            straggler_restarts: 0,
        })
    }

    fn is_creation(&self) -> bool {
        self.prev_group.is_empty()
    }

    /// Epoch of the record while this task runs.
    fn record_epoch(&self) -> Epoch {
        if self.is_creation() {
            self.epoch
        } else {
            self.prev_epoch
        }
    }

    /// Lands the record on `epoch` once enough of the new group started.
    fn try_ready(&mut self, ctx: &mut RcContext) -> Vec<Envelope> {
        if self.ready
            || self.acked.len() < ctx.start_quorum.threshold(self.new_group.len())
        {
            return Vec::new();
        }

        match ctx.store.start_acked(&self.name, self.record_epoch()) {
            Ok(true) => {}
            Ok(false) => {
                let landed = ctx.store.get_record(&self.name).ok().flatten().is_some_and(
                    |rec| rec.state == RecordState::Ready && rec.epoch >= self.epoch,
                );
                if !landed {
                    pf_warn!("record of '{}' not waiting for epoch {}", self.name, self.epoch);
                    return Vec::new();
                }
            }
            Err(e) => {
                pf_error!("error persisting start of '{}': {}", self.name, e);
                return Vec::new();
            }
        }

        self.ready = true;
        pf_info!("'{}' ready at epoch {} with {:?}", self.name, self.epoch, self.new_group);
        if self.is_creation() {
            RcContext::client_reply(
                &self.name,
                PacketType::CreateServiceName,
                true,
                format!("created at epoch {}", self.epoch),
                self.requester.take(),
            )
            .into_iter()
            .collect()
        } else {
            Vec::new()
        }
    }

    /// Completes, handing the previous epoch's final state to GC.
    fn finish(&self) -> TaskStep<RcContext> {
        if self.is_creation() {
            return TaskStep::done(Vec::new());
        }
        TaskStep::then(
            Vec::new(),
            WaitAckDropEpoch::new(
                self.name.clone(),
                self.prev_epoch,
                self.prev_group.clone(),
                false,
                None,
            ),
        )
    }
}

impl ProtocolTask<RcContext> for WaitAckStartEpoch {
    fn kind(&self) -> &'static str {
        "WaitAckStartEpoch"
    }

    fn key(&self) -> String {
        task_key(&self.name, self.epoch)
    }

    fn event_types(&self) -> &'static [PacketType] {
        &[PacketType::AckStartEpoch]
    }

    fn start(&mut self, ctx: &mut RcContext) -> Vec<Envelope> {
        to_unacked(&self.new_group, &self.acked, || ReconMsg::StartEpoch {
            name: self.name.clone(),
            epoch: self.epoch,
            new_group: self.new_group.clone(),
            prev_group: self.prev_group.clone(),
            prev_epoch: self.prev_epoch,
            initial_state: self.initial_state.clone(),
            first_candidate: self.first_candidate.clone(),
            initiator: ctx.me.clone(),
        })
    }

    fn restart(&mut self, ctx: &mut RcContext) -> TaskStep<RcContext> {
        let mut sends = self.try_ready(ctx);
        if self.ready {
            self.straggler_restarts += 1;
            if self.straggler_restarts > STRAGGLER_RESTARTS {
                pf_warn!(
                    "giving up on stragglers of '{}':{}: {:?}",
                    self.name,
                    self.epoch,
                    self.new_group
                        .iter()
                        .filter(|m| !self.acked.contains(*m))
                        .collect::<Vec<_>>()
                );
                return self.finish();
            }
        }
        sends.extend(self.start(ctx));
        TaskStep::Pending(sends)
    }

    fn handle_event(&mut self, msg: &ReconMsg, ctx: &mut RcContext) -> TaskStep<RcContext> {
        if let ReconMsg::AckStartEpoch { responder, .. } = msg {
            if record_ack(&self.new_group, &mut self.acked, responder) {
                pf_debug!("start ack of '{}':{} from {}", self.name, self.epoch, responder);
            }
        }
        let sends = self.try_ready(ctx);
        if self.ready && self.acked.len() == self.new_group.len() {
            return match self.finish() {
                TaskStep::Complete { spawn, .. } => TaskStep::Complete { sends, spawn },
                other => other,
            };
        }
        TaskStep::Pending(sends)
    }

    fn is_obviated(&self, ctx: &RcContext) -> bool {
        match ctx.store.get_record(&self.name) {
            Ok(Some(rec)) => rec.epoch > self.epoch || rec.state == RecordState::Deleted,
            Ok(None) => true,
            Err(_) => false,
        }
    }
}

/// Waits for drop acks of the final state of `epoch` from a group. For a
/// deletion, removes the record and answers the client at the end.
pub(super) struct WaitAckDropEpoch {
    pub(super) name: String,
    pub(super) epoch: Epoch,
    pub(super) group: Vec<NodeId>,
    pub(super) delete: bool,
    pub(super) requester: Option<Requester>,
    pub(super) acked: BTreeSet<NodeId>,
}

impl WaitAckDropEpoch {
    pub(super) fn new(
        name: String,
        epoch: Epoch,
        group: Vec<NodeId>,
        delete: bool,
        requester: Option<Requester>,
    ) -> Box<Self> {
        Box::new(WaitAckDropEpoch {
            name,
            epoch,
            group,
            delete,
            requester,
            acked: BTreeSet::new(),
        })
    }

    fn try_finish(&mut self, ctx: &mut RcContext) -> Option<TaskStep<RcContext>> {
        if self.acked.len() < ctx.drop_quorum.threshold(self.group.len()) {
            return None;
        }
        if !self.delete {
            pf_debug!("final state of '{}':{} collected", self.name, self.epoch);
            return Some(TaskStep::done(Vec::new()));
        }

        let deleted = ctx
            .store
            .mark_deleted(&self.name)
            .and_then(|_| ctx.store.purge(&self.name));
        if let Err(e) = deleted {
            pf_error!("error deleting record of '{}': {}", self.name, e);
            return None;
        }
        pf_info!("'{}' deleted", self.name);
        Some(TaskStep::done(
            RcContext::client_reply(
                &self.name,
                PacketType::DeleteServiceName,
                true,
                "deleted",
                self.requester.take(),
            )
            .into_iter()
            .collect(),
        ))
    }
}

impl ProtocolTask<RcContext> for WaitAckDropEpoch {
    fn kind(&self) -> &'static str {
        "WaitAckDropEpoch"
    }

    fn key(&self) -> String {
        task_key(&self.name, self.epoch)
    }

    fn event_types(&self) -> &'static [PacketType] {
        &[PacketType::AckDropEpochFinalState]
    }

    fn start(&mut self, ctx: &mut RcContext) -> Vec<Envelope> {
        to_unacked(&self.group, &self.acked, || ReconMsg::DropEpochFinalState {
            name: self.name.clone(),
            epoch: self.epoch,
            initiator: ctx.me.clone(),
        })
    }

    fn restart(&mut self, ctx: &mut RcContext) -> TaskStep<RcContext> {
        match self.try_finish(ctx) {
            Some(step) => step,
            None => TaskStep::Pending(self.start(ctx)),
        }
    }

    fn handle_event(&mut self, msg: &ReconMsg, ctx: &mut RcContext) -> TaskStep<RcContext> {
        if let ReconMsg::AckDropEpochFinalState { responder, .. } = msg {
            record_ack(&self.group, &mut self.acked, responder);
        }
        self.try_finish(ctx)
            .unwrap_or_else(|| TaskStep::Pending(Vec::new()))
    }

    fn is_obviated(&self, ctx: &RcContext) -> bool {
        self.delete && matches!(ctx.store.get_record(&self.name), Ok(None))
    }
}

/// Hands a `Ready` record over to the name's current primary reconfigurator
/// and drops the local copy once it is acked.
pub(super) struct WaitAckHandoff {
    pub(super) record: ReconfigurationRecord,
}

impl WaitAckHandoff {
    pub(super) fn new(record: ReconfigurationRecord) -> Box<Self> {
        Box::new(WaitAckHandoff { record })
    }
}

impl ProtocolTask<RcContext> for WaitAckHandoff {
    fn kind(&self) -> &'static str {
        "WaitAckHandoff"
    }

    fn key(&self) -> String {
        task_key(&self.record.name, self.record.epoch)
    }

    fn event_types(&self) -> &'static [PacketType] {
        &[PacketType::AckHandoffRecord]
    }

    fn start(&mut self, ctx: &mut RcContext) -> Vec<Envelope> {
        // re-resolved on every restart, so chained pool changes retarget
        match ctx.rings.current().reconfigurators.primary(&self.record.name) {
            Some(primary) if primary != ctx.me => vec![Envelope::new(
                primary,
                ReconMsg::HandoffRecord {
                    record: self.record.clone(),
                    initiator: ctx.me.clone(),
                },
            )],
            _ => Vec::new(),
        }
    }

    fn handle_event(&mut self, msg: &ReconMsg, ctx: &mut RcContext) -> TaskStep<RcContext> {
        let ReconMsg::AckHandoffRecord { responder, .. } = msg else {
            return TaskStep::Pending(Vec::new());
        };
        match ctx.store.release(&self.record.name, self.record.epoch) {
            Ok(_) => {
                pf_info!(
                    "record '{}' handed to {} at epoch {}",
                    self.record.name,
                    responder,
                    self.record.epoch
                );
                TaskStep::done(Vec::new())
            }
            Err(e) => {
                pf_error!("error releasing '{}': {}", self.record.name, e);
                TaskStep::Pending(Vec::new())
            }
        }
    }

    fn is_obviated(&self, ctx: &RcContext) -> bool {
        if ctx
            .rings
            .current()
            .reconfigurators
            .is_primary(&self.record.name, &ctx.me)
        {
            return true;
        }
        match ctx.store.get_record(&self.record.name) {
            Ok(Some(rec)) => {
                rec.epoch != self.record.epoch || rec.state != RecordState::Ready
            }
            Ok(None) => true,
            Err(_) => false,
        }
    }
}
