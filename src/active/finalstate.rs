//! Active replica -- fetching the previous epoch's final state before
//! starting a new epoch, and serving final states to other replicas.

use super::*;

use crate::packets::task_key;
use crate::protask::{ProtocolTask, TaskStep};
use crate::packets::PacketType;

/// Fetches the final state of `prev_epoch` from members of the previous
/// group, one member at a time, then creates the local group of `epoch`
/// seeded with it and acks the start to every waiting reconfigurator.
pub(super) struct WaitEpochFinalState {
    name: String,
    epoch: Epoch,
    new_group: Vec<NodeId>,
    prev_group: Vec<NodeId>,
    prev_epoch: Epoch,

    /// Member to ask first if I was not in the previous group.
    first_candidate: Option<NodeId>,

    /// Index into `prev_group` of the member currently asked.
    cursor: usize,

    /// Declines since the last timer-driven ask. Once every member declined
    /// in a row, further asks wait for `restart`.
    declines: usize,
}

impl WaitEpochFinalState {
    pub(super) const KIND: &'static str = "WaitEpochFinalState";

    pub(super) fn new(
        name: String,
        epoch: Epoch,
        new_group: Vec<NodeId>,
        prev_group: Vec<NodeId>,
        prev_epoch: Epoch,
        first_candidate: Option<NodeId>,
    ) -> Self {
        WaitEpochFinalState {
            name,
            epoch,
            new_group,
            prev_group,
            prev_epoch,
            first_candidate,
            cursor: 0,
            declines: 0,
        }
    }

    /// Member under the cursor.
    fn target(&self) -> Option<&NodeId> {
        if self.prev_group.is_empty() {
            return None;
        }
        self.prev_group.get(self.cursor % self.prev_group.len())
    }

    /// Asks the member under the cursor.
    fn ask(&self, ctx: &ArContext) -> Vec<Envelope> {
        let Some(target) = self.target().cloned() else {
            return Vec::new();
        };
        pf_debug!(
            "asking {} for final state of '{}' at epoch {}",
            target,
            self.name,
            self.prev_epoch
        );
        vec![Envelope::new(
            target,
            ReconMsg::RequestEpochFinalState {
                name: self.name.clone(),
                epoch: self.prev_epoch,
                initiator: ctx.me.clone(),
            },
        )]
    }
}

impl ProtocolTask<ArContext> for WaitEpochFinalState {
    fn kind(&self) -> &'static str {
        Self::KIND
    }

    fn key(&self) -> String {
        task_key(&self.name, self.prev_epoch)
    }

    fn event_types(&self) -> &'static [PacketType] {
        &[PacketType::EpochFinalState]
    }

    /// Asks myself first if I was in the previous group, else the member
    /// that acked the stop first.
    fn start(&mut self, ctx: &mut ArContext) -> Vec<Envelope> {
        let position = |id: &NodeId| self.prev_group.iter().position(|m| m == id);
        self.cursor = position(&ctx.me)
            .or_else(|| self.first_candidate.as_ref().and_then(position))
            .unwrap_or(0);
        self.declines = 0;
        self.ask(ctx)
    }

    fn restart(&mut self, ctx: &mut ArContext) -> TaskStep<ArContext> {
        self.cursor += 1;
        self.declines = 0;
        TaskStep::Pending(self.ask(ctx))
    }

    fn handle_event(
        &mut self,
        msg: &ReconMsg,
        ctx: &mut ArContext,
    ) -> TaskStep<ArContext> {
        let ReconMsg::EpochFinalState {
            state, responder, ..
        } = msg
        else {
            return TaskStep::Pending(Vec::new());
        };

        let Some(state) = state else {
            pf_debug!("{} declined final state of '{}'", responder, self.name);
            if self.target() != Some(responder) {
                // late answer to an earlier ask
                return TaskStep::Pending(Vec::new());
            }
            self.cursor += 1;
            self.declines += 1;
            if self.declines >= self.prev_group.len() {
                return TaskStep::Pending(Vec::new());
            }
            return TaskStep::Pending(self.ask(ctx));
        };

        match ctx.coordinator.create_replica_group(
            &self.name,
            self.epoch,
            state,
            &self.new_group,
        ) {
            Ok(true) => TaskStep::done(ctx.ack_start(&self.name, self.epoch)),
            Ok(false) => {
                if ctx.epoch_of(&self.name).is_some_and(|e| e >= self.epoch) {
                    TaskStep::done(ctx.ack_start(&self.name, self.epoch))
                } else {
                    pf_warn!("failed to create group of '{}'", self.name);
                    TaskStep::Pending(Vec::new())
                }
            }
            Err(e) => {
                pf_error!("error creating group of '{}': {}", self.name, e);
                TaskStep::Pending(Vec::new())
            }
        }
    }

    fn is_obviated(&self, ctx: &ArContext) -> bool {
        ctx.epoch_of(&self.name).is_some_and(|e| e >= self.epoch)
    }

    fn on_obviated(&mut self, ctx: &mut ArContext) -> Vec<Envelope> {
        ctx.ack_start(&self.name, self.epoch)
    }
}

impl ActiveReplica {
    /// Handler of `RequestEpochFinalState`: serves the final state of
    /// `epoch` if I still hold it, declines otherwise.
    pub(super) fn handle_request_final_state(
        &mut self,
        name: String,
        epoch: Epoch,
        initiator: NodeId,
    ) -> Vec<Envelope> {
        let state = self.ctx.coordinator.final_state(&name, epoch);
        vec![Envelope::new(
            initiator,
            ReconMsg::EpochFinalState {
                name,
                epoch,
                state,
                responder: self.ctx.me.clone(),
            },
        )]
    }
}
