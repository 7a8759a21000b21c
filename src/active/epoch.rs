//! Active replica -- epoch start, stop, and final state drop handshakes.

use super::*;

use crate::active::finalstate::WaitEpochFinalState;
use crate::coordinator::Completion;
use crate::packets::task_key;
use crate::protask::task_id;

use tokio::sync::oneshot::error::TryRecvError;

impl ActiveReplica {
    /// Handler of `StartEpoch`. Acks right away if I already moved on to
    /// this epoch or later; creates the group from the initial state if
    /// there is no previous group; otherwise fetches the previous epoch's
    /// final state first. Never acks before the group exists.
    pub(super) fn handle_start_epoch(
        &mut self,
        msg: ReconMsg,
    ) -> Result<Vec<Envelope>, ReconError> {
        let ReconMsg::StartEpoch {
            name,
            epoch,
            new_group,
            prev_group,
            prev_epoch,
            initial_state,
            first_candidate,
            initiator,
        } = msg
        else {
            return Ok(Vec::new());
        };

        self.ctx
            .start_notifiees
            .entry((name.clone(), epoch))
            .or_default()
            .insert(initiator);

        if self.ctx.epoch_of(&name).is_some_and(|e| e >= epoch) {
            pf_debug!("'{}' already at or past epoch {}", name, epoch);
            return Ok(self.ctx.ack_start(&name, epoch));
        }

        if prev_group.is_empty() {
            let state = initial_state.unwrap_or_default();
            let created = self
                .ctx
                .coordinator
                .create_replica_group(&name, epoch, &state, &new_group);
            if !matches!(created, Ok(true)) {
                // the reconfigurator retries and registers itself again
                self.ctx.start_notifiees.remove(&(name.clone(), epoch));
            }
            if !created? {
                pf_warn!("failed to create group of '{}' at epoch {}", name, epoch);
                return Ok(Vec::new());
            }
            return Ok(self.ctx.ack_start(&name, epoch));
        }

        let task = WaitEpochFinalState::new(
            name,
            epoch,
            new_group,
            prev_group,
            prev_epoch,
            first_candidate,
        );
        Ok(self
            .executor
            .spawn_if_not_running(Box::new(task), &mut self.ctx)
            .unwrap_or_default())
    }

    /// Handler of `StopEpoch`. Acks right away if there is nothing to stop;
    /// otherwise routes the application's stop request through the
    /// coordinator and acks once it completes.
    pub(super) fn handle_stop_epoch(
        &mut self,
        name: String,
        epoch: Epoch,
        initiator: NodeId,
    ) -> Result<Vec<Envelope>, ReconError> {
        let ack = |me: &NodeId, to: NodeId| {
            vec![Envelope::new(
                to,
                ReconMsg::AckStopEpoch {
                    name: name.clone(),
                    epoch,
                    responder: me.clone(),
                },
            )]
        };

        let local = match self.ctx.epoch_of(&name) {
            None => return Ok(ack(&self.ctx.me, initiator)),
            Some(local) => local,
        };
        if local > epoch || (local == epoch && self.ctx.coordinator.is_stopped(&name)) {
            return Ok(ack(&self.ctx.me, initiator));
        }
        if local < epoch {
            pf_warn!(
                "stop of '{}' at epoch {} while at epoch {}",
                name,
                epoch,
                local
            );
            return Ok(Vec::new());
        }

        let stop_key = (name.clone(), epoch);
        if let Some(pending) = self.ctx.pending_stops.get_mut(&stop_key) {
            pending.notifiees.insert(initiator);
            return Ok(Vec::new());
        }

        let id = self.ctx.new_req_id();
        let req = self.ctx.coordinator.core().stop_request(&name, epoch, id);
        let (completion, rx) = Completion::new();
        if !self.ctx.coordinator.handle_incoming(req, completion)? {
            pf_warn!("stop of '{}' at epoch {} not handled", name, epoch);
            return Ok(Vec::new());
        }
        self.ctx.pending_stops.insert(
            stop_key,
            PendingStop {
                notifiees: BTreeSet::from([initiator]),
                rx,
            },
        );
        Ok(Vec::new())
    }

    /// Acks every stop request whose completion reported success. Stops that
    /// failed or will never complete are forgotten without an ack.
    pub(super) fn drain_stops(&mut self) -> Vec<Envelope> {
        let mut sends = Vec::new();
        let me = self.ctx.me.clone();
        self.ctx.pending_stops.retain(|(name, epoch), pending| {
            match pending.rx.try_recv() {
                Ok(reply) if reply.success => {
                    for rc in &pending.notifiees {
                        sends.push(Envelope::new(
                            rc.clone(),
                            ReconMsg::AckStopEpoch {
                                name: name.clone(),
                                epoch: *epoch,
                                responder: me.clone(),
                            },
                        ));
                    }
                    false
                }
                Ok(_) | Err(TryRecvError::Closed) => {
                    pf_warn!("stop of '{}' at epoch {} failed", name, epoch);
                    false
                }
                Err(TryRecvError::Empty) => true,
            }
        });
        sends
    }

    /// Handler of `DropEpochFinalState`: forgets the final state of the
    /// epoch and the group that served it, then acks.
    pub(super) fn handle_drop_final_state(
        &mut self,
        name: String,
        epoch: Epoch,
        initiator: NodeId,
    ) -> Vec<Envelope> {
        if self.ctx.coordinator.delete_final_state(&name, epoch) {
            pf_debug!("dropped final state of '{}' at epoch {}", name, epoch);
        }
        if self.ctx.epoch_of(&name).is_some_and(|e| e <= epoch)
            && self.ctx.coordinator.delete_replica_group(&name)
        {
            pf_info!("deleted group of '{}' at epoch {}", name, epoch);
        }
        // a fetch of this final state can no longer succeed
        self.executor
            .remove(&task_id(WaitEpochFinalState::KIND, &task_key(&name, epoch)));
        if self.ctx.epoch_of(&name).is_none() {
            self.ctx.forget_name(&name, epoch + 1);
        }

        vec![Envelope::new(
            initiator,
            ReconMsg::AckDropEpochFinalState {
                name,
                epoch,
                responder: self.ctx.me.clone(),
            },
        )]
    }
}
