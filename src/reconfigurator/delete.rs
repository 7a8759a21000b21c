//! Reconfigurator -- name deletion.

use super::*;

use crate::records::RecordState;
use crate::reconfigurator::tasks::WaitAckStopEpoch;

impl Reconfigurator {
    /// Handler of a `DeleteServiceName` request. Stops the current group,
    /// then drops its final state, then removes the record.
    pub(super) fn handle_delete(
        &mut self,
        name: String,
        requester: Option<Requester>,
    ) -> Result<Vec<Envelope>, ReconError> {
        if let Some(forwarded) = self.forward_to_primary(
            || ReconMsg::DeleteServiceName {
                name: name.clone(),
                requester: requester.clone(),
            },
            &name,
        ) {
            return forwarded;
        }

        let detail = match self.ctx.store.get_record(&name)? {
            None => "name not found",
            Some(rec) if rec.state != RecordState::Ready => "name busy",
            Some(rec) => {
                if self.ctx.store.initiate_deletion(&name, rec.epoch)? {
                    pf_info!("deleting '{}' at epoch {}", name, rec.epoch);
                    return Ok(self.executor.spawn(
                        WaitAckStopEpoch::new(
                            name,
                            rec.epoch,
                            rec.active_replicas.into_iter().collect(),
                            Vec::new(),
                            requester,
                        ),
                        &mut self.ctx,
                    ));
                }
                "name busy"
            }
        };

        pf_debug!("delete of '{}' refused: {}", name, detail);
        Ok(RcContext::client_reply(
            &name,
            PacketType::DeleteServiceName,
            false,
            detail,
            requester,
        )
        .into_iter()
        .collect())
    }
}
