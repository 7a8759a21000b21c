//! Active replica -- application requests and demand reporting.

use super::*;

use crate::coordinator::{failed_reply, Completion};
use crate::packets::AppRequest;
use crate::utils::now_millis;

use rand::seq::SliceRandom;

use tokio::sync::oneshot::error::TryRecvError;

impl ActiveReplica {
    /// Handler of a client application request. Requests for names I do not
    /// serve at their epoch, and stop requests from clients, get a failure
    /// reply. Accepted requests count towards the name's demand.
    pub(super) fn handle_app_request(
        &mut self,
        req: AppRequest,
    ) -> Result<Vec<Envelope>, ReconError> {
        let failed = failed_reply(&req);
        if req.is_stop() {
            pf_warn!("client tried to stop '{}'", req.name);
            return Ok(Envelope::to_requester(ReconMsg::AppReply(failed))
                .into_iter()
                .collect());
        }

        let name = req.name.clone();
        let is_update = req.op.is_update();
        let (completion, rx) = Completion::new();
        if !self.ctx.coordinator.handle_incoming(req, completion)? {
            pf_debug!("request for '{}' not handled", name);
            return Ok(Envelope::to_requester(ReconMsg::AppReply(failed))
                .into_iter()
                .collect());
        }
        self.ctx.pending_replies.push(PendingReply { failed, rx });

        let me = self.ctx.me.clone();
        self.ctx
            .profiler
            .register(&name, is_update, &me, now_millis());
        Ok(self.maybe_report_demand(&name).into_iter().collect())
    }

    /// Flushes the demand of `name` to one of its reconfigurators, picked at
    /// random for load spreading, once enough has accumulated.
    fn maybe_report_demand(&mut self, name: &str) -> Option<Envelope> {
        if self.ctx.config.no_reporting || !self.ctx.profiler.should_report(name) {
            return None;
        }
        let rc_group = self.ctx.rings.current().reconfigurators.replicated_servers(name);
        let target = rc_group.choose(&mut self.ctx.rng)?.clone();
        let stats = self.ctx.profiler.pluck(name)?;
        let epoch = self.ctx.epoch_of(name).unwrap_or(0);
        pf_debug!(
            "reporting {} requests of '{}' to {}",
            stats.num_requests,
            name,
            target
        );
        Some(Envelope::new(
            target,
            ReconMsg::DemandReport {
                name: name.into(),
                epoch,
                stats,
            },
        ))
    }

    /// Replies to clients whose coordinated requests completed. A dropped
    /// completion means "not handled" and gets a failure reply.
    pub(super) fn drain_replies(&mut self) -> Vec<Envelope> {
        let mut sends = Vec::new();
        self.ctx.pending_replies.retain_mut(|pending| {
            let reply = match pending.rx.try_recv() {
                Ok(reply) => reply,
                Err(TryRecvError::Closed) => pending.failed.clone(),
                Err(TryRecvError::Empty) => return true,
            };
            sends.extend(Envelope::to_requester(ReconMsg::AppReply(reply)));
            false
        });
        sends
    }
}
