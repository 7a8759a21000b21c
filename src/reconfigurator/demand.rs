//! Reconfigurator -- demand reports and the reconfigurations they trigger.

use super::*;

use std::collections::BTreeSet;

use crate::demand::DemandStats;
use crate::packets::Epoch;
use crate::reconfigurator::tasks::WaitAckStopEpoch;
use crate::utils::now_millis;

impl Reconfigurator {
    /// Handler of a `DemandReport` from an active replica. Merges it into the
    /// record and starts a reconfiguration if the trigger policy fires.
    pub(super) fn handle_demand_report(
        &mut self,
        name: String,
        epoch: Epoch,
        stats: DemandStats,
    ) -> Result<Vec<Envelope>, ReconError> {
        let rings = self.ctx.rings.current();
        if !rings.reconfigurators.responsible_for(&name, &self.ctx.me) {
            return logged_err!("demand report of '{}' sent to non-owner", name);
        }
        if let Some(forwarded) = self.forward_to_primary(
            || ReconMsg::DemandReport {
                name: name.clone(),
                epoch,
                stats: stats.clone(),
            },
            &name,
        ) {
            return forwarded;
        }

        let now_ms = now_millis();
        if !self.ctx.store.update_demand_stats(
            &name,
            &stats,
            now_ms,
            &self.ctx.trigger,
        )? {
            return Ok(Vec::new());
        }
        let Some(rec) = self.ctx.store.get_record(&name)? else {
            pf_debug!("demand report of unknown name '{}'", name);
            return Ok(Vec::new());
        };
        if rec.epoch != epoch {
            pf_debug!(
                "demand report of '{}' from epoch {} at epoch {}",
                name,
                epoch,
                rec.epoch
            );
        }

        let new_group: BTreeSet<NodeId> = self.ctx.placement.choose(&rec, &rings);
        if new_group.is_empty() {
            pf_warn!("placement chose nobody for '{}'", name);
            return Ok(Vec::new());
        }
        if !self.ctx.store.initiate_reconfiguration(
            &name,
            rec.epoch,
            new_group.clone(),
            now_ms,
        )? {
            return Ok(Vec::new());
        }

        pf_info!(
            "reconfiguring '{}' {}: {:?} -> {:?}",
            name,
            rec.epoch,
            rec.active_replicas,
            new_group
        );
        Ok(self.executor.spawn(
            WaitAckStopEpoch::new(
                name,
                rec.epoch,
                rec.active_replicas.into_iter().collect(),
                new_group.into_iter().collect(),
                None,
            ),
            &mut self.ctx,
        ))
    }
}
