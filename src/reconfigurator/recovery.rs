//! Reconfigurator -- re-driving unfinished handoffs after a restart.

use super::*;

use crate::records::RecordState;
use crate::reconfigurator::tasks::{WaitAckStartEpoch, WaitAckStopEpoch};

impl Reconfigurator {
    /// Restarts the protocol task of every record left mid-transition in the
    /// store, for names I am primary for. Returns the messages to send.
    pub fn recover(&mut self) -> Result<Vec<Envelope>, ReconError> {
        let rings = self.ctx.rings.current();
        let mut sends = Vec::new();
        let mut resumed = 0;

        for name in self.ctx.store.get_pending_reconfigurations()? {
            if !rings.reconfigurators.is_primary(&name, &self.ctx.me) {
                continue;
            }
            let Some(rec) = self.ctx.store.get_record(&name)? else {
                continue;
            };
            let new_group: Vec<NodeId> = rec
                .new_active_replicas
                .clone()
                .unwrap_or_default()
                .into_iter()
                .collect();
            let prev_group: Vec<NodeId> =
                rec.active_replicas.iter().cloned().collect();

            match rec.state {
                RecordState::Ready => continue,
                RecordState::Deleted => {
                    self.ctx.store.purge(&name)?;
                    continue;
                }
                RecordState::WaitAckStop => {
                    // an empty new group resumes a deletion
                    sends.extend(self.executor.spawn(
                        WaitAckStopEpoch::new(
                            name.clone(),
                            rec.epoch,
                            prev_group,
                            new_group,
                            None,
                        ),
                        &mut self.ctx,
                    ));
                }
                RecordState::WaitAckStart if rec.is_creating() => {
                    sends.extend(self.executor.spawn(
                        WaitAckStartEpoch::new(
                            name.clone(),
                            rec.epoch,
                            new_group,
                            Vec::new(),
                            0,
                            rec.initial_state.clone(),
                            None,
                        ),
                        &mut self.ctx,
                    ));
                }
                RecordState::WaitAckStart => {
                    sends.extend(self.executor.spawn(
                        WaitAckStartEpoch::new(
                            name.clone(),
                            rec.pending_epoch.unwrap_or(rec.epoch + 1),
                            new_group,
                            prev_group,
                            rec.epoch,
                            None,
                            None,
                        ),
                        &mut self.ctx,
                    ));
                }
            }
            resumed += 1;
            pf_info!("resumed '{}' in {}@{}", name, rec.state, rec.epoch);
        }

        if resumed > 0 {
            pf_info!("recovered {} pending reconfigurations", resumed);
        }
        Ok(sends)
    }
}

#[cfg(test)]
mod recovery_tests {
    use super::*;
    use crate::records::MemoryBackend;
    use crate::reconfigurator::reconfigurator_tests::{nid, primary_and_other};
    use crate::ring::{NodeRings, RingParams};
    use std::collections::BTreeSet;

    /// Reconfigurator `me` over a store preloaded by `fill`.
    fn with_store(
        me: &str,
        fill: impl FnOnce(&RecordStore) -> Result<(), ReconError>,
    ) -> Result<Reconfigurator, ReconError> {
        let params = RingParams::default();
        let rings = NodeRings::new(
            (0..5).map(|i| nid(&format!("AR{}", i))),
            (0..3).map(|i| nid(&format!("RC{}", i))),
            params,
            1,
        );
        let store = RecordStore::open(Box::new(MemoryBackend::new()))?;
        fill(&store)?;
        Reconfigurator::new(
            nid(me),
            &ReconfiguratorConfig::default(),
            Arc::new(RingView::new(rings, params)),
            store,
        )
    }

    fn group(ids: &[&str]) -> BTreeSet<NodeId> {
        ids.iter().map(|s| nid(s)).collect()
    }

    #[test]
    fn resumes_each_state() -> Result<(), ReconError> {
        let (primary, _) = primary_and_other("alice");
        let mut rc = with_store(&primary, |store| {
            store.create_record("alice", group(&["AR0", "AR1"]), "a")?;
            Ok(())
        })?;
        let sends = rc.recover()?;
        assert_eq!(sends.len(), 2);
        assert!(sends.iter().all(|env| matches!(
            &env.msg,
            ReconMsg::StartEpoch { epoch: 0, initial_state: Some(s), .. } if s == "a"
        )));
        assert_eq!(rc.outstanding_tasks(), vec!["WaitAckStartEpoch/alice:0"]);

        let mut rc = with_store(&primary, |store| {
            store.create_record("alice", group(&["AR0", "AR1"]), "a")?;
            store.start_acked("alice", 0)?;
            store.initiate_reconfiguration("alice", 0, group(&["AR2"]), 0)?;
            Ok(())
        })?;
        let sends = rc.recover()?;
        assert_eq!(sends.len(), 2);
        assert_eq!(rc.outstanding_tasks(), vec!["WaitAckStopEpoch/alice:0"]);

        let mut rc = with_store(&primary, |store| {
            store.create_record("alice", group(&["AR0", "AR1"]), "a")?;
            store.start_acked("alice", 0)?;
            store.initiate_reconfiguration("alice", 0, group(&["AR2"]), 0)?;
            store.stop_acked("alice", 0)?;
            Ok(())
        })?;
        let sends = rc.recover()?;
        assert_eq!(sends.len(), 1);
        match &sends[0].msg {
            ReconMsg::StartEpoch {
                epoch,
                prev_group,
                prev_epoch,
                ..
            } => {
                assert_eq!(*epoch, 1);
                assert_eq!(*prev_epoch, 0);
                assert_eq!(prev_group, &vec![nid("AR0"), nid("AR1")]);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(rc.outstanding_tasks(), vec!["WaitAckStartEpoch/alice:1"]);
        Ok(())
    }

    #[test]
    fn purges_tombstones_and_skips_others() -> Result<(), ReconError> {
        let (primary, other) = primary_and_other("alice");
        let mut rc = with_store(&primary, |store| {
            store.create_record("alice", group(&["AR0"]), "")?;
            store.mark_deleted("alice")?;
            Ok(())
        })?;
        assert!(rc.recover()?.is_empty());
        assert!(rc.store().is_empty()?);

        let mut rc = with_store(&other, |store| {
            store.create_record("alice", group(&["AR0"]), "")?;
            Ok(())
        })?;
        assert!(rc.recover()?.is_empty());
        assert!(rc.outstanding_tasks().is_empty());
        Ok(())
    }
}
