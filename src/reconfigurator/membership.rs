//! Reconfigurator -- runtime changes of the node pools.
//!
//! The reconfigurator an operator asks applies the change to its directory
//! and sends the resulting snapshot to every node of the old and new
//! membership. Each reconfigurator then reconciles its records against the
//! new rings: records whose primary moved are handed over, and groups that
//! lost members to the active pool are reconfigured onto live nodes.

use super::*;

use std::collections::BTreeSet;

use crate::node::{NodeConfigChange, NodeDirectory};
use crate::packets::NODE_CONFIG_NAME;
use crate::records::{RecordState, ReconfigurationRecord};
use crate::reconfigurator::tasks::{WaitAckHandoff, WaitAckStopEpoch};
use crate::ring::NodeRings;
use crate::utils::now_millis;

impl Reconfigurator {
    /// Handler of an operator's `ReconfigureNodeConfig`.
    pub(super) fn handle_node_config_change(
        &mut self,
        change: NodeConfigChange,
        requester: Option<Requester>,
    ) -> Result<Vec<Envelope>, ReconError> {
        let reply = |success: bool, detail: String| {
            RcContext::client_reply(
                NODE_CONFIG_NAME,
                PacketType::ReconfigureNodeConfig,
                success,
                detail,
                requester.clone(),
            )
        };

        let current = self.ctx.rings.directory();
        if current.version() == 0 {
            pf_warn!("node config change with no known membership");
            return Ok(reply(false, "membership unknown".into()).into_iter().collect());
        }
        if change.is_empty() {
            return Ok(reply(false, "empty change".into()).into_iter().collect());
        }
        let next = match current.apply(&change) {
            Ok(next) => next,
            Err(e) => {
                pf_warn!("node config change rejected: {}", e);
                return Ok(reply(false, e.to_string()).into_iter().collect());
            }
        };
        pf_info!("node config change to version {}: {:?}", next.version(), change);

        // nodes leaving are told too, so a leaving reconfigurator hands off
        let targets: BTreeSet<NodeId> = current
            .all_addrs()
            .into_keys()
            .chain(next.all_addrs().into_keys())
            .filter(|id| *id != self.ctx.me)
            .collect();
        let mut sends: Vec<Envelope> = targets
            .into_iter()
            .map(|id| {
                Envelope::new(
                    id,
                    ReconMsg::NodeConfig {
                        directory: next.clone(),
                    },
                )
            })
            .collect();
        sends.extend(self.install_directory(&next)?);
        sends.extend(reply(true, format!("node config at version {}", next.version())));
        Ok(sends)
    }

    /// Adopts a newer membership snapshot and starts reconciling records
    /// against it. Older or equal versions are ignored.
    pub(super) fn install_directory(
        &mut self,
        directory: &NodeDirectory,
    ) -> Result<Vec<Envelope>, ReconError> {
        if !self.ctx.rings.refresh(directory) {
            pf_debug!(
                "node config version {} not newer than {}",
                directory.version(),
                self.ctx.rings.version()
            );
            return Ok(Vec::new());
        }
        self.reconcile_pending = true;
        self.reconcile_membership()
    }

    /// Handler of a `HandoffRecord` from the name's previous primary.
    pub(super) fn handle_handoff_record(
        &mut self,
        record: ReconfigurationRecord,
        initiator: NodeId,
    ) -> Result<Vec<Envelope>, ReconError> {
        let rings = self.ctx.rings.current();
        if !rings.reconfigurators.is_primary(&record.name, &self.ctx.me) {
            // my rings may lag behind the sender's; it retries
            pf_debug!("handoff of '{}' from {} while not primary", record.name, initiator);
            return Ok(Vec::new());
        }
        let name = record.name.clone();
        let epoch = record.epoch;
        self.ctx.store.adopt(record)?;
        self.reconcile_pending = true;
        Ok(vec![Envelope::new(
            initiator,
            ReconMsg::AckHandoffRecord {
                name,
                epoch,
                responder: self.ctx.me.clone(),
            },
        )])
    }

    /// One pass over my records against the current rings: hands over the
    /// ones I no longer own and moves owned groups off removed actives.
    /// Clears the pending flag once nothing is left to do.
    pub(super) fn reconcile_membership(&mut self) -> Result<Vec<Envelope>, ReconError> {
        let rings = self.ctx.rings.current();
        let mut sends = Vec::new();
        let mut settled = true;

        for name in self.ctx.store.names()? {
            let Some(rec) = self.ctx.store.get_record(&name)? else {
                continue;
            };
            if !rings.reconfigurators.is_primary(&name, &self.ctx.me) {
                settled = false;
                if rec.state == RecordState::Ready {
                    if let Some(more) = self
                        .executor
                        .spawn_if_not_running(WaitAckHandoff::new(rec), &mut self.ctx)
                    {
                        sends.extend(more);
                    }
                }
                continue;
            }

            let pool = rings.actives.nodes();
            if rec.active_replicas.iter().all(|id| pool.contains(id)) {
                continue;
            }
            if rec.state != RecordState::Ready {
                settled = false;
                continue;
            }
            if let Some(more) = self.evacuate(rec, &rings)? {
                settled = false;
                sends.extend(more);
            }
        }

        if settled {
            pf_info!("records settled at membership version {}", rings.actives.version());
        }
        self.reconcile_pending = !settled;
        Ok(sends)
    }

    /// Reconfigures a `Ready` record whose group lost members to the active
    /// pool: survivors stay, the ring fills the group back up to its size.
    /// Returns `None` if nothing was started.
    fn evacuate(
        &mut self,
        rec: ReconfigurationRecord,
        rings: &NodeRings,
    ) -> Result<Option<Vec<Envelope>>, ReconError> {
        let pool = rings.actives.nodes();
        let survivors: Vec<NodeId> = rec
            .active_replicas
            .iter()
            .filter(|id| pool.contains(*id))
            .cloned()
            .collect();
        if survivors.is_empty() {
            pf_warn!("every active replica of '{}' left the pool", rec.name);
            return Ok(None);
        }

        let size = rec.active_replicas.len().min(pool.len());
        let mut new_group: BTreeSet<NodeId> = survivors.iter().cloned().collect();
        for id in rings.actives.ring_order(&rec.name) {
            if new_group.len() >= size {
                break;
            }
            new_group.insert(id);
        }
        if !self.ctx.store.initiate_reconfiguration(
            &rec.name,
            rec.epoch,
            new_group.clone(),
            now_millis(),
        )? {
            return Ok(None);
        }

        pf_info!(
            "moving '{}' {} off removed actives: {:?} -> {:?}",
            rec.name,
            rec.epoch,
            rec.active_replicas,
            new_group
        );
        Ok(Some(self.executor.spawn(
            WaitAckStopEpoch::new(
                rec.name,
                rec.epoch,
                survivors,
                new_group.into_iter().collect(),
                None,
            ),
            &mut self.ctx,
        )))
    }
}

#[cfg(test)]
mod membership_tests {
    use super::*;
    use crate::records::MemoryBackend;
    use crate::reconfigurator::reconfigurator_tests::nid;
    use crate::ring::RingParams;

    /// Directory of `num_ars` actives and `num_rcs` reconfigurators.
    fn directory(num_ars: usize, num_rcs: usize) -> NodeDirectory {
        let mut dir = NodeDirectory::new();
        for i in 0..num_ars {
            let addr = format!("127.0.0.1:{}", 52700 + i).parse().unwrap();
            dir.add_active(nid(&format!("AR{}", i)), addr).unwrap();
        }
        for i in 0..num_rcs {
            let addr = format!("127.0.0.1:{}", 52800 + i).parse().unwrap();
            dir.add_reconfigurator(nid(&format!("RC{}", i)), addr).unwrap();
        }
        dir
    }

    fn over(me: &NodeId, dir: &NodeDirectory) -> Reconfigurator {
        let config = ReconfiguratorConfig {
            reconfigure_threshold: 10,
            min_reconfigure_interval_ms: 0,
            ..Default::default()
        };
        let store = RecordStore::open(Box::new(MemoryBackend::new())).unwrap();
        let rings = RingView::from_directory(dir.clone(), RingParams::default());
        Reconfigurator::new(me.clone(), &config, Arc::new(rings), store).unwrap()
    }

    /// Primary of `name` over `dir` holding its record `Ready` at epoch 0.
    fn owner_of(name: &str, dir: &NodeDirectory) -> Result<Reconfigurator, ReconError> {
        let rings = NodeRings::from_directory(dir, RingParams::default());
        let Some(primary) = rings.reconfigurators.primary(name) else {
            return Err(ReconError::msg("no primary"));
        };
        let rc = over(&primary, dir);
        let group = rings.actives.replicated_servers(name);
        assert!(rc.store().create_record(name, group.into_iter().collect(), "")?);
        assert!(rc.store().start_acked(name, 0)?);
        Ok(rc)
    }

    fn change_msg(change: NodeConfigChange) -> ReconMsg {
        ReconMsg::ReconfigureNodeConfig {
            change,
            requester: Some(Requester {
                entry: nid("RC0"),
                client: 3,
            }),
        }
    }

    fn reply_success(sends: &[Envelope]) -> Option<bool> {
        sends.iter().find_map(|env| match &env.msg {
            ReconMsg::ClientReply {
                kind: PacketType::ReconfigureNodeConfig,
                success,
                ..
            } => Some(*success),
            _ => None,
        })
    }

    #[test]
    fn change_broadcasts_snapshot() -> Result<(), ReconError> {
        let dir = directory(5, 3);
        let mut rc = over(&nid("RC0"), &dir);
        let mut change = NodeConfigChange::default();
        change.add_actives.insert(nid("AR5"), "127.0.0.1:52705".parse()?);
        let sends = rc.handle_msg(change_msg(change))?;

        assert_eq!(reply_success(&sends), Some(true));
        assert_eq!(rc.rings_version(), dir.version() + 1);
        let told: BTreeSet<NodeId> = sends
            .iter()
            .filter(|env| matches!(env.msg, ReconMsg::NodeConfig { .. }))
            .map(|env| env.to.clone())
            .collect();
        assert_eq!(told.len(), 5 + 1 + 2);
        assert!(told.contains(&nid("AR5")));
        assert!(!told.contains(&nid("RC0")));
        Ok(())
    }

    #[test]
    fn emptying_change_rejected() -> Result<(), ReconError> {
        let dir = directory(2, 1);
        let mut rc = over(&nid("RC0"), &dir);
        let mut change = NodeConfigChange::default();
        change.remove_reconfigurators.insert(nid("RC0"));
        let sends = rc.handle_msg(change_msg(change))?;
        assert_eq!(sends.len(), 1);
        assert_eq!(reply_success(&sends), Some(false));
        assert_eq!(rc.rings_version(), dir.version());

        let sends = rc.handle_msg(change_msg(NodeConfigChange::default()))?;
        assert_eq!(reply_success(&sends), Some(false));
        Ok(())
    }

    #[test]
    fn stale_snapshot_ignored() -> Result<(), ReconError> {
        let dir = directory(5, 3);
        let mut rc = over(&nid("RC1"), &dir);
        let sends = rc.handle_msg(ReconMsg::NodeConfig { directory: dir.clone() })?;
        assert!(sends.is_empty());
        assert_eq!(rc.rings_version(), dir.version());
        Ok(())
    }

    #[test]
    fn removed_active_evacuated() -> Result<(), ReconError> {
        let dir = directory(5, 3);
        let mut rc = owner_of("alice", &dir)?;
        let group: Vec<NodeId> = rc
            .store()
            .get_record("alice")?
            .map(|rec| rec.active_replicas.into_iter().collect())
            .unwrap_or_default();
        let gone = group[0].clone();

        let mut change = NodeConfigChange::default();
        change.remove_actives.insert(gone.clone());
        let sends = rc.handle_msg(change_msg(change))?;
        let stopped: BTreeSet<NodeId> = sends
            .iter()
            .filter(|env| matches!(env.msg, ReconMsg::StopEpoch { epoch: 0, .. }))
            .map(|env| env.to.clone())
            .collect();
        assert_eq!(stopped, group[1..].iter().cloned().collect());

        let rec = rc.store().get_record("alice")?.unwrap();
        assert_eq!(rec.state, RecordState::WaitAckStop);
        let next = rec.new_active_replicas.unwrap_or_default();
        assert_eq!(next.len(), group.len());
        assert!(!next.contains(&gone));
        assert_eq!(rc.outstanding_tasks(), vec!["WaitAckStopEpoch/alice:0"]);
        Ok(())
    }

    #[test]
    fn added_reconfigurator_takes_records() -> Result<(), ReconError> {
        let dir = directory(5, 3);
        let mut change = NodeConfigChange::default();
        change.add_reconfigurators.insert(nid("RC3"), "127.0.0.1:52803".parse()?);
        let next = dir.apply(&change)?;
        let old_rings = NodeRings::from_directory(&dir, RingParams::default());
        let new_rings = NodeRings::from_directory(&next, RingParams::default());
        let Some(name) = (0..200).map(|i| format!("name-{}", i)).find(|name| {
            old_rings.reconfigurators.primary(name) == Some(nid("RC0"))
                && new_rings.reconfigurators.primary(name) == Some(nid("RC3"))
        }) else {
            panic!("no name moves from RC0 to RC3");
        };

        let mut old = owner_of(&name, &dir)?;
        let sends = old.handle_msg(ReconMsg::NodeConfig { directory: next.clone() })?;
        let handoffs: Vec<&Envelope> = sends
            .iter()
            .filter(|env| matches!(env.msg, ReconMsg::HandoffRecord { .. }))
            .collect();
        assert_eq!(handoffs.len(), 1);
        assert_eq!(handoffs[0].to, nid("RC3"));

        // the new primary adopts the record and acks
        let mut new = over(&nid("RC3"), &next);
        let acks = new.handle_msg(handoffs[0].msg.clone())?;
        assert_eq!(acks.len(), 1);
        assert_eq!(acks[0].to, nid("RC0"));
        assert_eq!(new.store().get_record(&name)?.map(|rec| rec.epoch), Some(0));

        assert!(old.handle_msg(acks[0].msg.clone())?.is_empty());
        assert!(old.store().get_record(&name)?.is_none());
        assert!(old.outstanding_tasks().is_empty());
        Ok(())
    }

    #[test]
    fn handoff_to_non_primary_dropped() -> Result<(), ReconError> {
        let dir = directory(5, 3);
        let mut rc = over(&nid("RC0"), &dir);
        let rings = NodeRings::from_directory(&dir, RingParams::default());
        let Some(name) = (0..50)
            .map(|i| format!("name-{}", i))
            .find(|name| rings.reconfigurators.primary(name) != Some(nid("RC0")))
        else {
            panic!("RC0 owns every name");
        };
        let record = ReconfigurationRecord::new_creation(&name, BTreeSet::new(), "");
        let sends = rc.handle_msg(ReconMsg::HandoffRecord {
            record,
            initiator: nid("RC1"),
        })?;
        assert!(sends.is_empty());
        assert!(rc.store().get_record(&name)?.is_none());
        Ok(())
    }
}
