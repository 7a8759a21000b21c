//! Deterministic in-process network of reconfigurator and active replica
//! cores, for end-to-end protocol tests without sockets.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;

use crate::active::{ActiveReplica, ActiveReplicaConfig};
use crate::app::KvApplication;
use crate::coordinator::CoordinatorKind;
use crate::node::{ClientId, NodeDirectory, NodeId};
use crate::packets::{Envelope, ReconMsg, Requester};
use crate::reconfigurator::{Reconfigurator, ReconfiguratorConfig};
use crate::records::{MemoryBackend, RecordStore, ReconfigurationRecord};
use crate::ring::{RingParams, RingView};
use crate::utils::ReconError;

use tokio::time::{Duration, Instant};

/// Deliveries after which `run()` gives up, assuming a message storm.
const MAX_DELIVERIES: usize = 100_000;

pub(crate) struct SimNet {
    /// Observer view, refreshed by every `NodeConfig` the network carries.
    rings: Arc<RingView>,
    params: RingParams,
    rc_config: ReconfiguratorConfig,
    ar_config: ActiveReplicaConfig,
    kind: CoordinatorKind,
    rcs: BTreeMap<NodeId, Reconfigurator>,
    ars: BTreeMap<NodeId, ActiveReplica>,

    /// Envelopes in flight, delivered in FIFO order.
    queue: VecDeque<Envelope>,

    /// Nodes whose inbound messages are dropped.
    partitioned: BTreeSet<NodeId>,

    /// If set, every `StartEpoch` and `StopEpoch` is delivered twice.
    duplicate_control: bool,

    /// Client-bound replies, with the entry node they reached.
    replies: Vec<(NodeId, ReconMsg)>,

    /// Simulated time handed to task ticks.
    clock: Instant,
}

impl SimNet {
    /// Network of `num_ars` active replicas and `num_rcs` reconfigurators
    /// with in-memory record stores. Every node has its own ring view.
    pub(crate) fn new(
        num_ars: usize,
        num_rcs: usize,
        rc_config: ReconfiguratorConfig,
        ar_config: ActiveReplicaConfig,
        kind: CoordinatorKind,
    ) -> Result<Self, ReconError> {
        let params = RingParams::default();
        let mut directory = NodeDirectory::new();
        for i in 0..num_ars {
            directory.add_active(format!("AR{}", i).parse()?, sim_addr(52700 + i)?)?;
        }
        for i in 0..num_rcs {
            directory.add_reconfigurator(format!("RC{}", i).parse()?, sim_addr(52800 + i)?)?;
        }

        let mut net = SimNet {
            rings: Arc::new(RingView::from_directory(directory.clone(), params)),
            params,
            rc_config,
            ar_config,
            kind,
            rcs: BTreeMap::new(),
            ars: BTreeMap::new(),
            queue: VecDeque::new(),
            partitioned: BTreeSet::new(),
            duplicate_control: false,
            replies: Vec::new(),
            clock: Instant::now(),
        };
        for id in directory.reconfigurators().keys() {
            net.boot_reconfigurator(id)?;
        }
        for id in directory.actives().keys() {
            net.boot_active(id)?;
        }
        Ok(net)
    }

    /// Ring view of a node booting now, over the membership the network
    /// currently knows.
    fn fresh_view(&self) -> Arc<RingView> {
        Arc::new(RingView::from_directory((*self.rings.directory()).clone(), self.params))
    }

    /// Starts active replica `id`, not yet part of any membership change.
    pub(crate) fn boot_active(&mut self, id: &NodeId) -> Result<(), ReconError> {
        let coordinator = self
            .kind
            .new_coordinator(id.clone(), Box::new(KvApplication::new()));
        let mut ar = ActiveReplica::new(
            id.clone(),
            self.ar_config.clone(),
            self.fresh_view(),
            coordinator,
        )?;
        ar.seed_rng(self.ars.len() as u64);
        self.ars.insert(id.clone(), ar);
        Ok(())
    }

    /// Starts reconfigurator `id` over an empty in-memory store.
    pub(crate) fn boot_reconfigurator(&mut self, id: &NodeId) -> Result<(), ReconError> {
        let store = RecordStore::open(Box::new(MemoryBackend::new()))?;
        let rc = Reconfigurator::new(id.clone(), &self.rc_config, self.fresh_view(), store)?;
        self.rcs.insert(id.clone(), rc);
        Ok(())
    }

    pub(crate) fn rc(&self, id: &NodeId) -> &Reconfigurator {
        &self.rcs[id]
    }

    pub(crate) fn ar(&self, id: &NodeId) -> &ActiveReplica {
        &self.ars[id]
    }

    /// Primary reconfigurator of `name` and another member of its group.
    pub(crate) fn owners(&self, name: &str) -> (NodeId, NodeId) {
        let group = self.rings.current().reconfigurators.replicated_servers(name);
        (group[0].clone(), group[1].clone())
    }

    /// Default active replica group of `name`.
    pub(crate) fn default_actives(&self, name: &str) -> Vec<NodeId> {
        self.rings.current().actives.replicated_servers(name)
    }

    /// Record of `name` at its primary reconfigurator.
    pub(crate) fn record(
        &self,
        name: &str,
    ) -> Result<Option<ReconfigurationRecord>, ReconError> {
        let (primary, _) = self.owners(name);
        self.rc(&primary).store().get_record(name)
    }

    pub(crate) fn partition(&mut self, id: &NodeId) {
        self.partitioned.insert(id.clone());
    }

    pub(crate) fn heal(&mut self, id: &NodeId) {
        self.partitioned.remove(id);
    }

    pub(crate) fn set_duplicate_control(&mut self, on: bool) {
        self.duplicate_control = on;
    }

    /// Queues a message to `to`.
    pub(crate) fn send(&mut self, to: &NodeId, msg: ReconMsg) {
        self.enqueue(vec![Envelope::new(to.clone(), msg)]);
    }

    /// Queues a message from client `client` entering through `entry`.
    pub(crate) fn client_send(&mut self, entry: &NodeId, client: ClientId, msg: ReconMsg) {
        let msg = msg.with_requester(Requester {
            entry: entry.clone(),
            client,
        });
        self.send(entry, msg);
    }

    /// Takes the client replies received so far.
    pub(crate) fn take_replies(&mut self) -> Vec<(NodeId, ReconMsg)> {
        std::mem::take(&mut self.replies)
    }

    fn enqueue(&mut self, envelopes: Vec<Envelope>) {
        for env in envelopes {
            if self.duplicate_control
                && matches!(
                    env.msg,
                    ReconMsg::StartEpoch { .. } | ReconMsg::StopEpoch { .. }
                )
            {
                self.queue.push_back(env.clone());
            }
            self.queue.push_back(env);
        }
    }

    /// Delivers queued messages until the network is quiet.
    pub(crate) fn run(&mut self) -> Result<(), ReconError> {
        let mut deliveries = 0;
        while let Some(Envelope { to, msg }) = self.queue.pop_front() {
            deliveries += 1;
            if deliveries > MAX_DELIVERIES {
                return logged_err!("network not quiet after {} deliveries", deliveries);
            }
            if self.partitioned.contains(&to) {
                pf_trace!("dropped {} -> {}", msg.packet_type(), to);
                continue;
            }
            if msg.is_client_reply() {
                self.replies.push((to, msg));
                continue;
            }
            if let ReconMsg::NodeConfig { directory } = &msg {
                self.rings.refresh(directory);
            }

            let sends = if let Some(rc) = self.rcs.get_mut(&to) {
                rc.handle_msg(msg)?
            } else if let Some(ar) = self.ars.get_mut(&to) {
                ar.handle_msg(msg)?
            } else {
                return logged_err!("no node {} in the network", to);
            };
            self.enqueue(sends);
        }
        Ok(())
    }

    /// Advances the clock past every task's backoff, ticks every node, and
    /// runs the network until quiet.
    pub(crate) fn tick(&mut self) -> Result<(), ReconError> {
        self.clock += Duration::from_secs(600);
        let now = self.clock;
        let mut sends = Vec::new();
        for rc in self.rcs.values_mut() {
            sends.extend(rc.on_tick(now));
        }
        for ar in self.ars.values_mut() {
            sends.extend(ar.on_tick(now)?);
        }
        self.enqueue(sends);
        self.run()
    }

    /// Replaces reconfigurator `id` by a fresh one over the store `open`
    /// returns, then re-drives its unfinished handoffs. The old core is
    /// dropped before `open` runs.
    pub(crate) fn restart_rc(
        &mut self,
        id: &NodeId,
        open: impl FnOnce() -> Result<RecordStore, ReconError>,
    ) -> Result<(), ReconError> {
        self.rcs.remove(id);
        let mut rc = Reconfigurator::new(
            id.clone(),
            &self.rc_config,
            self.fresh_view(),
            open()?,
        )?;
        let sends = rc.recover()?;
        self.rcs.insert(id.clone(), rc);
        self.enqueue(sends);
        Ok(())
    }
}

/// Loopback address standing in for a simulated node's endpoint.
pub(crate) fn sim_addr(port: usize) -> Result<std::net::SocketAddr, ReconError> {
    Ok(format!("127.0.0.1:{}", port).parse()?)
}

#[cfg(test)]
mod testkit_tests {
    use super::*;
    use crate::demand::DemandStats;
    use crate::node::NodeConfigChange;
    use crate::packets::{AppOp, AppRequest, PacketType};
    use crate::records::{RecordState, WalBackend};

    fn nid(s: &str) -> NodeId {
        s.parse().unwrap()
    }

    fn create(name: &str, initial_state: &str) -> ReconMsg {
        ReconMsg::CreateServiceName {
            name: name.into(),
            initial_state: initial_state.into(),
            requester: None,
        }
    }

    fn app(id: u64, name: &str, op: AppOp) -> ReconMsg {
        ReconMsg::AppRequest(AppRequest {
            id,
            name: name.into(),
            epoch: None,
            needs_coordination: op.is_update(),
            op,
            requester: None,
        })
    }

    /// Update-heavy demand report with `count` votes for each of `voters`.
    fn votes_for(voters: &[NodeId], count: u64) -> DemandStats {
        let mut stats = DemandStats::default();
        for voter in voters {
            for t in 0..count {
                stats.register(true, voter, t);
            }
        }
        stats
    }

    fn hosted_epoch(net: &SimNet, ar: &NodeId, name: &str) -> Option<u64> {
        net.ar(ar)
            .coordinator()
            .core()
            .group(name)
            .filter(|g| !g.stopped)
            .map(|g| g.epoch)
    }

    fn assert_reply_success(replies: &[(NodeId, ReconMsg)], kind: PacketType) {
        assert!(
            replies.iter().any(|(_, msg)| matches!(
                msg,
                ReconMsg::ClientReply { kind: k, success: true, .. } if *k == kind
            )),
            "no successful {} reply in {:?}",
            kind,
            replies
        );
    }

    #[test]
    fn create_at_non_owner_is_forwarded() -> Result<(), ReconError> {
        let mut net = SimNet::new(
            5,
            3,
            ReconfiguratorConfig::default(),
            ActiveReplicaConfig::default(),
            CoordinatorKind::Quorum,
        )?;
        let (primary, other) = net.owners("alice");
        net.client_send(&other, 11, create("alice", ""));
        net.run()?;

        let replies = net.take_replies();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].0, other);
        assert_reply_success(&replies, PacketType::CreateServiceName);

        let rec = net.record("alice")?.unwrap();
        assert_eq!(rec.state, RecordState::Ready);
        assert_eq!(rec.epoch, 0);
        let defaults = net.default_actives("alice");
        assert_eq!(rec.active_replicas, defaults.iter().cloned().collect());
        for ar in &defaults {
            assert_eq!(hosted_epoch(&net, ar, "alice"), Some(0));
        }
        // only the primary keeps a record
        assert!(net.rc(&other).store().get_record("alice")?.is_none());
        assert!(net.rc(&primary).outstanding_tasks().is_empty());
        Ok(())
    }

    #[test]
    fn demand_moves_group_and_keeps_state() -> Result<(), ReconError> {
        let rc_config = ReconfiguratorConfig {
            reconfigure_threshold: 1,
            min_reconfigure_interval_ms: 0,
            placement: "DemandVotes".into(),
            min_replicas: 3,
            max_replicas: 3,
            ..Default::default()
        };
        let ar_config = ActiveReplicaConfig {
            no_reporting: true,
            ..Default::default()
        };
        let mut net = SimNet::new(
            6,
            3,
            rc_config,
            ar_config,
            CoordinatorKind::LazyBroadcast,
        )?;
        let (primary, _) = net.owners("alice");
        net.send(&primary, create("alice", ""));
        net.run()?;

        let first = net.default_actives("alice");
        net.client_send(
            &first[0],
            5,
            app(0, "alice", AppOp::Put {
                key: "ip".into(),
                value: "10.0.0.1".into(),
            }),
        );
        net.run()?;
        assert!(matches!(
            &net.take_replies()[..],
            [(_, ReconMsg::AppReply(reply))] if reply.success
        ));

        let low: Vec<NodeId> = (0..3).map(|i| nid(&format!("AR{}", i))).collect();
        let high: Vec<NodeId> = (3..6).map(|i| nid(&format!("AR{}", i))).collect();
        for epoch in 1..=4u64 {
            // each round outvotes everything merged before it
            let winners = if epoch % 2 == 1 { &high } else { &low };
            net.send(
                &primary,
                ReconMsg::DemandReport {
                    name: "alice".into(),
                    epoch: epoch - 1,
                    stats: votes_for(winners, 10 * epoch),
                },
            );
            net.run()?;

            let rec = net.record("alice")?.unwrap();
            assert_eq!(rec.state, RecordState::Ready);
            assert_eq!(rec.epoch, epoch);
            assert_eq!(rec.active_replicas, winners.iter().cloned().collect());
            for ar in winners {
                assert_eq!(hosted_epoch(&net, ar, "alice"), Some(epoch));
            }
        }
        // every final state collected, nothing left running
        assert!(net.rc(&primary).outstanding_tasks().is_empty());

        // the value written at epoch 0 survived four handoffs
        net.client_send(&low[1], 6, app(1, "alice", AppOp::Get { key: "ip".into() }));
        net.run()?;
        match &net.take_replies()[..] {
            [(_, ReconMsg::AppReply(reply))] => {
                assert!(reply.success);
                assert_eq!(reply.value.as_deref(), Some("10.0.0.1"));
            }
            other => panic!("unexpected replies {:?}", other),
        }
        Ok(())
    }

    #[test]
    fn traffic_reports_trigger_reconfiguration() -> Result<(), ReconError> {
        let rc_config = ReconfiguratorConfig {
            reconfigure_threshold: 4,
            min_reconfigure_interval_ms: 0,
            ..Default::default()
        };
        let ar_config = ActiveReplicaConfig {
            report_threshold: 2,
            ..Default::default()
        };
        let mut net = SimNet::new(
            3,
            3,
            rc_config,
            ar_config,
            CoordinatorKind::LazyBroadcast,
        )?;
        let (primary, _) = net.owners("alice");
        net.send(&primary, create("alice", ""));
        net.run()?;

        let entry = net.default_actives("alice")[0].clone();
        for id in 0..3 {
            net.client_send(&entry, 1, app(id, "alice", AppOp::Get { key: "k".into() }));
            net.run()?;
            assert_eq!(net.record("alice")?.unwrap().epoch, 0);
        }
        net.client_send(&entry, 1, app(3, "alice", AppOp::Get { key: "k".into() }));
        net.run()?;

        // keep-current placement: same group, next epoch
        let rec = net.record("alice")?.unwrap();
        assert_eq!(rec.state, RecordState::Ready);
        assert_eq!(rec.epoch, 1);
        assert_eq!(
            rec.active_replicas,
            net.default_actives("alice").into_iter().collect()
        );
        assert_eq!(net.take_replies().len(), 4);
        Ok(())
    }

    #[test]
    fn duplicate_control_messages_are_idempotent() -> Result<(), ReconError> {
        let rc_config = ReconfiguratorConfig {
            reconfigure_threshold: 1,
            min_reconfigure_interval_ms: 0,
            ..Default::default()
        };
        let mut net = SimNet::new(
            3,
            3,
            rc_config,
            ActiveReplicaConfig::default(),
            CoordinatorKind::Unreplicated,
        )?;
        net.set_duplicate_control(true);
        let (primary, _) = net.owners("alice");
        net.send(&primary, create("alice", "k = 'v'"));
        net.run()?;
        net.send(
            &primary,
            ReconMsg::DemandReport {
                name: "alice".into(),
                epoch: 0,
                stats: votes_for(&[nid("AR0")], 1),
            },
        );
        net.run()?;

        let rec = net.record("alice")?.unwrap();
        assert_eq!((rec.state, rec.epoch), (RecordState::Ready, 1));
        for ar in net.default_actives("alice") {
            assert_eq!(hosted_epoch(&net, &ar, "alice"), Some(1));
            assert!(net.ar(&ar).outstanding_tasks().is_empty());
        }
        assert!(net.rc(&primary).outstanding_tasks().is_empty());
        Ok(())
    }

    #[test]
    fn restarted_owner_finishes_handoff() -> Result<(), ReconError> {
        let path = &std::env::temp_dir().join(format!(
            "gigarecon_test_sim_recovery_{}.wal",
            std::process::id()
        ));
        let _ = std::fs::remove_file(path);
        let open = || RecordStore::open(Box::new(WalBackend::open(path, false)?));

        let rc_config = ReconfiguratorConfig {
            reconfigure_threshold: 1,
            min_reconfigure_interval_ms: 0,
            ..Default::default()
        };
        let mut net = SimNet::new(
            3,
            3,
            rc_config,
            ActiveReplicaConfig::default(),
            CoordinatorKind::Quorum,
        )?;
        let (primary, _) = net.owners("alice");
        net.restart_rc(&primary, open)?;
        net.send(&primary, create("alice", ""));
        net.run()?;
        assert_eq!(net.record("alice")?.unwrap().state, RecordState::Ready);

        // stops never arrive
        let group = net.default_actives("alice");
        for ar in &group {
            net.partition(ar);
        }
        net.send(
            &primary,
            ReconMsg::DemandReport {
                name: "alice".into(),
                epoch: 0,
                stats: votes_for(&group[..1], 1),
            },
        );
        net.run()?;
        net.tick()?;
        assert_eq!(net.record("alice")?.unwrap().state, RecordState::WaitAckStop);

        // crash and restart the owner over the same log
        net.restart_rc(&primary, open)?;
        assert_eq!(
            net.rc(&primary).store().get_pending_reconfigurations()?,
            vec!["alice".to_string()]
        );
        assert_eq!(
            net.rc(&primary).outstanding_tasks(),
            vec!["WaitAckStopEpoch/alice:0"]
        );
        net.run()?;

        for ar in &group {
            net.heal(ar);
        }
        net.tick()?;
        let rec = net.record("alice")?.unwrap();
        assert_eq!((rec.state, rec.epoch), (RecordState::Ready, 1));
        Ok(())
    }

    #[test]
    fn partitioned_member_catches_up_later() -> Result<(), ReconError> {
        let mut net = SimNet::new(
            3,
            3,
            ReconfiguratorConfig::default(),
            ActiveReplicaConfig::default(),
            CoordinatorKind::Quorum,
        )?;
        let (primary, _) = net.owners("alice");
        let group = net.default_actives("alice");
        net.partition(&group[2]);
        net.send(&primary, create("alice", ""));
        net.run()?;

        // a majority of starts makes the record ready
        assert_eq!(net.record("alice")?.unwrap().state, RecordState::Ready);
        assert_eq!(hosted_epoch(&net, &group[2], "alice"), None);
        assert_eq!(
            net.rc(&primary).outstanding_tasks(),
            vec!["WaitAckStartEpoch/alice:0"]
        );

        net.heal(&group[2]);
        net.tick()?;
        assert_eq!(hosted_epoch(&net, &group[2], "alice"), Some(0));
        assert!(net.rc(&primary).outstanding_tasks().is_empty());
        Ok(())
    }

    #[test]
    fn delete_end_to_end() -> Result<(), ReconError> {
        let mut net = SimNet::new(
            3,
            3,
            ReconfiguratorConfig::default(),
            ActiveReplicaConfig::default(),
            CoordinatorKind::Quorum,
        )?;
        let (primary, other) = net.owners("alice");
        net.send(&primary, create("alice", ""));
        net.run()?;

        net.client_send(
            &other,
            4,
            ReconMsg::DeleteServiceName {
                name: "alice".into(),
                requester: None,
            },
        );
        net.run()?;
        let replies = net.take_replies();
        assert_reply_success(&replies, PacketType::DeleteServiceName);
        assert!(net.record("alice")?.is_none());
        for ar in net.default_actives("alice") {
            assert!(net.ar(&ar).coordinator().core().group("alice").is_none());
            assert!(net.ar(&ar).coordinator().core().final_state("alice", 0).is_none());
        }

        // the name can be created again from scratch
        net.client_send(&other, 4, create("alice", ""));
        net.run()?;
        assert_reply_success(&net.take_replies(), PacketType::CreateServiceName);
        assert_eq!(net.record("alice")?.unwrap().epoch, 0);
        Ok(())
    }

    #[test]
    fn active_pool_change_moves_groups() -> Result<(), ReconError> {
        let ar_config = ActiveReplicaConfig {
            no_reporting: true,
            ..Default::default()
        };
        let mut net = SimNet::new(
            4,
            3,
            ReconfiguratorConfig::default(),
            ar_config,
            CoordinatorKind::LazyBroadcast,
        )?;
        let (primary, other) = net.owners("alice");
        net.send(&primary, create("alice", ""));
        net.run()?;
        let group = net.default_actives("alice");
        net.client_send(
            &group[0],
            5,
            app(0, "alice", AppOp::Put {
                key: "ip".into(),
                value: "10.0.0.1".into(),
            }),
        );
        net.run()?;
        net.take_replies();

        // swap one of alice's replicas for a fresh node
        let gone = group[0].clone();
        let version = net.rc(&primary).rings_version();
        net.boot_active(&nid("AR4"))?;
        let mut change = NodeConfigChange::default();
        change.remove_actives.insert(gone.clone());
        change.add_actives.insert(nid("AR4"), sim_addr(52704)?);
        net.client_send(
            &other,
            9,
            ReconMsg::ReconfigureNodeConfig {
                change,
                requester: None,
            },
        );
        net.run()?;
        assert_reply_success(&net.take_replies(), PacketType::ReconfigureNodeConfig);

        for rc in net.rcs.values() {
            assert_eq!(rc.rings_version(), version + 1);
        }
        for ar in net.ars.values() {
            assert_eq!(ar.rings_version(), version + 1);
        }

        let rec = net.record("alice")?.unwrap();
        assert_eq!((rec.state, rec.epoch), (RecordState::Ready, 1));
        assert_eq!(rec.active_replicas.len(), group.len());
        assert!(!rec.active_replicas.contains(&gone));
        for ar in &rec.active_replicas {
            assert_eq!(hosted_epoch(&net, ar, "alice"), Some(1));
        }
        assert!(net.rc(&primary).outstanding_tasks().is_empty());

        // the state moved along with the group
        let newcomer = rec
            .active_replicas
            .iter()
            .find(|ar| !group.contains(*ar))
            .cloned()
            .unwrap();
        net.client_send(&newcomer, 6, app(1, "alice", AppOp::Get { key: "ip".into() }));
        net.run()?;
        match &net.take_replies()[..] {
            [(_, ReconMsg::AppReply(reply))] => {
                assert_eq!(reply.value.as_deref(), Some("10.0.0.1"));
            }
            other => panic!("unexpected replies {:?}", other),
        }

        // new names land on the new pool only
        let (bob_primary, _) = net.owners("bob");
        net.send(&bob_primary, create("bob", ""));
        net.run()?;
        let bob = net.record("bob")?.unwrap();
        assert_eq!(bob.state, RecordState::Ready);
        assert!(!bob.active_replicas.contains(&gone));
        assert_eq!(bob.active_replicas, net.default_actives("bob").into_iter().collect());
        Ok(())
    }

    #[test]
    fn reconfigurator_pool_change_hands_off_records() -> Result<(), ReconError> {
        let ar_config = ActiveReplicaConfig {
            no_reporting: true,
            ..Default::default()
        };
        let mut net = SimNet::new(
            3,
            3,
            ReconfiguratorConfig::default(),
            ar_config,
            CoordinatorKind::LazyBroadcast,
        )?;
        let names: Vec<String> = (0..12).map(|i| format!("name-{}", i)).collect();
        for name in &names {
            let (primary, _) = net.owners(name);
            net.send(&primary, create(name, ""));
        }
        net.run()?;

        net.boot_reconfigurator(&nid("RC3"))?;
        let mut change = NodeConfigChange::default();
        change.add_reconfigurators.insert(nid("RC3"), sim_addr(52803)?);
        change.remove_reconfigurators.insert(nid("RC0"));
        net.client_send(
            &nid("RC1"),
            4,
            ReconMsg::ReconfigureNodeConfig {
                change,
                requester: None,
            },
        );
        net.run()?;
        assert_reply_success(&net.take_replies(), PacketType::ReconfigureNodeConfig);

        for name in &names {
            let (primary, _) = net.owners(name);
            assert_ne!(primary, nid("RC0"));
            let rec = net.record(name)?.unwrap();
            assert_eq!((rec.state, rec.epoch), (RecordState::Ready, 0));
            let holders = net
                .rcs
                .values()
                .filter(|rc| matches!(rc.store().get_record(name), Ok(Some(_))))
                .count();
            assert_eq!(holders, 1, "'{}' held {} times", name, holders);
        }
        assert!(net.rc(&nid("RC0")).store().is_empty()?);
        assert!(!net.rc(&nid("RC3")).store().is_empty()?);

        // the new primary serves lookups
        let (primary, _) = net.owners("name-0");
        net.client_send(&primary, 8, ReconMsg::RequestActiveReplicas {
            name: "name-0".into(),
            requester: None,
        });
        net.run()?;
        assert!(matches!(
            &net.take_replies()[..],
            [(_, ReconMsg::ActiveReplicas { epoch: 0, .. })]
        ));
        Ok(())
    }
}
