//! Active replica -- networked runtime around the `ActiveReplica` core.

use super::*;

use crate::app::Application;
use crate::coordinator::CoordinatorKind;
use crate::node::{peer_addrs_of, ClusterConfig, NodeDirectory, Pool, TransportHub};
use crate::ring::RingParams;
use crate::GenericNode;

use async_trait::async_trait;

use tokio::sync::watch;
use tokio::time::{self, Interval, MissedTickBehavior};

/// Active replica node: the core, its transport hub, and the task ticker.
pub struct ActiveReplicaNode {
    /// My node ID.
    me: NodeId,

    /// The message-driven core.
    core: ActiveReplica,

    /// TransportHub module.
    transport_hub: TransportHub<ReconMsg>,

    /// Protocol task tick interval.
    tick_interval: Interval,

    /// Rings shared with the core, carrying the current directory.
    rings: Arc<RingView>,

    /// Membership version the transport's peer addresses match.
    peers_version: u64,
}

impl ActiveReplicaNode {
    /// Creates the node described by the cluster file under ID `me`, with
    /// `app` as its application.
    pub async fn new_and_setup(
        me: NodeId,
        cluster: &ClusterConfig,
        app: Box<dyn Application>,
    ) -> Result<Self, ReconError> {
        let directory = NodeDirectory::from_cluster(cluster)?;
        if directory.pool_of(&me) != Some(Pool::Active) {
            return logged_err!("{} is not an active replica", me);
        }
        let Some(bind_addr) = directory.addr_of(&me) else {
            return logged_err!("{} has no address", me);
        };

        // parse role-specific configs
        let config_str = cluster.role_config(Pool::Active);
        let config = parsed_config!(config_str.as_deref() => ActiveReplicaConfig;
                                    coordinator, report_threshold, no_reporting,
                                    task_restart_ms, task_max_backoff,
                                    task_tick_ms)?;
        if config.task_tick_ms == 0 {
            return logged_err!(
                "invalid config.task_tick_ms '{}'",
                config.task_tick_ms
            );
        }
        let Some(kind) = CoordinatorKind::parse_name(&config.coordinator) else {
            return logged_err!(
                "invalid config.coordinator '{}'",
                config.coordinator
            );
        };

        let params = RingParams::from_cluster(cluster);
        let rings = Arc::new(RingView::from_directory(directory.clone(), params));

        let transport_hub = TransportHub::new_and_setup(
            me.clone(),
            bind_addr,
            peer_addrs_of(&directory, &me),
        )
        .await?;

        let mut tick_interval =
            time::interval(Duration::from_millis(config.task_tick_ms));
        tick_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        if kind.is_node_local() {
            pf_warn!(
                "{} coordinator runs on an in-process consensus engine; \
                 commits are not replicated across nodes",
                kind
            );
        }
        let coordinator = kind.new_coordinator(me.clone(), app);
        pf_info!("active replica up on {} with {} coordinator", bind_addr, kind);
        Ok(ActiveReplicaNode {
            core: ActiveReplica::new(me.clone(), config, rings.clone(), coordinator)?,
            me,
            transport_hub,
            tick_interval,
            peers_version: rings.version(),
            rings,
        })
    }

    /// Sends a step's output, re-syncing peer addresses first if the step
    /// moved the membership.
    fn deliver(&mut self, sends: Vec<Envelope>) {
        let directory = self.rings.directory();
        if directory.version() == self.peers_version {
            self.transport_hub.deliver(sends);
            return;
        }
        pf_info!("peer addresses now at version {}", directory.version());
        self.peers_version = directory.version();
        self.transport_hub.deliver_across(sends, &directory);
    }
}

#[async_trait]
impl GenericNode for ActiveReplicaNode {
    async fn run(
        &mut self,
        mut rx_term: watch::Receiver<bool>,
    ) -> Result<(), ReconError> {
        loop {
            tokio::select! {
                // message from a peer or a client
                msg = self.transport_hub.recv_msg() => {
                    let (src, msg) = match msg {
                        Ok(pair) => pair,
                        Err(e) => {
                            pf_error!("error receiving msg: {}", e);
                            continue;
                        }
                    };
                    let msg = self.transport_hub.stamp_inbound(src, msg);
                    if msg.is_client_reply() {
                        if let Err(e) = self.transport_hub.relay_client_reply(&msg) {
                            pf_error!("error relaying reply: {}", e);
                        }
                        continue;
                    }
                    match self.core.handle_msg(msg) {
                        Ok(sends) => self.deliver(sends),
                        Err(e) => pf_error!("error handling msg: {}", e),
                    }
                },

                // protocol task restarts
                now = self.tick_interval.tick() => {
                    match self.core.on_tick(now) {
                        Ok(sends) => self.deliver(sends),
                        Err(e) => pf_error!("error on tick: {}", e),
                    }
                },

                // receiving termination signal
                _ = rx_term.changed() => {
                    pf_warn!("active replica caught termination signal");
                    return Ok(());
                }
            }
        }
    }

    fn id(&self) -> &NodeId {
        &self.me
    }
}
