//! Consistent hash rings mapping a service name to an ordered group of
//! nodes, one ring per node pool. Rings are immutable once built; membership
//! changes publish a fresh `NodeRings` through `RingView`.

use std::collections::BTreeSet;
use std::sync::{Arc, RwLock};

use crate::node::{ClusterConfig, NodeDirectory, NodeId};

use sha2::{Digest, Sha256};

/// Stable 64-bit hash: the first 8 bytes of SHA-256, big-endian. Identical
/// across processes and platforms.
pub fn ring_hash(data: &[u8]) -> u64 {
    let digest = Sha256::digest(data);
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(head)
}

/// One consistent hash ring over a single node pool.
#[derive(Debug, Clone)]
pub struct ConsistentHashRing {
    /// Sorted (point, node) pairs; each node owns `virtual_nodes` points.
    points: Vec<(u64, NodeId)>,

    /// Distinct members.
    nodes: BTreeSet<NodeId>,

    /// Group size returned by `replicated_servers`.
    replication: usize,

    /// If true, every group contains all members.
    replicate_all: bool,

    /// Membership version this ring was built from.
    version: u64,
}

impl ConsistentHashRing {
    /// Builds a ring over the given nodes.
    pub fn new(
        nodes: impl IntoIterator<Item = NodeId>,
        replication: usize,
        virtual_nodes: usize,
        replicate_all: bool,
        version: u64,
    ) -> Self {
        let nodes: BTreeSet<NodeId> = nodes.into_iter().collect();
        let mut points = Vec::with_capacity(nodes.len() * virtual_nodes);
        for node in &nodes {
            for v in 0..virtual_nodes.max(1) {
                let point = ring_hash(format!("{}#{}", node, v).as_bytes());
                points.push((point, node.clone()));
            }
        }
        // ties broken by node ID so order never depends on insertion
        points.sort();

        ConsistentHashRing {
            points,
            nodes,
            replication: replication.max(1),
            replicate_all,
            version,
        }
    }

    /// Ordered replica group of `name`: distinct nodes met walking clockwise
    /// from the name's hash. Holds `replication` nodes, or every node in
    /// replicate-all mode or when the pool is smaller than that.
    pub fn replicated_servers(&self, name: &str) -> Vec<NodeId> {
        let want = if self.replicate_all {
            self.nodes.len()
        } else {
            self.replication.min(self.nodes.len())
        };
        self.walk(name, want)
    }

    /// Every member, in the clockwise order met from the name's hash.
    pub fn ring_order(&self, name: &str) -> Vec<NodeId> {
        self.walk(name, self.nodes.len())
    }

    fn walk(&self, name: &str, want: usize) -> Vec<NodeId> {
        if want == 0 {
            return Vec::new();
        }

        let hash = ring_hash(name.as_bytes());
        let start = self.points.partition_point(|(point, _)| *point < hash);
        let mut group: Vec<NodeId> = Vec::with_capacity(want);
        for i in 0..self.points.len() {
            let (_, node) = &self.points[(start + i) % self.points.len()];
            if !group.contains(node) {
                group.push(node.clone());
                if group.len() == want {
                    break;
                }
            }
        }
        group
    }

    /// True if `me` is in the replica group of `name`.
    pub fn responsible_for(&self, name: &str, me: &NodeId) -> bool {
        self.replicated_servers(name).contains(me)
    }

    /// True if `me` is first in the replica group of `name`.
    pub fn is_primary(&self, name: &str, me: &NodeId) -> bool {
        self.primary(name).as_ref() == Some(me)
    }

    /// First node in the replica group of `name`.
    pub fn primary(&self, name: &str) -> Option<NodeId> {
        self.replicated_servers(name).into_iter().next()
    }

    pub fn nodes(&self) -> &BTreeSet<NodeId> {
        &self.nodes
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Ring construction parameters, taken from the cluster file.
#[derive(Debug, Clone, Copy)]
pub struct RingParams {
    pub replication_factor: usize,
    pub virtual_nodes: usize,
    pub actives_replicate_all: bool,
}

impl Default for RingParams {
    fn default() -> Self {
        RingParams {
            replication_factor: 3,
            virtual_nodes: 16,
            actives_replicate_all: false,
        }
    }
}

impl RingParams {
    pub fn from_cluster(cluster: &ClusterConfig) -> Self {
        RingParams {
            replication_factor: cluster.replication_factor,
            virtual_nodes: cluster.virtual_nodes,
            actives_replicate_all: cluster.actives_replicate_all,
        }
    }
}

/// Both rings, derived from one directory snapshot.
#[derive(Debug, Clone)]
pub struct NodeRings {
    /// Ring over the reconfigurator pool; decides a name's RC group.
    pub reconfigurators: ConsistentHashRing,

    /// Ring over the active replica pool; decides a name's default group.
    pub actives: ConsistentHashRing,
}

impl NodeRings {
    /// Builds both rings from explicit pool member lists.
    pub fn new(
        actives: impl IntoIterator<Item = NodeId>,
        reconfigurators: impl IntoIterator<Item = NodeId>,
        params: RingParams,
        version: u64,
    ) -> Self {
        NodeRings {
            reconfigurators: ConsistentHashRing::new(
                reconfigurators,
                params.replication_factor,
                params.virtual_nodes,
                false,
                version,
            ),
            actives: ConsistentHashRing::new(
                actives,
                params.replication_factor,
                params.virtual_nodes,
                params.actives_replicate_all,
                version,
            ),
        }
    }

    /// Builds both rings from a directory snapshot.
    pub fn from_directory(dir: &NodeDirectory, params: RingParams) -> Self {
        Self::new(
            dir.actives().keys().cloned(),
            dir.reconfigurators().keys().cloned(),
            params,
            dir.version(),
        )
    }
}

/// Shared, swappable handle to the current rings and the directory they
/// were derived from. Readers grab an `Arc` snapshot and never see a
/// half-built ring; writers publish a whole new `NodeRings`.
#[derive(Debug)]
pub struct RingView {
    current: RwLock<Arc<NodeRings>>,
    directory: RwLock<Arc<NodeDirectory>>,
    params: RingParams,
}

impl RingView {
    /// View over explicitly built rings, with no node addresses known.
    pub fn new(rings: NodeRings, params: RingParams) -> Self {
        RingView {
            current: RwLock::new(Arc::new(rings)),
            directory: RwLock::new(Arc::new(NodeDirectory::new())),
            params,
        }
    }

    /// View over the rings of a directory.
    pub fn from_directory(dir: NodeDirectory, params: RingParams) -> Self {
        RingView {
            current: RwLock::new(Arc::new(NodeRings::from_directory(&dir, params))),
            directory: RwLock::new(Arc::new(dir)),
            params,
        }
    }

    /// Current rings snapshot.
    pub fn current(&self) -> Arc<NodeRings> {
        match self.current.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Directory the current rings were derived from.
    pub fn directory(&self) -> Arc<NodeDirectory> {
        match self.directory.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Membership version of the current rings.
    pub fn version(&self) -> u64 {
        self.current().actives.version()
    }

    /// Publishes a new rings snapshot.
    pub fn publish(&self, rings: NodeRings) {
        let rings = Arc::new(rings);
        match self.current.write() {
            Ok(mut guard) => *guard = rings,
            Err(poisoned) => *poisoned.into_inner() = rings,
        }
    }

    /// Re-derives both rings after a membership change and keeps `dir` as
    /// the current directory. Returns false if the directory version is not
    /// newer than the current rings'.
    pub fn refresh(&self, dir: &NodeDirectory) -> bool {
        if dir.version() <= self.version() {
            return false;
        }
        let dir = Arc::new(dir.clone());
        match self.directory.write() {
            Ok(mut guard) => *guard = dir.clone(),
            Err(poisoned) => *poisoned.into_inner() = dir.clone(),
        }
        self.publish(NodeRings::from_directory(&dir, self.params));
        pf_info!("rings refreshed to version {}", dir.version());
        true
    }
}
