//! Node-address directory covering both node pools, and the cluster TOML
//! file it is loaded from.

use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;

use crate::node::NodeId;
use crate::utils::ReconError;

use serde::{Deserialize, Serialize};

/// Which pool a node belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pool {
    /// Serves application requests.
    Active,
    /// Coordinates group membership.
    Reconfigurator,
}

/// Mapping from node ID to network endpoint, for both pools. Every
/// membership change bumps `version`, which rings carry along.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDirectory {
    /// Membership version.
    version: u64,

    /// Active replica pool.
    actives: BTreeMap<NodeId, SocketAddr>,

    /// Reconfigurator pool.
    reconfigurators: BTreeMap<NodeId, SocketAddr>,
}

impl NodeDirectory {
    /// Creates an empty directory at version 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a directory from a parsed cluster file, at the file's
    /// `config_version`.
    pub fn from_cluster(cluster: &ClusterConfig) -> Result<Self, ReconError> {
        let mut dir = NodeDirectory::new();
        for (id, addr) in &cluster.actives {
            dir.add_active(id.parse()?, addr.parse()?)?;
        }
        for (id, addr) in &cluster.reconfigurators {
            dir.add_reconfigurator(id.parse()?, addr.parse()?)?;
        }
        dir.version = cluster.config_version;
        Ok(dir)
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn actives(&self) -> &BTreeMap<NodeId, SocketAddr> {
        &self.actives
    }

    pub fn reconfigurators(&self) -> &BTreeMap<NodeId, SocketAddr> {
        &self.reconfigurators
    }

    /// Adds an active replica. A node ID may live in only one pool.
    pub fn add_active(
        &mut self,
        id: NodeId,
        addr: SocketAddr,
    ) -> Result<(), ReconError> {
        if self.reconfigurators.contains_key(&id) {
            return Err(ReconError::msg(format!(
                "node {} already a reconfigurator",
                id
            )));
        }
        self.actives.insert(id, addr);
        self.version += 1;
        Ok(())
    }

    /// Adds a reconfigurator. A node ID may live in only one pool.
    pub fn add_reconfigurator(
        &mut self,
        id: NodeId,
        addr: SocketAddr,
    ) -> Result<(), ReconError> {
        if self.actives.contains_key(&id) {
            return Err(ReconError::msg(format!(
                "node {} already an active replica",
                id
            )));
        }
        self.reconfigurators.insert(id, addr);
        self.version += 1;
        Ok(())
    }

    /// Removes an active replica; returns whether it was present.
    pub fn remove_active(&mut self, id: &NodeId) -> bool {
        let removed = self.actives.remove(id).is_some();
        if removed {
            self.version += 1;
        }
        removed
    }

    /// Removes a reconfigurator; returns whether it was present.
    pub fn remove_reconfigurator(&mut self, id: &NodeId) -> bool {
        let removed = self.reconfigurators.remove(id).is_some();
        if removed {
            self.version += 1;
        }
        removed
    }

    /// Which pool `id` is in, if any.
    pub fn pool_of(&self, id: &NodeId) -> Option<Pool> {
        if self.actives.contains_key(id) {
            Some(Pool::Active)
        } else if self.reconfigurators.contains_key(id) {
            Some(Pool::Reconfigurator)
        } else {
            None
        }
    }

    /// Network endpoint of any node.
    pub fn addr_of(&self, id: &NodeId) -> Option<SocketAddr> {
        self.actives
            .get(id)
            .or_else(|| self.reconfigurators.get(id))
            .copied()
    }

    /// Endpoints of every node in both pools.
    pub fn all_addrs(&self) -> BTreeMap<NodeId, SocketAddr> {
        self.actives
            .iter()
            .chain(self.reconfigurators.iter())
            .map(|(id, addr)| (id.clone(), *addr))
            .collect()
    }

    /// Directory after `change`, one version past this one. Removals go
    /// first, so a node can move between pools in one change. Fails if
    /// either pool would end up empty.
    pub fn apply(&self, change: &NodeConfigChange) -> Result<Self, ReconError> {
        let mut next = self.clone();
        for id in &change.remove_actives {
            next.actives.remove(id);
        }
        for id in &change.remove_reconfigurators {
            next.reconfigurators.remove(id);
        }
        for (id, addr) in &change.add_actives {
            next.add_active(id.clone(), *addr)?;
        }
        for (id, addr) in &change.add_reconfigurators {
            next.add_reconfigurator(id.clone(), *addr)?;
        }
        if next.actives.is_empty() || next.reconfigurators.is_empty() {
            return Err(ReconError::msg("node config change empties a pool"));
        }
        next.version = self.version + 1;
        Ok(next)
    }
}

/// Requested change of the node pools.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfigChange {
    pub add_actives: BTreeMap<NodeId, SocketAddr>,
    pub remove_actives: BTreeSet<NodeId>,
    pub add_reconfigurators: BTreeMap<NodeId, SocketAddr>,
    pub remove_reconfigurators: BTreeSet<NodeId>,
}

impl NodeConfigChange {
    pub fn is_empty(&self) -> bool {
        self.add_actives.is_empty()
            && self.remove_actives.is_empty()
            && self.add_reconfigurators.is_empty()
            && self.remove_reconfigurators.is_empty()
    }
}

/// Cluster file contents, e.g.:
///
/// ```toml
/// replication_factor = 3
///
/// [actives]
/// AR0 = "127.0.0.1:52700"
///
/// [reconfigurators]
/// RC0 = "127.0.0.1:52800"
///
/// [reconfigurator]
/// stop_ack_quorum = "all"
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClusterConfig {
    /// Size of a name's reconfigurator group and default active group.
    #[serde(default = "default_replication_factor")]
    pub replication_factor: usize,

    /// Virtual points per node on each ring.
    #[serde(default = "default_virtual_nodes")]
    pub virtual_nodes: usize,

    /// Membership version the listed pools stand for. A node started after
    /// runtime node-config changes takes the version it was written at.
    #[serde(default = "default_config_version")]
    pub config_version: u64,

    /// If true, every name's default active group is the whole active pool.
    #[serde(default)]
    pub actives_replicate_all: bool,

    /// Active replica pool: ID -> "ip:port".
    #[serde(default)]
    pub actives: BTreeMap<String, String>,

    /// Reconfigurator pool: ID -> "ip:port".
    #[serde(default)]
    pub reconfigurators: BTreeMap<String, String>,

    /// Role config overrides for active replicas.
    pub active: Option<toml::Table>,

    /// Role config overrides for reconfigurators.
    pub reconfigurator: Option<toml::Table>,
}

fn default_replication_factor() -> usize {
    3
}

fn default_virtual_nodes() -> usize {
    16
}

fn default_config_version() -> u64 {
    1
}

impl ClusterConfig {
    /// Parses a cluster file's contents.
    pub fn parse(content: &str) -> Result<Self, ReconError> {
        let cluster: ClusterConfig = toml::from_str(content)?;
        if cluster.replication_factor == 0 {
            return Err(ReconError::msg("replication_factor must be positive"));
        }
        if cluster.virtual_nodes == 0 {
            return Err(ReconError::msg("virtual_nodes must be positive"));
        }
        if cluster.config_version == 0 {
            return Err(ReconError::msg("config_version must be positive"));
        }
        Ok(cluster)
    }

    /// Role-specific config TOML string for the given pool, if any.
    pub fn role_config(&self, pool: Pool) -> Option<String> {
        match pool {
            Pool::Active => self.active.as_ref().map(|t| t.to_string()),
            Pool::Reconfigurator => {
                self.reconfigurator.as_ref().map(|t| t.to_string())
            }
        }
    }
}

#[cfg(test)]
mod directory_tests {
    use super::*;

    const CLUSTER: &str = r#"
        replication_factor = 2

        [actives]
        AR0 = "127.0.0.1:52700"
        AR1 = "127.0.0.1:52701"

        [reconfigurators]
        RC0 = "127.0.0.1:52800"

        [reconfigurator]
        stop_ack_quorum = "all"
    "#;

    #[test]
    fn load_cluster() -> Result<(), ReconError> {
        let cluster = ClusterConfig::parse(CLUSTER)?;
        assert_eq!(cluster.replication_factor, 2);
        assert_eq!(cluster.virtual_nodes, 16);
        let dir = NodeDirectory::from_cluster(&cluster)?;
        assert_eq!(dir.actives().len(), 2);
        assert_eq!(dir.reconfigurators().len(), 1);
        assert_eq!(dir.version(), 1);
        assert_eq!(dir.pool_of(&"RC0".parse()?), Some(Pool::Reconfigurator));
        assert_eq!(dir.addr_of(&"AR1".parse()?), Some("127.0.0.1:52701".parse()?));
        let rc_config = cluster.role_config(Pool::Reconfigurator);
        assert!(rc_config.is_some_and(|s| s.contains("stop_ack_quorum")));
        assert!(cluster.role_config(Pool::Active).is_none());
        Ok(())
    }

    #[test]
    fn membership_versions() -> Result<(), ReconError> {
        let mut dir = NodeDirectory::new();
        dir.add_active("AR0".parse()?, "127.0.0.1:52700".parse()?)?;
        assert!(dir
            .add_reconfigurator("AR0".parse()?, "127.0.0.1:52800".parse()?)
            .is_err());
        assert!(dir.remove_active(&"AR0".parse()?));
        assert!(!dir.remove_active(&"AR0".parse()?));
        assert_eq!(dir.version(), 2);
        assert_eq!(dir.pool_of(&"AR0".parse()?), None);
        Ok(())
    }

    #[test]
    fn apply_change() -> Result<(), ReconError> {
        let dir = NodeDirectory::from_cluster(&ClusterConfig::parse(CLUSTER)?)?;
        let mut change = NodeConfigChange::default();
        change.add_actives.insert("AR2".parse()?, "127.0.0.1:52702".parse()?);
        change.remove_actives.insert("AR0".parse()?);
        let next = dir.apply(&change)?;
        assert_eq!(next.version(), dir.version() + 1);
        assert_eq!(next.pool_of(&"AR0".parse()?), None);
        assert_eq!(next.pool_of(&"AR2".parse()?), Some(Pool::Active));
        assert_eq!(dir.pool_of(&"AR0".parse()?), Some(Pool::Active));

        // moving a node across pools in one change
        let mut change = NodeConfigChange::default();
        change.remove_actives.insert("AR1".parse()?);
        change.add_reconfigurators.insert("AR1".parse()?, "127.0.0.1:52801".parse()?);
        let moved = next.apply(&change)?;
        assert_eq!(moved.pool_of(&"AR1".parse()?), Some(Pool::Reconfigurator));

        let mut change = NodeConfigChange::default();
        change.remove_reconfigurators.insert("RC0".parse()?);
        assert!(dir.apply(&change).is_err());
        Ok(())
    }

    #[test]
    fn reject_unknown_key() {
        assert!(ClusterConfig::parse("bogus = 1").is_err());
    }
}
