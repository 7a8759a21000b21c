//! Placement policies choosing the active replicas of a name's next epoch.

use std::collections::BTreeSet;

use crate::node::NodeId;
use crate::reconfigurator::ReconfiguratorConfig;
use crate::records::ReconfigurationRecord;
use crate::ring::NodeRings;
use crate::utils::ReconError;

/// Chooses the next epoch's active replica set of a record.
pub trait PlacementPolicy: Send {
    fn choose(
        &self,
        record: &ReconfigurationRecord,
        rings: &NodeRings,
    ) -> BTreeSet<NodeId>;
}

/// Keeps the current group unchanged.
#[derive(Debug, Default)]
pub struct KeepCurrent;

impl PlacementPolicy for KeepCurrent {
    fn choose(
        &self,
        record: &ReconfigurationRecord,
        _rings: &NodeRings,
    ) -> BTreeSet<NodeId> {
        record.active_replicas.clone()
    }
}

/// Sizes the group by the read/write mix and fills it with the replicas
/// that received the most requests, then current members, then the rest of
/// the pool in ring order. Read-heavy names get more replicas.
#[derive(Debug)]
pub struct DemandVotes {
    pub min_replicas: usize,
    pub max_replicas: usize,
}

impl DemandVotes {
    /// Target group size within `[min_replicas, max_replicas]`, capped by the
    /// pool size.
    fn target_size(&self, record: &ReconfigurationRecord, pool: usize) -> usize {
        let stats = &record.demand.stats;
        let want = if stats.update_count == 0 {
            self.max_replicas
        } else {
            stats.lookup_count.div_ceil(stats.update_count) as usize
        };
        want.clamp(self.min_replicas, self.max_replicas).min(pool)
    }
}

impl PlacementPolicy for DemandVotes {
    fn choose(
        &self,
        record: &ReconfigurationRecord,
        rings: &NodeRings,
    ) -> BTreeSet<NodeId> {
        let pool = rings.actives.nodes();
        let size = self.target_size(record, pool.len());
        let candidates = record
            .demand
            .stats
            .ranked_voters()
            .into_iter()
            .chain(record.active_replicas.iter().cloned())
            .chain(rings.actives.ring_order(&record.name));

        let mut chosen = BTreeSet::new();
        for node in candidates {
            if chosen.len() >= size {
                break;
            }
            if pool.contains(&node) {
                chosen.insert(node);
            }
        }
        chosen
    }
}

/// Creates the placement policy named by the config.
pub(super) fn new_policy(
    config: &ReconfiguratorConfig,
) -> Result<Box<dyn PlacementPolicy>, ReconError> {
    match config.placement.as_str() {
        "KeepCurrent" => Ok(Box::new(KeepCurrent)),
        "DemandVotes" => {
            if config.min_replicas == 0 || config.min_replicas > config.max_replicas {
                return logged_err!(
                    "invalid config.min_replicas '{}' / max_replicas '{}'",
                    config.min_replicas,
                    config.max_replicas
                );
            }
            Ok(Box::new(DemandVotes {
                min_replicas: config.min_replicas,
                max_replicas: config.max_replicas,
            }))
        }
        other => logged_err!("invalid config.placement '{}'", other),
    }
}
