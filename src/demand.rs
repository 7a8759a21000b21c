//! Per-name demand profiling. Active replicas accumulate `DemandStats` per
//! name and flush them as reports; reconfigurators merge the reports into a
//! `StoredDemand` that decides when demand justifies a reconfiguration.

use std::collections::{BTreeMap, HashMap};

use crate::node::NodeId;

use serde::{Deserialize, Serialize};

/// Weight given to the newest sample in the inter-arrival moving average.
const INTER_ARRIVAL_ALPHA: f64 = 0.125;

/// Mergeable request statistics of one name over some window.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DemandStats {
    /// Requests observed in this window.
    pub num_requests: u64,

    /// Read-only requests among them.
    pub lookup_count: u64,

    /// Mutating requests among them.
    pub update_count: u64,

    /// Moving average of request inter-arrival time in milliseconds.
    pub inter_arrival_ms: f64,

    /// Timestamp of the latest request, in ms since the UNIX epoch.
    pub last_request_ms: u64,

    /// Request count per active replica that received them; used as
    /// locality votes by demand-driven placement.
    pub votes: BTreeMap<NodeId, u64>,
}

impl DemandStats {
    /// Records one request received by `receiver` at `now_ms`.
    pub fn register(&mut self, is_update: bool, receiver: &NodeId, now_ms: u64) {
        if self.num_requests > 0 {
            let gap = now_ms.saturating_sub(self.last_request_ms) as f64;
            self.inter_arrival_ms = if self.num_requests == 1 {
                gap
            } else {
                (1.0 - INTER_ARRIVAL_ALPHA) * self.inter_arrival_ms
                    + INTER_ARRIVAL_ALPHA * gap
            };
        }
        self.num_requests = self.num_requests.saturating_add(1);
        if is_update {
            self.update_count = self.update_count.saturating_add(1);
        } else {
            self.lookup_count = self.lookup_count.saturating_add(1);
        }
        self.last_request_ms = self.last_request_ms.max(now_ms);
        let votes = self.votes.entry(receiver.clone()).or_insert(0);
        *votes = votes.saturating_add(1);
    }

    /// Merges another window into this one. Counts saturate, since reports
    /// arrive from the network.
    pub fn combine(&mut self, other: &DemandStats) {
        let total = self.num_requests.saturating_add(other.num_requests);
        if total > 0 && other.inter_arrival_ms.is_finite() {
            self.inter_arrival_ms = (self.inter_arrival_ms
                * self.num_requests as f64
                + other.inter_arrival_ms * other.num_requests as f64)
                / total as f64;
        }
        self.num_requests = total;
        self.lookup_count = self.lookup_count.saturating_add(other.lookup_count);
        self.update_count = self.update_count.saturating_add(other.update_count);
        self.last_request_ms = self.last_request_ms.max(other.last_request_ms);
        for (node, count) in &other.votes {
            let votes = self.votes.entry(node.clone()).or_insert(0);
            *votes = votes.saturating_add(*count);
        }
    }

    /// Nodes ordered by descending vote count, ties by node ID.
    pub fn ranked_voters(&self) -> Vec<NodeId> {
        let mut voters: Vec<(&NodeId, &u64)> = self.votes.iter().collect();
        voters.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
        voters.into_iter().map(|(node, _)| node.clone()).collect()
    }
}

/// Per-node demand profiler kept by an active replica.
#[derive(Debug, Default)]
pub struct DemandProfiler {
    /// Report once a name has seen this many requests since its last report.
    report_threshold: u64,

    /// Map from name -> stats accumulated since its last report.
    profiles: HashMap<String, DemandStats>,
}

impl DemandProfiler {
    pub fn new(report_threshold: u64) -> Self {
        DemandProfiler {
            report_threshold: report_threshold.max(1),
            profiles: HashMap::new(),
        }
    }

    /// Records one request for `name`.
    pub fn register(
        &mut self,
        name: &str,
        is_update: bool,
        receiver: &NodeId,
        now_ms: u64,
    ) {
        self.profiles
            .entry(name.into())
            .or_default()
            .register(is_update, receiver, now_ms);
    }

    /// True if enough demand has accumulated for `name` to report it.
    pub fn should_report(&self, name: &str) -> bool {
        self.profiles
            .get(name)
            .is_some_and(|p| p.num_requests >= self.report_threshold)
    }

    /// Takes the accumulated stats of `name`, resetting its window.
    pub fn pluck(&mut self, name: &str) -> Option<DemandStats> {
        self.profiles.remove(name)
    }

    /// Drops the window of a name I no longer serve.
    pub fn forget(&mut self, name: &str) {
        self.profiles.remove(name);
    }

    /// Number of names with an open window.
    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }

    /// Peeks at the accumulated stats of `name`.
    pub fn profile(&self, name: &str) -> Option<&DemandStats> {
        self.profiles.get(name)
    }
}

/// Thresholds for turning merged demand into a reconfiguration.
#[derive(Debug, Clone, Copy)]
pub struct TriggerPolicy {
    /// Requests needed since the last reconfiguration.
    pub reconfigure_threshold: u64,

    /// Minimum time between two reconfigurations of the same name.
    pub min_interval_ms: u64,
}

/// Demand persisted with a reconfiguration record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoredDemand {
    /// All reports merged so far.
    pub stats: DemandStats,

    /// `stats.num_requests` when the last reconfiguration was initiated.
    pub total_at_last_reconfig: u64,

    /// When the last reconfiguration was initiated; 0 if never.
    pub last_reconfig_ms: u64,
}

impl StoredDemand {
    /// Merges a report and returns whether the accumulated demand now
    /// justifies a reconfiguration.
    pub fn merge(
        &mut self,
        report: &DemandStats,
        now_ms: u64,
        policy: &TriggerPolicy,
    ) -> bool {
        self.stats.combine(report);
        self.stats
            .num_requests
            .saturating_sub(self.total_at_last_reconfig)
            >= policy.reconfigure_threshold
            && now_ms.saturating_sub(self.last_reconfig_ms)
                >= policy.min_interval_ms
    }

    /// Resets the trigger baselines when a reconfiguration is initiated.
    pub fn mark_reconfigured(&mut self, now_ms: u64) {
        self.total_at_last_reconfig = self.stats.num_requests;
        self.last_reconfig_ms = now_ms;
    }
}
