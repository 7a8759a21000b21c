//! Node identifier type shared by both node pools.

use std::fmt;
use std::str::FromStr;

use crate::utils::ReconError;

use serde::{Deserialize, Serialize};

/// Client ID type.
pub type ClientId = u64;

/// Identifier of a server node, either an active replica or a reconfigurator.
/// Compared, hashed, and ordered by its string form, so ring placement and
/// quorum bookkeeping are independent of process-local state.
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct NodeId(String);

impl NodeId {
    /// Borrows the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for NodeId {
    type Err = ReconError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            Err(ReconError::msg("empty node ID"))
        } else if s.chars().any(|c| c.is_whitespace()) {
            Err(ReconError::msg(format!("node ID '{}' has whitespace", s)))
        } else {
            Ok(NodeId(s.into()))
        }
    }
}
