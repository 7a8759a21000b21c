//! Node identity, the node-address directory, and the TCP transport.

mod directory;
mod nodeid;
mod outbox;
mod transport;

pub use directory::{ClusterConfig, NodeConfigChange, NodeDirectory, Pool};
pub use nodeid::{ClientId, NodeId};
pub use outbox::peer_addrs_of;
pub use transport::{Hello, Source, TransportHub};
