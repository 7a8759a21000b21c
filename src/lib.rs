//! Public interface to the gigarecon core library, linked by both the
//! server executable and the client CLI.
//!
//! Gigarecon is the reconfiguration subsystem of a name service: it moves a
//! service name's replica group across epochs (create, migrate, resize,
//! delete) without losing state or serving stale epochs.

#[macro_use]
mod utils;

pub mod active;
pub mod app;
pub mod client;
pub mod coordinator;
pub mod demand;
pub mod node;
pub mod packets;
pub mod protask;
pub mod reconfigurator;
pub mod records;
pub mod ring;

#[cfg(test)]
mod testkit;

// Helper utilities, functions, and macros
#[doc(inline)]
pub use crate::utils::{logger_init, now_millis, ReconError, Timer, ME};

// Node identity, directory, and transport
#[doc(inline)]
pub use crate::node::{
    ClientId, ClusterConfig, Hello, NodeConfigChange, NodeDirectory, NodeId,
    Pool, Source, TransportHub,
};

// Wire messages
#[doc(inline)]
pub use crate::packets::{
    AppOp, AppReply, AppRequest, Envelope, Epoch, PacketType, ReconMsg,
    Requester,
};

// Node cores and runtimes
#[doc(inline)]
pub use crate::active::{ActiveReplica, ActiveReplicaConfig, ActiveReplicaNode};
#[doc(inline)]
pub use crate::reconfigurator::{
    Reconfigurator, ReconfiguratorConfig, ReconfiguratorNode,
};

// Client-side stub
#[doc(inline)]
pub use crate::client::ReconClient;

/// Common interface of the two node runtimes.
#[async_trait::async_trait]
pub trait GenericNode {
    /// Main event loop; returns when `rx_term` signals termination.
    async fn run(
        &mut self,
        rx_term: tokio::sync::watch::Receiver<bool>,
    ) -> Result<(), ReconError>;

    /// My node ID.
    fn id(&self) -> &NodeId;
}
