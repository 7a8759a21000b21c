//! Reconfiguration records: the per-name state machine, its store, and the
//! durable backends behind it.

mod backend;
mod record;
mod store;

pub use backend::{MemoryBackend, RecordBackend, WalBackend};
pub use record::{RecordState, ReconfigurationRecord};
pub use store::RecordStore;
