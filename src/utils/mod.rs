//! Helper utilities, functions, and macros.

#[macro_use]
mod print;

#[macro_use]
mod config;

mod error;
mod safetcp;
mod timer;

pub use error::ReconError;
pub use print::{logger_init, ME};
pub use timer::Timer;

pub(crate) use safetcp::{
    safe_tcp_read, tcp_bind_with_retry, tcp_connect_with_retry, tcp_write_obj,
};

/// Milliseconds elapsed since the UNIX epoch, used to stamp demand
/// observations. Clamps to 0 if the system clock is before the epoch.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
