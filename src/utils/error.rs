//! Customized unified error type.

use std::error;
use std::fmt;
use std::io;
use std::net;
use std::num;
use std::string;

/// Customized error type for gigarecon. Carries only the rendered message of
/// whatever went wrong; callers match on success/failure, not on kinds.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct ReconError(pub String);

impl ReconError {
    pub fn msg(msg: impl ToString) -> Self {
        ReconError(msg.to_string())
    }
}

impl fmt::Display for ReconError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0) // do not display literal quotes
    }
}

impl error::Error for ReconError {}

// Helper macro for saving boiler-plate `impl From<X>`s for transparent
// conversion from various common error types to `ReconError`.
macro_rules! impl_from_error {
    ($error:ty) => {
        impl From<$error> for ReconError {
            fn from(e: $error) -> Self {
                ReconError(e.to_string())
            }
        }
    };
}

// Same as above, for generic error types such as channel send errors.
macro_rules! impl_from_error_generic {
    ($error:ty) => {
        impl<T> From<$error> for ReconError {
            fn from(e: $error) -> ReconError {
                ReconError::msg(e.to_string())
            }
        }
    };
}

impl_from_error!(io::Error);
impl_from_error!(string::FromUtf8Error);
impl_from_error!(num::ParseIntError);
impl_from_error!(net::AddrParseError);
impl_from_error!(rmp_serde::encode::Error);
impl_from_error!(rmp_serde::decode::Error);
impl_from_error!(toml::ser::Error);
impl_from_error!(toml::de::Error);
impl_from_error!(ctrlc::Error);
impl_from_error!(tokio::sync::oneshot::error::RecvError);
impl_from_error!(tokio::sync::oneshot::error::TryRecvError);

impl_from_error_generic!(tokio::sync::watch::error::SendError<T>);
impl_from_error_generic!(tokio::sync::mpsc::error::SendError<T>);
