//! Single-use completion slot notifying an upper layer that a request has
//! been applied.

use crate::packets::AppReply;
use crate::utils::ReconError;

use tokio::sync::oneshot;

/// Sending half of a one-shot completion. Fulfilling it twice is an error.
#[derive(Debug)]
pub struct Completion {
    tx: Option<oneshot::Sender<AppReply>>,
    fulfilled: bool,
}

impl Completion {
    /// Creates a completion slot and the receiver that observes it. If the
    /// slot is dropped unfulfilled, the receiver sees a closed channel,
    /// meaning "not handled".
    pub fn new() -> (Self, oneshot::Receiver<AppReply>) {
        let (tx, rx) = oneshot::channel();
        (
            Completion {
                tx: Some(tx),
                fulfilled: false,
            },
            rx,
        )
    }

    /// A slot nobody listens to.
    pub fn detached() -> Self {
        Completion {
            tx: None,
            fulfilled: false,
        }
    }

    /// Delivers the reply. A receiver that has gone away is not an error; a
    /// second fulfillment is.
    pub fn fulfill(&mut self, reply: AppReply) -> Result<(), ReconError> {
        if self.fulfilled {
            return Err(ReconError::msg(format!(
                "completion of request {} fulfilled twice",
                reply.id
            )));
        }
        self.fulfilled = true;
        if let Some(tx) = self.tx.take() {
            if tx.send(reply).is_err() {
                pf_debug!("completion receiver already dropped");
            }
        }
        Ok(())
    }
}
