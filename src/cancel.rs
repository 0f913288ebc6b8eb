//! Caller-driven cancellation for document processing.
//!
//! A [`CancelSignal`] stays with the caller; any number of [`CancelToken`]s
//! derived from it travel into the pipeline. Cancellation is observed at
//! batch boundaries and races in-flight extraction calls, so already
//! accumulated results stay intact and are returned as a partial outcome.

use tokio::sync::watch;

/// Owner side. Dropping the signal without cancelling leaves all tokens
/// permanently uncancelled.
#[derive(Debug)]
pub struct CancelSignal {
    sender: watch::Sender<bool>,
}

impl CancelSignal {
    pub fn new() -> Self {
        let (sender, _receiver) = watch::channel(false);
        Self { sender }
    }

    pub fn token(&self) -> CancelToken {
        CancelToken {
            receiver: self.sender.subscribe(),
        }
    }

    pub fn cancel(&self) {
        // Send only fails with no receivers, which still records the value.
        let _ = self.sender.send(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.sender.borrow()
    }
}

impl Default for CancelSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Borrower side, cheap to clone.
#[derive(Debug, Clone)]
pub struct CancelToken {
    receiver: watch::Receiver<bool>,
}

impl CancelToken {
    pub fn is_cancelled(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Resolve once cancellation is requested. If the signal is dropped
    /// without cancelling, this future never resolves.
    pub async fn cancelled(&mut self) {
        loop {
            if *self.receiver.borrow() {
                return;
            }
            if self.receiver.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}
