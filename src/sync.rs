//! Concurrency primitives: the single-flight command lock and a cooperative
//! cancellation signal.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, trace};
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};

use crate::error::TableError;

/// Non-blocking mutual exclusion for command issuance.
///
/// The protocol is half-duplex: one command may be in flight per device.
/// Acquisition never queues; a second caller fails immediately with
/// [`TableError::CommandInProgress`] and must retry after backoff. The lock
/// is scoped per device instance, never shared process-wide.
pub struct CommandLock {
    permit: Arc<Semaphore>,
}

impl Default for CommandLock {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandLock {
    pub fn new() -> Self {
        Self {
            permit: Arc::new(Semaphore::new(1)),
        }
    }

    /// Try to take the lock for `operation`.
    ///
    /// The returned guard releases on drop, on every exit path.
    pub fn try_acquire(&self, operation: &'static str) -> Result<CommandGuard, TableError> {
        match Arc::clone(&self.permit).try_acquire_owned() {
            Ok(permit) => {
                trace!("command lock acquired by {operation}");
                Ok(CommandGuard {
                    _permit: permit,
                    operation,
                })
            }
            Err(_) => {
                debug!("command lock is busy, rejecting {operation}");
                Err(TableError::CommandInProgress { operation })
            }
        }
    }

    pub fn is_held(&self) -> bool {
        self.permit.available_permits() == 0
    }
}

/// Scoped token returned by [`CommandLock::try_acquire`].
#[derive(Debug)]
pub struct CommandGuard {
    _permit: OwnedSemaphorePermit,
    operation: &'static str,
}

impl Drop for CommandGuard {
    fn drop(&mut self) {
        trace!("command lock released by {}", self.operation);
    }
}

/// Clonable cooperative cancellation flag.
///
/// All clones observe the same state. [`CancelSignal::cancelled`] completes
/// once [`CancelSignal::cancel`] has been called, including when it was
/// called before the wait began.
#[derive(Clone, Default)]
pub struct CancelSignal {
    flag: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl CancelSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// Wait until the signal is cancelled.
    pub async fn cancelled(&self) {
        loop {
            // Register interest before checking the flag so a concurrent
            // cancel between the check and the await cannot be missed.
            let notified = self.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

impl std::fmt::Debug for CancelSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelSignal")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
