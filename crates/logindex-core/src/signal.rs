//! One-shot wake-up signal shared between producers and a sleeping loop.

use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;

/// A level-triggered wake-up flag.
///
/// `raise` marks the signal set and wakes every current waiter. A raise with
/// no waiter is remembered, so a `wait` that starts afterwards returns
/// immediately. `wait` consumes the flag on return.
#[derive(Debug, Default)]
pub struct Signal {
    set: AtomicBool,
    notify: Notify,
}

impl Signal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the signal set and wake all waiters.
    pub fn raise(&self) {
        self.set.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    /// Returns `true` if the signal is currently set.
    pub fn is_raised(&self) -> bool {
        self.set.load(Ordering::Acquire)
    }

    /// Wait until the signal is raised, then clear it.
    pub async fn wait(&self) {
        loop {
            // Register before the check so a raise between the check and the
            // await is not lost.
            let notified = self.notify.notified();
            if self.set.swap(false, Ordering::AcqRel) {
                return;
            }
            notified.await;
        }
    }
}
