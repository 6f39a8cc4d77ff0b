//! Lifecycle drainer for long-lived components.
//!
//! A [`Drainer`] hands out [`DrainerLock`] handles to in-flight operations
//! (spawned watcher tasks, lifecycle loops). [`Drainer::drain`] suspends
//! until every handle has been dropped, so a component can guarantee that no
//! callback outlives it. Mailbox handles must be destroyed before their
//! owner drains, which in Rust falls out of field declaration order.

use parking_lot::Mutex;
use tokio::sync::mpsc;

/// Blocks component teardown until all outstanding handles are released.
pub struct Drainer {
    /// Source of new handles; `None` once draining has begun.
    keep: Mutex<Option<mpsc::Sender<()>>>,
    /// Completion side; yields `None` when the last handle drops.
    closed: tokio::sync::Mutex<mpsc::Receiver<()>>,
}

/// A handle proving its holder may still run against the owning component.
#[derive(Clone)]
pub struct DrainerLock(mpsc::Sender<()>);

impl Drainer {
    /// Creates a drainer with no outstanding handles.
    #[must_use]
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(1);
        Self {
            keep: Mutex::new(Some(tx)),
            closed: tokio::sync::Mutex::new(rx),
        }
    }

    /// Acquires a handle, or `None` if draining has already begun.
    #[must_use]
    pub fn lock(&self) -> Option<DrainerLock> {
        self.keep.lock().as_ref().cloned().map(DrainerLock)
    }

    /// Stops handing out new handles and waits for outstanding ones to drop.
    ///
    /// Safe to call more than once; later calls return immediately.
    pub async fn drain(&self) {
        let mut closed = self.closed.lock().await;
        *self.keep.lock() = None;
        while closed.recv().await.is_some() {}
    }
}

impl Default for Drainer {
    fn default() -> Self {
        Self::new()
    }
}

// ===========================================================================
// Tests
// ===========================================================================
