//! The per-query view into a feed: a lazy stream of change events.
//!
//! A [`ChangeStream`] owns a bounded queue the feed pushes into. When the
//! feed must terminate the subscription abnormally it parks the reason in
//! the stream's error slot and closes the queue; the stream drains what was
//! already delivered, yields the error once, and ends. A graceful `Stop`
//! closes the queue with the slot empty, so the stream simply ends.
//!
//! Dropping the stream unsubscribes it from its feed, which may trigger
//! feed teardown when it was the last one.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::Stream;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::changefeed::msg::SortKey;
use crate::changefeed::{ChangefeedError, SubscriptionId};
use crate::datum::Datum;

/// Slot where the feed parks a terminal error for the stream to yield
/// after its queue drains.
pub(crate) type ErrorSlot = Arc<Mutex<Option<ChangefeedError>>>;

// ---------------------------------------------------------------------------
// ChangeEvent
// ---------------------------------------------------------------------------

/// A change delivered to one subscription.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeEvent {
    /// A point mutation visible to the subscription's keyspec.
    Change {
        /// Row value before the mutation.
        old_val: Option<Datum>,
        /// Row value after the mutation.
        new_val: Option<Datum>,
    },
    /// Initial contents of a limit window, in sort order.
    LimitStart {
        /// `(sort_key, row)` pairs, at most the window size.
        data: Vec<(SortKey, Datum)>,
    },
    /// A diff on a limit window.
    LimitChange {
        /// Entry leaving the window, if any.
        old_key: Option<SortKey>,
        /// Entry joining the window, if any.
        new_val: Option<(SortKey, Datum)>,
    },
}

// ---------------------------------------------------------------------------
// ChangeStream
// ---------------------------------------------------------------------------

/// A query's subscription to a table's changefeed.
///
/// Yields `Result<ChangeEvent, ChangefeedError>`; at most one `Err` is ever
/// produced, immediately before the stream ends.
pub struct ChangeStream {
    id: SubscriptionId,
    rx: mpsc::Receiver<ChangeEvent>,
    error: ErrorSlot,
    drop_tx: mpsc::UnboundedSender<SubscriptionId>,
    finished: bool,
}

impl ChangeStream {
    pub(crate) fn new(
        id: SubscriptionId,
        rx: mpsc::Receiver<ChangeEvent>,
        error: ErrorSlot,
        drop_tx: mpsc::UnboundedSender<SubscriptionId>,
    ) -> Self {
        Self {
            id,
            rx,
            error,
            drop_tx,
            finished: false,
        }
    }

    /// This subscription's identity.
    #[must_use]
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Whether the stream has ended.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Receives the next event.
    ///
    /// Returns `None` once the subscription has terminated; a terminal
    /// error is yielded as the final item before that.
    pub async fn recv(&mut self) -> Option<Result<ChangeEvent, ChangefeedError>> {
        if self.finished {
            return None;
        }
        match self.rx.recv().await {
            Some(event) => Some(Ok(event)),
            None => {
                self.finished = true;
                self.error.lock().take().map(Err)
            }
        }
    }
}

impl Stream for ChangeStream {
    type Item = Result<ChangeEvent, ChangefeedError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }
        match this.rx.poll_recv(cx) {
            Poll::Ready(Some(event)) => Poll::Ready(Some(Ok(event))),
            Poll::Ready(None) => {
                this.finished = true;
                Poll::Ready(this.error.lock().take().map(Err))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for ChangeStream {
    fn drop(&mut self) {
        // The feed may already be gone during shutdown; a dead letter here
        // is fine.
        let _ = self.drop_tx.send(self.id);
    }
}

// ===========================================================================
// Tests
// ===========================================================================
