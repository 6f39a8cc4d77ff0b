//! Wire messages broadcast by servers and the registration handshake.
//!
//! Every type here is a plain serde value; [`crate::fabric::encode`] and
//! [`crate::fabric::decode`] turn them into fabric payloads. The transport
//! layer owns length-prefixing and versioning — only the logical shapes are
//! defined here.

use serde::{Deserialize, Serialize};

use crate::changefeed::keyspec::Keyspec;
use crate::changefeed::{ClientAddr, ServerId, SubscriptionId};
use crate::datum::{Datum, StoreKey};
use crate::fabric::MailboxAddr;

// ---------------------------------------------------------------------------
// SortKey
// ---------------------------------------------------------------------------

/// Ordering key of a limit-window entry.
///
/// Secondary-index value first, primary key second, so sort-key ties break
/// deterministically.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SortKey {
    /// Secondary-index value the window sorts on.
    pub secondary: Datum,
    /// Primary key of the row, the tie-breaker.
    pub primary: StoreKey,
}

impl SortKey {
    /// Builds a sort key.
    #[must_use]
    pub fn new(secondary: Datum, primary: StoreKey) -> Self {
        Self { secondary, primary }
    }
}

// ---------------------------------------------------------------------------
// Msg / StampedMsg
// ---------------------------------------------------------------------------

/// The unit a server broadcasts to subscribed clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Msg {
    /// The server is shutting this subscription down.
    Stop,
    /// A point mutation. A missing side denotes insert or delete.
    Change {
        /// Row value before the mutation.
        old_val: Option<Datum>,
        /// Row value after the mutation.
        new_val: Option<Datum>,
    },
    /// Initial snapshot of a limit subscription's window.
    LimitStart {
        /// Subscription the snapshot belongs to.
        sub: SubscriptionId,
        /// Window contents in sort order, at most the window size.
        start_data: Vec<(SortKey, Datum)>,
    },
    /// A diff on a limit window: delete `old_key`, insert `new_val`.
    LimitChange {
        /// Subscription owning the window.
        sub: SubscriptionId,
        /// Sort key of the entry leaving the window, if any.
        old_key: Option<SortKey>,
        /// Entry joining the window, if any.
        new_val: Option<(SortKey, Datum)>,
    },
}

impl Msg {
    /// A point-mutation message.
    #[must_use]
    pub fn change(old_val: Option<Datum>, new_val: Option<Datum>) -> Self {
        Self::Change { old_val, new_val }
    }
}

/// The wire form of a broadcast: who sent it and where it sits in that
/// server's per-client sequence.
///
/// Stamps are strictly increasing and gap-free per (server, client).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StampedMsg {
    /// Originating server.
    pub server: ServerId,
    /// Position in the per-client sequence.
    pub stamp: u64,
    /// Payload.
    pub msg: Msg,
}

// ---------------------------------------------------------------------------
// Registration handshake
// ---------------------------------------------------------------------------

/// Sent to a server's registration mailbox to subscribe a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscribeRequest {
    /// The feed's data mailbox, where stamped messages should go.
    pub client_addr: ClientAddr,
    /// Where to send the [`SubscribeReply`]; `None` when the client already
    /// tracks this server's stamps.
    pub reply_addr: Option<MailboxAddr>,
    /// The subscription being registered (used by limit registrations).
    pub sub: SubscriptionId,
    /// What the subscription watches.
    pub keyspec: Keyspec,
}

/// The server's answer to a [`SubscribeRequest`].
///
/// Receiving it also confirms the server holds a client entry for the
/// requesting address.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SubscribeReply {
    /// Identity of the answering server.
    pub server: ServerId,
    /// First stamp the client must expect from this server.
    pub stamp: u64,
}

/// Sent to a server's stop mailbox to drop a client.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Unsubscribe {
    /// The client entry to remove.
    pub client_addr: ClientAddr,
}

// ===========================================================================
// Tests
// ===========================================================================
