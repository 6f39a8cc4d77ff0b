//! The changefeed core: live per-table streams of row-level mutations.
//!
//! Three components carry the weight:
//!
//! - [`Server`] — one per storage shard. Attached to the write pipeline, it
//!   fans mutations out to subscribed client mailboxes, assigning each
//!   client a gap-free sequence of stamps.
//! - [`Feed`] — one per (client node, table). It shares a single server
//!   subscription across every concurrent query on that table, reassembles
//!   out-of-order fabric messages back into per-server order, and pushes
//!   into per-subscription queues.
//! - [`LimitManager`] — one per ordered-prefix subscription, server-side.
//!   It maintains the top-N window over a secondary index and emits diffs
//!   as writes perturb it.
//!
//! ```text
//!  writes ─► Server ─► stamped msgs ─► fabric ─► Feed ─► ChangeStream(s)
//!               │                                  ▲
//!               └─ LimitManager diffs ─────────────┘
//! ```
//!
//! Queries enter through [`FeedRegistry::new_feed`]; the write pipeline
//! enters through [`Server::on_write`] and the limit staging/commit calls.

mod client;
mod feed;
mod keyspec;
mod limit;
mod msg;
mod server;
mod sub;

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::fabric::{FabricError, MailboxAddr};

pub use client::{FeedRegistry, NamespaceAccess, NamespaceSource, ShardAccess};
pub use feed::{Feed, FeedConfig};
pub use keyspec::{Keyspec, LimitSpec, Sorting};
pub use limit::{LimitManager, LimitReader};
pub use msg::{Msg, StampedMsg, SortKey, SubscribeReply, SubscribeRequest, Unsubscribe};
pub use server::Server;
pub use sub::{ChangeEvent, ChangeStream};

/// Address of a feed's data mailbox, as registered with servers.
pub type ClientAddr = MailboxAddr;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

macro_rules! uuid_id {
    ($(#[$doc:meta])* $name:ident, $prefix:literal) => {
        $(#[$doc])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        pub struct $name(Uuid);

        impl $name {
            /// A fresh random identifier.
            #[must_use]
            pub fn random() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "-{}"), &self.0.simple().to_string()[..8])
            }
        }
    };
}

uuid_id!(
    /// Identity of a table.
    TableId,
    "table"
);
uuid_id!(
    /// Identity of a shard's broadcaster, used for per-server ordering.
    ServerId,
    "srv"
);
uuid_id!(
    /// Identity of one query's subscription.
    SubscriptionId,
    "sub"
);

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Query-visible changefeed failures.
///
/// Each terminates the subscription it is delivered to; none affects
/// sibling subscriptions on the same feed.
#[derive(Debug, thiserror::Error)]
pub enum ChangefeedError {
    /// The subscription's queue filled faster than the query drained it.
    #[error("changefeed cache over array size limit")]
    Overflow,
    /// The table could not be resolved to any shard.
    #[error("table {0} is unavailable")]
    TableUnavailable(TableId),
    /// A shard covering the subscription stopped responding.
    #[error("shard {0} became unreachable")]
    ShardUnreachable(ServerId),
    /// The keyspec cannot describe a valid subscription.
    #[error("malformed keyspec: {0}")]
    MalformedKeyspec(String),
    /// The feed was torn down, either orderly or after an ordering fault.
    #[error("changefeed closed")]
    Closed,
    /// A fabric failure that no more specific kind describes.
    #[error(transparent)]
    Fabric(#[from] FabricError),
}
