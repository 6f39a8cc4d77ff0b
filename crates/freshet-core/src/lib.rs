//! # Freshet Core
//!
//! The changefeed core of a sharded, replicated document database: ordered,
//! per-client streams of row-level mutations from storage shards to query
//! clients, across a clustered message-passing fabric.
//!
//! This crate provides:
//! - **Server broadcaster** ([`Server`]) — per-shard fanout with per-client
//!   monotonic stamps
//! - **Feed** ([`FeedRegistry`], [`Feed`]) — per-table client-side
//!   demultiplexer with per-server reassembly
//! - **Limit windows** ([`LimitManager`]) — top-N ordered-prefix windows
//!   over secondary indexes, emitting diffs on commit
//! - **Fabric facade** ([`fabric`]) — addressable mailboxes, typed send,
//!   peer-disappearance signals, lifecycle drainers
//!
//! ## Guarantees
//!
//! Per (server, client) pair, stamps are gap-free and strictly increasing;
//! a feed never delivers out of order from one server. No ordering is
//! promised across servers. The feed is live-only: events are not durable,
//! deduplicated, or replayable.
//!
//! ## Example
//!
//! ```rust,ignore
//! use freshet_core::{FeedConfig, FeedRegistry, Keyspec, Region};
//!
//! let registry = FeedRegistry::new(manager, namespace, FeedConfig::default());
//! let mut changes = registry
//!     .new_feed(table, Keyspec::Range { range: Region::all() })
//!     .await?;
//! while let Some(event) = changes.recv().await {
//!     apply(event?);
//! }
//! ```

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod changefeed;
pub mod datum;
pub mod fabric;

pub use changefeed::{
    ChangeEvent, ChangeStream, ChangefeedError, ClientAddr, Feed, FeedConfig, FeedRegistry,
    Keyspec, LimitManager, LimitReader, LimitSpec, Msg, NamespaceAccess, NamespaceSource, Server,
    ServerId, ShardAccess, SortKey, Sorting, StampedMsg, SubscriptionId, TableId,
};
pub use datum::{Datum, DatumRange, Region, StoreKey};
pub use fabric::{Fabric, MailboxAddr, MailboxManager, NodeId};

/// Result type for freshet-core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for freshet-core.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Fabric-level errors.
    #[error("fabric error: {0}")]
    Fabric(#[from] fabric::FabricError),

    /// Changefeed errors.
    #[error("changefeed error: {0}")]
    Changefeed(#[from] changefeed::ChangefeedError),
}
