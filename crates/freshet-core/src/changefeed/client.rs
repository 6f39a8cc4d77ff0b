//! Client registry: the per-node entry point for changefeed queries.
//!
//! A [`FeedRegistry`] keeps at most one [`Feed`] per table so that any
//! number of concurrent queries produces a single cluster subscription per
//! server. `new_feed` attaches to an existing feed under the read lock;
//! creation upgrades to the write lock and holds it across the cluster
//! read, which is what prevents two feeds (and double delivery) for one
//! table. The cost scales with the number of distinct tables, not the
//! number of subscriptions.

use std::sync::Arc;

use async_trait::async_trait;
use fxhash::FxHashMap;
use tokio::sync::RwLock;

use crate::changefeed::feed::{Feed, FeedConfig};
use crate::changefeed::keyspec::Keyspec;
use crate::changefeed::sub::ChangeStream;
use crate::changefeed::{ChangefeedError, ServerId, TableId};
use crate::datum::Region;
use crate::fabric::{Drainer, MailboxAddr, MailboxManager};

// ---------------------------------------------------------------------------
// Namespace collaborator
// ---------------------------------------------------------------------------

/// Resolves tables to their shard sets; supplied by the cluster metadata
/// layer.
#[async_trait]
pub trait NamespaceSource: Send + Sync {
    /// Resolves `table` to its primary-key field and covering shards.
    ///
    /// # Errors
    ///
    /// [`ChangefeedError::TableUnavailable`] when the table is unknown or
    /// currently unreachable.
    async fn resolve(&self, table: TableId) -> Result<NamespaceAccess, ChangefeedError>;
}

/// A resolved table.
#[derive(Debug, Clone)]
pub struct NamespaceAccess {
    /// Name of the primary-key field in row values.
    pub pkey: String,
    /// The shards covering the table.
    pub shards: Vec<ShardAccess>,
}

/// Access point of one shard's broadcaster.
#[derive(Debug, Clone)]
pub struct ShardAccess {
    /// The shard's server identity.
    pub server: ServerId,
    /// Region of the primary keyspace the shard owns.
    pub region: Region,
    /// The server's registration mailbox.
    pub register_addr: MailboxAddr,
    /// The server's stop mailbox, where [`crate::changefeed::Unsubscribe`]
    /// is sent.
    pub stop_addr: MailboxAddr,
}

// ---------------------------------------------------------------------------
// FeedRegistry
// ---------------------------------------------------------------------------

/// Per-node owner of all live feeds.
pub struct FeedRegistry {
    pub(crate) manager: Arc<MailboxManager>,
    pub(crate) namespace: Arc<dyn NamespaceSource>,
    pub(crate) config: FeedConfig,
    feeds: RwLock<FxHashMap<TableId, Arc<Feed>>>,
    pub(crate) drainer: Drainer,
}

impl FeedRegistry {
    /// Creates a registry for one client node.
    #[must_use]
    pub fn new(
        manager: Arc<MailboxManager>,
        namespace: Arc<dyn NamespaceSource>,
        config: FeedConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            manager,
            namespace,
            config,
            feeds: RwLock::new(FxHashMap::default()),
            drainer: Drainer::new(),
        })
    }

    /// Opens a changefeed on `table` for one query.
    ///
    /// Attaches to the table's existing feed when there is one; otherwise
    /// creates the feed, registering with every covering shard. A feed
    /// caught mid-teardown is replaced rather than attached to.
    ///
    /// # Errors
    ///
    /// [`ChangefeedError::MalformedKeyspec`] for an invalid keyspec,
    /// [`ChangefeedError::TableUnavailable`] when resolution or the stamp
    /// handshake fails, [`ChangefeedError::ShardUnreachable`] when a shard
    /// rejects registration.
    pub async fn new_feed(
        self: &Arc<Self>,
        table: TableId,
        keyspec: Keyspec,
    ) -> Result<ChangeStream, ChangefeedError> {
        keyspec.validate()?;

        // Fast path: attach under the read lock.
        {
            let feeds = self.feeds.read().await;
            if let Some(feed) = feeds.get(&table) {
                match feed.attach(keyspec.clone()) {
                    Ok(stream) => {
                        let feed = Arc::clone(feed);
                        drop(feeds);
                        feed.register_keyspec(stream.id(), &keyspec).await?;
                        return Ok(stream);
                    }
                    // The feed is tearing down; take the slow path.
                    Err(ChangefeedError::Closed) => {}
                    Err(other) => return Err(other),
                }
            }
        }

        // Slow path: re-check, then create while holding the write lock
        // across the cluster read.
        let mut feeds = self.feeds.write().await;
        if let Some(feed) = feeds.get(&table) {
            match feed.attach(keyspec.clone()) {
                Ok(stream) => {
                    let feed = Arc::clone(feed);
                    drop(feeds);
                    feed.register_keyspec(stream.id(), &keyspec).await?;
                    return Ok(stream);
                }
                Err(ChangefeedError::Closed) => {
                    feeds.remove(&table);
                }
                Err(other) => return Err(other),
            }
        }
        let (feed, stream) = Feed::create(self, table, &keyspec).await?;
        feeds.insert(table, feed);
        Ok(stream)
    }

    /// Removes the table's feed if it has no subscriptions left.
    ///
    /// Re-checks under the write lock, so a subscription attaching
    /// concurrently keeps the feed alive. Idempotent.
    pub async fn maybe_remove_feed(&self, table: TableId) {
        let feed = {
            let mut feeds = self.feeds.write().await;
            match feeds.get(&table) {
                Some(feed) if feed.live() == 0 => feeds.remove(&table),
                _ => None,
            }
        };
        if let Some(feed) = feed {
            feed.shutdown().await;
            tracing::info!(table = %table, "feed removed");
        }
    }

    /// Transfers exclusive ownership of the table's feed out of the map.
    pub async fn detach_feed(&self, table: TableId) -> Option<Arc<Feed>> {
        self.feeds.write().await.remove(&table)
    }

    /// Whether this exact feed is still the one registered for its table.
    pub(crate) async fn holds(&self, feed: &Arc<Feed>) -> bool {
        self.feeds
            .read()
            .await
            .get(&feed.table())
            .is_some_and(|registered| Arc::ptr_eq(registered, feed))
    }

    /// Number of live feeds.
    pub async fn feed_count(&self) -> usize {
        self.feeds.read().await.len()
    }

    /// Tears down every feed and waits for their background tasks.
    pub async fn shutdown(&self) {
        let feeds: Vec<Arc<Feed>> = {
            let mut map = self.feeds.write().await;
            map.drain().map(|(_, feed)| feed).collect()
        };
        for feed in feeds {
            feed.shutdown().await;
        }
        self.drainer.drain().await;
        tracing::info!("feed registry shut down");
    }
}

// ===========================================================================
// Tests
// ===========================================================================
