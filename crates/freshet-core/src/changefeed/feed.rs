//! Per-table demultiplexer on the query side.
//!
//! One [`Feed`] exists per (client node, table); every concurrent query on
//! that table shares it, so the cluster sees a single subscription per
//! server. The feed owns one reassembly queue per server — out-of-order
//! fabric arrivals wait in a bounded buffer until the next expected stamp
//! shows up — and routes each delivered message to the subscriptions it
//! concerns: point and range subscriptions by primary-key coverage, limit
//! subscriptions by id.
//!
//! # Bootstrap
//!
//! Creation resolves the table's shards, registers the feed's data mailbox
//! with each server, and seeds the reassembly queues from the replied
//! initial stamps. Messages racing in before all stamps are known are
//! buffered and replayed once seeding completes.
//!
//! # Failure
//!
//! Ordering faults — a reassembly buffer past its cap, a targeted message
//! for a subscription that never existed — poison the feed: every
//! subscription ends with `changefeed closed`, the feed detaches from the
//! registry and unsubscribes from its servers. The disappearance of a
//! single server only terminates the subscriptions that had no other
//! server left, with `shard unreachable`.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use fxhash::{FxHashMap, FxHashSet};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch, Notify};

use crate::changefeed::client::{FeedRegistry, ShardAccess};
use crate::changefeed::keyspec::Keyspec;
use crate::changefeed::msg::{Msg, StampedMsg, SubscribeReply, SubscribeRequest, Unsubscribe};
use crate::changefeed::sub::{ChangeEvent, ChangeStream, ErrorSlot};
use crate::changefeed::{ChangefeedError, ClientAddr, ServerId, SubscriptionId, TableId};
use crate::datum::{Datum, Region, StoreKey};
use crate::fabric::{MailboxAddr, MailboxHandle, MailboxManager};

// ---------------------------------------------------------------------------
// FeedConfig
// ---------------------------------------------------------------------------

/// Tunables for feeds and their subscriptions.
#[derive(Debug, Clone)]
pub struct FeedConfig {
    /// Queue depth of each subscription; overflowing it terminates the
    /// subscription rather than stalling its siblings.
    pub queue_capacity: usize,
    /// Maximum out-of-order messages buffered per server before the feed
    /// declares the stream broken.
    pub reorder_capacity: usize,
    /// How long feed creation waits for every shard's initial stamp.
    pub subscribe_timeout: Duration,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 32,
            reorder_capacity: 512,
            subscribe_timeout: Duration::from_secs(5),
        }
    }
}

// ---------------------------------------------------------------------------
// Internal state
// ---------------------------------------------------------------------------

/// One subscription as the feed sees it.
struct SubEntry {
    keyspec: Keyspec,
    /// Servers whose regions intersect the keyspec; emptied as servers
    /// stop, terminating the subscription with the last one.
    servers: FxHashSet<ServerId>,
    /// Delivery queue; `None` once the subscription is terminal.
    tx: Option<mpsc::Sender<ChangeEvent>>,
    error: ErrorSlot,
}

/// Reassembly and routing state for one server.
struct ServerEntry {
    stop_addr: MailboxAddr,
    register_addr: MailboxAddr,
    region: Region,
    /// Next expected stamp.
    next: u64,
    /// Out-of-order arrivals keyed by stamp, bounded by
    /// `FeedConfig::reorder_capacity`.
    pending: BTreeMap<u64, Msg>,
}

#[derive(Default)]
struct FeedState {
    subs: FxHashMap<SubscriptionId, SubEntry>,
    servers: FxHashMap<ServerId, ServerEntry>,
    /// Ids of subscriptions that once existed; late targeted messages for
    /// them are dropped instead of treated as ordering faults.
    retired: FxHashSet<SubscriptionId>,
    /// Arrivals before all initial stamps were seeded.
    buffered: Vec<StampedMsg>,
    initialized: bool,
    stopped: bool,
    /// Whether unsubscribe messages have been sent to the servers.
    unsubscribed: bool,
    /// Attached `ChangeStream`s that have not been dropped yet.
    live: usize,
}

// ---------------------------------------------------------------------------
// Feed
// ---------------------------------------------------------------------------

/// The per-(node, table) changefeed multiplexer.
pub struct Feed {
    table: TableId,
    pkey: String,
    manager: Arc<MailboxManager>,
    config: FeedConfig,
    registry: Weak<FeedRegistry>,
    shards: Vec<ShardAccess>,
    addr: ClientAddr,
    state: Mutex<FeedState>,
    drop_tx: mpsc::UnboundedSender<SubscriptionId>,
    shutdown_tx: watch::Sender<bool>,
    poison_notify: Notify,
    _mailbox: MailboxHandle,
}

impl Feed {
    /// Resolves the table, registers with every shard, seeds stamps, and
    /// attaches the first subscription.
    ///
    /// Runs under the registry's write lock so a concurrent `new_feed` for
    /// the same table cannot create a second feed.
    pub(crate) async fn create(
        registry: &Arc<FeedRegistry>,
        table: TableId,
        keyspec: &Keyspec,
    ) -> Result<(Arc<Self>, ChangeStream), ChangefeedError> {
        let access = registry.namespace.resolve(table).await?;
        if access.shards.is_empty() {
            return Err(ChangefeedError::TableUnavailable(table));
        }

        let (drop_tx, drop_rx) = mpsc::unbounded_channel();
        let manager = Arc::clone(&registry.manager);
        let config = registry.config.clone();
        let shards = access.shards.clone();

        let feed = Arc::new_cyclic(|weak| {
            let mailbox_weak: Weak<Feed> = weak.clone();
            let mailbox = manager.mailbox(move |msg: StampedMsg| {
                let feed = mailbox_weak.clone();
                async move {
                    if let Some(feed) = feed.upgrade() {
                        feed.on_msg(msg);
                    }
                }
            });
            Self {
                table,
                pkey: access.pkey.clone(),
                manager: Arc::clone(&manager),
                config,
                registry: Arc::downgrade(registry),
                shards,
                addr: mailbox.addr(),
                state: Mutex::new(FeedState::default()),
                drop_tx,
                shutdown_tx: watch::channel(false).0,
                poison_notify: Notify::new(),
                _mailbox: mailbox,
            }
        });

        let first_sub = SubscriptionId::random();
        let replies = feed.register_with_shards(first_sub, keyspec).await?;

        let attached = {
            let mut state = feed.state.lock();
            for reply in replies {
                let Some(shard) = feed.shards.iter().find(|s| s.server == reply.server) else {
                    continue;
                };
                state.servers.insert(
                    reply.server,
                    ServerEntry {
                        stop_addr: shard.stop_addr,
                        register_addr: shard.register_addr,
                        region: shard.region.clone(),
                        next: reply.stamp,
                        pending: BTreeMap::new(),
                    },
                );
            }
            let attached = feed.attach_locked(&mut state, first_sub, keyspec.clone());
            if attached.is_ok() {
                state.initialized = true;
                let buffered = std::mem::take(&mut state.buffered);
                for msg in buffered {
                    feed.process(&mut state, msg);
                }
            }
            attached
        };
        let stream = match attached {
            Ok(stream) => stream,
            Err(error) => {
                // Every shard confirmed a client entry by now; tell them all
                // to drop it again.
                let registered: Vec<&ShardAccess> = feed.shards.iter().collect();
                feed.abort_registration(&registered).await;
                return Err(error);
            }
        };

        feed.spawn_lifecycle(registry, drop_rx);
        feed.spawn_disconnect_watchers(registry);
        tracing::info!(table = %table, shards = feed.shards.len(), "feed created");
        Ok((feed, stream))
    }

    /// The table this feed multiplexes.
    #[must_use]
    pub fn table(&self) -> TableId {
        self.table
    }

    /// Number of attached, not-yet-dropped subscriptions.
    pub(crate) fn live(&self) -> usize {
        self.state.lock().live
    }

    /// Attaches a new subscription to a live feed.
    pub(crate) fn attach(&self, keyspec: Keyspec) -> Result<ChangeStream, ChangefeedError> {
        let mut state = self.state.lock();
        self.attach_locked(&mut state, SubscriptionId::random(), keyspec)
    }

    /// Extends the server-side registration for a subscription attached to
    /// a live feed: regions accumulate; a limit keyspec creates its window
    /// and snapshot.
    pub(crate) async fn register_keyspec(
        &self,
        sub: SubscriptionId,
        keyspec: &Keyspec,
    ) -> Result<(), ChangefeedError> {
        let targets: Vec<(ServerId, MailboxAddr)> = {
            let state = self.state.lock();
            let region = keyspec.to_region();
            state
                .servers
                .iter()
                .filter(|(_, entry)| entry.region.intersects(&region))
                .map(|(server, entry)| (*server, entry.register_addr))
                .collect()
        };
        for (server, register_addr) in targets {
            let request = SubscribeRequest {
                client_addr: self.addr,
                reply_addr: None,
                sub,
                keyspec: keyspec.clone(),
            };
            if let Err(error) = self.manager.send(register_addr, &request).await {
                tracing::warn!(%server, %error, "keyspec registration undeliverable");
                return Err(ChangefeedError::ShardUnreachable(server));
            }
        }
        Ok(())
    }

    /// Stops routing, unsubscribes from every server, and wakes the
    /// lifecycle task. Idempotent.
    pub(crate) async fn shutdown(&self) {
        let targets: Vec<MailboxAddr> = {
            let mut state = self.state.lock();
            if state.unsubscribed {
                Vec::new()
            } else {
                state.unsubscribed = true;
                state.stopped = true;
                let ids: Vec<_> = state.subs.keys().copied().collect();
                for id in ids {
                    state.subs.remove(&id);
                    state.retired.insert(id);
                }
                state.servers.values().map(|entry| entry.stop_addr).collect()
            }
        };
        for stop_addr in targets {
            let unsubscribe = Unsubscribe {
                client_addr: self.addr,
            };
            if let Err(error) = self.manager.send(stop_addr, &unsubscribe).await {
                tracing::debug!(%error, "unsubscribe undeliverable");
            }
        }
        let _ = self.shutdown_tx.send(true);
    }

    // --- Registration -----------------------------------------------------

    /// Sends a `SubscribeRequest` to every shard and collects one reply
    /// per shard within the configured timeout.
    ///
    /// A shard that cannot be reached, or never replies, fails the
    /// bootstrap with `shard unreachable` naming that shard. Before the
    /// error is returned, every shard the request did reach is sent an
    /// `Unsubscribe`, so a partial bootstrap leaves no client entries
    /// behind. Reply collection runs even after a send failure: a shard's
    /// reply confirms its entry exists, which makes the rollback ordered
    /// behind the registration it undoes.
    async fn register_with_shards(
        &self,
        sub: SubscriptionId,
        keyspec: &Keyspec,
    ) -> Result<Vec<SubscribeReply>, ChangefeedError> {
        let (reply_tx, mut reply_rx) = mpsc::channel::<SubscribeReply>(self.shards.len());
        let reply_mailbox = self.manager.mailbox(move |reply: SubscribeReply| {
            let tx = reply_tx.clone();
            async move {
                let _ = tx.send(reply).await;
            }
        });

        let mut contacted: Vec<&ShardAccess> = Vec::with_capacity(self.shards.len());
        let mut unreachable: Option<ServerId> = None;
        for shard in &self.shards {
            let request = SubscribeRequest {
                client_addr: self.addr,
                reply_addr: Some(reply_mailbox.addr()),
                sub,
                keyspec: keyspec.clone(),
            };
            match self.manager.send(shard.register_addr, &request).await {
                Ok(()) => contacted.push(shard),
                Err(error) => {
                    tracing::warn!(server = %shard.server, %error, "shard registration undeliverable");
                    unreachable = Some(shard.server);
                    break;
                }
            }
        }

        let deadline = tokio::time::Instant::now() + self.config.subscribe_timeout;
        let mut replies = Vec::with_capacity(contacted.len());
        let mut replied: FxHashSet<ServerId> = FxHashSet::default();
        while replies.len() < contacted.len() {
            match tokio::time::timeout_at(deadline, reply_rx.recv()).await {
                Ok(Some(reply)) => {
                    if replied.insert(reply.server) {
                        replies.push(reply);
                    }
                }
                Ok(None) | Err(_) => break,
            }
        }

        if unreachable.is_none() && replies.len() < contacted.len() {
            let missing = contacted
                .iter()
                .find(|shard| !replied.contains(&shard.server))
                .map(|shard| shard.server);
            if let Some(server) = missing {
                tracing::warn!(%server, "no subscribe reply from shard");
            }
            unreachable = missing;
        }

        if let Some(server) = unreachable {
            self.abort_registration(&contacted).await;
            return Err(ChangefeedError::ShardUnreachable(server));
        }
        Ok(replies)
    }

    /// Rolls back a failed bootstrap: every shard the registration reached
    /// may hold a client entry, so each is told to drop it. Best effort.
    async fn abort_registration(&self, shards: &[&ShardAccess]) {
        for shard in shards {
            let unsubscribe = Unsubscribe {
                client_addr: self.addr,
            };
            if let Err(error) = self.manager.send(shard.stop_addr, &unsubscribe).await {
                tracing::debug!(server = %shard.server, %error, "registration rollback undeliverable");
            }
        }
    }

    // --- Inbound path -----------------------------------------------------

    /// Data-mailbox entry point.
    fn on_msg(&self, msg: StampedMsg) {
        let mut state = self.state.lock();
        if state.stopped {
            return;
        }
        if !state.initialized {
            if state.buffered.len() >= self.config.reorder_capacity {
                self.poison(&mut state, "bootstrap buffer overflow");
                return;
            }
            state.buffered.push(msg);
            return;
        }
        self.process(&mut state, msg);
    }

    /// Runs a stamped message through the server's reassembly queue and
    /// applies everything that became contiguous.
    fn process(&self, state: &mut FeedState, stamped: StampedMsg) {
        let StampedMsg { server, stamp, msg } = stamped;
        let mut ready: Vec<Msg> = Vec::new();
        let mut broken = false;
        {
            let Some(entry) = state.servers.get_mut(&server) else {
                tracing::debug!(%server, "message from unknown server dropped");
                return;
            };
            match stamp.cmp(&entry.next) {
                Ordering::Less => {
                    tracing::debug!(%server, stamp, "late or duplicate message dropped");
                    return;
                }
                Ordering::Greater => {
                    entry.pending.insert(stamp, msg);
                    if entry.pending.len() > self.config.reorder_capacity {
                        broken = true;
                    } else {
                        tracing::debug!(
                            %server,
                            stamp,
                            expected = entry.next,
                            "buffered out-of-order message"
                        );
                    }
                }
                Ordering::Equal => {
                    ready.push(msg);
                    entry.next += 1;
                    while let Some(next_msg) = entry.pending.remove(&entry.next) {
                        ready.push(next_msg);
                        entry.next += 1;
                    }
                }
            }
        }
        if broken {
            self.poison(state, "reorder buffer overflow");
            return;
        }
        for msg in ready {
            self.apply(state, server, msg);
        }
    }

    /// Routes one in-order message to the subscriptions it concerns.
    fn apply(&self, state: &mut FeedState, server: ServerId, msg: Msg) {
        match msg {
            Msg::Stop => self.on_server_stop(state, server, false),
            Msg::Change { old_val, new_val } => {
                let Some(key) = self.primary_key(old_val.as_ref(), new_val.as_ref()) else {
                    tracing::warn!(%server, "change without a primary key dropped");
                    return;
                };
                let matches: Vec<SubscriptionId> = state
                    .subs
                    .iter()
                    .filter(|(_, sub)| sub.keyspec.covers(&key))
                    .map(|(id, _)| *id)
                    .collect();
                let event = ChangeEvent::Change { old_val, new_val };
                for id in matches {
                    self.push(state, id, event.clone());
                }
            }
            Msg::LimitStart { sub, start_data } => {
                self.push_targeted(state, sub, ChangeEvent::LimitStart { data: start_data });
            }
            Msg::LimitChange {
                sub,
                old_key,
                new_val,
            } => {
                self.push_targeted(state, sub, ChangeEvent::LimitChange { old_key, new_val });
            }
        }
    }

    /// Delivers a targeted (limit) event; an id that never existed on this
    /// feed is an ordering fault.
    fn push_targeted(&self, state: &mut FeedState, sub: SubscriptionId, event: ChangeEvent) {
        if state.subs.contains_key(&sub) {
            self.push(state, sub, event);
        } else if state.retired.contains(&sub) {
            tracing::debug!(%sub, "event for retired subscription dropped");
        } else {
            self.poison(state, "event targeted an unknown subscription");
        }
    }

    /// Enqueues an event, converting a full queue into a terminal overflow.
    fn push(&self, state: &mut FeedState, id: SubscriptionId, event: ChangeEvent) {
        let mut kill = false;
        if let Some(entry) = state.subs.get_mut(&id) {
            if let Some(tx) = entry.tx.as_ref() {
                match tx.try_send(event) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        tracing::warn!(sub = %id, "subscription queue overflowed, terminating it");
                        *entry.error.lock() = Some(ChangefeedError::Overflow);
                        kill = true;
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        kill = true;
                    }
                }
            }
        }
        if kill {
            state.subs.remove(&id);
            state.retired.insert(id);
        }
    }

    /// A server stopped or disappeared; subscriptions left without any
    /// server terminate. When the last server goes, the feed goes with it.
    fn on_server_stop(&self, state: &mut FeedState, server: ServerId, unreachable: bool) {
        if state.servers.remove(&server).is_none() {
            return;
        }
        tracing::info!(table = %self.table, %server, unreachable, "server left the feed");
        let orphaned: Vec<SubscriptionId> = state
            .subs
            .iter_mut()
            .filter_map(|(id, sub)| {
                sub.servers.remove(&server);
                sub.servers.is_empty().then_some(*id)
            })
            .collect();
        for id in orphaned {
            if let Some(entry) = state.subs.remove(&id) {
                if unreachable {
                    *entry.error.lock() = Some(ChangefeedError::ShardUnreachable(server));
                }
                state.retired.insert(id);
            }
        }
        if state.servers.is_empty() {
            let rest: Vec<_> = state.subs.keys().copied().collect();
            for id in rest {
                state.subs.remove(&id);
                state.retired.insert(id);
            }
            state.stopped = true;
        }
    }

    /// Ordering fault: close every subscription and schedule detachment.
    fn poison(&self, state: &mut FeedState, why: &str) {
        if state.stopped {
            return;
        }
        tracing::error!(table = %self.table, why, "feed poisoned, closing all subscriptions");
        state.stopped = true;
        let ids: Vec<_> = state.subs.keys().copied().collect();
        for id in ids {
            if let Some(entry) = state.subs.remove(&id) {
                *entry.error.lock() = Some(ChangefeedError::Closed);
                state.retired.insert(id);
            }
        }
        self.poison_notify.notify_one();
    }

    // --- Subscription lifecycle -------------------------------------------

    fn attach_locked(
        &self,
        state: &mut FeedState,
        id: SubscriptionId,
        keyspec: Keyspec,
    ) -> Result<ChangeStream, ChangefeedError> {
        if state.stopped {
            return Err(ChangefeedError::Closed);
        }
        let region = keyspec.to_region();
        let servers: FxHashSet<ServerId> = state
            .servers
            .iter()
            .filter(|(_, entry)| entry.region.intersects(&region))
            .map(|(server, _)| *server)
            .collect();
        if servers.is_empty() {
            return Err(ChangefeedError::TableUnavailable(self.table));
        }
        let (tx, rx) = mpsc::channel(self.config.queue_capacity);
        let error: ErrorSlot = Arc::new(Mutex::new(None));
        state.subs.insert(
            id,
            SubEntry {
                keyspec,
                servers,
                tx: Some(tx),
                error: Arc::clone(&error),
            },
        );
        state.live += 1;
        Ok(ChangeStream::new(id, rx, error, self.drop_tx.clone()))
    }

    /// A `ChangeStream` was dropped; returns whether the feed is now
    /// unused.
    fn on_stream_dropped(&self, id: SubscriptionId) -> bool {
        let mut state = self.state.lock();
        if state.subs.remove(&id).is_some() {
            state.retired.insert(id);
        }
        state.live = state.live.saturating_sub(1);
        state.live == 0
    }

    fn primary_key(&self, old: Option<&Datum>, new: Option<&Datum>) -> Option<StoreKey> {
        new.or(old)
            .and_then(|row| row.get(&self.pkey))
            .map(StoreKey::from_datum)
    }

    // --- Background tasks -------------------------------------------------

    /// Reacts to dropped streams and poison: removes the feed from the
    /// registry when it becomes unused or broken.
    fn spawn_lifecycle(
        self: &Arc<Self>,
        registry: &Arc<FeedRegistry>,
        mut drop_rx: mpsc::UnboundedReceiver<SubscriptionId>,
    ) {
        let Some(guard) = registry.drainer.lock() else {
            return;
        };
        let feed = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let _guard = guard;
            loop {
                tokio::select! {
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    () = feed.poison_notify.notified() => {
                        if let Some(registry) = feed.registry.upgrade() {
                            registry.detach_feed(feed.table).await;
                        }
                        feed.shutdown().await;
                        break;
                    }
                    dropped = drop_rx.recv() => {
                        match dropped {
                            Some(id) => {
                                if feed.on_stream_dropped(id) {
                                    match feed.registry.upgrade() {
                                        Some(registry) => {
                                            registry.maybe_remove_feed(feed.table).await;
                                            // A feed already replaced in the
                                            // registry still needs its own
                                            // teardown.
                                            if !registry.holds(&feed).await {
                                                feed.shutdown().await;
                                            }
                                        }
                                        None => feed.shutdown().await,
                                    }
                                }
                            }
                            None => break,
                        }
                    }
                }
            }
        });
    }

    /// One watcher per shard: a disappearing server node is handled like a
    /// `Stop`, but surfaces `shard unreachable` to orphaned subscriptions.
    fn spawn_disconnect_watchers(self: &Arc<Self>, registry: &Arc<FeedRegistry>) {
        for shard in &self.shards {
            let Some(guard) = registry.drainer.lock() else {
                return;
            };
            let weak = Arc::downgrade(self);
            let server = shard.server;
            let disappeared = self.manager.peer_disappeared(shard.register_addr.node);
            let mut shutdown_rx = self.shutdown_tx.subscribe();
            tokio::spawn(async move {
                let _guard = guard;
                tokio::select! {
                    () = disappeared.wait() => {
                        if let Some(feed) = weak.upgrade() {
                            let mut state = feed.state.lock();
                            if !state.stopped {
                                feed.on_server_stop(&mut state, server, true);
                            }
                        }
                    }
                    _ = shutdown_rx.changed() => {}
                }
            });
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use crate::fabric::Fabric;

    /// Feed wired to a fake server entry, no registry, no background tasks.
    struct Harness {
        feed: Arc<Feed>,
        server: ServerId,
        _drop_rx: mpsc::UnboundedReceiver<SubscriptionId>,
        _manager: Arc<MailboxManager>,
    }

    fn harness(config: FeedConfig) -> Harness {
        let fabric = Fabric::new();
        let manager = MailboxManager::new(&fabric);
        let (drop_tx, drop_rx) = mpsc::unbounded_channel();
        let mailbox = manager.mailbox(|_: StampedMsg| async {});
        let addr = mailbox.addr();

        let feed = Arc::new(Feed {
            table: TableId::random(),
            pkey: "id".into(),
            manager: Arc::clone(&manager),
            config,
            registry: Weak::new(),
            shards: Vec::new(),
            addr,
            state: Mutex::new(FeedState::default()),
            drop_tx,
            shutdown_tx: watch::channel(false).0,
            poison_notify: Notify::new(),
            _mailbox: mailbox,
        });

        let server = ServerId::random();
        {
            let mut state = feed.state.lock();
            state.servers.insert(
                server,
                ServerEntry {
                    stop_addr: addr,
                    register_addr: addr,
                    region: Region::all(),
                    next: 0,
                    pending: BTreeMap::new(),
                },
            );
            state.initialized = true;
        }

        Harness {
            feed,
            server,
            _drop_rx: drop_rx,
            _manager: manager,
        }
    }

    fn row(id: &str, value: i64) -> Datum {
        Datum::from(json!({ "id": id, "value": value }))
    }

    fn change(server: ServerId, stamp: u64, id: &str, value: i64) -> StampedMsg {
        StampedMsg {
            server,
            stamp,
            msg: Msg::change(None, Some(row(id, value))),
        }
    }

    fn range_all() -> Keyspec {
        Keyspec::Range {
            range: Region::all(),
        }
    }

    async fn expect_value(stream: &mut ChangeStream, value: i64) {
        match stream.recv().await {
            Some(Ok(ChangeEvent::Change { new_val, .. })) => {
                assert_eq!(new_val.unwrap().get("value"), Some(&Datum::from(value)));
            }
            other => panic!("expected change {value}, got {other:?}"),
        }
    }

    // --- Reassembly tests ---

    #[tokio::test]
    async fn test_out_of_order_arrivals_are_reassembled() {
        let h = harness(FeedConfig::default());
        let mut stream = h.feed.attach(range_all()).unwrap();

        h.feed.on_msg(change(h.server, 2, "m", 2));
        h.feed.on_msg(change(h.server, 1, "m", 1));
        h.feed.on_msg(change(h.server, 0, "m", 0));

        for value in 0..3 {
            expect_value(&mut stream, value).await;
        }
    }

    #[tokio::test]
    async fn test_shuffled_stamps_reassemble_into_order() {
        use rand::seq::SliceRandom;

        let config = FeedConfig {
            queue_capacity: 64,
            ..FeedConfig::default()
        };
        let h = harness(config);
        let mut stream = h.feed.attach(range_all()).unwrap();

        let mut stamps: Vec<u64> = (0..20).collect();
        stamps.shuffle(&mut rand::thread_rng());
        for stamp in stamps {
            h.feed
                .on_msg(change(h.server, stamp, "m", i64::try_from(stamp).unwrap()));
        }

        for value in 0..20 {
            expect_value(&mut stream, value).await;
        }
    }

    #[tokio::test]
    async fn test_duplicate_and_late_stamps_are_dropped() {
        let h = harness(FeedConfig::default());
        let mut stream = h.feed.attach(range_all()).unwrap();

        h.feed.on_msg(change(h.server, 0, "m", 0));
        h.feed.on_msg(change(h.server, 0, "m", 99));
        h.feed.on_msg(change(h.server, 1, "m", 1));

        expect_value(&mut stream, 0).await;
        expect_value(&mut stream, 1).await;
    }

    #[tokio::test]
    async fn test_reorder_buffer_overflow_poisons_feed() {
        let config = FeedConfig {
            reorder_capacity: 2,
            ..FeedConfig::default()
        };
        let h = harness(config);
        let mut stream = h.feed.attach(range_all()).unwrap();

        // Stamp 0 never arrives; the buffer blows past its cap.
        h.feed.on_msg(change(h.server, 5, "m", 5));
        h.feed.on_msg(change(h.server, 6, "m", 6));
        h.feed.on_msg(change(h.server, 7, "m", 7));

        let last = stream.recv().await.unwrap();
        assert!(matches!(last, Err(ChangefeedError::Closed)));
        assert!(stream.recv().await.is_none());
    }

    // --- Routing tests ---

    #[tokio::test]
    async fn test_changes_route_by_keyspec_coverage() {
        let h = harness(FeedConfig::default());
        let mut point = h
            .feed
            .attach(Keyspec::Point {
                key: StoreKey::from("a"),
            })
            .unwrap();
        let mut range = h.feed.attach(range_all()).unwrap();

        h.feed.on_msg(change(h.server, 0, "b", 1));
        h.feed.on_msg(change(h.server, 1, "a", 2));

        // The range subscription sees both, the point only its key.
        expect_value(&mut range, 1).await;
        expect_value(&mut range, 2).await;
        expect_value(&mut point, 2).await;
    }

    #[tokio::test]
    async fn test_limit_events_route_by_subscription_id() {
        let h = harness(FeedConfig::default());
        let limit_spec = crate::changefeed::keyspec::LimitSpec {
            range: crate::datum::DatumRange::all(),
            sindex: "age".into(),
            sorting: crate::changefeed::keyspec::Sorting::Ascending,
            limit: 2,
        };
        let mut limit = h.feed.attach(Keyspec::Limit(limit_spec)).unwrap();
        let mut range = h.feed.attach(range_all()).unwrap();

        h.feed.on_msg(StampedMsg {
            server: h.server,
            stamp: 0,
            msg: Msg::LimitStart {
                sub: limit.id(),
                start_data: Vec::new(),
            },
        });

        match limit.recv().await {
            Some(Ok(ChangeEvent::LimitStart { data })) => assert!(data.is_empty()),
            other => panic!("expected LimitStart, got {other:?}"),
        }

        // The range subscription saw nothing.
        h.feed.on_msg(change(h.server, 1, "x", 7));
        expect_value(&mut range, 7).await;
    }

    #[tokio::test]
    async fn test_unknown_subscription_id_poisons_feed() {
        let h = harness(FeedConfig::default());
        let mut stream = h.feed.attach(range_all()).unwrap();

        h.feed.on_msg(StampedMsg {
            server: h.server,
            stamp: 0,
            msg: Msg::LimitChange {
                sub: SubscriptionId::random(),
                old_key: None,
                new_val: None,
            },
        });

        let last = stream.recv().await.unwrap();
        assert!(matches!(last, Err(ChangefeedError::Closed)));
    }

    #[tokio::test]
    async fn test_retired_subscription_messages_are_dropped() {
        let h = harness(FeedConfig::default());
        let victim = h.feed.attach(range_all()).unwrap();
        let victim_id = victim.id();
        let mut survivor = h.feed.attach(range_all()).unwrap();

        drop(victim);
        assert!(!h.feed.on_stream_dropped(victim_id));

        // A late targeted message for the dropped subscription is benign.
        h.feed.on_msg(StampedMsg {
            server: h.server,
            stamp: 0,
            msg: Msg::LimitChange {
                sub: victim_id,
                old_key: None,
                new_val: None,
            },
        });
        h.feed.on_msg(change(h.server, 1, "m", 1));
        expect_value(&mut survivor, 1).await;
    }

    // --- Stop tests ---

    #[tokio::test]
    async fn test_stop_from_last_server_ends_all_subscriptions() {
        let h = harness(FeedConfig::default());
        let mut stream = h.feed.attach(range_all()).unwrap();

        h.feed.on_msg(change(h.server, 0, "m", 1));
        h.feed.on_msg(StampedMsg {
            server: h.server,
            stamp: 1,
            msg: Msg::Stop,
        });

        expect_value(&mut stream, 1).await;
        assert!(stream.recv().await.is_none());

        // The feed refuses new subscriptions once stopped.
        assert!(matches!(
            h.feed.attach(range_all()),
            Err(ChangefeedError::Closed)
        ));
    }

    // --- Overflow tests ---

    #[tokio::test]
    async fn test_overflow_terminates_only_the_slow_subscription() {
        let config = FeedConfig {
            queue_capacity: 4,
            ..FeedConfig::default()
        };
        let h = harness(config);
        let mut slow = h.feed.attach(range_all()).unwrap();
        let mut sibling = h
            .feed
            .attach(Keyspec::Point {
                key: StoreKey::from("solo"),
            })
            .unwrap();

        // Ten writes land while neither subscriber drains; the wide
        // subscription overflows after four, the narrow one only ever sees
        // its single key.
        for stamp in 0..10u64 {
            h.feed.on_msg(change(h.server, stamp, "k", i64::try_from(stamp).unwrap()));
        }
        h.feed.on_msg(change(h.server, 10, "solo", 42));

        for value in 0..4 {
            expect_value(&mut slow, value).await;
        }
        let last = slow.recv().await.unwrap();
        assert!(matches!(last, Err(ChangefeedError::Overflow)));
        assert!(slow.recv().await.is_none());

        expect_value(&mut sibling, 42).await;
    }
}
