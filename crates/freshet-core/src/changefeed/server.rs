//! Server broadcaster: per-shard fanout of committed mutations.
//!
//! One [`Server`] exists per storage shard. The write pipeline calls
//! [`Server::on_write`] after each commit; the server stamps and transmits
//! the change to every subscribed client whose regions contain the key.
//! Limit subscriptions are serviced through the staged
//! [`foreach_limit`](Server::foreach_limit) /
//! [`commit_limits`](Server::commit_limits) pair.
//!
//! # Locking
//!
//! A read/write lock protects the clients map. `send_all`, `get_stamp`,
//! `foreach_limit`, and `commit_limits` hold it for read — transmission may
//! suspend in transport, and concurrent reads must proceed meanwhile.
//! `add_client`, `add_limit_client`, and the unsubscribe handler hold it
//! for write. Stamp assignment is atomic with the decision to transmit: the
//! counter lives in the client entry and is bumped only for clients a
//! message is actually sent to.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use fxhash::FxHashMap;
use smallvec::SmallVec;
use tokio::sync::{watch, RwLock};

use crate::changefeed::keyspec::{Keyspec, LimitSpec};
use crate::changefeed::limit::{LimitManager, LimitReader};
use crate::changefeed::msg::{Msg, StampedMsg, SubscribeReply, SubscribeRequest, Unsubscribe};
use crate::changefeed::{ChangefeedError, ClientAddr, ServerId, SubscriptionId};
use crate::datum::{Datum, Region, StoreKey};
use crate::fabric::{Drainer, MailboxAddr, MailboxHandle, MailboxManager};

// ---------------------------------------------------------------------------
// ClientInfo
// ---------------------------------------------------------------------------

/// Server-side state for one subscribed client address.
struct ClientInfo {
    /// Next stamp to assign; bumped per transmitted message.
    stamp: AtomicU64,
    /// Regions this client watches; a key matching any of them is sent.
    regions: SmallVec<[Region; 2]>,
    /// Limit managers owned by this client, keyed by secondary index.
    limits: FxHashMap<String, Vec<Arc<RwLock<LimitManager>>>>,
    /// Dropping the entry closes this channel, releasing the disconnect
    /// watcher spawned at registration.
    _cond: watch::Sender<()>,
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

/// Per-shard changefeed broadcaster.
pub struct Server {
    id: ServerId,
    table: String,
    manager: Arc<MailboxManager>,
    reader: Arc<dyn LimitReader>,
    clients: RwLock<FxHashMap<ClientAddr, ClientInfo>>,
    // Mailboxes are declared before the drainer so their handler tasks die
    // before teardown completes.
    register_mailbox: MailboxHandle,
    stop_mailbox: MailboxHandle,
    drainer: Drainer,
}

impl Server {
    /// Creates a broadcaster for one shard of `table`.
    ///
    /// `reader` is the secondary-index read path used for limit snapshots
    /// and refills. Must be called within a tokio runtime.
    #[must_use]
    pub fn new(
        manager: Arc<MailboxManager>,
        table: impl Into<String>,
        reader: Arc<dyn LimitReader>,
    ) -> Arc<Self> {
        let id = ServerId::random();
        Arc::new_cyclic(|weak| {
            let stop_weak = weak.clone();
            let stop_mailbox = manager.mailbox(move |msg: Unsubscribe| {
                let server: std::sync::Weak<Server> = stop_weak.clone();
                async move {
                    if let Some(server) = server.upgrade() {
                        server.remove_client(&msg.client_addr).await;
                    }
                }
            });
            let register_weak = weak.clone();
            let register_mailbox = manager.mailbox(move |req: SubscribeRequest| {
                let server: std::sync::Weak<Server> = register_weak.clone();
                async move {
                    if let Some(server) = server.upgrade() {
                        server.handle_subscribe(req).await;
                    }
                }
            });
            tracing::info!(server = %id, "changefeed server started");
            Self {
                id,
                table: table.into(),
                manager: Arc::clone(&manager),
                reader,
                clients: RwLock::new(FxHashMap::default()),
                register_mailbox,
                stop_mailbox,
                drainer: Drainer::new(),
            }
        })
    }

    /// This server's identity, carried in every stamped message.
    #[must_use]
    pub fn id(&self) -> ServerId {
        self.id
    }

    /// Address clients register through.
    #[must_use]
    pub fn register_addr(&self) -> MailboxAddr {
        self.register_mailbox.addr()
    }

    /// Address a client sends [`Unsubscribe`] to.
    #[must_use]
    pub fn get_stop_addr(&self) -> MailboxAddr {
        self.stop_mailbox.addr()
    }

    /// Number of currently subscribed clients.
    pub async fn client_count(&self) -> usize {
        self.clients.read().await.len()
    }

    /// Registers `addr` as a point/range subscriber covering `region`.
    ///
    /// Idempotent by address: repeated adds extend the region list. Returns
    /// the next stamp the client will observe, with the entry in place and
    /// the unsubscribe channel armed.
    pub async fn add_client(self: &Arc<Self>, addr: ClientAddr, region: Region) -> u64 {
        let mut clients = self.clients.write().await;
        let info = self.ensure_client(&mut clients, addr, region);
        info.stamp.load(Ordering::Relaxed)
    }

    /// Registers a limit window for `sub` at `addr`.
    ///
    /// Performs the initial read under the clients write lock and sends the
    /// `LimitStart` snapshot before any `LimitChange` can be stamped for
    /// the subscription. Returns the stamp the `LimitStart` carries.
    ///
    /// # Errors
    ///
    /// Read failures from the storage reader, or a fabric error if the
    /// snapshot cannot be delivered (the client entry is removed again).
    pub async fn add_limit_client(
        self: &Arc<Self>,
        addr: ClientAddr,
        region: Region,
        sub: SubscriptionId,
        spec: LimitSpec,
    ) -> Result<u64, ChangefeedError> {
        let mut clients = self.clients.write().await;
        let snapshot = self
            .reader
            .read(&spec.range, &self.table, &spec.sindex, spec.sorting, spec.limit)
            .await?;

        let info = self.ensure_client(&mut clients, addr, region);
        let manager = LimitManager::new(self.table.clone(), sub, addr, spec.clone(), snapshot);
        let start_data = manager.snapshot();
        info.limits
            .entry(spec.sindex.clone())
            .or_default()
            .push(Arc::new(RwLock::new(manager)));

        let stamp = info.stamp.fetch_add(1, Ordering::Relaxed);
        let stamped = StampedMsg {
            server: self.id,
            stamp,
            msg: Msg::LimitStart { sub, start_data },
        };
        if let Err(error) = self.manager.send(addr, &stamped).await {
            tracing::warn!(client = %addr, %error, "limit snapshot undeliverable, dropping client");
            clients.remove(&addr);
            return Err(error.into());
        }
        Ok(stamp)
    }

    /// Write-pipeline entry point: a committed mutation on `key`.
    pub async fn on_write(&self, key: &StoreKey, old_val: Option<Datum>, new_val: Option<Datum>) {
        self.send_all(&Msg::change(old_val, new_val), key).await;
    }

    /// Stamps and transmits `msg` to every client whose regions contain
    /// `key`. Clients the filter excludes consume no stamp. A failed
    /// transmission unsubscribes the client.
    pub async fn send_all(&self, msg: &Msg, key: &StoreKey) {
        let mut failed: SmallVec<[ClientAddr; 2]> = SmallVec::new();
        {
            let clients = self.clients.read().await;
            for (addr, info) in clients.iter() {
                if !info.regions.iter().any(|r| r.contains(key)) {
                    continue;
                }
                let stamp = info.stamp.fetch_add(1, Ordering::Relaxed);
                let stamped = StampedMsg {
                    server: self.id,
                    stamp,
                    msg: msg.clone(),
                };
                if let Err(error) = self.manager.send(*addr, &stamped).await {
                    tracing::warn!(client = %addr, %error, "send failed, unsubscribing client");
                    failed.push(*addr);
                }
            }
        }
        for addr in failed {
            self.remove_client(&addr).await;
        }
    }

    /// The next stamp `addr` would be assigned, without consuming it.
    pub async fn get_stamp(&self, addr: &ClientAddr) -> Option<u64> {
        self.clients
            .read()
            .await
            .get(addr)
            .map(|info| info.stamp.load(Ordering::Relaxed))
    }

    /// Invokes `f` on every limit manager for `sindex`, holding the clients
    /// lock for read and each manager's lock for write.
    pub async fn foreach_limit<F>(&self, sindex: &str, mut f: F)
    where
        F: FnMut(&mut LimitManager),
    {
        let clients = self.clients.read().await;
        for info in clients.values() {
            if let Some(managers) = info.limits.get(sindex) {
                for manager in managers {
                    let mut guard = manager.write().await;
                    f(&mut guard);
                }
            }
        }
    }

    /// Commits every staged limit window on `sindex` and transmits the
    /// resulting diffs, stamped, to each window's owning client.
    ///
    /// # Errors
    ///
    /// Refill-read failures from the storage reader.
    pub async fn commit_limits(&self, sindex: &str) -> Result<(), ChangefeedError> {
        let mut failed: SmallVec<[ClientAddr; 2]> = SmallVec::new();
        {
            let clients = self.clients.read().await;
            'clients: for (addr, info) in clients.iter() {
                let Some(managers) = info.limits.get(sindex) else {
                    continue;
                };
                for manager in managers {
                    let mut guard = manager.write().await;
                    let diffs = guard.commit(self.reader.as_ref()).await?;
                    for msg in diffs {
                        let stamp = info.stamp.fetch_add(1, Ordering::Relaxed);
                        let stamped = StampedMsg {
                            server: self.id,
                            stamp,
                            msg,
                        };
                        if let Err(error) = self.manager.send(*addr, &stamped).await {
                            tracing::warn!(client = %addr, %error, "diff undeliverable, unsubscribing client");
                            failed.push(*addr);
                            continue 'clients;
                        }
                    }
                }
            }
        }
        for addr in failed {
            self.remove_client(&addr).await;
        }
        Ok(())
    }

    /// Broadcasts `Stop` to every client and clears the table.
    pub async fn stop_all(&self) {
        let mut clients = self.clients.write().await;
        for (addr, info) in clients.drain() {
            let stamp = info.stamp.fetch_add(1, Ordering::Relaxed);
            let stamped = StampedMsg {
                server: self.id,
                stamp,
                msg: Msg::Stop,
            };
            if let Err(error) = self.manager.send(addr, &stamped).await {
                tracing::debug!(client = %addr, %error, "stop undeliverable");
            }
        }
        tracing::info!(server = %self.id, "stopped all clients");
    }

    /// Removes a client entry; its limit managers and pending sends go with
    /// it.
    pub async fn remove_client(&self, addr: &ClientAddr) {
        if self.clients.write().await.remove(addr).is_some() {
            tracing::info!(server = %self.id, client = %addr, "client unsubscribed");
        }
    }

    /// Orderly teardown: stop every client, then wait for watcher tasks.
    pub async fn shutdown(&self) {
        self.stop_all().await;
        self.drainer.drain().await;
    }

    /// Registration handler for both plain and limit subscriptions.
    async fn handle_subscribe(self: &Arc<Self>, req: SubscribeRequest) {
        let first_stamp = match &req.keyspec {
            Keyspec::Limit(spec) => {
                match self
                    .add_limit_client(
                        req.client_addr,
                        req.keyspec.to_region(),
                        req.sub,
                        spec.clone(),
                    )
                    .await
                {
                    Ok(stamp) => stamp,
                    Err(error) => {
                        tracing::warn!(client = %req.client_addr, %error, "limit registration failed");
                        return;
                    }
                }
            }
            other => self.add_client(req.client_addr, other.to_region()).await,
        };
        if let Some(reply_addr) = req.reply_addr {
            let reply = SubscribeReply {
                server: self.id,
                stamp: first_stamp,
            };
            if let Err(error) = self.manager.send(reply_addr, &reply).await {
                tracing::warn!(client = %req.client_addr, %error, "subscribe reply undeliverable");
            }
        }
    }

    /// Finds or creates the client entry, arming the disconnect watcher for
    /// new entries, and extends its region list.
    fn ensure_client<'a>(
        self: &Arc<Self>,
        clients: &'a mut FxHashMap<ClientAddr, ClientInfo>,
        addr: ClientAddr,
        region: Region,
    ) -> &'a mut ClientInfo {
        let info = clients.entry(addr).or_insert_with(|| {
            let (cond, cond_rx) = watch::channel(());
            self.spawn_disconnect_watcher(addr, cond_rx);
            tracing::info!(server = %self.id, client = %addr, "client subscribed");
            ClientInfo {
                stamp: AtomicU64::new(0),
                regions: SmallVec::new(),
                limits: FxHashMap::default(),
                _cond: cond,
            }
        });
        if !info.regions.contains(&region) {
            info.regions.push(region);
        }
        info
    }

    /// Watches the client's node; disappearance unsubscribes the client.
    /// The watcher exits when the client entry is dropped.
    fn spawn_disconnect_watcher(self: &Arc<Self>, addr: ClientAddr, mut cond: watch::Receiver<()>) {
        let Some(guard) = self.drainer.lock() else {
            return;
        };
        let weak = Arc::downgrade(self);
        let disappeared = self.manager.peer_disappeared(addr.node);
        tokio::spawn(async move {
            let _guard = guard;
            tokio::select! {
                () = disappeared.wait() => {
                    if let Some(server) = weak.upgrade() {
                        tracing::warn!(client = %addr, "client node disappeared, unsubscribing");
                        server.remove_client(&addr).await;
                    }
                }
                () = async { while cond.changed().await.is_ok() {} } => {}
            }
        });
    }
}

// ===========================================================================
// Tests
// ===========================================================================
