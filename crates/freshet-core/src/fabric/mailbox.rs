//! Named, addressable message endpoints over an in-process fabric.
//!
//! Every node in the cluster owns a [`MailboxManager`]; components create
//! typed mailboxes through it and hand their [`MailboxAddr`]s to peers.
//! Delivery is at-most-once and reliable (in order) while both peers are
//! connected; the disappearance of a peer node is observable through
//! [`MailboxManager::peer_disappeared`].
//!
//! Payloads cross the fabric as serialized bytes — the logical shape of each
//! message is a plain serde type, so the codec here is the single place
//! where wire compatibility is decided.
//!
//! ```text
//!  node A                     Fabric                      node B
//!  ┌────────────────┐   ┌────────────────────┐   ┌────────────────┐
//!  │ MailboxManager │──►│ addr → inbox route │──►│ handler task   │
//!  │   send(addr,m) │   │ node → liveness    │   │   (decode, f)  │
//!  └────────────────┘   └────────────────────┘   └────────────────┘
//! ```

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use fxhash::FxHashMap;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Inbox depth of a newly created mailbox.
pub const DEFAULT_INBOX_CAPACITY: usize = 64;

// ---------------------------------------------------------------------------
// Addresses
// ---------------------------------------------------------------------------

/// Identity of a node on the fabric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(Uuid);

impl NodeId {
    /// A fresh node identity.
    #[must_use]
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node-{}", &self.0.simple().to_string()[..8])
    }
}

/// Node-local mailbox number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MailboxId(u64);

impl MailboxId {
    /// Wraps a raw mailbox number.
    #[must_use]
    pub fn new(n: u64) -> Self {
        Self(n)
    }
}

/// A fabric-wide mailbox address: node identity plus local mailbox number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MailboxAddr {
    /// Owning node.
    pub node: NodeId,
    /// Mailbox number on that node.
    pub mailbox: MailboxId,
}

impl fmt::Display for MailboxAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.node, self.mailbox.0)
    }
}

// ---------------------------------------------------------------------------
// Errors and codec
// ---------------------------------------------------------------------------

/// Fabric-level failures.
#[derive(Debug, thiserror::Error)]
pub enum FabricError {
    /// No mailbox is registered at the address.
    #[error("no route to mailbox {0}")]
    Unreachable(MailboxAddr),
    /// The mailbox exists but its receiver has gone away.
    #[error("mailbox {0} rejected delivery")]
    Closed(MailboxAddr),
    /// The payload could not be serialized.
    #[error("message encode failed: {0}")]
    Encode(#[source] serde_json::Error),
    /// The payload could not be deserialized.
    #[error("message decode failed: {0}")]
    Decode(#[source] serde_json::Error),
}

/// Serializes a wire message into fabric payload bytes.
///
/// # Errors
///
/// Returns [`FabricError::Encode`] if the value cannot be serialized.
pub fn encode<T: Serialize>(value: &T) -> Result<Bytes, FabricError> {
    serde_json::to_vec(value)
        .map(Bytes::from)
        .map_err(FabricError::Encode)
}

/// Deserializes fabric payload bytes back into a wire message.
///
/// # Errors
///
/// Returns [`FabricError::Decode`] if the bytes do not parse as `T`.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, FabricError> {
    serde_json::from_slice(bytes).map_err(FabricError::Decode)
}

// ---------------------------------------------------------------------------
// Fabric
// ---------------------------------------------------------------------------

/// Shared routing state connecting the managers of an in-process cluster.
pub struct Fabric {
    /// Mailbox address → inbox sender.
    routes: RwLock<FxHashMap<MailboxAddr, mpsc::Sender<Bytes>>>,
    /// Node → liveness channel; dropping the sender signals disappearance.
    nodes: RwLock<FxHashMap<NodeId, watch::Sender<()>>>,
}

impl Fabric {
    /// Creates an empty fabric.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            routes: RwLock::new(FxHashMap::default()),
            nodes: RwLock::new(FxHashMap::default()),
        })
    }

    fn register_node(&self, node: NodeId) {
        let (tx, _rx) = watch::channel(());
        self.nodes.write().insert(node, tx);
    }

    fn deregister_node(&self, node: NodeId) {
        self.nodes.write().remove(&node);
        self.routes.write().retain(|addr, _| addr.node != node);
        tracing::info!(%node, "node left the fabric");
    }

    fn register_mailbox(&self, addr: MailboxAddr, tx: mpsc::Sender<Bytes>) {
        self.routes.write().insert(addr, tx);
    }

    fn deregister_mailbox(&self, addr: MailboxAddr) {
        self.routes.write().remove(&addr);
    }

    fn peer_disappeared(&self, node: NodeId) -> DisappearanceSignal {
        DisappearanceSignal {
            rx: self.nodes.read().get(&node).map(watch::Sender::subscribe),
        }
    }
}

/// Resolves when the watched node leaves the fabric.
pub struct DisappearanceSignal {
    /// `None` when the node was already gone at subscription time.
    rx: Option<watch::Receiver<()>>,
}

impl DisappearanceSignal {
    /// Waits for the peer to disappear.
    pub async fn wait(self) {
        if let Some(mut rx) = self.rx {
            while rx.changed().await.is_ok() {}
        }
    }
}

// ---------------------------------------------------------------------------
// MailboxManager
// ---------------------------------------------------------------------------

/// Per-node factory for mailboxes and the typed send primitive.
pub struct MailboxManager {
    node: NodeId,
    fabric: Arc<Fabric>,
    next_id: AtomicU64,
    inbox_capacity: usize,
}

impl MailboxManager {
    /// Joins the fabric as a fresh node.
    #[must_use]
    pub fn new(fabric: &Arc<Fabric>) -> Arc<Self> {
        let node = NodeId::random();
        fabric.register_node(node);
        Arc::new(Self {
            node,
            fabric: Arc::clone(fabric),
            next_id: AtomicU64::new(0),
            inbox_capacity: DEFAULT_INBOX_CAPACITY,
        })
    }

    /// This manager's node identity.
    #[must_use]
    pub fn node(&self) -> NodeId {
        self.node
    }

    /// Creates a typed mailbox whose messages are handed to `handler`.
    ///
    /// The handler runs on a dedicated task; undecodable payloads are logged
    /// and dropped. Dropping the returned handle deregisters the address and
    /// stops the task. Must be called within a tokio runtime.
    pub fn mailbox<T, H, Fut>(&self, mut handler: H) -> MailboxHandle
    where
        T: DeserializeOwned + Send + 'static,
        H: FnMut(T) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let addr = MailboxAddr {
            node: self.node,
            mailbox: MailboxId(self.next_id.fetch_add(1, Ordering::Relaxed)),
        };
        let (tx, mut rx) = mpsc::channel::<Bytes>(self.inbox_capacity);
        self.fabric.register_mailbox(addr, tx);

        let task = tokio::spawn(async move {
            while let Some(bytes) = rx.recv().await {
                match decode::<T>(&bytes) {
                    Ok(msg) => handler(msg).await,
                    Err(error) => {
                        tracing::warn!(%addr, %error, "dropping undecodable message");
                    }
                }
            }
        });

        MailboxHandle {
            addr,
            fabric: Arc::clone(&self.fabric),
            task,
        }
    }

    /// Sends a typed message to a mailbox anywhere on the fabric.
    ///
    /// Suspends when the destination inbox is full.
    ///
    /// # Errors
    ///
    /// [`FabricError::Unreachable`] when no mailbox is registered at `addr`,
    /// [`FabricError::Closed`] when its receiver is gone, or an encode error.
    pub async fn send<T: Serialize>(&self, addr: MailboxAddr, msg: &T) -> Result<(), FabricError> {
        let bytes = encode(msg)?;
        let tx = { self.fabric.routes.read().get(&addr).cloned() };
        let tx = tx.ok_or(FabricError::Unreachable(addr))?;
        tx.send(bytes).await.map_err(|_| FabricError::Closed(addr))
    }

    /// A signal that resolves when `node` leaves the fabric.
    ///
    /// Resolves immediately if the node is already gone.
    #[must_use]
    pub fn peer_disappeared(&self, node: NodeId) -> DisappearanceSignal {
        self.fabric.peer_disappeared(node)
    }

    /// Leaves the fabric, invalidating every mailbox address on this node.
    pub fn shutdown(&self) {
        self.fabric.deregister_node(self.node);
    }
}

// ---------------------------------------------------------------------------
// MailboxHandle
// ---------------------------------------------------------------------------

/// Ownership handle for a registered mailbox.
pub struct MailboxHandle {
    addr: MailboxAddr,
    fabric: Arc<Fabric>,
    task: JoinHandle<()>,
}

impl MailboxHandle {
    /// The mailbox's fabric-wide address.
    #[must_use]
    pub fn addr(&self) -> MailboxAddr {
        self.addr
    }
}

impl Drop for MailboxHandle {
    fn drop(&mut self) {
        self.fabric.deregister_mailbox(self.addr);
        self.task.abort();
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Ping {
        seq: u64,
        body: String,
    }

    fn collector(
        manager: &MailboxManager,
    ) -> (MailboxHandle, mpsc::UnboundedReceiver<Ping>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = manager.mailbox(move |msg: Ping| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(msg);
            }
        });
        (handle, rx)
    }

    // --- Delivery tests ---

    #[tokio::test]
    async fn test_send_and_receive() {
        let fabric = Fabric::new();
        let a = MailboxManager::new(&fabric);
        let b = MailboxManager::new(&fabric);
        let (handle, mut rx) = collector(&b);

        let msg = Ping {
            seq: 1,
            body: "hello".into(),
        };
        a.send(handle.addr(), &msg).await.unwrap();

        let got = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, msg);
    }

    #[tokio::test]
    async fn test_in_order_delivery() {
        let fabric = Fabric::new();
        let a = MailboxManager::new(&fabric);
        let (handle, mut rx) = collector(&a);

        for seq in 0..16u64 {
            a.send(
                handle.addr(),
                &Ping {
                    seq,
                    body: String::new(),
                },
            )
            .await
            .unwrap();
        }
        for seq in 0..16u64 {
            let got = tokio::time::timeout(Duration::from_secs(1), rx.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(got.seq, seq);
        }
    }

    #[tokio::test]
    async fn test_send_to_unknown_addr_is_unreachable() {
        let fabric = Fabric::new();
        let a = MailboxManager::new(&fabric);
        let bogus = MailboxAddr {
            node: NodeId::random(),
            mailbox: MailboxId(7),
        };
        let err = a.send(bogus, &Ping { seq: 0, body: String::new() }).await;
        assert!(matches!(err, Err(FabricError::Unreachable(_))));
    }

    #[tokio::test]
    async fn test_dropped_handle_deregisters() {
        let fabric = Fabric::new();
        let a = MailboxManager::new(&fabric);
        let (handle, _rx) = collector(&a);
        let addr = handle.addr();
        drop(handle);

        let err = a.send(addr, &Ping { seq: 0, body: String::new() }).await;
        assert!(matches!(err, Err(FabricError::Unreachable(_))));
    }

    #[tokio::test]
    async fn test_undecodable_payload_is_dropped() {
        let fabric = Fabric::new();
        let a = MailboxManager::new(&fabric);
        let (handle, mut rx) = collector(&a);

        // A string is not a Ping; the handler must never see it.
        a.send(handle.addr(), &"not a ping").await.unwrap();
        a.send(handle.addr(), &Ping { seq: 9, body: String::new() })
            .await
            .unwrap();

        let got = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.seq, 9);
    }

    // --- Codec tests ---

    #[test]
    fn test_codec_round_trip() {
        let msg = Ping {
            seq: 42,
            body: "payload".into(),
        };
        let bytes = encode(&msg).unwrap();
        let back: Ping = decode(&bytes).unwrap();
        assert_eq!(back, msg);
    }

    // --- Disappearance tests ---

    #[tokio::test]
    async fn test_peer_disappeared_on_shutdown() {
        let fabric = Fabric::new();
        let a = MailboxManager::new(&fabric);
        let b = MailboxManager::new(&fabric);

        let signal = a.peer_disappeared(b.node());
        b.shutdown();

        tokio::time::timeout(Duration::from_secs(1), signal.wait())
            .await
            .expect("signal fires after shutdown");
    }

    #[tokio::test]
    async fn test_peer_disappeared_for_unknown_node_fires_immediately() {
        let fabric = Fabric::new();
        let a = MailboxManager::new(&fabric);
        let signal = a.peer_disappeared(NodeId::random());
        tokio::time::timeout(Duration::from_secs(1), signal.wait())
            .await
            .expect("unknown node counts as already gone");
    }

    #[tokio::test]
    async fn test_shutdown_invalidates_routes() {
        let fabric = Fabric::new();
        let a = MailboxManager::new(&fabric);
        let b = MailboxManager::new(&fabric);
        let (handle, _rx) = collector(&b);
        let addr = handle.addr();

        b.shutdown();
        let err = a.send(addr, &Ping { seq: 0, body: String::new() }).await;
        assert!(matches!(err, Err(FabricError::Unreachable(_))));
    }
}
