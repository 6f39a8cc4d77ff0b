//! Cluster fabric facade: addressable mailboxes and lifecycle drainers.
//!
//! The changefeed core never opens sockets; it talks to peers through the
//! primitives here. Production deployments back [`Fabric`] with the real
//! cluster transport; tests and single-process deployments use it directly.

mod drainer;
mod mailbox;

pub use drainer::{Drainer, DrainerLock};
pub use mailbox::{
    decode, encode, DisappearanceSignal, Fabric, FabricError, MailboxAddr, MailboxHandle,
    MailboxId, MailboxManager, NodeId, DEFAULT_INBOX_CAPACITY,
};
