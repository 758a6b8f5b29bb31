//! The narrow seam to the networking layer. Framing, codecs, TLS and
//! authentication live behind these traits.

pub mod memory;

use async_trait::async_trait;
use common::{Result, ServerAddress};
use uuid::Uuid;

pub use memory::MemoryCluster;

/// Command and reply documents; their wire encoding belongs to the codec layer.
pub type Document = serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelPurpose {
    /// Dedicated heartbeat connection owned by a server monitor.
    Monitoring,
    /// Pooled connection handed to operations.
    Application,
}

/// One established logical connection to a node.
#[async_trait]
pub trait Channel: Send + Sync {
    fn id(&self) -> Uuid;

    fn address(&self) -> &ServerAddress;

    /// Cheap local check; must not touch the network.
    fn is_live(&self) -> bool;

    async fn send_command(&self, command: Document) -> Result<Document>;

    async fn close(&self);
}

#[async_trait]
pub trait ChannelFactory: Send + Sync {
    /// Connects and completes the handshake for `address`.
    async fn open(&self, address: &ServerAddress, purpose: ChannelPurpose) -> Result<Box<dyn Channel>>;
}
