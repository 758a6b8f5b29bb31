use common::{Result, ServerAddress};
use std::fmt;
use std::sync::Weak;
use tokio::time::Instant;
use uuid::Uuid;

use super::PoolInner;
use crate::channel::{Channel, Document};

/// A channel checked out of a [`ConnectionPool`](super::ConnectionPool),
/// stamped with the pool generation it was created under. Return it with
/// `check_in`; dropping it instead releases its slot and closes the channel.
pub struct PooledChannel {
    channel: Option<Box<dyn Channel>>,
    generation: u64,
    created_at: Instant,
    pool: Weak<PoolInner>,
}

impl PooledChannel {
    pub(super) fn new(channel: Box<dyn Channel>, generation: u64, created_at: Instant, pool: Weak<PoolInner>) -> Self {
        Self {
            channel: Some(channel),
            generation,
            created_at,
            pool,
        }
    }

    pub fn id(&self) -> Uuid {
        self.channel.as_ref().map(|c| c.id()).unwrap_or_default()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn address(&self) -> Option<&ServerAddress> {
        self.channel.as_ref().map(|c| c.address())
    }

    pub fn is_live(&self) -> bool {
        self.channel.as_ref().map_or(false, |c| c.is_live())
    }

    pub async fn send_command(&self, command: Document) -> Result<Document> {
        match self.channel.as_ref() {
            Some(channel) => channel.send_command(command).await,
            None => Err(common::CoreError::Cancelled),
        }
    }

    pub(super) fn take(mut self) -> Option<Box<dyn Channel>> {
        self.channel.take()
    }
}

impl fmt::Debug for PooledChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledChannel")
            .field("id", &self.id())
            .field("address", &self.address())
            .field("generation", &self.generation)
            .finish()
    }
}

impl Drop for PooledChannel {
    fn drop(&mut self) {
        let channel = match self.channel.take() {
            Some(channel) => channel,
            None => return,
        };
        if let Some(pool) = self.pool.upgrade() {
            pool.release_slot();
        }
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move { channel.close().await });
        }
    }
}
