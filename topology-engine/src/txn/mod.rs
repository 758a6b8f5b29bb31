//! Sessions, transaction state and server/channel affinity.

pub mod pinning;

pub use pinning::{label_transaction_error, unpin_on_command_exception, unpin_on_retryable_commit_exception};

use chrono::{DateTime, Utc};
use common::{ClusterType, CoreError, ReadPreference, Result, ServerAddress};
use std::fmt;
use tracing::debug;
use uuid::Uuid;

use crate::pool::{ConnectionPool, PooledChannel};
use crate::selector::ServerAddressSelector;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    None,
    Starting,
    InProgress,
    Committed,
    Aborted,
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionState::None => write!(f, "None"),
            TransactionState::Starting => write!(f, "Starting"),
            TransactionState::InProgress => write!(f, "InProgress"),
            TransactionState::Committed => write!(f, "Committed"),
            TransactionState::Aborted => write!(f, "Aborted"),
        }
    }
}

impl TransactionState {
    /// Started and not yet committed or aborted.
    pub fn in_transaction(&self) -> bool {
        matches!(self, TransactionState::Starting | TransactionState::InProgress)
    }

    /// May still send commands, including a retried commit.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            TransactionState::Starting | TransactionState::InProgress | TransactionState::Committed
        )
    }
}

/// Cluster types where every operation of a transaction must reach the same
/// mongos (Sharded) or the same channel (LoadBalanced).
pub fn requires_pinning(cluster_type: ClusterType) -> bool {
    matches!(cluster_type, ClusterType::Sharded | ClusterType::LoadBalanced)
}

struct PinnedChannel {
    pool: ConnectionPool,
    channel: PooledChannel,
}

pub struct CoreTransaction {
    txn_number: i64,
    state: TransactionState,
    pinned_server: Option<ServerAddress>,
    pinned_channel: Option<PinnedChannel>,
}

impl CoreTransaction {
    fn new() -> Self {
        Self {
            txn_number: 0,
            state: TransactionState::None,
            pinned_server: None,
            pinned_channel: None,
        }
    }

    pub fn txn_number(&self) -> i64 {
        self.txn_number
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state.is_active()
    }

    pub fn pinned_server(&self) -> Option<&ServerAddress> {
        self.pinned_server.as_ref()
    }

    pub fn pinned_channel(&self) -> Option<&PooledChannel> {
        self.pinned_channel.as_ref().map(|p| &p.channel)
    }

    pub fn is_pinned(&self) -> bool {
        self.pinned_server.is_some() || self.pinned_channel.is_some()
    }

    /// Selector routing follow-up operations to the pinned server.
    pub fn pinned_selector(&self) -> Option<ServerAddressSelector> {
        self.pinned_server.clone().map(ServerAddressSelector::new)
    }

    /// Only Primary reads are allowed inside a transaction.
    pub fn check_read_preference(&self, read_preference: &ReadPreference) -> Result<()> {
        if self.state.in_transaction() && !read_preference.is_primary() {
            return Err(CoreError::TransactionState(format!(
                "read preference in a transaction must be primary, got {:?}",
                read_preference.mode
            )));
        }
        Ok(())
    }

    /// Records the first command of a starting transaction. On clusters that
    /// need affinity the server is pinned; load-balanced clusters also keep the
    /// channel, in which case `None` is returned and the caller keeps using
    /// [`pinned_channel`](Self::pinned_channel).
    pub fn mark_in_progress(
        &mut self,
        cluster_type: ClusterType,
        pool: &ConnectionPool,
        channel: PooledChannel,
    ) -> Result<Option<PooledChannel>> {
        if self.state != TransactionState::Starting {
            return Ok(Some(channel));
        }
        self.transition(TransactionState::InProgress)?;

        match cluster_type {
            ClusterType::LoadBalanced => {
                self.pinned_server = Some(pool.address().clone());
                self.pinned_channel = Some(PinnedChannel {
                    pool: pool.clone(),
                    channel,
                });
                debug!("Transaction {} pinned to channel on {}", self.txn_number, pool.address());
                Ok(None)
            }
            ClusterType::Sharded => {
                self.pinned_server = Some(pool.address().clone());
                debug!("Transaction {} pinned to {}", self.txn_number, pool.address());
                Ok(Some(channel))
            }
            _ => Ok(Some(channel)),
        }
    }

    /// Drops server affinity and returns a pinned channel to its pool.
    pub async fn unpin(&mut self) {
        if let Some(address) = self.pinned_server.take() {
            debug!("Transaction {} unpinned from {}", self.txn_number, address);
        }
        if let Some(pinned) = self.pinned_channel.take() {
            pinned.pool.check_in(pinned.channel).await;
        }
    }

    fn transition(&mut self, next: TransactionState) -> Result<TransactionState> {
        use TransactionState::*;

        let allowed = match (self.state, next) {
            (_, None) => true,
            (None | Committed | Aborted, Starting) => true,
            (Starting, InProgress) => true,
            (Starting | InProgress | Committed, Committed) => true,
            (Starting | InProgress, Aborted) => true,
            _ => false,
        };
        if !allowed {
            return Err(CoreError::TransactionState(format!(
                "cannot move transaction {} from {} to {}",
                self.txn_number, self.state, next
            )));
        }

        debug!("Transaction {} state: {} -> {}", self.txn_number, self.state, next);
        self.state = next;
        Ok(next)
    }
}

impl fmt::Debug for CoreTransaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoreTransaction")
            .field("txn_number", &self.txn_number)
            .field("state", &self.state)
            .field("pinned_server", &self.pinned_server)
            .field("pinned_channel", &self.pinned_channel().map(|c| c.id()))
            .finish()
    }
}

/// Logical session. Transaction numbers only ever increase.
#[derive(Debug)]
pub struct CoreSession {
    id: Uuid,
    created_at: DateTime<Utc>,
    last_use: DateTime<Utc>,
    transaction: CoreTransaction,
}

impl CoreSession {
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            created_at: now,
            last_use: now,
            transaction: CoreTransaction::new(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn last_use(&self) -> DateTime<Utc> {
        self.last_use
    }

    pub fn touch(&mut self) {
        self.last_use = Utc::now();
    }

    pub fn transaction(&self) -> &CoreTransaction {
        &self.transaction
    }

    pub fn transaction_mut(&mut self) -> &mut CoreTransaction {
        &mut self.transaction
    }

    pub fn txn_number(&self) -> i64 {
        self.transaction.txn_number
    }

    /// Next number for a retryable write outside a transaction.
    pub fn advance_txn_number(&mut self) -> i64 {
        self.transaction.txn_number += 1;
        self.transaction.txn_number
    }

    /// Starts a transaction, dropping any affinity left by the previous one.
    pub async fn start_transaction(&mut self, read_preference: &ReadPreference) -> Result<i64> {
        if self.transaction.state.in_transaction() {
            return Err(CoreError::TransactionState("transaction already in progress".into()));
        }
        if !read_preference.is_primary() {
            return Err(CoreError::TransactionState(format!(
                "read preference in a transaction must be primary, got {:?}",
                read_preference.mode
            )));
        }

        self.transaction.unpin().await;
        self.transaction.txn_number += 1;
        self.transaction.transition(TransactionState::Starting)?;
        self.touch();
        Ok(self.transaction.txn_number)
    }

    /// Affinity is kept so the commit can be retried on the same server.
    pub fn commit_transaction(&mut self) -> Result<()> {
        if self.transaction.state == TransactionState::None {
            return Err(CoreError::TransactionState("no transaction started".into()));
        }
        self.transaction.transition(TransactionState::Committed)?;
        self.touch();
        Ok(())
    }

    pub async fn abort_transaction(&mut self) -> Result<()> {
        match self.transaction.state {
            TransactionState::None => {
                return Err(CoreError::TransactionState("no transaction started".into()))
            }
            TransactionState::Committed => {
                return Err(CoreError::TransactionState(
                    "cannot abort after commit".into(),
                ))
            }
            TransactionState::Aborted => {
                return Err(CoreError::TransactionState("transaction already aborted".into()))
            }
            _ => {}
        }
        self.transaction.transition(TransactionState::Aborted)?;
        self.transaction.unpin().await;
        self.touch();
        Ok(())
    }

    /// Aborts an open transaction and releases any pinned channel.
    pub async fn end(mut self) {
        if self.transaction.state.in_transaction() {
            let _ = self.transaction.transition(TransactionState::Aborted);
        }
        self.transaction.unpin().await;
        debug!("Session {} ended", self.id);
    }
}

impl Default for CoreSession {
    fn default() -> Self {
        Self::new()
    }
}
