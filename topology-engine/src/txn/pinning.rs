use common::error::labels::{TRANSIENT_TRANSACTION_ERROR, UNKNOWN_TRANSACTION_COMMIT_RESULT};
use common::CoreError;
use tracing::debug;

use super::{CoreSession, CoreTransaction, TransactionState};

/// Adds the transaction labels an error earns from the state it happened in:
/// network failures inside a transaction are transient, and network or
/// state-change failures of a commit leave its outcome unknown.
pub fn label_transaction_error(transaction: &CoreTransaction, error: CoreError) -> CoreError {
    match transaction.state() {
        TransactionState::Starting | TransactionState::InProgress if error.is_network_error() => {
            error.with_label(TRANSIENT_TRANSACTION_ERROR)
        }
        TransactionState::Committed if error.is_network_error() || error.is_state_change_error() => {
            error.with_label(UNKNOWN_TRANSACTION_COMMIT_RESULT)
        }
        _ => error,
    }
}

/// Unpins the session's transaction when a command failure means the next
/// attempt may go to a different server. Returns whether it unpinned.
pub async fn unpin_on_command_exception(session: &mut CoreSession, error: &CoreError) -> bool {
    let transaction = session.transaction_mut();
    if !transaction.is_active() || !transaction.is_pinned() {
        return false;
    }
    if error.has_label(TRANSIENT_TRANSACTION_ERROR) || error.has_label(UNKNOWN_TRANSACTION_COMMIT_RESULT) {
        debug!("Unpinning transaction {} after {}", transaction.txn_number(), error);
        transaction.unpin().await;
        return true;
    }
    false
}

/// Commit retries only unpin when the outcome of the commit is unknown.
pub async fn unpin_on_retryable_commit_exception(transaction: &mut CoreTransaction, error: &CoreError) -> bool {
    if !transaction.is_pinned() || !error.has_label(UNKNOWN_TRANSACTION_COMMIT_RESULT) {
        return false;
    }
    debug!("Unpinning transaction {} before commit retry", transaction.txn_number());
    transaction.unpin().await;
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::MemoryCluster;
    use crate::pool::{ConnectionPool, PoolSettings};
    use common::{ClusterType, CommandError, HelloReply, ReadPreference, ServerAddress};

    async fn pinned_session(cluster: &MemoryCluster) -> (CoreSession, ConnectionPool) {
        let address = cluster.add_node("lb:1", HelloReply::mongos());
        let pool = ConnectionPool::new(address, PoolSettings::default(), cluster.factory(), true);
        let mut session = CoreSession::new();
        session.start_transaction(&ReadPreference::primary()).await.unwrap();
        let channel = pool.check_out_default().await.unwrap();
        session
            .transaction_mut()
            .mark_in_progress(ClusterType::LoadBalanced, &pool, channel)
            .unwrap();
        (session, pool)
    }

    fn network() -> CoreError {
        CoreError::network(ServerAddress::new("lb", 1), "connection reset")
    }

    #[tokio::test]
    async fn test_transient_error_unpins_and_returns_channel() {
        let cluster = MemoryCluster::new();
        let (mut session, pool) = pinned_session(&cluster).await;

        let error = label_transaction_error(session.transaction(), network());
        assert!(error.has_label(TRANSIENT_TRANSACTION_ERROR));
        assert!(unpin_on_command_exception(&mut session, &error).await);
        assert!(!session.transaction().is_pinned());
        assert_eq!(pool.stats().in_use, 0);
    }

    #[tokio::test]
    async fn test_unlabelled_error_keeps_pin() {
        let cluster = MemoryCluster::new();
        let (mut session, _pool) = pinned_session(&cluster).await;

        let error = CoreError::Command(CommandError::new(11000, "DuplicateKey", "dup"));
        let error = label_transaction_error(session.transaction(), error);
        assert!(!unpin_on_command_exception(&mut session, &error).await);
        assert!(session.transaction().is_pinned());
    }

    #[tokio::test]
    async fn test_commit_retry_unpins_only_on_unknown_result() {
        let cluster = MemoryCluster::new();
        let (mut session, _pool) = pinned_session(&cluster).await;
        session.commit_transaction().unwrap();

        let transient = network().with_label(TRANSIENT_TRANSACTION_ERROR);
        assert!(!unpin_on_retryable_commit_exception(session.transaction_mut(), &transient).await);
        assert!(session.transaction().is_pinned());

        let unknown = label_transaction_error(session.transaction(), network());
        assert!(unknown.has_label(UNKNOWN_TRANSACTION_COMMIT_RESULT));
        assert!(unpin_on_retryable_commit_exception(session.transaction_mut(), &unknown).await);
        assert!(!session.transaction().is_pinned());
    }
}
