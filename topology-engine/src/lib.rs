//! Cluster discovery, server selection and connection pooling.
//!
//! A [`Topology`] runs one [`ServerMonitor`] and one [`ConnectionPool`] per
//! known member, folds heartbeat results into an immutable
//! [`ClusterDescription`](common::ClusterDescription) snapshot and hands out
//! channels to servers picked by a [`ServerSelector`].

pub mod channel;
pub mod monitor;
pub mod pool;
pub mod selector;
pub mod sync;
pub mod topology;
pub mod txn;

pub use channel::{Channel, ChannelFactory, ChannelPurpose, Document, MemoryCluster};
pub use monitor::{MonitorSettings, MonitorState, ServerMonitor};
pub use pool::{ConnectionPool, PoolSettings, PoolStats, PoolStatus, PooledChannel};
pub use selector::{
    CompositeSelector, ReadPreferenceSelector, SecondaryUsePolicy, ServerAddressSelector, ServerSelector,
    WritableServerSelector,
};
pub use sync::{AtomicState, HandoffQueue, StateRepr};
pub use topology::{ErrorPhase, InvalidationReason, Topology};
pub use txn::{CoreSession, CoreTransaction, TransactionState};
