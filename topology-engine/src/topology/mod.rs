//! Cluster view aggregated from the per-node monitors.

mod publisher;
pub mod sdam;

pub use publisher::TopologyPublisher;
pub use sdam::SdamUpdate;

use common::{
    ClusterConfig, ClusterDescription, CoreError, Result, ServerAddress,
    ServerConnectionState, ServerDescription, TopologyVersion,
};
use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::Mutex;
use std::cmp::Ordering as CmpOrdering;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::channel::ChannelFactory;
use crate::monitor::{MonitorEvent, MonitorEventKind, MonitorSettings, ServerMonitor};
use crate::pool::{ConnectionPool, PoolSettings, PoolStats, PooledChannel};
use crate::selector::{select_servers, ServerSelector};

/// Why a server is being marked Unknown outside of its own monitor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidationReason {
    Network(String),
    StateChange { message: String, shutdown: bool },
    Manual(String),
}

impl InvalidationReason {
    pub fn clears_pool(&self) -> bool {
        matches!(
            self,
            InvalidationReason::Network(_) | InvalidationReason::StateChange { shutdown: true, .. }
        )
    }

    pub fn requests_check(&self) -> bool {
        !matches!(self, InvalidationReason::Network(_))
    }
}

impl fmt::Display for InvalidationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvalidationReason::Network(msg) => write!(f, "network error: {}", msg),
            InvalidationReason::StateChange { message, .. } => write!(f, "state change: {}", message),
            InvalidationReason::Manual(msg) => write!(f, "{}", msg),
        }
    }
}

/// Where in the life of a channel an application error happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorPhase {
    BeforeHandshake,
    AfterHandshake,
}

struct ServerHandle {
    epoch: u64,
    monitor: Option<ServerMonitor>,
    pool: ConnectionPool,
}

struct TopologyInner {
    config: ClusterConfig,
    monitor_settings: MonitorSettings,
    pool_settings: PoolSettings,
    factory: Arc<dyn ChannelFactory>,
    publisher: TopologyPublisher,
    servers: DashMap<ServerAddress, ServerHandle>,
    next_epoch: AtomicU64,
    /// Serializes read-modify-publish of the snapshot. Never held across an await.
    update_lock: Mutex<()>,
    events: mpsc::UnboundedSender<MonitorEvent>,
    shutdown: CancellationToken,
}

/// Owns the cluster snapshot and one (monitor, pool) pair per member.
#[derive(Clone)]
pub struct Topology {
    inner: Arc<TopologyInner>,
    update_task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl Topology {
    /// Starts monitoring the configured seeds. Must be called inside a Tokio runtime.
    pub fn new(config: ClusterConfig, factory: Arc<dyn ChannelFactory>) -> Result<Self> {
        config.validate()?;
        let seeds = config.seed_addresses()?;

        let initial = ClusterDescription::new(
            config.initial_cluster_type(),
            seeds.clone(),
            config.replica_set.clone(),
            config.direct_connection,
            config.heartbeat_frequency(),
        )
        .with_local_threshold(config.local_threshold());

        let (events, events_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(TopologyInner {
            monitor_settings: MonitorSettings::from_config(&config),
            pool_settings: PoolSettings::from_config(&config),
            config,
            factory,
            publisher: TopologyPublisher::new(initial),
            servers: DashMap::new(),
            next_epoch: AtomicU64::new(0),
            update_lock: Mutex::new(()),
            events,
            shutdown: CancellationToken::new(),
        });

        info!(
            "Starting topology: {:?} seeds={:?}",
            inner.config.initial_cluster_type(),
            seeds.iter().map(ToString::to_string).collect::<Vec<_>>()
        );
        for address in seeds {
            inner.start_server(address);
        }

        let task = tokio::spawn(run_updates(Arc::downgrade(&inner), events_rx, inner.shutdown.clone()));
        Ok(Self {
            inner,
            update_task: Arc::new(Mutex::new(Some(task))),
        })
    }

    pub fn description(&self) -> Arc<ClusterDescription> {
        self.inner.publisher.load()
    }

    /// Receives the version of every published snapshot.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.inner.publisher.subscribe()
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.inner.config
    }

    pub fn pool(&self, address: &ServerAddress) -> Option<ConnectionPool> {
        self.inner.servers.get(address).map(|h| h.pool.clone())
    }

    pub fn pool_stats(&self) -> Vec<PoolStats> {
        let mut stats: Vec<PoolStats> = self.inner.servers.iter().map(|h| h.pool.stats()).collect();
        stats.sort_by(|a, b| a.address.cmp(&b.address));
        stats
    }

    pub fn request_heartbeat(&self) {
        self.inner.request_heartbeat();
    }

    pub fn request_heartbeat_for(&self, address: &ServerAddress) {
        if let Some(handle) = self.inner.servers.get(address) {
            if let Some(monitor) = &handle.monitor {
                monitor.request_heartbeat();
            }
        }
    }

    /// Picks a server for `selector`, waiting for topology changes up to the
    /// server selection timeout.
    pub async fn select_server_description(
        &self,
        selector: &dyn ServerSelector,
        cancel: Option<&CancellationToken>,
    ) -> Result<Arc<ServerDescription>> {
        let inner = &self.inner;
        let start = Instant::now();
        let deadline = start + inner.config.server_selection_timeout();
        let mut versions = inner.publisher.subscribe();

        loop {
            if inner.shutdown.is_cancelled() {
                return Err(CoreError::Shutdown);
            }
            versions.borrow_and_update();
            let snapshot = inner.publisher.load();
            selector.validate(&snapshot)?;
            if let Some(error) = &snapshot.compatibility_error {
                return Err(CoreError::Incompatible(error.clone()));
            }

            let selected = select_servers(selector, &snapshot);
            if let Some(server) = selector.pick(&selected) {
                trace!("Selected {} with {:?}", server.address, selector);
                return Ok(server);
            }

            debug!("No server matches {:?} in {}; waiting", selector, snapshot);
            inner.request_heartbeat();

            let timed_out = || CoreError::SelectionTimeout {
                selector: format!("{:?}", selector),
                snapshot: inner.publisher.load(),
                elapsed: start.elapsed(),
            };
            tokio::select! {
                _ = cancelled(cancel) => return Err(CoreError::Cancelled),
                changed = time::timeout_at(deadline, versions.changed()) => match changed {
                    Err(_) => return Err(timed_out()),
                    Ok(Err(_)) => return Err(CoreError::Shutdown),
                    Ok(Ok(())) => {}
                },
            }
        }
    }

    /// Selects a server and checks a channel out of its pool.
    pub async fn select_server(
        &self,
        selector: &dyn ServerSelector,
        cancel: Option<&CancellationToken>,
    ) -> Result<(ServerAddress, PooledChannel)> {
        loop {
            let server = self.select_server_description(selector, cancel).await?;
            let pool = match self.pool(&server.address) {
                Some(pool) => pool,
                // removed between selection and check-out
                None => continue,
            };
            let generation = pool.generation();

            let checked_out = tokio::select! {
                _ = cancelled(cancel) => return Err(CoreError::Cancelled),
                result = pool.check_out_default() => result,
            };
            return match checked_out {
                Ok(channel) => Ok((server.address.clone(), channel)),
                Err(error) => {
                    if error.is_network_error() {
                        self.handle_application_error(&server.address, &error, generation, ErrorPhase::BeforeHandshake)
                            .await;
                    }
                    Err(error)
                }
            };
        }
    }

    /// Marks `address` Unknown. With a topology version, the invalidation is
    /// ignored unless it is newer than the one on file. Returns whether the
    /// server was invalidated. A load balancer keeps its description and only
    /// has its pool cleared.
    pub async fn invalidate(
        &self,
        address: &ServerAddress,
        reason: InvalidationReason,
        topology_version: Option<TopologyVersion>,
    ) -> bool {
        let inner = &self.inner;
        let (pool, monitor_epoch) = match inner.servers.get(address) {
            Some(handle) => (handle.pool.clone(), handle.epoch),
            None => return false,
        };

        // No monitor backs a load balancer, so its description never leaves Connected.
        if inner.config.load_balanced {
            if !reason.clears_pool() {
                return false;
            }
            warn!("Clearing pool for load balancer {}: {}", address, reason);
            pool.clear(&reason.to_string()).await;
            return true;
        }

        let applied = {
            let _guard = inner.update_lock.lock();
            let current = inner.publisher.load();
            let on_file = match current.server(address) {
                Some(on_file) => on_file,
                None => return false,
            };
            if let (Some(incoming), Some(known)) = (&topology_version, &on_file.topology_version) {
                if matches!(incoming.partial_cmp(known), Some(CmpOrdering::Less | CmpOrdering::Equal)) {
                    trace!("Ignoring stale invalidation of {}: {}", address, reason);
                    return false;
                }
            }

            let mut description = ServerDescription::unknown(address.clone());
            description.state = ServerConnectionState::Disconnected;
            description.error = Some(reason.to_string());
            description.topology_version = topology_version.or_else(|| on_file.topology_version.clone());
            description.generation = pool.generation();
            inner.apply_locked(&current, description)
        };
        let retired = match applied {
            Some(retired) => retired,
            None => return false,
        };

        warn!("Invalidated {} (epoch {}): {}", address, monitor_epoch, reason);
        if reason.clears_pool() {
            pool.clear(&reason.to_string()).await;
        }
        if reason.requests_check() {
            self.request_heartbeat_for(address);
        }
        retire(retired).await;
        true
    }

    /// Classifies an operation failure on a channel from `address` that was
    /// created at `generation`.
    pub async fn handle_application_error(
        &self,
        address: &ServerAddress,
        error: &CoreError,
        generation: u64,
        phase: ErrorPhase,
    ) {
        let pool = match self.pool(address) {
            Some(pool) => pool,
            None => return,
        };
        if generation < pool.generation() {
            trace!("Ignoring error from stale generation {} on {}: {}", generation, address, error);
            return;
        }

        if error.is_network_error() {
            if phase == ErrorPhase::BeforeHandshake || !error.is_network_timeout() {
                self.invalidate(address, InvalidationReason::Network(error.to_string()), None)
                    .await;
            }
        } else if error.is_state_change_error() {
            let reason = InvalidationReason::StateChange {
                message: error.to_string(),
                shutdown: error.is_shutdown(),
            };
            self.invalidate(address, reason, error.topology_version().cloned())
                .await;
        }
    }

    /// Stops every monitor and the update task, then closes every pool.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        if inner.shutdown.is_cancelled() {
            return;
        }
        info!("Shutting down topology");
        inner.shutdown.cancel();
        inner.publisher.close();

        let task = self.update_task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }

        let addresses: Vec<ServerAddress> = inner.servers.iter().map(|h| h.key().clone()).collect();
        let handles: Vec<ServerHandle> = addresses
            .iter()
            .filter_map(|a| inner.servers.remove(a).map(|(_, h)| h))
            .collect();
        retire(handles).await;
    }
}

impl fmt::Debug for Topology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Topology").field(&self.description().to_string()).finish()
    }
}

impl TopologyInner {
    fn start_server(&self, address: ServerAddress) {
        let epoch = self.next_epoch.fetch_add(1, Ordering::AcqRel);
        let load_balanced = self.config.load_balanced;
        let pool = ConnectionPool::new(address.clone(), self.pool_settings.clone(), self.factory.clone(), load_balanced);
        let monitor = (!load_balanced).then(|| {
            ServerMonitor::start(
                address.clone(),
                epoch,
                self.monitor_settings.clone(),
                self.factory.clone(),
                self.events.clone(),
            )
        });
        self.servers.insert(address, ServerHandle { epoch, monitor, pool });
    }

    fn request_heartbeat(&self) {
        for handle in self.servers.iter() {
            if let Some(monitor) = &handle.monitor {
                monitor.request_heartbeat();
            }
        }
    }

    /// Applies one observation and publishes the result. Caller holds
    /// `update_lock`. Returns the handles of removed members, or None when
    /// the observation was discarded.
    fn apply_locked(&self, current: &ClusterDescription, description: ServerDescription) -> Option<Vec<ServerHandle>> {
        let update = sdam::apply(current, description);
        if !update.applied {
            return None;
        }

        for address in &update.added {
            info!("Adding {} to cluster", address);
            self.start_server(address.clone());
        }
        let retired: Vec<ServerHandle> = update
            .removed
            .iter()
            .filter_map(|address| {
                info!("Removing {} from cluster", address);
                self.servers.remove(address).map(|(_, handle)| handle)
            })
            .collect();

        let previous_type = current.cluster_type;
        let previous_primary = current.primary().map(|p| p.address.clone());
        let published = self.publisher.publish(update.description);
        let primary = published.primary().map(|p| p.address.clone());

        if published.cluster_type != previous_type || primary != previous_primary {
            info!("Cluster changed: {}", published);
        } else {
            debug!("Published cluster version {}", published.version);
        }
        Some(retired)
    }

    async fn handle_event(&self, event: MonitorEvent) {
        let pool = match self.servers.get(&event.address) {
            Some(handle) if handle.epoch == event.epoch => handle.pool.clone(),
            _ => {
                trace!("Dropping event from retired monitor {} (epoch {})", event.address, event.epoch);
                return;
            }
        };

        match event.kind {
            MonitorEventKind::Heartbeat(mut description) => {
                description.generation = pool.generation();
                pool.ready();
                let retired = {
                    let _guard = self.update_lock.lock();
                    let current = self.publisher.load();
                    self.apply_locked(&current, description)
                };
                if let Some(retired) = retired {
                    retire(retired).await;
                }
            }
            MonitorEventKind::Failed { mut description, error } => {
                description.generation = pool.generation();
                let retired = {
                    let _guard = self.update_lock.lock();
                    let current = self.publisher.load();
                    self.apply_locked(&current, description)
                };
                pool.clear(&error.to_string()).await;
                if let Some(retired) = retired {
                    retire(retired).await;
                }
            }
        }
    }
}

async fn run_updates(
    topology: Weak<TopologyInner>,
    mut events: mpsc::UnboundedReceiver<MonitorEvent>,
    shutdown: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        let inner = match topology.upgrade() {
            Some(inner) => inner,
            None => break,
        };
        inner.handle_event(event).await;
    }
    debug!("Topology update task stopped");
}

async fn retire(handles: Vec<ServerHandle>) {
    join_all(handles.into_iter().map(|handle| async move {
        if let Some(monitor) = &handle.monitor {
            monitor.shutdown().await;
        }
        handle.pool.close().await;
    }))
    .await;
}

async fn cancelled(token: Option<&CancellationToken>) {
    match token {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}
