//! Per-node connection pool with FIFO wait queue and pause-on-failure.

mod pooled;

pub use pooled::PooledChannel;

use common::{ClusterConfig, CoreError, PoolConfig, Result, ServerAddress};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::channel::{Channel, ChannelFactory, ChannelPurpose};
use crate::sync::{AtomicState, HandoffQueue, StateRepr};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolStatus {
    Paused,
    Ready,
    Closed,
}

impl StateRepr for PoolStatus {
    fn to_raw(self) -> u8 {
        match self {
            PoolStatus::Paused => 0,
            PoolStatus::Ready => 1,
            PoolStatus::Closed => 2,
        }
    }

    fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(PoolStatus::Paused),
            1 => Some(PoolStatus::Ready),
            2 => Some(PoolStatus::Closed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub max_size: usize,
    pub min_size: usize,
    pub wait_queue_timeout: Duration,
    pub max_idle_time: Option<Duration>,
    pub maintenance_interval: Duration,
    pub connect_timeout: Duration,
}

impl PoolSettings {
    pub fn from_config(config: &ClusterConfig) -> Self {
        let pool: &PoolConfig = &config.pool;
        Self {
            max_size: pool.max_pool_size,
            min_size: pool.min_pool_size,
            wait_queue_timeout: pool.wait_queue_timeout(),
            max_idle_time: pool.max_idle_time(),
            maintenance_interval: pool.maintenance_interval(),
            connect_timeout: config.connect_timeout(),
        }
    }
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self::from_config(&ClusterConfig::default())
    }
}

/// Point-in-time view of a pool for diagnostics and error reports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub address: ServerAddress,
    pub status: PoolStatus,
    pub generation: u64,
    pub total: usize,
    pub idle: usize,
    pub in_use: usize,
    pub waiters: usize,
    pub max_size: usize,
}

impl fmt::Display for PoolStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {:?} gen={} total={}/{} idle={} in_use={} waiters={}",
            self.address,
            self.status,
            self.generation,
            self.total,
            self.max_size,
            self.idle,
            self.in_use,
            self.waiters
        )
    }
}

struct IdleChannel {
    channel: Box<dyn Channel>,
    generation: u64,
    created_at: Instant,
    idle_since: Instant,
}

enum WaitOutcome {
    Channel(IdleChannel),
    /// The waiter inherits a reserved slot and opens its own channel.
    Permit,
    Failed(CoreError),
}

struct Waiter {
    id: u64,
    slot: Arc<HandoffQueue<WaitOutcome>>,
}

#[derive(Default)]
struct PoolState {
    idle: VecDeque<IdleChannel>,
    /// Outstanding + idle + being created.
    total: usize,
    waiters: VecDeque<Waiter>,
    next_waiter: u64,
    pause_cause: Option<String>,
}

pub(crate) struct PoolInner {
    address: ServerAddress,
    settings: PoolSettings,
    factory: Arc<dyn ChannelFactory>,
    status: AtomicState<PoolStatus>,
    generation: AtomicU64,
    load_balanced: bool,
    state: Mutex<PoolState>,
    shutdown: CancellationToken,
}

impl PoolInner {
    fn is_stale(&self, idle: &IdleChannel, now: Instant) -> bool {
        idle.generation != self.generation.load(Ordering::Acquire)
            || !idle.channel.is_live()
            || self
                .settings
                .max_idle_time
                .map_or(false, |max| now.duration_since(idle.idle_since) >= max)
    }

    /// Gives a reserved slot to the oldest waiter, or frees it.
    pub(crate) fn release_slot(&self) {
        let mut state = self.state.lock();
        if self.status.load() == PoolStatus::Ready {
            if let Some(waiter) = state.waiters.pop_front() {
                let _ = waiter.slot.offer(WaitOutcome::Permit);
                return;
            }
        }
        state.total = state.total.saturating_sub(1);
    }

    /// Hands a healthy channel to the oldest waiter or parks it as idle.
    fn give_back(&self, idle: IdleChannel) {
        let mut state = self.state.lock();
        match state.waiters.pop_front() {
            Some(waiter) => {
                if let Err(WaitOutcome::Channel(idle)) = waiter.slot.offer(WaitOutcome::Channel(idle)) {
                    state.idle.push_back(idle);
                }
            }
            None => state.idle.push_back(idle),
        }
    }

    fn paused_error(&self, state: &PoolState, elapsed: Duration) -> CoreError {
        CoreError::PoolPaused {
            address: self.address.clone(),
            cause: state
                .pause_cause
                .clone()
                .unwrap_or_else(|| "no successful heartbeat yet".to_string()),
            wait_queue_depth: state.waiters.len(),
            elapsed,
        }
    }

    fn stats(&self) -> PoolStats {
        let state = self.state.lock();
        PoolStats {
            address: self.address.clone(),
            status: self.status.load(),
            generation: self.generation.load(Ordering::Acquire),
            total: state.total,
            idle: state.idle.len(),
            in_use: state.total.saturating_sub(state.idle.len()),
            waiters: state.waiters.len(),
            max_size: self.settings.max_size,
        }
    }
}

/// Removes a waiter that stops waiting for any reason and returns whatever
/// was handed to it in the meantime.
struct WaiterGuard {
    pool: Arc<PoolInner>,
    id: u64,
    slot: Arc<HandoffQueue<WaitOutcome>>,
    armed: bool,
}

impl WaiterGuard {
    /// Leaves the queue. Returns an outcome delivered concurrently, if any.
    fn withdraw(&mut self) -> Option<WaitOutcome> {
        self.armed = false;
        let mut state = self.pool.state.lock();
        let position = state.waiters.iter().position(|w| w.id == self.id);
        match position {
            Some(index) => {
                state.waiters.remove(index);
                None
            }
            None => self.slot.poll(),
        }
    }
}

impl Drop for WaiterGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        match self.withdraw() {
            Some(WaitOutcome::Channel(idle)) => self.pool.give_back(idle),
            Some(WaitOutcome::Permit) => self.pool.release_slot(),
            Some(WaitOutcome::Failed(_)) | None => {}
        }
    }
}

enum Admission {
    Reuse(IdleChannel),
    Create,
    Wait(WaiterGuard),
}

#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    /// Creates a pool and starts its maintenance task. Pools start paused
    /// until the first successful heartbeat, except in load-balanced mode.
    pub fn new(
        address: ServerAddress,
        settings: PoolSettings,
        factory: Arc<dyn ChannelFactory>,
        load_balanced: bool,
    ) -> Self {
        let initial = if load_balanced {
            PoolStatus::Ready
        } else {
            PoolStatus::Paused
        };
        let inner = Arc::new(PoolInner {
            address,
            settings,
            factory,
            status: AtomicState::new(initial),
            generation: AtomicU64::new(0),
            load_balanced,
            state: Mutex::new(PoolState::default()),
            shutdown: CancellationToken::new(),
        });

        tokio::spawn(run_maintenance(Arc::downgrade(&inner), inner.shutdown.clone()));
        debug!("Created pool for {} ({:?})", inner.address, initial);
        Self { inner }
    }

    pub fn address(&self) -> &ServerAddress {
        &self.inner.address
    }

    pub fn status(&self) -> PoolStatus {
        self.inner.status.load()
    }

    pub fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> PoolStats {
        self.inner.stats()
    }

    pub async fn check_out_default(&self) -> Result<PooledChannel> {
        self.check_out(self.inner.settings.wait_queue_timeout).await
    }

    pub async fn check_out(&self, timeout: Duration) -> Result<PooledChannel> {
        let start = Instant::now();
        let deadline = start + timeout;
        let inner = &self.inner;

        let mut discarded = Vec::new();
        let admission = {
            let mut state = inner.state.lock();
            match inner.status.load() {
                PoolStatus::Paused => return Err(inner.paused_error(&state, start.elapsed())),
                PoolStatus::Closed => {
                    return Err(CoreError::PoolClosed {
                        address: inner.address.clone(),
                    })
                }
                PoolStatus::Ready => {}
            }

            let now = Instant::now();
            let mut reuse = None;
            if state.waiters.is_empty() {
                while let Some(idle) = state.idle.pop_back() {
                    if inner.is_stale(&idle, now) {
                        state.total = state.total.saturating_sub(1);
                        discarded.push(idle.channel);
                    } else {
                        reuse = Some(idle);
                        break;
                    }
                }
            }

            if let Some(idle) = reuse {
                Admission::Reuse(idle)
            } else if state.waiters.is_empty() && state.total < inner.settings.max_size {
                state.total += 1;
                Admission::Create
            } else {
                let id = state.next_waiter;
                state.next_waiter += 1;
                let slot = Arc::new(HandoffQueue::bounded(1));
                state.waiters.push_back(Waiter {
                    id,
                    slot: slot.clone(),
                });
                while state.total < inner.settings.max_size {
                    match state.waiters.pop_front() {
                        Some(first) => {
                            state.total += 1;
                            let _ = first.slot.offer(WaitOutcome::Permit);
                        }
                        None => break,
                    }
                }
                Admission::Wait(WaiterGuard {
                    pool: inner.clone(),
                    id,
                    slot,
                    armed: true,
                })
            }
        };

        for channel in discarded {
            channel.close().await;
        }

        match admission {
            Admission::Reuse(idle) => Ok(self.wrap(idle)),
            Admission::Create => self.create().await,
            Admission::Wait(mut guard) => {
                let delivered = guard.slot.take_until(deadline).await;
                let outcome = match delivered {
                    Some(outcome) => {
                        guard.armed = false;
                        Some(outcome)
                    }
                    None => guard.withdraw(),
                };
                match outcome {
                    Some(WaitOutcome::Channel(idle)) => Ok(self.wrap(idle)),
                    Some(WaitOutcome::Permit) => self.create().await,
                    Some(WaitOutcome::Failed(CoreError::PoolPaused {
                        address,
                        cause,
                        wait_queue_depth,
                        ..
                    })) => Err(CoreError::PoolPaused {
                        address,
                        cause,
                        wait_queue_depth,
                        elapsed: start.elapsed(),
                    }),
                    Some(WaitOutcome::Failed(err)) => Err(err),
                    None => {
                        let stats = inner.stats();
                        debug!("Check-out from {} timed out: {}", inner.address, stats);
                        Err(CoreError::PoolWaitTimeout {
                            address: inner.address.clone(),
                            wait_queue_depth: stats.waiters,
                            pool_size: stats.total,
                            in_use: stats.in_use,
                            max_size: stats.max_size,
                            elapsed: start.elapsed(),
                        })
                    }
                }
            }
        }
    }

    /// Returns a channel. Stale, broken or post-close channels are closed;
    /// healthy ones go to the oldest waiter or back to the idle list.
    pub async fn check_in(&self, pooled: PooledChannel) {
        let generation = pooled.generation();
        let created_at = pooled.created_at();
        let channel = match pooled.take() {
            Some(channel) => channel,
            None => return,
        };

        let keep = self.status() != PoolStatus::Closed
            && generation == self.generation()
            && channel.is_live();
        if !keep {
            debug!(
                "Closing channel {} to {} on check-in (gen {} vs {})",
                channel.id(),
                self.inner.address,
                generation,
                self.generation()
            );
            channel.close().await;
            self.inner.release_slot();
            return;
        }

        self.inner.give_back(IdleChannel {
            channel,
            generation,
            created_at,
            idle_since: Instant::now(),
        });
    }

    /// Invalidates every existing channel and, unless load-balanced, pauses
    /// the pool and fails all waiters.
    pub async fn clear(&self, cause: &str) {
        let inner = &self.inner;
        let generation = inner.generation.fetch_add(1, Ordering::AcqRel) + 1;

        let paused = !inner.load_balanced
            && inner
                .status
                .compare_exchange(PoolStatus::Ready, PoolStatus::Paused)
                .is_ok();

        let (drained, waiters, error) = {
            let mut state = inner.state.lock();
            let drained: Vec<IdleChannel> = state.idle.drain(..).collect();
            state.total = state.total.saturating_sub(drained.len());
            if inner.load_balanced {
                (drained, Vec::new(), None)
            } else {
                state.pause_cause = Some(cause.to_string());
                let error = inner.paused_error(&state, Duration::ZERO);
                let waiters: Vec<Waiter> = state.waiters.drain(..).collect();
                (drained, waiters, Some(error))
            }
        };

        if let Some(error) = error {
            for waiter in waiters {
                let _ = waiter.slot.offer(WaitOutcome::Failed(error.clone()));
            }
        }
        if paused {
            warn!("Pool for {} paused at generation {}: {}", inner.address, generation, cause);
        } else {
            debug!("Pool for {} cleared to generation {}: {}", inner.address, generation, cause);
        }
        for idle in drained {
            idle.channel.close().await;
        }
    }

    /// Paused -> Ready after a successful heartbeat.
    pub fn ready(&self) -> bool {
        let became_ready = self
            .inner
            .status
            .compare_exchange(PoolStatus::Paused, PoolStatus::Ready)
            .is_ok();
        if became_ready {
            self.inner.state.lock().pause_cause = None;
            info!("Pool for {} is ready", self.inner.address);
        }
        became_ready
    }

    /// Terminal. Stops maintenance, fails waiters and closes idle channels;
    /// outstanding channels are closed when checked in.
    pub async fn close(&self) {
        let inner = &self.inner;
        if inner.status.swap(PoolStatus::Closed) == PoolStatus::Closed {
            return;
        }
        inner.shutdown.cancel();

        let (drained, waiters) = {
            let mut state = inner.state.lock();
            let drained: Vec<IdleChannel> = state.idle.drain(..).collect();
            state.total = state.total.saturating_sub(drained.len());
            (drained, state.waiters.drain(..).collect::<Vec<_>>())
        };
        for waiter in waiters {
            let _ = waiter.slot.offer(WaitOutcome::Failed(CoreError::PoolClosed {
                address: inner.address.clone(),
            }));
        }
        for idle in drained {
            idle.channel.close().await;
        }
        info!("Pool for {} closed", inner.address);
    }

    fn wrap(&self, idle: IdleChannel) -> PooledChannel {
        PooledChannel::new(idle.channel, idle.generation, idle.created_at, Arc::downgrade(&self.inner))
    }

    /// Opens a channel into a slot already reserved by the caller.
    async fn create(&self) -> Result<PooledChannel> {
        match open_channel(&self.inner).await {
            Ok(idle) => Ok(self.wrap(idle)),
            Err(err) => {
                warn!("Failed to open channel to {}: {}", self.inner.address, err);
                self.inner.release_slot();
                Err(err)
            }
        }
    }
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ConnectionPool").field(&self.stats()).finish()
    }
}

async fn open_channel(inner: &PoolInner) -> Result<IdleChannel> {
    let generation = inner.generation.load(Ordering::Acquire);
    let channel = time::timeout(
        inner.settings.connect_timeout,
        inner.factory.open(&inner.address, ChannelPurpose::Application),
    )
    .await
    .map_err(|_| CoreError::network_timeout(inner.address.clone(), "connect timed out"))??;

    let now = Instant::now();
    Ok(IdleChannel {
        channel,
        generation,
        created_at: now,
        idle_since: now,
    })
}

async fn run_maintenance(pool: Weak<PoolInner>, shutdown: CancellationToken) {
    let interval = match pool.upgrade() {
        Some(inner) => inner.settings.maintenance_interval,
        None => return,
    };
    let mut ticker = time::interval(interval);
    ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let inner = match pool.upgrade() {
            Some(inner) => inner,
            None => break,
        };
        if inner.status.load() != PoolStatus::Ready {
            continue;
        }

        let expired = {
            let mut state = inner.state.lock();
            let now = Instant::now();
            let (stale, fresh): (Vec<IdleChannel>, Vec<IdleChannel>) =
                state.idle.drain(..).partition(|idle| inner.is_stale(idle, now));
            state.idle.extend(fresh);
            state.total = state.total.saturating_sub(stale.len());
            stale
        };
        if !expired.is_empty() {
            debug!("Pruned {} idle channels to {}", expired.len(), inner.address);
        }
        for idle in expired {
            idle.channel.close().await;
        }

        while inner.status.load() == PoolStatus::Ready {
            let reserved = {
                let mut state = inner.state.lock();
                if state.total < inner.settings.min_size {
                    state.total += 1;
                    true
                } else {
                    false
                }
            };
            if !reserved {
                break;
            }
            match open_channel(&inner).await {
                Ok(idle) => inner.give_back(idle),
                Err(err) => {
                    warn!("Failed to populate pool for {}: {}", inner.address, err);
                    inner.release_slot();
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::MemoryCluster;
    use common::HelloReply;

    fn settings(max_size: usize) -> PoolSettings {
        PoolSettings {
            max_size,
            min_size: 0,
            wait_queue_timeout: Duration::from_secs(1),
            max_idle_time: None,
            maintenance_interval: Duration::from_millis(20),
            connect_timeout: Duration::from_secs(1),
        }
    }

    fn ready_pool(cluster: &MemoryCluster, settings: PoolSettings) -> ConnectionPool {
        let address = cluster.add_node("a:1", HelloReply::standalone());
        let pool = ConnectionPool::new(address, settings, cluster.factory(), false);
        assert!(pool.ready());
        pool
    }

    #[tokio::test]
    async fn test_starts_paused_and_fails_fast() {
        let cluster = MemoryCluster::new();
        let address = cluster.add_node("a:1", HelloReply::standalone());
        let pool = ConnectionPool::new(address, settings(2), cluster.factory(), false);

        let start = Instant::now();
        let err = pool.check_out(Duration::from_secs(5)).await.unwrap_err();
        assert!(err.is_pool_paused());
        assert!(start.elapsed() < Duration::from_millis(500));
        assert_eq!(cluster.opened("a:1"), 0);
    }

    #[tokio::test]
    async fn test_reuses_idle_channel() {
        let cluster = MemoryCluster::new();
        let pool = ready_pool(&cluster, settings(2));

        let first = pool.check_out(Duration::from_secs(1)).await.unwrap();
        let id = first.id();
        pool.check_in(first).await;

        let second = pool.check_out(Duration::from_secs(1)).await.unwrap();
        assert_eq!(second.id(), id);
        assert_eq!(cluster.opened("a:1"), 1);
        assert_eq!(pool.stats().in_use, 1);
        pool.check_in(second).await;
        assert_eq!(pool.stats().idle, 1);
    }

    #[tokio::test]
    async fn test_wait_times_out_with_context() {
        let cluster = MemoryCluster::new();
        let pool = ready_pool(&cluster, settings(1));
        let held = pool.check_out(Duration::from_secs(1)).await.unwrap();

        let start = Instant::now();
        let err = pool.check_out(Duration::from_millis(50)).await.unwrap_err();
        assert!(start.elapsed() >= Duration::from_millis(50));
        match err {
            CoreError::PoolWaitTimeout { pool_size, in_use, max_size, .. } => {
                assert_eq!(pool_size, 1);
                assert_eq!(in_use, 1);
                assert_eq!(max_size, 1);
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert_eq!(pool.stats().waiters, 0);
        pool.check_in(held).await;
    }

    #[tokio::test]
    async fn test_clear_discards_old_generation() {
        let cluster = MemoryCluster::new();
        let pool = ready_pool(&cluster, settings(2));
        let held = pool.check_out(Duration::from_secs(1)).await.unwrap();
        assert_eq!(held.generation(), 0);

        pool.clear("network error").await;
        assert_eq!(pool.status(), PoolStatus::Paused);
        assert_eq!(pool.generation(), 1);

        pool.check_in(held).await;
        assert_eq!(cluster.closed("a:1"), 1);
        assert_eq!(pool.stats().total, 0);

        assert!(pool.check_out(Duration::from_secs(1)).await.unwrap_err().is_pool_paused());
        pool.ready();
        let fresh = pool.check_out(Duration::from_secs(1)).await.unwrap();
        assert_eq!(fresh.generation(), 1);
        pool.check_in(fresh).await;
    }

    #[tokio::test]
    async fn test_clear_fails_waiters() {
        let cluster = MemoryCluster::new();
        let pool = ready_pool(&cluster, settings(1));
        let held = pool.check_out(Duration::from_secs(1)).await.unwrap();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.check_out(Duration::from_secs(5)).await })
        };
        time::sleep(Duration::from_millis(20)).await;
        assert_eq!(pool.stats().waiters, 1);

        pool.clear("primary stepped down").await;
        let err = waiter.await.unwrap().unwrap_err();
        match err {
            CoreError::PoolPaused { cause, .. } => assert_eq!(cause, "primary stepped down"),
            other => panic!("unexpected error {:?}", other),
        }
        pool.check_in(held).await;
    }

    #[tokio::test]
    async fn test_load_balanced_pool_never_pauses() {
        let cluster = MemoryCluster::new();
        let address = cluster.add_node("lb:1", HelloReply::mongos());
        let pool = ConnectionPool::new(address, settings(2), cluster.factory(), true);
        assert_eq!(pool.status(), PoolStatus::Ready);

        pool.clear("network error").await;
        assert_eq!(pool.status(), PoolStatus::Ready);
        assert_eq!(pool.generation(), 1);
        assert!(pool.check_out(Duration::from_secs(1)).await.is_ok());
    }

    #[tokio::test]
    async fn test_cancelled_waiter_does_not_strand_channel() {
        let cluster = MemoryCluster::new();
        let pool = ready_pool(&cluster, settings(1));
        let held = pool.check_out(Duration::from_secs(1)).await.unwrap();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.check_out(Duration::from_secs(5)).await })
        };
        time::sleep(Duration::from_millis(20)).await;
        waiter.abort();
        let _ = waiter.await;

        pool.check_in(held).await;
        let stats = pool.stats();
        assert_eq!(stats.waiters, 0);
        assert_eq!(stats.idle, 1);
        assert!(pool.check_out(Duration::from_millis(100)).await.is_ok());
    }

    #[tokio::test]
    async fn test_concurrent_checkouts_get_distinct_channels() {
        let cluster = MemoryCluster::new();
        let pool = ready_pool(&cluster, settings(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let pool = pool.clone();
                tokio::spawn(async move { pool.check_out(Duration::from_secs(1)).await })
            })
            .collect();
        let mut channels = Vec::new();
        for handle in handles {
            channels.push(handle.await.unwrap().unwrap());
        }
        let mut ids: Vec<_> = channels.iter().map(|c| c.id()).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 8);
        assert!(pool.stats().total <= 8);
    }

    #[tokio::test]
    async fn test_concurrent_checkouts_reuse_distinct_idle_channels() {
        let cluster = MemoryCluster::new();
        let pool = ready_pool(&cluster, settings(4));

        let mut warm = Vec::new();
        for _ in 0..4 {
            warm.push(pool.check_out(Duration::from_secs(1)).await.unwrap());
        }
        for channel in warm {
            pool.check_in(channel).await;
        }
        assert_eq!(pool.stats().idle, 4);

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let pool = pool.clone();
                tokio::spawn(async move { pool.check_out(Duration::from_secs(1)).await })
            })
            .collect();
        let mut channels = Vec::new();
        for handle in handles {
            channels.push(handle.await.unwrap().unwrap());
        }
        let ids: std::collections::HashSet<_> = channels.iter().map(|c| c.id()).collect();
        assert_eq!(ids.len(), 4);
        assert_eq!(cluster.opened("a:1"), 4);
        assert_eq!(pool.stats().idle, 0);
        assert_eq!(pool.stats().in_use, 4);
    }

    #[tokio::test]
    async fn test_maintenance_populates_and_prunes() {
        let cluster = MemoryCluster::new();
        let mut s = settings(4);
        s.min_size = 2;
        s.max_idle_time = Some(Duration::from_millis(30));
        let pool = ready_pool(&cluster, s);

        time::sleep(Duration::from_millis(100)).await;
        let stats = pool.stats();
        assert_eq!(stats.total, 2);
        // expired channels are replaced to keep the minimum
        assert!(cluster.opened("a:1") > 2);

        pool.close().await;
        assert_eq!(pool.stats().total, 0);
        assert!(matches!(
            pool.check_out(Duration::from_secs(1)).await,
            Err(CoreError::PoolClosed { .. })
        ));
    }
}
