//! Per-node heartbeat loop.

mod rtt;

pub use rtt::RttEstimator;

use common::{
    ClusterConfig, CoreError, HelloReply, MonitoringMode, Result, ServerAddress, ServerDescription,
    TopologyVersion,
};
use parking_lot::Mutex;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::channel::{Channel, ChannelFactory, ChannelPurpose, Document};
use crate::sync::{AtomicState, HandoffQueue, StateRepr};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    Stopped,
    Connecting,
    Observing,
    ErrorBackoff,
}

impl StateRepr for MonitorState {
    fn to_raw(self) -> u8 {
        match self {
            MonitorState::Stopped => 0,
            MonitorState::Connecting => 1,
            MonitorState::Observing => 2,
            MonitorState::ErrorBackoff => 3,
        }
    }

    fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(MonitorState::Stopped),
            1 => Some(MonitorState::Connecting),
            2 => Some(MonitorState::Observing),
            3 => Some(MonitorState::ErrorBackoff),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub heartbeat_frequency: Duration,
    pub min_heartbeat_frequency: Duration,
    pub connect_timeout: Duration,
    pub mode: MonitoringMode,
}

impl MonitorSettings {
    pub fn from_config(config: &ClusterConfig) -> Self {
        Self {
            heartbeat_frequency: config.heartbeat_frequency(),
            min_heartbeat_frequency: config.min_heartbeat_frequency(),
            connect_timeout: config.connect_timeout(),
            mode: config.monitoring_mode,
        }
    }

    /// Delay before the next check after `failures` consecutive failures.
    pub fn backoff(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(16);
        self.min_heartbeat_frequency
            .saturating_mul(1u32 << exponent)
            .min(self.heartbeat_frequency)
    }
}

#[derive(Debug, Clone)]
pub enum MonitorEventKind {
    Heartbeat(ServerDescription),
    Failed {
        description: ServerDescription,
        error: CoreError,
    },
}

/// Observation sent from a monitor to the aggregator. `epoch` identifies the
/// monitor instance so results from a retired one can be dropped.
#[derive(Debug, Clone)]
pub struct MonitorEvent {
    pub epoch: u64,
    pub address: ServerAddress,
    pub kind: MonitorEventKind,
}

/// Builds a `hello`, awaitable when the previous reply carried a topology version.
pub fn hello_command(awaited: Option<&TopologyVersion>, max_await: Duration) -> Document {
    match awaited {
        Some(tv) => json!({
            "hello": 1,
            "topologyVersion": tv,
            "maxAwaitTimeMS": max_await.as_millis() as u64,
        }),
        None => json!({"hello": 1}),
    }
}

struct MonitorShared {
    address: ServerAddress,
    epoch: u64,
    settings: MonitorSettings,
    factory: Arc<dyn ChannelFactory>,
    state: AtomicState<MonitorState>,
    wakeup: HandoffQueue<()>,
    in_flight: AtomicBool,
    cancel: CancellationToken,
    events: mpsc::UnboundedSender<MonitorEvent>,
}

pub struct ServerMonitor {
    shared: Arc<MonitorShared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ServerMonitor {
    pub fn start(
        address: ServerAddress,
        epoch: u64,
        settings: MonitorSettings,
        factory: Arc<dyn ChannelFactory>,
        events: mpsc::UnboundedSender<MonitorEvent>,
    ) -> Self {
        let shared = Arc::new(MonitorShared {
            address,
            epoch,
            settings,
            factory,
            state: AtomicState::new(MonitorState::Connecting),
            wakeup: HandoffQueue::bounded(1),
            in_flight: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            events,
        });

        info!("Starting monitor for {} (epoch {})", shared.address, epoch);
        let runner = MonitorRunner::new(shared.clone());
        let handle = tokio::spawn(runner.run());

        Self {
            shared,
            handle: Mutex::new(Some(handle)),
        }
    }

    pub fn address(&self) -> &ServerAddress {
        &self.shared.address
    }

    pub fn epoch(&self) -> u64 {
        self.shared.epoch
    }

    pub fn state(&self) -> MonitorState {
        self.shared.state.load()
    }

    /// Wakes the loop for an immediate check. Collapses with other pending
    /// requests and does nothing while a check is already running.
    pub fn request_heartbeat(&self) {
        if self.shared.in_flight.load(Ordering::Acquire) {
            return;
        }
        let _ = self.shared.wakeup.offer(());
    }

    /// Cancels the loop, including any in-flight check.
    pub fn stop(&self) {
        self.shared.cancel.cancel();
    }

    pub async fn shutdown(&self) {
        self.stop();
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

impl Drop for ServerMonitor {
    fn drop(&mut self) {
        self.shared.cancel.cancel();
    }
}

struct MonitorRunner {
    shared: Arc<MonitorShared>,
    channel: Option<Box<dyn Channel>>,
    rtt: RttEstimator,
    topology_version: Option<TopologyVersion>,
    known: bool,
    failures: u32,
    last_check: Option<Instant>,
}

impl MonitorRunner {
    fn new(shared: Arc<MonitorShared>) -> Self {
        Self {
            shared,
            channel: None,
            rtt: RttEstimator::new(),
            topology_version: None,
            known: false,
            failures: 0,
            last_check: None,
        }
    }

    fn streaming(&self) -> Option<TopologyVersion> {
        match self.shared.settings.mode {
            MonitoringMode::Poll => None,
            MonitoringMode::Auto | MonitoringMode::Stream => self.topology_version.clone(),
        }
    }

    async fn run(mut self) {
        let cancel = self.shared.cancel.clone();

        loop {
            let awaited = self.streaming();
            if awaited.is_none() && !self.space_checks(&cancel).await {
                break;
            }

            self.shared.in_flight.store(true, Ordering::Release);
            self.shared.wakeup.clear();
            self.last_check = Some(Instant::now());

            let outcome = tokio::select! {
                _ = cancel.cancelled() => break,
                outcome = self.check_with_retry(awaited.as_ref()) => outcome,
            };
            self.shared.in_flight.store(false, Ordering::Release);

            let event = match outcome {
                Ok(description) => self.on_success(description),
                Err(error) => self.on_failure(error).await,
            };
            if self.shared.events.send(event).is_err() {
                debug!("Aggregator gone, stopping monitor for {}", self.shared.address);
                break;
            }

            if self.streaming().is_some() {
                continue;
            }
            let wait = if self.failures > 0 {
                self.shared.settings.backoff(self.failures)
            } else {
                self.shared.settings.heartbeat_frequency
            };
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.shared.wakeup.take_timeout(wait) => {}
            }
        }

        self.shared.in_flight.store(false, Ordering::Release);
        if let Some(channel) = self.channel.take() {
            channel.close().await;
        }
        self.shared.state.store(MonitorState::Stopped);
        info!("Monitor for {} stopped", self.shared.address);
    }

    /// Keeps checks at least the minimum heartbeat interval apart. Returns
    /// false when cancelled while waiting.
    async fn space_checks(&self, cancel: &CancellationToken) -> bool {
        let earliest = match self.last_check {
            Some(last) => last + self.shared.settings.min_heartbeat_frequency,
            None => return true,
        };
        if Instant::now() >= earliest {
            return true;
        }
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = time::sleep_until(earliest) => true,
        }
    }

    async fn check_with_retry(&mut self, awaited: Option<&TopologyVersion>) -> Result<ServerDescription> {
        match self.check(awaited).await {
            Err(error) if error.is_network_error() && self.known => {
                debug!("Heartbeat to {} failed ({}), retrying once", self.shared.address, error);
                self.discard_channel().await;
                self.check(None).await
            }
            other => other,
        }
    }

    async fn check(&mut self, awaited: Option<&TopologyVersion>) -> Result<ServerDescription> {
        let address = self.shared.address.clone();
        let settings = self.shared.settings.clone();

        let live = self.channel.as_ref().map_or(false, |c| c.is_live());
        if !live {
            self.discard_channel().await;
            self.shared.state.store(MonitorState::Connecting);
            let opened = time::timeout(
                settings.connect_timeout,
                self.shared.factory.open(&address, ChannelPurpose::Monitoring),
            )
            .await
            .map_err(|_| CoreError::network_timeout(address.clone(), "connect timed out"))??;
            self.channel = Some(opened);
        }
        let channel = match self.channel.as_ref() {
            Some(channel) => channel,
            None => return Err(CoreError::network(address, "monitoring channel unavailable")),
        };

        let command = hello_command(awaited, settings.heartbeat_frequency);
        let limit = match awaited {
            Some(_) => settings.connect_timeout + settings.heartbeat_frequency,
            None => settings.connect_timeout,
        };
        let start = Instant::now();
        let document = time::timeout(limit, channel.send_command(command))
            .await
            .map_err(|_| CoreError::network_timeout(address.clone(), "heartbeat timed out"))??;
        let reply = HelloReply::from_document(document)?;

        // awaitable replies are held by the server, so only polls measure RTT
        let rtt = match (awaited, self.rtt.current()) {
            (Some(_), Some(current)) => current,
            _ => self.rtt.update(start.elapsed()),
        };
        Ok(ServerDescription::from_hello(address, &reply, rtt, 0))
    }

    fn on_success(&mut self, description: ServerDescription) -> MonitorEvent {
        if self.failures > 0 {
            info!("Monitor for {} recovered after {} failures", self.shared.address, self.failures);
        }
        debug!("Heartbeat from {}", description);
        self.failures = 0;
        self.known = description.server_type.is_known();
        self.topology_version = description.topology_version.clone();
        self.shared.state.store(MonitorState::Observing);

        MonitorEvent {
            epoch: self.shared.epoch,
            address: self.shared.address.clone(),
            kind: MonitorEventKind::Heartbeat(description),
        }
    }

    async fn on_failure(&mut self, error: CoreError) -> MonitorEvent {
        warn!("Heartbeat to {} failed: {}", self.shared.address, error);
        self.discard_channel().await;
        self.failures = self.failures.saturating_add(1);
        self.known = false;
        self.topology_version = None;
        self.rtt.reset();
        self.shared.state.store(MonitorState::ErrorBackoff);

        let description = ServerDescription::with_error(self.shared.address.clone(), &error, None);
        MonitorEvent {
            epoch: self.shared.epoch,
            address: self.shared.address.clone(),
            kind: MonitorEventKind::Failed { description, error },
        }
    }

    async fn discard_channel(&mut self) {
        if let Some(channel) = self.channel.take() {
            channel.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::MemoryCluster;
    use common::ServerType;

    fn settings(heartbeat_ms: u64, mode: MonitoringMode) -> MonitorSettings {
        MonitorSettings {
            heartbeat_frequency: Duration::from_millis(heartbeat_ms),
            min_heartbeat_frequency: Duration::from_millis(10),
            connect_timeout: Duration::from_secs(1),
            mode,
        }
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<MonitorEvent>) -> MonitorEvent {
        time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("monitor event")
            .expect("channel open")
    }

    #[test]
    fn test_backoff_is_capped() {
        let s = settings(1_000, MonitoringMode::Poll);
        assert_eq!(s.backoff(1), Duration::from_millis(10));
        assert_eq!(s.backoff(3), Duration::from_millis(40));
        assert_eq!(s.backoff(50), Duration::from_millis(1_000));
    }

    #[test]
    fn test_hello_command() {
        assert_eq!(hello_command(None, Duration::from_secs(10)), json!({"hello": 1}));
        let tv = TopologyVersion::new("p", 4);
        let awaitable = hello_command(Some(&tv), Duration::from_secs(10));
        assert_eq!(awaitable["maxAwaitTimeMS"], 10_000);
        assert_eq!(awaitable["topologyVersion"]["counter"], 4);
    }

    #[tokio::test]
    async fn test_publishes_heartbeat() {
        let cluster = MemoryCluster::new();
        let addr = cluster.add_node("a:1", HelloReply::standalone());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let monitor = ServerMonitor::start(addr.clone(), 7, settings(60_000, MonitoringMode::Poll), cluster.factory(), tx);

        let event = next_event(&mut rx).await;
        assert_eq!(event.epoch, 7);
        match event.kind {
            MonitorEventKind::Heartbeat(desc) => {
                assert_eq!(desc.server_type, ServerType::Standalone);
                assert!(desc.round_trip_time.is_some());
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(monitor.state(), MonitorState::Observing);

        monitor.shutdown().await;
        assert_eq!(monitor.state(), MonitorState::Stopped);
        assert_eq!(cluster.closed("a:1"), 1);
    }

    #[tokio::test]
    async fn test_failure_is_published_immediately() {
        let cluster = MemoryCluster::new();
        let addr = cluster.add_node("a:1", HelloReply::standalone());
        cluster.set_reachable("a:1", false);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let monitor = ServerMonitor::start(addr, 1, settings(60_000, MonitoringMode::Poll), cluster.factory(), tx);

        match next_event(&mut rx).await.kind {
            MonitorEventKind::Failed { description, error } => {
                assert_eq!(description.server_type, ServerType::Unknown);
                assert!(description.error.is_some());
                assert!(error.is_network_error());
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(monitor.state(), MonitorState::ErrorBackoff);

        // backoff retries without being asked
        cluster.set_reachable("a:1", true);
        match next_event(&mut rx).await.kind {
            MonitorEventKind::Heartbeat(desc) => assert_eq!(desc.server_type, ServerType::Standalone),
            other => panic!("unexpected event {:?}", other),
        }
        monitor.shutdown().await;
    }

    #[tokio::test]
    async fn test_request_heartbeat_wakes_loop() {
        let cluster = MemoryCluster::new();
        let addr = cluster.add_node("a:1", HelloReply::standalone());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let monitor = ServerMonitor::start(addr, 1, settings(60_000, MonitoringMode::Poll), cluster.factory(), tx);
        next_event(&mut rx).await;

        cluster.set_reply("a:1", HelloReply::mongos());
        tokio::time::sleep(Duration::from_millis(20)).await;
        for _ in 0..5 {
            monitor.request_heartbeat();
        }

        match next_event(&mut rx).await.kind {
            MonitorEventKind::Heartbeat(desc) => assert_eq!(desc.server_type, ServerType::Mongos),
            other => panic!("unexpected event {:?}", other),
        }
        // collapsed requests produce a single extra check
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(cluster.hello_count("a:1"), 2);
        monitor.shutdown().await;
    }

    #[tokio::test]
    async fn test_reconnects_broken_channel() {
        let cluster = MemoryCluster::new();
        let addr = cluster.add_node("a:1", HelloReply::standalone());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let monitor = ServerMonitor::start(addr, 1, settings(60_000, MonitoringMode::Poll), cluster.factory(), tx);
        next_event(&mut rx).await;

        cluster.kill_channels("a:1");
        monitor.request_heartbeat();
        match next_event(&mut rx).await.kind {
            MonitorEventKind::Heartbeat(_) => {}
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(cluster.opened("a:1"), 2);
        monitor.shutdown().await;
    }

    #[tokio::test]
    async fn test_streams_topology_changes() {
        let cluster = MemoryCluster::new();
        let addr = cluster.add_node(
            "a:1",
            HelloReply::standalone().with_topology_version(TopologyVersion::new("p", 1)),
        );
        let (tx, mut rx) = mpsc::unbounded_channel();
        let monitor = ServerMonitor::start(addr, 1, settings(60_000, MonitoringMode::Auto), cluster.factory(), tx);
        next_event(&mut rx).await;

        tokio::time::sleep(Duration::from_millis(20)).await;
        cluster.set_reply(
            "a:1",
            HelloReply::mongos().with_topology_version(TopologyVersion::new("p", 2)),
        );

        match next_event(&mut rx).await.kind {
            MonitorEventKind::Heartbeat(desc) => {
                assert_eq!(desc.server_type, ServerType::Mongos);
                assert_eq!(desc.topology_version, Some(TopologyVersion::new("p", 2)));
            }
            other => panic!("unexpected event {:?}", other),
        }
        monitor.shutdown().await;
    }
}
