use async_trait::async_trait;
use common::error::CommandError;
use common::{CoreError, HelloReply, Result, ServerAddress};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tracing::debug;
use uuid::Uuid;

use super::{Channel, ChannelFactory, ChannelPurpose, Document};

struct NodeState {
    reply: watch::Sender<HelloReply>,
    reachable: AtomicBool,
    latency: Mutex<Duration>,
    command_error: Mutex<Option<CommandError>>,
    killed: Notify,
    live_flags: Mutex<Vec<Weak<AtomicBool>>>,
    opened: AtomicUsize,
    closed: AtomicUsize,
    hellos: AtomicUsize,
}

impl NodeState {
    fn new(reply: HelloReply) -> Self {
        let (reply, _) = watch::channel(reply);
        Self {
            reply,
            reachable: AtomicBool::new(true),
            latency: Mutex::new(Duration::ZERO),
            command_error: Mutex::new(None),
            killed: Notify::new(),
            live_flags: Mutex::new(Vec::new()),
            opened: AtomicUsize::new(0),
            closed: AtomicUsize::new(0),
            hellos: AtomicUsize::new(0),
        }
    }

    fn kill_channels(&self) {
        let mut flags = self.live_flags.lock();
        for flag in flags.iter().filter_map(Weak::upgrade) {
            flag.store(false, Ordering::Release);
        }
        flags.retain(|f| f.strong_count() > 0);
        drop(flags);
        self.killed.notify_waiters();
    }

    fn latency(&self) -> Duration {
        *self.latency.lock()
    }
}

/// Scripted in-process deployment. Each node answers `hello` with whatever
/// reply the test or simulator last set, and can be partitioned, slowed down
/// or made to fail commands.
#[derive(Clone, Default)]
pub struct MemoryCluster {
    nodes: Arc<DashMap<ServerAddress, Arc<NodeState>>>,
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&self, address: &str, reply: HelloReply) -> ServerAddress {
        let address = parse(address);
        self.nodes.insert(address.clone(), Arc::new(NodeState::new(reply)));
        address
    }

    pub fn set_reply(&self, address: &str, reply: HelloReply) {
        if let Some(node) = self.node(address) {
            node.reply.send_replace(reply);
        }
    }

    pub fn reply(&self, address: &str) -> Option<HelloReply> {
        self.node(address).map(|n| n.reply.borrow().clone())
    }

    /// An unreachable node refuses connections and breaks the open ones.
    pub fn set_reachable(&self, address: &str, reachable: bool) {
        if let Some(node) = self.node(address) {
            node.reachable.store(reachable, Ordering::Release);
            if !reachable {
                node.kill_channels();
            }
        }
    }

    pub fn set_latency(&self, address: &str, latency: Duration) {
        if let Some(node) = self.node(address) {
            *node.latency.lock() = latency;
        }
    }

    /// Non-hello commands answer with `error` until cleared with `None`.
    pub fn fail_commands(&self, address: &str, error: Option<CommandError>) {
        if let Some(node) = self.node(address) {
            *node.command_error.lock() = error;
        }
    }

    pub fn kill_channels(&self, address: &str) {
        if let Some(node) = self.node(address) {
            node.kill_channels();
        }
    }

    pub fn opened(&self, address: &str) -> usize {
        self.node(address).map_or(0, |n| n.opened.load(Ordering::Acquire))
    }

    pub fn closed(&self, address: &str) -> usize {
        self.node(address).map_or(0, |n| n.closed.load(Ordering::Acquire))
    }

    pub fn hello_count(&self, address: &str) -> usize {
        self.node(address).map_or(0, |n| n.hellos.load(Ordering::Acquire))
    }

    pub fn factory(&self) -> Arc<dyn ChannelFactory> {
        Arc::new(self.clone())
    }

    fn node(&self, address: &str) -> Option<Arc<NodeState>> {
        self.nodes.get(&parse(address)).map(|n| n.value().clone())
    }
}

fn parse(address: &str) -> ServerAddress {
    ServerAddress::parse(address).unwrap_or_else(|_| ServerAddress::new(address, 0))
}

#[async_trait]
impl ChannelFactory for MemoryCluster {
    async fn open(&self, address: &ServerAddress, purpose: ChannelPurpose) -> Result<Box<dyn Channel>> {
        let node = self
            .nodes
            .get(address)
            .map(|n| n.value().clone())
            .ok_or_else(|| CoreError::network(address.clone(), "no such host"))?;

        let latency = node.latency();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if !node.reachable.load(Ordering::Acquire) {
            return Err(CoreError::network(address.clone(), "connection refused"));
        }

        let live = Arc::new(AtomicBool::new(true));
        node.live_flags.lock().push(Arc::downgrade(&live));
        node.opened.fetch_add(1, Ordering::AcqRel);

        let channel = MemoryChannel {
            id: Uuid::new_v4(),
            address: address.clone(),
            node,
            live,
            closed: AtomicBool::new(false),
        };
        debug!("Opened {:?} channel {} to {}", purpose, channel.id, address);
        Ok(Box::new(channel))
    }
}

pub struct MemoryChannel {
    id: Uuid,
    address: ServerAddress,
    node: Arc<NodeState>,
    live: Arc<AtomicBool>,
    closed: AtomicBool,
}

impl MemoryChannel {
    fn check_live(&self) -> Result<()> {
        if self.is_live() {
            Ok(())
        } else {
            self.live.store(false, Ordering::Release);
            Err(CoreError::network(self.address.clone(), "connection reset by peer"))
        }
    }

    async fn hello(&self, command: &Document) -> Result<Document> {
        self.node.hellos.fetch_add(1, Ordering::AcqRel);

        let awaited = command.get("topologyVersion").cloned();
        let max_await = command
            .get("maxAwaitTimeMS")
            .and_then(|v| v.as_u64())
            .map(Duration::from_millis);

        if let (Some(awaited), Some(max_await)) = (awaited, max_await) {
            let mut rx = self.node.reply.subscribe();
            let unchanged = rx
                .borrow()
                .topology_version
                .as_ref()
                .and_then(|tv| serde_json::to_value(tv).ok())
                == Some(awaited);
            if unchanged {
                tokio::select! {
                    _ = rx.changed() => {}
                    _ = self.node.killed.notified() => {}
                    _ = tokio::time::sleep(max_await) => {}
                }
                self.check_live()?;
            }
        }

        let reply = self.node.reply.borrow().clone();
        Ok(reply.to_document())
    }
}

#[async_trait]
impl Channel for MemoryChannel {
    fn id(&self) -> Uuid {
        self.id
    }

    fn address(&self) -> &ServerAddress {
        &self.address
    }

    fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire) && self.node.reachable.load(Ordering::Acquire)
    }

    async fn send_command(&self, command: Document) -> Result<Document> {
        self.check_live()?;
        let latency = self.node.latency();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
            self.check_live()?;
        }

        if command.get("hello").is_some() {
            return self.hello(&command).await;
        }

        let error = self.node.command_error.lock().clone();
        match error {
            Some(err) => Ok(err.to_document()),
            None => Ok(json!({"ok": 1})),
        }
    }

    async fn close(&self) {
        self.live.store(false, Ordering::Release);
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.node.closed.fetch_add(1, Ordering::AcqRel);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::TopologyVersion;

    #[tokio::test]
    async fn test_unreachable_node_breaks_channels() {
        let cluster = MemoryCluster::new();
        let addr = cluster.add_node("a:1", HelloReply::standalone());
        let channel = cluster.open(&addr, ChannelPurpose::Application).await.unwrap();
        assert!(channel.is_live());

        cluster.set_reachable("a:1", false);
        assert!(!channel.is_live());
        assert!(channel.send_command(json!({"ping": 1})).await.unwrap_err().is_network_error());
        assert!(cluster.open(&addr, ChannelPurpose::Application).await.is_err());
        assert_eq!(cluster.opened("a:1"), 1);
    }

    #[tokio::test]
    async fn test_awaitable_hello_returns_on_change() {
        let cluster = MemoryCluster::new();
        let tv = TopologyVersion::new("p", 1);
        let addr = cluster.add_node(
            "a:1",
            HelloReply::standalone().with_topology_version(tv.clone()),
        );
        let channel = cluster.open(&addr, ChannelPurpose::Monitoring).await.unwrap();

        let updater = {
            let cluster = cluster.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                cluster.set_reply(
                    "a:1",
                    HelloReply::mongos().with_topology_version(TopologyVersion::new("p", 2)),
                );
            })
        };

        let start = std::time::Instant::now();
        let doc = channel
            .send_command(json!({"hello": 1, "topologyVersion": tv, "maxAwaitTimeMS": 5000}))
            .await
            .unwrap();
        updater.await.unwrap();

        assert!(start.elapsed() < Duration::from_secs(2));
        let reply = HelloReply::from_document(doc).unwrap();
        assert_eq!(reply.topology_version, Some(TopologyVersion::new("p", 2)));
    }

    #[tokio::test]
    async fn test_scripted_command_error() {
        let cluster = MemoryCluster::new();
        let addr = cluster.add_node("a:1", HelloReply::standalone());
        let channel = cluster.open(&addr, ChannelPurpose::Application).await.unwrap();
        cluster.fail_commands("a:1", Some(CommandError::new(10107, "NotWritablePrimary", "")));

        let doc = channel.send_command(json!({"insert": "c"})).await.unwrap();
        assert_eq!(CommandError::from_document(&doc).code, 10107);

        channel.close().await;
        channel.close().await;
        assert_eq!(cluster.closed("a:1"), 1);
    }
}
