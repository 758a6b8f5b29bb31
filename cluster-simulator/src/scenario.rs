use anyhow::{bail, Context, Result};
use common::{
    ClusterDescription, CoreError, ElectionId, HelloReply, ReadPreference, ServerAddress, ServerType,
};
use futures::future::join_all;
use rand::seq::SliceRandom;
use rand::Rng;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::{info, warn};

use topology_engine::{MemoryCluster, ReadPreferenceSelector, Topology, WritableServerSelector};

use crate::config::SimulatorConfig;

/// Drives a scripted replica set through failure phases against a live
/// [`Topology`].
pub struct Simulator {
    config: SimulatorConfig,
    cluster: MemoryCluster,
    topology: Topology,
    members: Vec<ServerAddress>,
    violations: Arc<AtomicUsize>,
    stop_watch: Arc<AtomicBool>,
    watcher: JoinHandle<()>,
}

impl Simulator {
    pub fn start(config: SimulatorConfig) -> Result<Self> {
        let sim = &config.simulation;
        let hosts: Vec<&str> = sim.members.iter().map(String::as_str).collect();
        let cluster = MemoryCluster::new();
        let mut rng = rand::thread_rng();

        let mut members = Vec::with_capacity(hosts.len());
        for (i, host) in hosts.iter().enumerate() {
            let reply = HelloReply::rs_member(&sim.set_name, &hosts, host);
            let reply = if i == 0 {
                reply.as_primary(1, ElectionId::from_counter(1))
            } else {
                reply.as_secondary()
            };
            members.push(cluster.add_node(host, reply));
            cluster.set_latency(host, Duration::from_millis(rng.gen_range(1..10)));
        }

        let topology = Topology::new(config.cluster.clone(), cluster.factory())
            .context("Failed to start topology")?;

        let violations = Arc::new(AtomicUsize::new(0));
        let stop_watch = Arc::new(AtomicBool::new(false));
        let watcher = spawn_primary_watch(topology.clone(), violations.clone(), stop_watch.clone());

        Ok(Self {
            config,
            cluster,
            topology,
            members,
            violations,
            stop_watch,
            watcher,
        })
    }

    pub async fn run(&self) -> Result<()> {
        self.discovery().await?;
        let primary = self.step_down().await?;
        self.pool_exhaustion().await?;
        self.partition(&primary).await?;

        let violations = self.violations.load(Ordering::Acquire);
        if violations > 0 {
            bail!("observed {} snapshots with more than one primary", violations);
        }
        for stats in self.topology.pool_stats() {
            info!("Pool stats: {}", serde_json::to_string(&stats)?);
        }
        Ok(())
    }

    pub async fn shutdown(self) {
        self.stop_watch.store(true, Ordering::Release);
        self.topology.shutdown().await;
        let _ = self.watcher.await;
    }

    async fn discovery(&self) -> Result<()> {
        info!("Phase: discovery");
        let expected = self.members.len();
        let snapshot = self
            .wait_for("all members discovered", |c| {
                c.primary().is_some()
                    && c.servers.len() == expected
                    && c.servers.values().all(|s| s.server_type != ServerType::Unknown)
            })
            .await?;
        info!("Discovered {}", snapshot);
        Ok(())
    }

    /// Elects a random secondary and returns its address.
    async fn step_down(&self) -> Result<ServerAddress> {
        info!("Phase: step-down failover");
        let old = self
            .topology
            .description()
            .primary()
            .map(|p| p.address.clone())
            .context("no primary before step-down")?;
        let candidates: Vec<&ServerAddress> = self.members.iter().filter(|m| **m != old).collect();
        let new = match candidates.choose(&mut rand::thread_rng()) {
            Some(new) => (*new).clone(),
            None => {
                warn!("Single member set, skipping step-down");
                return Ok(old);
            }
        };

        let sim = &self.config.simulation;
        let hosts: Vec<&str> = sim.members.iter().map(String::as_str).collect();
        let new_host = new.to_string();
        let old_host = old.to_string();
        self.cluster.set_reply(
            &new_host,
            HelloReply::rs_member(&sim.set_name, &hosts, &new_host).as_primary(1, ElectionId::from_counter(2)),
        );
        self.cluster
            .set_reply(&old_host, HelloReply::rs_member(&sim.set_name, &hosts, &old_host).as_secondary());
        self.topology.request_heartbeat();

        let started = Instant::now();
        let (address, channel) = self
            .topology
            .select_server(&WritableServerSelector::new(), None)
            .await
            .context("write selection during failover")?;
        info!("Write routed to {} after {:?}", address, started.elapsed());
        drop(channel);

        self.wait_for("new primary", |c| c.primary().map(|p| &p.address) == Some(&new))
            .await?;
        info!("Primary moved {} -> {} in {:?}", old, new, started.elapsed());
        Ok(new)
    }

    async fn pool_exhaustion(&self) -> Result<()> {
        info!("Phase: pool exhaustion");
        let clients = self.config.simulation.clients;
        let hold = Duration::from_millis(100);

        let tasks = (0..clients).map(|_| {
            let topology = self.topology.clone();
            async move {
                let (address, channel) = topology
                    .select_server(&WritableServerSelector::new(), None)
                    .await?;
                time::sleep(hold).await;
                if let Some(pool) = topology.pool(&address) {
                    pool.check_in(channel).await;
                }
                Ok::<_, CoreError>(())
            }
        });

        let mut served = 0;
        let mut timed_out = 0;
        for result in join_all(tasks).await {
            match result {
                Ok(()) => served += 1,
                Err(CoreError::PoolWaitTimeout { .. }) => timed_out += 1,
                Err(e) => return Err(e).context("unexpected check-out failure"),
            }
        }
        info!("{} clients served, {} timed out waiting", served, timed_out);
        Ok(())
    }

    async fn partition(&self, primary: &ServerAddress) -> Result<()> {
        info!("Phase: partition recovery");
        let host = primary.to_string();
        self.cluster.set_reachable(&host, false);
        let snapshot = self
            .wait_for("primary unreachable", |c| c.primary().is_none())
            .await?;
        info!("Partitioned: {}", snapshot);

        if self.members.len() > 1 {
            let reader = ReadPreferenceSelector::new(ReadPreference::secondary_preferred());
            let (address, channel) = self
                .topology
                .select_server(&reader, None)
                .await
                .context("read during partition")?;
            info!("Read served by {} while partitioned", address);
            drop(channel);
        }

        self.cluster.set_reachable(&host, true);
        self.topology.request_heartbeat_for(primary);
        self.wait_for("primary recovered", |c| c.primary().map(|p| &p.address) == Some(primary))
            .await?;
        info!("Recovered {}", primary);
        Ok(())
    }

    async fn wait_for<F>(&self, what: &str, predicate: F) -> Result<Arc<ClusterDescription>>
    where
        F: Fn(&ClusterDescription) -> bool,
    {
        let mut rx = self.topology.subscribe();
        let deadline = Instant::now() + self.config.simulation.phase_timeout();
        loop {
            let snapshot = self.topology.description();
            if predicate(&snapshot) {
                return Ok(snapshot);
            }
            match time::timeout_at(deadline, rx.changed()).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => bail!("topology shut down while waiting for {}", what),
                Err(_) => bail!("timed out waiting for {}: {}", what, snapshot),
            }
        }
    }
}

/// Counts published snapshots that show more than one primary.
fn spawn_primary_watch(topology: Topology, violations: Arc<AtomicUsize>, stop: Arc<AtomicBool>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut rx = topology.subscribe();
        while !stop.load(Ordering::Acquire) {
            let snapshot = topology.description();
            if snapshot.primary_count() > 1 {
                warn!("Two primaries in {}", snapshot);
                violations.fetch_add(1, Ordering::AcqRel);
            }
            if time::timeout(Duration::from_millis(50), rx.changed()).await.is_ok_and(|r| r.is_err()) {
                break;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_full_run() {
        let mut config = SimulatorConfig::default();
        config.cluster.heartbeat_frequency_ms = 50;
        config.cluster.min_heartbeat_frequency_ms = 10;
        config.simulation.clients = 4;
        let simulator = Simulator::start(config).unwrap();
        let result = simulator.run().await;
        simulator.shutdown().await;
        result.unwrap();
    }
}
