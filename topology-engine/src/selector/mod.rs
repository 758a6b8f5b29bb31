//! Server selection policies. A selector narrows the available servers of a
//! snapshot down to the eligible ones; `pick` breaks the tie.

mod read_preference;
mod writable;

pub use read_preference::ReadPreferenceSelector;
pub use writable::{SecondaryUsePolicy, WritableServerSelector};

use common::{ClusterDescription, Result, ServerAddress, ServerDescription};
use rand::seq::SliceRandom;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

pub type Candidates = Vec<Arc<ServerDescription>>;

pub trait ServerSelector: Send + Sync + fmt::Debug {
    /// Returns the subset of `candidates` eligible for the operation. An empty
    /// input yields an empty output.
    fn select(&self, cluster: &ClusterDescription, candidates: Candidates) -> Candidates;

    /// Chooses one server from a non-empty selection, uniformly at random.
    fn pick(&self, selected: &[Arc<ServerDescription>]) -> Option<Arc<ServerDescription>> {
        selected.choose(&mut rand::thread_rng()).cloned()
    }

    /// Rejects a selector that can never be satisfied against `cluster`,
    /// before any waiting starts.
    fn validate(&self, _cluster: &ClusterDescription) -> Result<()> {
        Ok(())
    }
}

/// Runs `selector` against the connected servers of `cluster`. A direct
/// connection bypasses the selector entirely.
pub fn select_servers(selector: &dyn ServerSelector, cluster: &ClusterDescription) -> Candidates {
    let candidates = cluster.available_servers();
    if cluster.direct_connection || candidates.is_empty() {
        return candidates;
    }
    selector.select(cluster, candidates)
}

/// Keeps the servers whose round-trip time is within `threshold` of the fastest.
pub fn latency_window(candidates: Candidates, threshold: Duration) -> Candidates {
    fn rtt(s: &ServerDescription) -> Duration {
        s.round_trip_time.unwrap_or_default()
    }

    let fastest = match candidates.iter().map(|s| rtt(s)).min() {
        Some(fastest) => fastest,
        None => return candidates,
    };
    candidates
        .into_iter()
        .filter(|s| rtt(s) <= fastest + threshold)
        .collect()
}

/// Selects exactly one address, used for operations pinned to a server.
#[derive(Debug, Clone)]
pub struct ServerAddressSelector {
    address: ServerAddress,
}

impl ServerAddressSelector {
    pub fn new(address: ServerAddress) -> Self {
        Self { address }
    }
}

impl ServerSelector for ServerAddressSelector {
    fn select(&self, _cluster: &ClusterDescription, candidates: Candidates) -> Candidates {
        candidates
            .into_iter()
            .filter(|s| s.address == self.address)
            .collect()
    }
}

/// Feeds each selector's output into the next one.
#[derive(Debug, Clone)]
pub struct CompositeSelector {
    selectors: Vec<Arc<dyn ServerSelector>>,
}

impl CompositeSelector {
    pub fn new(selectors: Vec<Arc<dyn ServerSelector>>) -> Self {
        Self { selectors }
    }
}

impl ServerSelector for CompositeSelector {
    fn select(&self, cluster: &ClusterDescription, candidates: Candidates) -> Candidates {
        self.selectors
            .iter()
            .fold(candidates, |remaining, selector| {
                if remaining.is_empty() {
                    remaining
                } else {
                    selector.select(cluster, remaining)
                }
            })
    }

    fn validate(&self, cluster: &ClusterDescription) -> Result<()> {
        self.selectors.iter().try_for_each(|selector| selector.validate(cluster))
    }
}
