use common::{ClusterDescription, ClusterType, ReadPreference, Result};
use parking_lot::Mutex;
use std::fmt;

use super::{latency_window, Candidates, ReadPreferenceSelector, ServerSelector};

/// Allows an aggregation-with-write style operation to run on a secondary when
/// every known server is new enough to support it.
#[derive(Debug, Clone)]
pub struct SecondaryUsePolicy {
    pub read_preference: ReadPreference,
    pub min_wire_version: i32,
}

/// Selects servers that accept writes.
pub struct WritableServerSelector {
    policy: Option<SecondaryUsePolicy>,
    applied: Mutex<ReadPreference>,
}

impl WritableServerSelector {
    pub fn new() -> Self {
        Self {
            policy: None,
            applied: Mutex::new(ReadPreference::primary()),
        }
    }

    pub fn with_secondary_use(policy: SecondaryUsePolicy) -> Self {
        Self {
            policy: Some(policy),
            applied: Mutex::new(ReadPreference::primary()),
        }
    }

    /// The read preference used by the most recent selection.
    pub fn applied_read_preference(&self) -> ReadPreference {
        self.applied.lock().clone()
    }

    fn delegate_to(&self, cluster: &ClusterDescription, candidates: &Candidates) -> Option<&SecondaryUsePolicy> {
        let policy = self.policy.as_ref()?;
        match cluster.cluster_type {
            ClusterType::LoadBalanced => Some(policy),
            ClusterType::ReplicaSetNoPrimary | ClusterType::ReplicaSetWithPrimary | ClusterType::Sharded => {
                let all_capable = candidates
                    .iter()
                    .filter(|s| s.server_type.is_known())
                    .all(|s| s.max_wire_version >= policy.min_wire_version);
                all_capable.then_some(policy)
            }
            _ => None,
        }
    }
}

impl Default for WritableServerSelector {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for WritableServerSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WritableServerSelector")
            .field("policy", &self.policy)
            .finish()
    }
}

impl ServerSelector for WritableServerSelector {
    fn select(&self, cluster: &ClusterDescription, candidates: Candidates) -> Candidates {
        if let Some(policy) = self.delegate_to(cluster, &candidates) {
            *self.applied.lock() = policy.read_preference.clone();
            return ReadPreferenceSelector::new(policy.read_preference.clone()).select(cluster, candidates);
        }

        *self.applied.lock() = ReadPreference::primary();
        let writable = candidates
            .into_iter()
            .filter(|s| s.server_type.is_writable())
            .collect();
        latency_window(writable, cluster.local_threshold)
    }

    fn validate(&self, cluster: &ClusterDescription) -> Result<()> {
        match &self.policy {
            Some(policy) => policy.read_preference.validate(cluster.heartbeat_frequency),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_util::*;
    use super::*;
    use common::{ReadMode, ServerType};

    #[test]
    fn test_requires_primary_regardless_of_tags() {
        let cluster = cluster(
            ClusterType::ReplicaSetWithPrimary,
            vec![
                primary("a:1", 50),
                secondary("b:1", 1, &[("dc", "east")]),
                secondary("c:1", 1, &[("dc", "east")]),
            ],
        );
        let selector = WritableServerSelector::new();
        for _ in 0..20 {
            let selected = selector.select(&cluster, cluster.available_servers());
            assert_eq!(selected.len(), 1);
            let picked = selector.pick(&selected).unwrap();
            assert_eq!(picked.server_type, ServerType::RsPrimary);
        }
        assert!(selector.applied_read_preference().is_primary());
    }

    #[test]
    fn test_no_primary_selects_nothing() {
        let cluster = cluster(
            ClusterType::ReplicaSetNoPrimary,
            vec![secondary("b:1", 1, &[]), secondary("c:1", 1, &[])],
        );
        assert!(WritableServerSelector::new()
            .select(&cluster, cluster.available_servers())
            .is_empty());
    }

    #[test]
    fn test_secondary_use_policy() {
        let cluster = cluster(
            ClusterType::ReplicaSetWithPrimary,
            vec![primary("a:1", 1), secondary("b:1", 1, &[])],
        );

        let capable = WritableServerSelector::with_secondary_use(SecondaryUsePolicy {
            read_preference: ReadPreference::secondary(),
            min_wire_version: 13,
        });
        let selected = capable.select(&cluster, cluster.available_servers());
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].server_type, ServerType::RsSecondary);
        assert_eq!(capable.applied_read_preference().mode, ReadMode::Secondary);

        let too_new = WritableServerSelector::with_secondary_use(SecondaryUsePolicy {
            read_preference: ReadPreference::secondary(),
            min_wire_version: 99,
        });
        let selected = too_new.select(&cluster, cluster.available_servers());
        assert_eq!(selected[0].server_type, ServerType::RsPrimary);
        assert!(too_new.applied_read_preference().is_primary());
    }
}
