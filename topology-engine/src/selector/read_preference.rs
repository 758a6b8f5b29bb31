use chrono::{DateTime, Utc};
use common::{ClusterDescription, ClusterType, ReadMode, ReadPreference, Result, ServerDescription, ServerType};
use std::sync::Arc;
use std::time::Duration;

use super::{latency_window, Candidates, ServerSelector};

/// Routes reads according to a [`ReadPreference`].
#[derive(Debug, Clone)]
pub struct ReadPreferenceSelector {
    read_preference: ReadPreference,
}

impl ReadPreferenceSelector {
    pub fn new(read_preference: ReadPreference) -> Self {
        Self { read_preference }
    }

    pub fn read_preference(&self) -> &ReadPreference {
        &self.read_preference
    }

    fn select_replica_set(&self, cluster: &ClusterDescription, candidates: Candidates) -> Candidates {
        let primary: Candidates = of_type(&candidates, ServerType::RsPrimary);

        match self.read_preference.mode {
            ReadMode::Primary => primary,
            ReadMode::PrimaryPreferred => {
                if !primary.is_empty() {
                    primary
                } else {
                    self.eligible_secondaries(cluster, &candidates)
                }
            }
            ReadMode::Secondary => self.eligible_secondaries(cluster, &candidates),
            ReadMode::SecondaryPreferred => {
                let secondaries = self.eligible_secondaries(cluster, &candidates);
                if secondaries.is_empty() {
                    primary
                } else {
                    secondaries
                }
            }
            ReadMode::Nearest => {
                let fresh = self.filter_staleness(cluster, &candidates, data_bearing(&candidates));
                self.filter_tags(fresh)
            }
        }
    }

    fn eligible_secondaries(&self, cluster: &ClusterDescription, candidates: &Candidates) -> Candidates {
        let secondaries = of_type(candidates, ServerType::RsSecondary);
        let fresh = self.filter_staleness(cluster, candidates, secondaries);
        self.filter_tags(fresh)
    }

    /// First tag set matched by any server wins; an empty set matches all.
    fn filter_tags(&self, servers: Candidates) -> Candidates {
        if self.read_preference.tag_sets.is_empty() {
            return servers;
        }
        for tag_set in &self.read_preference.tag_sets {
            let matching: Candidates = servers
                .iter()
                .filter(|s| s.matches_tags(tag_set))
                .cloned()
                .collect();
            if !matching.is_empty() {
                return matching;
            }
        }
        Vec::new()
    }

    fn filter_staleness(
        &self,
        cluster: &ClusterDescription,
        candidates: &Candidates,
        servers: Candidates,
    ) -> Candidates {
        let max_staleness = match self.read_preference.max_staleness {
            Some(max) => max,
            None => return servers,
        };
        let heartbeat = cluster.heartbeat_frequency;
        let primary = candidates.iter().find(|s| s.server_type == ServerType::RsPrimary);

        match primary {
            Some(primary) => {
                let primary_lag = replication_lag(primary);
                servers
                    .into_iter()
                    .filter(|s| {
                        if s.server_type == ServerType::RsPrimary {
                            return true;
                        }
                        let staleness = replication_lag(s)
                            .saturating_sub(primary_lag)
                            .saturating_add(heartbeat);
                        staleness <= max_staleness
                    })
                    .collect()
            }
            None => {
                let freshest = candidates
                    .iter()
                    .filter(|s| s.server_type == ServerType::RsSecondary)
                    .filter_map(|s| s.last_write_date)
                    .max();
                let freshest = match freshest {
                    Some(date) => date,
                    None => return servers,
                };
                servers
                    .into_iter()
                    .filter(|s| {
                        let behind = s
                            .last_write_date
                            .map(|w| to_duration(freshest, w))
                            .unwrap_or_default();
                        behind.saturating_add(heartbeat) <= max_staleness
                    })
                    .collect()
            }
        }
    }
}

impl ServerSelector for ReadPreferenceSelector {
    fn select(&self, cluster: &ClusterDescription, candidates: Candidates) -> Candidates {
        let selected = match cluster.cluster_type {
            ClusterType::Unknown => Vec::new(),
            ClusterType::Single | ClusterType::LoadBalanced => candidates,
            ClusterType::Sharded => of_type(&candidates, ServerType::Mongos),
            ClusterType::ReplicaSetNoPrimary | ClusterType::ReplicaSetWithPrimary => {
                self.select_replica_set(cluster, candidates)
            }
        };
        latency_window(selected, cluster.local_threshold)
    }

    fn validate(&self, cluster: &ClusterDescription) -> Result<()> {
        self.read_preference.validate(cluster.heartbeat_frequency)
    }
}

fn of_type(candidates: &Candidates, server_type: ServerType) -> Candidates {
    candidates
        .iter()
        .filter(|s| s.server_type == server_type)
        .cloned()
        .collect()
}

fn data_bearing(candidates: &Candidates) -> Candidates {
    candidates
        .iter()
        .filter(|s| matches!(s.server_type, ServerType::RsPrimary | ServerType::RsSecondary))
        .cloned()
        .collect()
}

/// Time between the last observed write and the observation itself.
fn replication_lag(server: &Arc<ServerDescription>) -> Duration {
    match server.last_write_date {
        Some(write) => to_duration(server.last_update_time, write),
        None => Duration::ZERO,
    }
}

fn to_duration(later: DateTime<Utc>, earlier: DateTime<Utc>) -> Duration {
    (later - earlier).to_std().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::super::test_util::*;
    use super::*;
    use common::{CoreError, HelloReply, TagSet};

    fn tags(pairs: &[(&str, &str)]) -> TagSet {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    fn addresses(selected: &Candidates) -> Vec<String> {
        let mut addrs: Vec<String> = selected.iter().map(|s| s.address.to_string()).collect();
        addrs.sort();
        addrs
    }

    fn replica_set() -> ClusterDescription {
        cluster(
            ClusterType::ReplicaSetWithPrimary,
            vec![
                primary("a:1", 1),
                secondary("b:1", 2, &[("dc", "east")]),
                secondary("c:1", 3, &[("dc", "west")]),
            ],
        )
    }

    #[test]
    fn test_modes() {
        let cluster = replica_set();
        let run = |rp: ReadPreference| {
            let selector = ReadPreferenceSelector::new(rp);
            addresses(&selector.select(&cluster, cluster.available_servers()))
        };

        assert_eq!(run(ReadPreference::primary()), vec!["a:1"]);
        assert_eq!(run(ReadPreference::primary_preferred()), vec!["a:1"]);
        assert_eq!(run(ReadPreference::secondary()), vec!["b:1", "c:1"]);
        assert_eq!(run(ReadPreference::secondary_preferred()), vec!["b:1", "c:1"]);
        assert_eq!(run(ReadPreference::nearest()), vec!["a:1", "b:1", "c:1"]);
    }

    #[test]
    fn test_first_matching_tag_set_wins() {
        let cluster = replica_set();
        let selector = ReadPreferenceSelector::new(ReadPreference::secondary().with_tag_sets(vec![
            tags(&[("dc", "north")]),
            tags(&[("dc", "west")]),
            tags(&[("dc", "east")]),
        ]));
        let selected = selector.select(&cluster, cluster.available_servers());
        assert_eq!(addresses(&selected), vec!["c:1"]);

        let nothing = ReadPreferenceSelector::new(
            ReadPreference::secondary().with_tag_sets(vec![tags(&[("dc", "north")])]),
        );
        assert!(nothing.select(&cluster, cluster.available_servers()).is_empty());
    }

    #[test]
    fn test_secondary_preferred_falls_back_to_primary() {
        let cluster = cluster(ClusterType::ReplicaSetWithPrimary, vec![primary("a:1", 1)]);
        let selector = ReadPreferenceSelector::new(ReadPreference::secondary_preferred());
        assert_eq!(
            addresses(&selector.select(&cluster, cluster.available_servers())),
            vec!["a:1"]
        );
    }

    #[test]
    fn test_max_staleness_without_primary() {
        let now = Utc::now();
        let fresh = member(
            HelloReply::rs_member("rs", &HOSTS, "b:1")
                .as_secondary()
                .with_last_write_date(now),
            "b:1",
            1,
        );
        let lagging = member(
            HelloReply::rs_member("rs", &HOSTS, "c:1")
                .as_secondary()
                .with_last_write_date(now - chrono::Duration::seconds(300)),
            "c:1",
            1,
        );
        let cluster = cluster(ClusterType::ReplicaSetNoPrimary, vec![fresh, lagging]);
        let selector = ReadPreferenceSelector::new(
            ReadPreference::secondary().with_max_staleness(Duration::from_secs(120)),
        );
        assert_eq!(
            addresses(&selector.select(&cluster, cluster.available_servers())),
            vec!["b:1"]
        );
    }

    #[test]
    fn test_validate_uses_cluster_heartbeat() {
        let mut cluster = cluster(ClusterType::ReplicaSetNoPrimary, vec![secondary("b:1", 1, &[])]);
        let selector = ReadPreferenceSelector::new(
            ReadPreference::secondary().with_max_staleness(Duration::from_secs(100)),
        );
        assert!(selector.validate(&cluster).is_ok());

        cluster.heartbeat_frequency = Duration::from_secs(95);
        assert!(matches!(selector.validate(&cluster), Err(CoreError::Config(_))));

        let tagged_primary =
            ReadPreferenceSelector::new(ReadPreference::primary().with_tag_sets(vec![tags(&[("dc", "east")])]));
        assert!(tagged_primary.validate(&cluster).is_err());
    }

    #[test]
    fn test_unknown_cluster_selects_nothing() {
        let cluster = cluster(ClusterType::Unknown, vec![secondary("a:1", 1, &[])]);
        let selector = ReadPreferenceSelector::new(ReadPreference::nearest());
        assert!(selector.select(&cluster, cluster.available_servers()).is_empty());
    }
}
