//! Cluster-description update rules. Pure functions over immutable snapshots;
//! the aggregator decides what to do with the result.

use common::types::{MAX_SUPPORTED_WIRE_VERSION, MIN_SUPPORTED_WIRE_VERSION};
use common::{ClusterDescription, ClusterType, CoreError, ServerAddress, ServerDescription, ServerType};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

/// Result of applying one server observation.
#[derive(Debug, Clone)]
pub struct SdamUpdate {
    pub description: ClusterDescription,
    /// False when the observation was discarded.
    pub applied: bool,
    pub added: Vec<ServerAddress>,
    pub removed: Vec<ServerAddress>,
}

impl SdamUpdate {
    fn discarded(current: &ClusterDescription) -> Self {
        Self {
            description: current.clone(),
            applied: false,
            added: Vec::new(),
            removed: Vec::new(),
        }
    }
}

pub fn apply(current: &ClusterDescription, incoming: ServerDescription) -> SdamUpdate {
    let on_file = match current.servers.get(&incoming.address) {
        Some(on_file) => on_file,
        None => {
            trace!("Discarding update for non-member {}", incoming.address);
            return SdamUpdate::discarded(current);
        }
    };
    if incoming.is_stale_relative_to(on_file) {
        trace!(
            "Discarding stale update for {}: {:?} < {:?}",
            incoming.address,
            incoming.topology_version,
            on_file.topology_version
        );
        return SdamUpdate::discarded(current);
    }

    let mut next = current.clone();
    next.version = current.version + 1;
    let incoming = Arc::new(incoming);
    next.servers.insert(incoming.address.clone(), incoming.clone());

    match next.cluster_type {
        ClusterType::LoadBalanced => {}
        ClusterType::Single => update_single(&mut next, &incoming),
        ClusterType::Unknown => update_unknown(&mut next, &incoming),
        ClusterType::Sharded => {
            if !matches!(incoming.server_type, ServerType::Unknown | ServerType::Mongos) {
                remove(&mut next, &incoming.address, "not a mongos");
            }
        }
        ClusterType::ReplicaSetNoPrimary => match incoming.server_type {
            ServerType::Standalone | ServerType::Mongos => {
                remove(&mut next, &incoming.address, "not a replica set member");
            }
            ServerType::RsPrimary => update_rs_from_primary(&mut next, &incoming),
            ServerType::RsSecondary | ServerType::RsArbiter | ServerType::RsOther => {
                update_rs_without_primary(&mut next, &incoming)
            }
            _ => {}
        },
        ClusterType::ReplicaSetWithPrimary => match incoming.server_type {
            ServerType::Standalone | ServerType::Mongos => {
                remove(&mut next, &incoming.address, "not a replica set member");
                check_if_has_primary(&mut next);
            }
            ServerType::RsPrimary => update_rs_from_primary(&mut next, &incoming),
            ServerType::RsSecondary | ServerType::RsArbiter | ServerType::RsOther => {
                update_rs_with_primary_from_member(&mut next, &incoming)
            }
            _ => check_if_has_primary(&mut next),
        },
    }

    next.logical_session_timeout = logical_session_timeout(&next);
    next.compatibility_error = compatibility_error(&next);

    let before: BTreeSet<&ServerAddress> = current.servers.keys().collect();
    let after: BTreeSet<&ServerAddress> = next.servers.keys().collect();
    let added = after.difference(&before).map(|a| (*a).clone()).collect();
    let removed = before.difference(&after).map(|a| (*a).clone()).collect();

    SdamUpdate {
        description: next,
        applied: true,
        added,
        removed,
    }
}

fn update_single(next: &mut ClusterDescription, incoming: &Arc<ServerDescription>) {
    let mismatch = match (&next.set_name, &incoming.set_name) {
        (Some(expected), Some(actual)) => expected != actual,
        (Some(_), None) => incoming.server_type.is_known(),
        _ => false,
    };
    if mismatch {
        let error = CoreError::Incompatible(format!(
            "server {} is not a member of replica set {:?}",
            incoming.address, next.set_name
        ));
        mark_unknown(next, &incoming.address, &error);
    }
}

fn update_unknown(next: &mut ClusterDescription, incoming: &Arc<ServerDescription>) {
    match incoming.server_type {
        ServerType::Standalone => {
            if next.servers.len() > 1 {
                remove(next, &incoming.address, "standalone in a multi-seed deployment");
            } else {
                next.cluster_type = ClusterType::Single;
            }
        }
        ServerType::Mongos => next.cluster_type = ClusterType::Sharded,
        ServerType::RsPrimary => update_rs_from_primary(next, incoming),
        ServerType::RsSecondary | ServerType::RsArbiter | ServerType::RsOther => {
            next.cluster_type = ClusterType::ReplicaSetNoPrimary;
            update_rs_without_primary(next, incoming);
        }
        _ => {}
    }
}

fn set_name_matches(next: &mut ClusterDescription, incoming: &ServerDescription) -> bool {
    match &next.set_name {
        None => {
            next.set_name = incoming.set_name.clone();
            true
        }
        Some(expected) => incoming.set_name.as_ref() == Some(expected),
    }
}

fn update_rs_from_primary(next: &mut ClusterDescription, primary: &Arc<ServerDescription>) {
    if !set_name_matches(next, primary) {
        remove(next, &primary.address, "replica set name mismatch");
        check_if_has_primary(next);
        return;
    }

    if let (Some(set_version), Some(election_id)) = (primary.set_version, primary.election_id) {
        if let (Some(max_version), Some(max_election)) = (next.max_set_version, next.max_election_id) {
            if (set_version, election_id) < (max_version, max_election) {
                let error = CoreError::Incompatible(format!(
                    "primary {} is stale: (setVersion {}, electionId {}) < ({}, {})",
                    primary.address, set_version, election_id, max_version, max_election
                ));
                mark_unknown(next, &primary.address, &error);
                check_if_has_primary(next);
                return;
            }
        }
        next.max_election_id = Some(election_id);
    }
    if let Some(set_version) = primary.set_version {
        if next.max_set_version.map_or(true, |max| set_version > max) {
            next.max_set_version = Some(set_version);
        }
    }

    let demoted: Vec<ServerAddress> = next
        .servers
        .values()
        .filter(|s| s.server_type == ServerType::RsPrimary && s.address != primary.address)
        .map(|s| s.address.clone())
        .collect();
    for address in demoted {
        debug!("Demoting old primary {} in favor of {}", address, primary.address);
        let error = CoreError::Incompatible(format!("primary replaced by {}", primary.address));
        mark_unknown(next, &address, &error);
    }

    let members: BTreeSet<ServerAddress> = primary.all_hosts().cloned().collect();
    for address in &members {
        next.servers
            .entry(address.clone())
            .or_insert_with(|| Arc::new(ServerDescription::unknown(address.clone())));
    }
    let departed: Vec<ServerAddress> = next
        .servers
        .keys()
        .filter(|a| !members.contains(a))
        .cloned()
        .collect();
    for address in departed {
        remove(next, &address, "not in the primary's host list");
    }

    check_if_has_primary(next);
}

fn update_rs_without_primary(next: &mut ClusterDescription, member: &Arc<ServerDescription>) {
    if !set_name_matches(next, member) {
        remove(next, &member.address, "replica set name mismatch");
        return;
    }

    for address in member.all_hosts() {
        next.servers
            .entry(address.clone())
            .or_insert_with(|| Arc::new(ServerDescription::unknown(address.clone())));
    }

    if member.me.as_ref().map_or(false, |me| *me != member.address) {
        remove(next, &member.address, "address does not match `me`");
    }
}

fn update_rs_with_primary_from_member(next: &mut ClusterDescription, member: &Arc<ServerDescription>) {
    if !set_name_matches(next, member) {
        remove(next, &member.address, "replica set name mismatch");
    } else if member.me.as_ref().map_or(false, |me| *me != member.address) {
        remove(next, &member.address, "address does not match `me`");
    }
    check_if_has_primary(next);
}

fn check_if_has_primary(next: &mut ClusterDescription) {
    next.cluster_type = if next.primary().is_some() {
        ClusterType::ReplicaSetWithPrimary
    } else {
        ClusterType::ReplicaSetNoPrimary
    };
}

fn remove(next: &mut ClusterDescription, address: &ServerAddress, reason: &str) {
    if next.servers.remove(address).is_some() {
        debug!("Removing {} from cluster: {}", address, reason);
    }
}

fn mark_unknown(next: &mut ClusterDescription, address: &ServerAddress, error: &CoreError) {
    if let Some(existing) = next.servers.get_mut(address) {
        let mut unknown = ServerDescription::with_error(address.clone(), error, existing.topology_version.clone());
        unknown.generation = existing.generation;
        *existing = Arc::new(unknown);
    }
}

/// Smallest timeout among data-bearing servers; unknown if any of them lacks one.
fn logical_session_timeout(cluster: &ClusterDescription) -> Option<Duration> {
    let mut data_bearing = cluster
        .servers
        .values()
        .filter(|s| s.server_type.is_data_bearing())
        .peekable();
    data_bearing.peek()?;
    data_bearing.try_fold(Duration::MAX, |min, s| s.logical_session_timeout.map(|t| min.min(t)))
}

fn compatibility_error(cluster: &ClusterDescription) -> Option<String> {
    cluster.servers.values().find_map(|s| {
        if s.is_wire_compatible() {
            return None;
        }
        if s.min_wire_version > MAX_SUPPORTED_WIRE_VERSION {
            Some(format!(
                "server at {} requires wire version {}, but this client only supports up to {}",
                s.address, s.min_wire_version, MAX_SUPPORTED_WIRE_VERSION
            ))
        } else {
            Some(format!(
                "server at {} reports wire version {}, but this client requires at least {}",
                s.address, s.max_wire_version, MIN_SUPPORTED_WIRE_VERSION
            ))
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{ElectionId, HelloReply, TopologyVersion};
    use rand::seq::SliceRandom;
    use rand::Rng;

    const HOSTS: [&str; 3] = ["a:1", "b:1", "c:1"];

    fn addr(s: &str) -> ServerAddress {
        ServerAddress::parse(s).unwrap()
    }

    fn observe(reply: HelloReply, address: &str) -> ServerDescription {
        ServerDescription::from_hello(addr(address), &reply, Duration::from_millis(1), 0)
    }

    fn primary(address: &str, set_version: i32, election: u64) -> ServerDescription {
        observe(
            HelloReply::rs_member("rs", &HOSTS, address)
                .as_primary(set_version, ElectionId::from_counter(election))
                .with_wire_versions(6, 21),
            address,
        )
    }

    fn secondary(address: &str) -> ServerDescription {
        observe(
            HelloReply::rs_member("rs", &HOSTS, address)
                .as_secondary()
                .with_wire_versions(6, 21),
            address,
        )
    }

    fn seeded(cluster_type: ClusterType, set_name: Option<&str>, seeds: &[&str]) -> ClusterDescription {
        ClusterDescription::new(
            cluster_type,
            seeds.iter().map(|s| addr(s)),
            set_name.map(str::to_string),
            false,
            Duration::from_secs(10),
        )
    }

    #[test]
    fn test_discovers_replica_set_from_primary() {
        let cluster = seeded(ClusterType::Unknown, None, &["a:1"]);
        let update = apply(&cluster, primary("a:1", 1, 1));

        assert!(update.applied);
        let next = update.description;
        assert_eq!(next.cluster_type, ClusterType::ReplicaSetWithPrimary);
        assert_eq!(next.set_name.as_deref(), Some("rs"));
        assert_eq!(next.servers.len(), 3);
        assert_eq!(update.added, vec![addr("b:1"), addr("c:1")]);
        assert_eq!(next.version, 1);
        assert_eq!(next.logical_session_timeout, Some(Duration::from_secs(30 * 60)));
    }

    #[test]
    fn test_discards_non_member_and_stale() {
        let cluster = seeded(ClusterType::Unknown, None, &["a:1"]);
        assert!(!apply(&cluster, secondary("z:1")).applied);

        let tv = |n| TopologyVersion::new("p", n);
        let mut current = cluster.clone();
        let mut newer = secondary("a:1");
        newer.topology_version = Some(tv(5));
        current = apply(&current, newer).description;

        let mut older = ServerDescription::unknown(addr("a:1"));
        older.topology_version = Some(tv(4));
        let update = apply(&current, older);
        assert!(!update.applied);
        assert_eq!(update.description.version, current.version);
    }

    #[test]
    fn test_rejects_stale_primary() {
        let mut cluster = seeded(ClusterType::ReplicaSetNoPrimary, Some("rs"), &HOSTS);
        cluster = apply(&cluster, primary("a:1", 2, 5)).description;
        assert_eq!(cluster.max_set_version, Some(2));

        // lower election id at the same set version
        let next = apply(&cluster, primary("b:1", 2, 4)).description;
        assert_eq!(next.primary().unwrap().address, addr("a:1"));
        assert_eq!(next.server(&addr("b:1")).unwrap().server_type, ServerType::Unknown);

        // lower set version loses even with a higher election id
        let next = apply(&cluster, primary("b:1", 1, 9)).description;
        assert_eq!(next.primary().unwrap().address, addr("a:1"));
    }

    #[test]
    fn test_new_primary_demotes_old() {
        let mut cluster = seeded(ClusterType::ReplicaSetNoPrimary, Some("rs"), &HOSTS);
        cluster = apply(&cluster, primary("a:1", 1, 1)).description;
        cluster = apply(&cluster, primary("b:1", 1, 2)).description;

        assert_eq!(cluster.primary_count(), 1);
        assert_eq!(cluster.primary().unwrap().address, addr("b:1"));
        let old = cluster.server(&addr("a:1")).unwrap();
        assert_eq!(old.server_type, ServerType::Unknown);
        assert_eq!(cluster.max_election_id, Some(ElectionId::from_counter(2)));
    }

    #[test]
    fn test_set_name_mismatch_removes_server() {
        let cluster = seeded(ClusterType::ReplicaSetNoPrimary, Some("other"), &HOSTS);
        let update = apply(&cluster, secondary("a:1"));
        assert_eq!(update.removed, vec![addr("a:1")]);
        assert_eq!(update.description.servers.len(), 2);
    }

    #[test]
    fn test_standalone_and_mongos() {
        let single = seeded(ClusterType::Unknown, None, &["a:1"]);
        let next = apply(&single, observe(HelloReply::standalone(), "a:1")).description;
        assert_eq!(next.cluster_type, ClusterType::Single);
        assert_eq!(next.logical_session_timeout, Some(Duration::from_secs(30 * 60)));

        let multi = seeded(ClusterType::Unknown, None, &["a:1", "b:1"]);
        let next = apply(&multi, observe(HelloReply::standalone(), "a:1")).description;
        assert_eq!(next.servers.len(), 1);

        let next = apply(&multi, observe(HelloReply::mongos(), "a:1")).description;
        assert_eq!(next.cluster_type, ClusterType::Sharded);
        let next = apply(&next, secondary("b:1")).description;
        assert!(next.server(&addr("b:1")).is_none());
    }

    #[test]
    fn test_primary_host_list_is_authoritative() {
        let mut cluster = seeded(ClusterType::ReplicaSetNoPrimary, Some("rs"), &["a:1", "d:1"]);
        cluster = apply(&cluster, primary("a:1", 1, 1)).description;
        let mut addrs = cluster.addresses();
        addrs.sort();
        assert_eq!(addrs, vec![addr("a:1"), addr("b:1"), addr("c:1")]);
    }

    #[test]
    fn test_incompatible_wire_version() {
        let cluster = seeded(ClusterType::Unknown, None, &["a:1"]);
        let reply = HelloReply::standalone().with_wire_versions(30, 40);
        let next = apply(&cluster, observe(reply, "a:1")).description;
        assert!(next.compatibility_error.unwrap().contains("requires wire version 30"));
    }

    #[test]
    fn test_primary_step_down_converges() {
        let mut cluster = seeded(ClusterType::ReplicaSetNoPrimary, Some("rs"), &HOSTS);
        cluster = apply(&cluster, primary("a:1", 1, 1)).description;
        cluster = apply(&cluster, secondary("b:1")).description;

        cluster = apply(&cluster, secondary("a:1")).description;
        assert_eq!(cluster.cluster_type, ClusterType::ReplicaSetNoPrimary);
        cluster = apply(&cluster, primary("b:1", 1, 2)).description;
        assert_eq!(cluster.cluster_type, ClusterType::ReplicaSetWithPrimary);
        assert_eq!(cluster.primary().unwrap().address, addr("b:1"));
    }

    #[test]
    fn test_random_sequences_never_have_two_primaries() {
        let mut rng = rand::thread_rng();
        for _ in 0..200 {
            let mut cluster = seeded(ClusterType::Unknown, None, &HOSTS);
            for _ in 0..30 {
                let address = *HOSTS.choose(&mut rng).unwrap();
                let update = match rng.gen_range(0..4) {
                    0 => primary(address, rng.gen_range(1..4), rng.gen_range(1..6)),
                    1 => secondary(address),
                    2 => ServerDescription::unknown(addr(address)),
                    _ => observe(HelloReply::rs_member("rs", &HOSTS, address).as_arbiter(), address),
                };
                let next = apply(&cluster, update);
                assert!(next.description.primary_count() <= 1);
                if let (Some(before), Some(after)) =
                    (cluster.max_set_version, next.description.max_set_version)
                {
                    assert!(after >= before);
                }
                cluster = next.description;
            }
        }
    }
}
