use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::error::CoreError;
use crate::heartbeat::HelloReply;

pub const DEFAULT_PORT: u16 = 27017;

/// Oldest wire version this core can talk to.
pub const MIN_SUPPORTED_WIRE_VERSION: i32 = 6;
/// Newest wire version this core can talk to.
pub const MAX_SUPPORTED_WIRE_VERSION: i32 = 25;

pub const DEFAULT_LOCAL_THRESHOLD: Duration = Duration::from_millis(15);

pub type TagSet = BTreeMap<String, String>;

/// A `host:port` pair identifying one node. Host names are lower-cased so that
/// membership lists reported by different nodes compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ServerAddress {
    host: String,
    port: u16,
}

impl ServerAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into().to_ascii_lowercase(),
            port,
        }
    }

    pub fn parse(s: &str) -> Result<Self, CoreError> {
        let s = s.trim();
        if s.is_empty() {
            return Err(CoreError::Config("empty server address".to_string()));
        }

        // [::1]:27017
        let (host, port) = if let Some(rest) = s.strip_prefix('[') {
            let end = rest
                .find(']')
                .ok_or_else(|| CoreError::Config(format!("unterminated IPv6 address: {}", s)))?;
            let host = &rest[..end];
            let port = rest[end + 1..].strip_prefix(':');
            (host, port)
        } else {
            match s.rsplit_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (s, None),
            }
        };

        let port = match port {
            Some(p) => p
                .parse::<u16>()
                .map_err(|_| CoreError::Config(format!("invalid port in address: {}", s)))?,
            None => DEFAULT_PORT,
        };
        if host.is_empty() || port == 0 {
            return Err(CoreError::Config(format!("invalid server address: {}", s)));
        }

        Ok(Self::new(host, port))
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for ServerAddress {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ServerAddress {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ServerAddress> for String {
    fn from(address: ServerAddress) -> Self {
        address.to_string()
    }
}

/// 12-byte object id used for replica-set election ids. Byte-wise ordering
/// matches the server's ordering of election ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ElectionId(pub [u8; 12]);

impl ElectionId {
    pub fn from_counter(counter: u64) -> Self {
        let mut bytes = [0u8; 12];
        bytes[4..].copy_from_slice(&counter.to_be_bytes());
        Self(bytes)
    }

    pub fn parse_hex(s: &str) -> Result<Self, CoreError> {
        let raw = hex::decode(s)
            .map_err(|e| CoreError::InvalidReply(format!("bad election id {}: {}", s, e)))?;
        let bytes: [u8; 12] = raw
            .try_into()
            .map_err(|_| CoreError::InvalidReply(format!("election id {} is not 12 bytes", s)))?;
        Ok(Self(bytes))
    }
}

impl fmt::Display for ElectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl TryFrom<String> for ElectionId {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse_hex(&value)
    }
}

impl From<ElectionId> for String {
    fn from(id: ElectionId) -> Self {
        id.to_string()
    }
}

/// Monotonic `{processId, counter}` pair reported by a node. Two versions are
/// only ordered when they come from the same server process.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopologyVersion {
    pub process_id: String,
    pub counter: i64,
}

impl TopologyVersion {
    pub fn new(process_id: impl Into<String>, counter: i64) -> Self {
        Self {
            process_id: process_id.into(),
            counter,
        }
    }
}

impl PartialOrd for TopologyVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        if self.process_id != other.process_id {
            return None;
        }
        Some(self.counter.cmp(&other.counter))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerType {
    Standalone,
    RsPrimary,
    RsSecondary,
    RsArbiter,
    RsOther,
    RsGhost,
    Mongos,
    LoadBalancer,
    Unknown,
}

impl ServerType {
    pub fn is_writable(&self) -> bool {
        matches!(
            self,
            ServerType::RsPrimary | ServerType::Mongos | ServerType::Standalone | ServerType::LoadBalancer
        )
    }

    pub fn is_data_bearing(&self) -> bool {
        matches!(
            self,
            ServerType::RsPrimary
                | ServerType::RsSecondary
                | ServerType::Mongos
                | ServerType::Standalone
                | ServerType::LoadBalancer
        )
    }

    pub fn is_replica_set_member(&self) -> bool {
        matches!(
            self,
            ServerType::RsPrimary
                | ServerType::RsSecondary
                | ServerType::RsArbiter
                | ServerType::RsOther
                | ServerType::RsGhost
        )
    }

    pub fn is_known(&self) -> bool {
        *self != ServerType::Unknown
    }
}

impl fmt::Display for ServerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerConnectionState {
    Connecting,
    Connected,
    Disconnected,
}

/// One node as observed by its monitor. Never mutated after publication; a new
/// observation replaces the whole value.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerDescription {
    pub address: ServerAddress,
    /// Pool generation at the time of the observation.
    pub generation: u64,
    pub server_type: ServerType,
    pub state: ServerConnectionState,
    pub round_trip_time: Option<Duration>,
    pub last_update_time: DateTime<Utc>,
    pub last_write_date: Option<DateTime<Utc>>,
    pub election_id: Option<ElectionId>,
    pub set_version: Option<i32>,
    pub set_name: Option<String>,
    pub topology_version: Option<TopologyVersion>,
    pub tags: TagSet,
    pub hosts: Vec<ServerAddress>,
    pub passives: Vec<ServerAddress>,
    pub arbiters: Vec<ServerAddress>,
    pub primary: Option<ServerAddress>,
    pub me: Option<ServerAddress>,
    pub min_wire_version: i32,
    pub max_wire_version: i32,
    pub logical_session_timeout: Option<Duration>,
    pub error: Option<String>,
}

impl ServerDescription {
    pub fn unknown(address: ServerAddress) -> Self {
        Self {
            address,
            generation: 0,
            server_type: ServerType::Unknown,
            state: ServerConnectionState::Connecting,
            round_trip_time: None,
            last_update_time: Utc::now(),
            last_write_date: None,
            election_id: None,
            set_version: None,
            set_name: None,
            topology_version: None,
            tags: TagSet::new(),
            hosts: Vec::new(),
            passives: Vec::new(),
            arbiters: Vec::new(),
            primary: None,
            me: None,
            min_wire_version: 0,
            max_wire_version: 0,
            logical_session_timeout: None,
            error: None,
        }
    }

    /// Node that failed a heartbeat or an operation. The topology version of a
    /// state-change error is kept so later replies can be ordered against it.
    pub fn with_error(
        address: ServerAddress,
        error: &CoreError,
        topology_version: Option<TopologyVersion>,
    ) -> Self {
        Self {
            state: ServerConnectionState::Disconnected,
            topology_version,
            error: Some(error.to_string()),
            ..Self::unknown(address)
        }
    }

    pub fn from_hello(
        address: ServerAddress,
        reply: &HelloReply,
        round_trip_time: Duration,
        generation: u64,
    ) -> Self {
        let parse_all = |hosts: &[String]| -> Vec<ServerAddress> {
            hosts.iter().filter_map(|h| ServerAddress::parse(h).ok()).collect()
        };

        Self {
            address,
            generation,
            server_type: reply.server_type(),
            state: ServerConnectionState::Connected,
            round_trip_time: Some(round_trip_time),
            last_update_time: Utc::now(),
            last_write_date: reply.last_write_date,
            election_id: reply.election_id,
            set_version: reply.set_version,
            set_name: reply.set_name.clone(),
            topology_version: reply.topology_version.clone(),
            tags: reply.tags.clone(),
            hosts: parse_all(&reply.hosts),
            passives: parse_all(&reply.passives),
            arbiters: parse_all(&reply.arbiters),
            primary: reply.primary.as_deref().and_then(|p| ServerAddress::parse(p).ok()),
            me: reply.me.as_deref().and_then(|m| ServerAddress::parse(m).ok()),
            min_wire_version: reply.min_wire_version,
            max_wire_version: reply.max_wire_version,
            logical_session_timeout: reply
                .logical_session_timeout_minutes
                .map(|m| Duration::from_secs(m * 60)),
            error: None,
        }
    }

    /// Synthesized description for a load-balanced deployment, which has no
    /// monitor and is always considered available.
    pub fn load_balancer(address: ServerAddress) -> Self {
        Self {
            server_type: ServerType::LoadBalancer,
            state: ServerConnectionState::Connected,
            ..Self::unknown(address)
        }
    }

    pub fn is_available(&self) -> bool {
        self.state == ServerConnectionState::Connected && self.server_type.is_known()
    }

    /// True when `self` was produced before `current` by the same server process.
    pub fn is_stale_relative_to(&self, current: &ServerDescription) -> bool {
        match (&self.topology_version, &current.topology_version) {
            (Some(incoming), Some(on_file)) => {
                matches!(incoming.partial_cmp(on_file), Some(Ordering::Less))
            }
            _ => false,
        }
    }

    pub fn all_hosts(&self) -> impl Iterator<Item = &ServerAddress> {
        self.hosts.iter().chain(self.passives.iter()).chain(self.arbiters.iter())
    }

    pub fn is_wire_compatible(&self) -> bool {
        if !self.server_type.is_known() || self.server_type == ServerType::LoadBalancer {
            return true;
        }
        self.min_wire_version <= MAX_SUPPORTED_WIRE_VERSION
            && self.max_wire_version >= MIN_SUPPORTED_WIRE_VERSION
    }

    pub fn matches_tags(&self, tags: &TagSet) -> bool {
        tags.iter().all(|(k, v)| self.tags.get(k) == Some(v))
    }
}

impl fmt::Display for ServerDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.address, self.server_type)?;
        if let Some(rtt) = self.round_trip_time {
            write!(f, " rtt={}ms", rtt.as_millis())?;
        }
        if let Some(err) = &self.error {
            write!(f, " error=\"{}\"", err)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClusterType {
    Unknown,
    Single,
    ReplicaSetNoPrimary,
    ReplicaSetWithPrimary,
    Sharded,
    LoadBalanced,
}

impl ClusterType {
    pub fn is_replica_set(&self) -> bool {
        matches!(self, ClusterType::ReplicaSetNoPrimary | ClusterType::ReplicaSetWithPrimary)
    }
}

impl fmt::Display for ClusterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Immutable snapshot of the whole deployment.
#[derive(Debug, Clone)]
pub struct ClusterDescription {
    pub version: u64,
    pub cluster_type: ClusterType,
    pub set_name: Option<String>,
    pub max_set_version: Option<i32>,
    pub max_election_id: Option<ElectionId>,
    pub logical_session_timeout: Option<Duration>,
    pub servers: BTreeMap<ServerAddress, Arc<ServerDescription>>,
    pub direct_connection: bool,
    pub heartbeat_frequency: Duration,
    /// Width of the latency window selectors reduce their result to.
    pub local_threshold: Duration,
    pub compatibility_error: Option<String>,
}

impl ClusterDescription {
    pub fn new(
        cluster_type: ClusterType,
        seeds: impl IntoIterator<Item = ServerAddress>,
        set_name: Option<String>,
        direct_connection: bool,
        heartbeat_frequency: Duration,
    ) -> Self {
        let servers = seeds
            .into_iter()
            .map(|address| {
                let description = if cluster_type == ClusterType::LoadBalanced {
                    ServerDescription::load_balancer(address.clone())
                } else {
                    ServerDescription::unknown(address.clone())
                };
                (address, Arc::new(description))
            })
            .collect();

        Self {
            version: 0,
            cluster_type,
            set_name,
            max_set_version: None,
            max_election_id: None,
            logical_session_timeout: None,
            servers,
            direct_connection,
            heartbeat_frequency,
            local_threshold: DEFAULT_LOCAL_THRESHOLD,
            compatibility_error: None,
        }
    }

    pub fn with_local_threshold(mut self, local_threshold: Duration) -> Self {
        self.local_threshold = local_threshold;
        self
    }

    pub fn server(&self, address: &ServerAddress) -> Option<&Arc<ServerDescription>> {
        self.servers.get(address)
    }

    pub fn primary(&self) -> Option<&Arc<ServerDescription>> {
        self.servers.values().find(|s| s.server_type == ServerType::RsPrimary)
    }

    pub fn primary_count(&self) -> usize {
        self.servers
            .values()
            .filter(|s| s.server_type == ServerType::RsPrimary)
            .count()
    }

    /// Servers a selector may choose from.
    pub fn available_servers(&self) -> Vec<Arc<ServerDescription>> {
        self.servers.values().filter(|s| s.is_available()).cloned().collect()
    }

    pub fn has_writable_server(&self) -> bool {
        self.servers
            .values()
            .any(|s| s.is_available() && s.server_type.is_writable())
    }

    pub fn addresses(&self) -> Vec<ServerAddress> {
        self.servers.keys().cloned().collect()
    }
}

impl fmt::Display for ClusterDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{type: {}, version: {}", self.cluster_type, self.version)?;
        if let Some(name) = &self.set_name {
            write!(f, ", setName: {}", name)?;
        }
        write!(f, ", servers: [")?;
        for (i, server) in self.servers.values().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", server)?;
        }
        write!(f, "]")?;
        if let Some(err) = &self.compatibility_error {
            write!(f, ", compatibilityError: {}", err)?;
        }
        write!(f, "}}")
    }
}
