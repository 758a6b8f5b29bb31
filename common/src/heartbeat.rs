use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CommandError, CoreError};
use crate::types::{ElectionId, ServerType, TagSet, TopologyVersion};

/// Parsed reply to a `hello` heartbeat. Only the fields the topology core reads
/// are modelled; everything else in the document is ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HelloReply {
    pub ok: f64,
    #[serde(alias = "ismaster")]
    pub is_writable_primary: bool,
    pub secondary: bool,
    pub arbiter_only: bool,
    pub hidden: bool,
    #[serde(rename = "isreplicaset")]
    pub is_replica_set: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub msg: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub set_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub set_version: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub election_id: Option<ElectionId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topology_version: Option<TopologyVersion>,
    pub hosts: Vec<String>,
    pub passives: Vec<String>,
    pub arbiters: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub primary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub me: Option<String>,
    pub tags: TagSet,
    pub min_wire_version: i32,
    pub max_wire_version: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logical_session_timeout_minutes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_write_date: Option<DateTime<Utc>>,
}

impl Default for HelloReply {
    fn default() -> Self {
        Self {
            ok: 1.0,
            is_writable_primary: false,
            secondary: false,
            arbiter_only: false,
            hidden: false,
            is_replica_set: false,
            msg: None,
            set_name: None,
            set_version: None,
            election_id: None,
            topology_version: None,
            hosts: Vec::new(),
            passives: Vec::new(),
            arbiters: Vec::new(),
            primary: None,
            me: None,
            tags: TagSet::new(),
            min_wire_version: 0,
            max_wire_version: 21,
            logical_session_timeout_minutes: Some(30),
            last_write_date: None,
        }
    }
}

impl HelloReply {
    /// Parses a response document, turning `{ok: 0}` into a command error.
    pub fn from_document(document: Value) -> Result<Self, CoreError> {
        if !document_ok(&document) {
            return Err(CoreError::Command(CommandError::from_document(&document)));
        }
        serde_json::from_value(document).map_err(|e| CoreError::InvalidReply(e.to_string()))
    }

    pub fn to_document(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    pub fn server_type(&self) -> ServerType {
        if self.ok != 1.0 {
            return ServerType::Unknown;
        }
        if self.is_replica_set {
            return ServerType::RsGhost;
        }
        if self.set_name.is_some() {
            return if self.hidden {
                ServerType::RsOther
            } else if self.is_writable_primary {
                ServerType::RsPrimary
            } else if self.secondary {
                ServerType::RsSecondary
            } else if self.arbiter_only {
                ServerType::RsArbiter
            } else {
                ServerType::RsOther
            };
        }
        if self.msg.as_deref() == Some("isdbgrid") {
            return ServerType::Mongos;
        }
        ServerType::Standalone
    }

    pub fn standalone() -> Self {
        Self {
            is_writable_primary: true,
            ..Self::default()
        }
    }

    pub fn mongos() -> Self {
        Self {
            is_writable_primary: true,
            msg: Some("isdbgrid".to_string()),
            ..Self::default()
        }
    }

    /// Replica-set member that is neither primary nor secondary yet; chain
    /// `as_primary` / `as_secondary` / `as_arbiter` to give it a role.
    pub fn rs_member(set_name: &str, hosts: &[&str], me: &str) -> Self {
        Self {
            set_name: Some(set_name.to_string()),
            hosts: hosts.iter().map(|h| h.to_string()).collect(),
            me: Some(me.to_string()),
            ..Self::default()
        }
    }

    pub fn as_primary(mut self, set_version: i32, election_id: ElectionId) -> Self {
        self.is_writable_primary = true;
        self.secondary = false;
        self.set_version = Some(set_version);
        self.election_id = Some(election_id);
        self.primary = self.me.clone();
        self
    }

    pub fn as_secondary(mut self) -> Self {
        self.is_writable_primary = false;
        self.secondary = true;
        self.election_id = None;
        self
    }

    pub fn as_arbiter(mut self) -> Self {
        self.is_writable_primary = false;
        self.secondary = false;
        self.arbiter_only = true;
        self
    }

    pub fn with_primary(mut self, primary: &str) -> Self {
        self.primary = Some(primary.to_string());
        self
    }

    pub fn with_tags(mut self, tags: &[(&str, &str)]) -> Self {
        self.tags = tags.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        self
    }

    pub fn with_topology_version(mut self, topology_version: TopologyVersion) -> Self {
        self.topology_version = Some(topology_version);
        self
    }

    pub fn with_wire_versions(mut self, min: i32, max: i32) -> Self {
        self.min_wire_version = min;
        self.max_wire_version = max;
        self
    }

    pub fn with_last_write_date(mut self, date: DateTime<Utc>) -> Self {
        self.last_write_date = Some(date);
        self
    }
}

pub fn document_ok(document: &Value) -> bool {
    match document.get("ok") {
        Some(Value::Number(n)) => n.as_f64() == Some(1.0),
        Some(Value::Bool(b)) => *b,
        _ => false,
    }
}
