use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::types::{ClusterDescription, ServerAddress, TopologyVersion};

pub type Result<T> = std::result::Result<T, CoreError>;

/// Error labels attached by servers (or by the operation layer) and consumed by
/// retry and transaction logic.
pub mod labels {
    pub const TRANSIENT_TRANSACTION_ERROR: &str = "TransientTransactionError";
    pub const UNKNOWN_TRANSACTION_COMMIT_RESULT: &str = "UnknownTransactionCommitResult";
    pub const RETRYABLE_WRITE_ERROR: &str = "RetryableWriteError";
}

/// Server error codes used to classify state-change errors.
pub mod codes {
    pub const SHUTDOWN_IN_PROGRESS: i32 = 91;
    pub const PRIMARY_STEPPED_DOWN: i32 = 189;
    pub const LEGACY_NOT_PRIMARY: i32 = 10058;
    pub const NOT_WRITABLE_PRIMARY: i32 = 10107;
    pub const INTERRUPTED_AT_SHUTDOWN: i32 = 11600;
    pub const INTERRUPTED_DUE_TO_REPL_STATE_CHANGE: i32 = 11602;
    pub const NOT_PRIMARY_NO_SECONDARY_OK: i32 = 13435;
    pub const NOT_PRIMARY_OR_SECONDARY: i32 = 13436;
}

/// `{ok: 0}` reply from a server.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandError {
    pub code: i32,
    pub code_name: String,
    pub message: String,
    pub labels: Vec<String>,
    pub topology_version: Option<TopologyVersion>,
}

impl CommandError {
    pub fn new(code: i32, code_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code,
            code_name: code_name.into(),
            message: message.into(),
            labels: Vec::new(),
            topology_version: None,
        }
    }

    pub fn from_document(document: &Value) -> Self {
        let code = document.get("code").and_then(Value::as_i64).unwrap_or(0) as i32;
        let code_name = document
            .get("codeName")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let message = document
            .get("errmsg")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let labels = document
            .get("errorLabels")
            .and_then(Value::as_array)
            .map(|arr| arr.iter().filter_map(|l| l.as_str().map(str::to_string)).collect())
            .unwrap_or_default();
        let topology_version = document
            .get("topologyVersion")
            .and_then(|tv| serde_json::from_value(tv.clone()).ok());

        Self {
            code,
            code_name,
            message,
            labels,
            topology_version,
        }
    }

    pub fn to_document(&self) -> Value {
        let mut doc = serde_json::json!({
            "ok": 0,
            "code": self.code,
            "codeName": self.code_name,
            "errmsg": self.message,
            "errorLabels": self.labels,
        });
        if let (Some(tv), Some(map)) = (&self.topology_version, doc.as_object_mut()) {
            map.insert(
                "topologyVersion".to_string(),
                serde_json::to_value(tv).unwrap_or(Value::Null),
            );
        }
        doc
    }

    pub fn with_topology_version(mut self, topology_version: TopologyVersion) -> Self {
        self.topology_version = Some(topology_version);
        self
    }

    pub fn is_not_primary(&self) -> bool {
        match self.code {
            codes::NOT_WRITABLE_PRIMARY | codes::NOT_PRIMARY_NO_SECONDARY_OK | codes::LEGACY_NOT_PRIMARY => {
                true
            }
            0 => {
                !self.is_recovering()
                    && (self.message.contains("not master") || self.message.contains("not primary"))
            }
            _ => false,
        }
    }

    pub fn is_recovering(&self) -> bool {
        match self.code {
            codes::INTERRUPTED_AT_SHUTDOWN
            | codes::INTERRUPTED_DUE_TO_REPL_STATE_CHANGE
            | codes::NOT_PRIMARY_OR_SECONDARY
            | codes::PRIMARY_STEPPED_DOWN
            | codes::SHUTDOWN_IN_PROGRESS => true,
            0 => {
                self.message.contains("node is recovering")
                    || self.message.contains("not master or secondary")
            }
            _ => false,
        }
    }

    pub fn is_shutdown(&self) -> bool {
        matches!(self.code, codes::INTERRUPTED_AT_SHUTDOWN | codes::SHUTDOWN_IN_PROGRESS)
    }
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.code_name, self.code, self.message)
    }
}

#[derive(Debug, Clone, Error)]
pub enum CoreError {
    #[error("connection pool for {address} is paused ({cause}); {wait_queue_depth} waiting, failed after {elapsed:?}")]
    PoolPaused {
        address: ServerAddress,
        cause: String,
        wait_queue_depth: usize,
        elapsed: Duration,
    },

    #[error("timed out after {elapsed:?} waiting for a connection to {address}: {in_use} in use, {pool_size}/{max_size} open, {wait_queue_depth} waiting")]
    PoolWaitTimeout {
        address: ServerAddress,
        wait_queue_depth: usize,
        pool_size: usize,
        in_use: usize,
        max_size: usize,
        elapsed: Duration,
    },

    #[error("connection pool for {address} is closed")]
    PoolClosed { address: ServerAddress },

    #[error("server selection timed out after {elapsed:?} using {selector}; cluster: {snapshot}")]
    SelectionTimeout {
        selector: String,
        snapshot: Arc<ClusterDescription>,
        elapsed: Duration,
    },

    #[error("network error on {address}: {message}")]
    Network {
        address: ServerAddress,
        message: String,
        timed_out: bool,
        labels: Vec<String>,
    },

    #[error("command failed: {0}")]
    Command(CommandError),

    #[error("operation cancelled")]
    Cancelled,

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("invalid heartbeat reply: {0}")]
    InvalidReply(String),

    #[error("incompatible deployment: {0}")]
    Incompatible(String),

    #[error("topology has been shut down")]
    Shutdown,

    #[error("invalid transaction state: {0}")]
    TransactionState(String),
}

impl CoreError {
    pub fn network(address: ServerAddress, message: impl Into<String>) -> Self {
        CoreError::Network {
            address,
            message: message.into(),
            timed_out: false,
            labels: Vec::new(),
        }
    }

    pub fn network_timeout(address: ServerAddress, message: impl Into<String>) -> Self {
        CoreError::Network {
            address,
            message: message.into(),
            timed_out: true,
            labels: Vec::new(),
        }
    }

    pub fn labels(&self) -> &[String] {
        match self {
            CoreError::Network { labels, .. } => labels,
            CoreError::Command(err) => &err.labels,
            _ => &[],
        }
    }

    pub fn has_label(&self, label: &str) -> bool {
        self.labels().iter().any(|l| l == label)
    }

    /// Adds a label to network and command errors; other kinds carry none.
    pub fn with_label(mut self, label: &str) -> Self {
        let target = match &mut self {
            CoreError::Network { labels, .. } => Some(labels),
            CoreError::Command(err) => Some(&mut err.labels),
            _ => None,
        };
        if let Some(labels) = target {
            if !labels.iter().any(|l| l == label) {
                labels.push(label.to_string());
            }
        }
        self
    }

    pub fn is_network_error(&self) -> bool {
        matches!(self, CoreError::Network { .. })
    }

    pub fn is_network_timeout(&self) -> bool {
        matches!(self, CoreError::Network { timed_out: true, .. })
    }

    pub fn is_not_primary(&self) -> bool {
        matches!(self, CoreError::Command(err) if err.is_not_primary())
    }

    pub fn is_recovering(&self) -> bool {
        matches!(self, CoreError::Command(err) if err.is_recovering())
    }

    pub fn is_state_change_error(&self) -> bool {
        self.is_not_primary() || self.is_recovering()
    }

    pub fn is_shutdown(&self) -> bool {
        matches!(self, CoreError::Command(err) if err.is_shutdown())
    }

    pub fn is_pool_paused(&self) -> bool {
        matches!(self, CoreError::PoolPaused { .. })
    }

    pub fn topology_version(&self) -> Option<&TopologyVersion> {
        match self {
            CoreError::Command(err) => err.topology_version.as_ref(),
            _ => None,
        }
    }
}
