pub mod config;
pub mod error;
pub mod heartbeat;
pub mod read_preference;
pub mod types;

pub use config::{ClusterConfig, MonitoringMode, PoolConfig};
pub use error::{CommandError, CoreError, Result};
pub use heartbeat::HelloReply;
pub use read_preference::{ReadMode, ReadPreference};
pub use types::{
    ClusterDescription, ClusterType, ElectionId, ServerAddress, ServerConnectionState,
    ServerDescription, ServerType, TagSet, TopologyVersion,
};
