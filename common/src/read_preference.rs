use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::error::CoreError;
use crate::types::TagSet;

/// Lower bound on max staleness accepted from callers.
pub const SMALLEST_MAX_STALENESS: Duration = Duration::from_secs(90);
/// How often an idle primary writes a no-op, bounding replication lag estimates.
pub const IDLE_WRITE_PERIOD: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReadMode {
    Primary,
    PrimaryPreferred,
    Secondary,
    SecondaryPreferred,
    Nearest,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadPreference {
    pub mode: ReadMode,
    /// Tried in order; the first set matched by any eligible server wins.
    #[serde(default)]
    pub tag_sets: Vec<TagSet>,
    #[serde(default)]
    pub max_staleness: Option<Duration>,
}

impl ReadPreference {
    pub fn new(mode: ReadMode) -> Self {
        Self {
            mode,
            tag_sets: Vec::new(),
            max_staleness: None,
        }
    }

    pub fn primary() -> Self {
        Self::new(ReadMode::Primary)
    }

    pub fn primary_preferred() -> Self {
        Self::new(ReadMode::PrimaryPreferred)
    }

    pub fn secondary() -> Self {
        Self::new(ReadMode::Secondary)
    }

    pub fn secondary_preferred() -> Self {
        Self::new(ReadMode::SecondaryPreferred)
    }

    pub fn nearest() -> Self {
        Self::new(ReadMode::Nearest)
    }

    pub fn with_tag_sets(mut self, tag_sets: Vec<TagSet>) -> Self {
        self.tag_sets = tag_sets;
        self
    }

    pub fn with_max_staleness(mut self, max_staleness: Duration) -> Self {
        self.max_staleness = Some(max_staleness);
        self
    }

    pub fn is_primary(&self) -> bool {
        self.mode == ReadMode::Primary
    }

    pub fn validate(&self, heartbeat_frequency: Duration) -> Result<(), CoreError> {
        if self.mode == ReadMode::Primary {
            if self.tag_sets.iter().any(|t| !t.is_empty()) {
                return Err(CoreError::Config(
                    "tag sets are not allowed with read mode primary".to_string(),
                ));
            }
            if self.max_staleness.is_some() {
                return Err(CoreError::Config(
                    "max staleness is not allowed with read mode primary".to_string(),
                ));
            }
        }

        if let Some(max_staleness) = self.max_staleness {
            let floor = SMALLEST_MAX_STALENESS.max(heartbeat_frequency + IDLE_WRITE_PERIOD);
            if max_staleness < floor {
                return Err(CoreError::Config(format!(
                    "max staleness {:?} is below the minimum of {:?}",
                    max_staleness, floor
                )));
            }
        }
        Ok(())
    }
}

impl Default for ReadPreference {
    fn default() -> Self {
        Self::primary()
    }
}

impl fmt::Display for ReadPreference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.mode)?;
        if !self.tag_sets.is_empty() {
            write!(f, " tags={:?}", self.tag_sets)?;
        }
        if let Some(ms) = self.max_staleness {
            write!(f, " maxStaleness={}s", ms.as_secs())?;
        }
        Ok(())
    }
}
