//! Session configuration via `coherence.toml`
//!
//! A session is configured either in code or from a small TOML file. Enum
//! valued settings are stored as strings so the file stays readable, and
//! are validated eagerly when the file is loaded.

use coherence_cache::CacheInvalidationPolicy;
use coherence_core::{CoherenceError, CoherenceResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::descriptor::CacheSynchronizationType;
use crate::merge::CascadePolicy;

/// Config file name.
pub const CONFIG_FILE_NAME: &str = "coherence.toml";

/// Session configuration loaded from `coherence.toml`.
///
/// # Example
///
/// ```toml
/// lock_wait_timeout_ms = 5000
/// deferred_locks = true
/// suppress_validation = false
/// default_cascade = "private"
/// cache_sync = "send-changes"
/// default_time_to_live_ms = 60000
/// sequence_start = 1
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoherenceConfig {
    /// Bound on blocking write-lock acquisition, unbounded when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock_wait_timeout_ms: Option<u64>,
    /// Allow merges to switch to deferred locking on contention.
    #[serde(default = "default_true")]
    pub deferred_locks: bool,
    /// Swallow suppressible validation errors during cascades.
    #[serde(default)]
    pub suppress_validation: bool,
    /// Cascade policy for clone merges: `"none"`, `"private"`, `"all"` or `"mapping"`.
    #[serde(default = "default_cascade_str")]
    pub default_cascade: String,
    /// Synchronization type for descriptors that do not set one:
    /// `"send-changes"`, `"invalidate"`, `"send-new-and-changes"` or `"none"`.
    #[serde(default = "default_cache_sync_str")]
    pub cache_sync: String,
    /// Time-to-live for descriptors without an invalidation policy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_time_to_live_ms: Option<u64>,
    /// First value handed out by sequencing for each entity.
    #[serde(default = "default_sequence_start")]
    pub sequence_start: i64,
}

fn default_true() -> bool {
    true
}

fn default_cascade_str() -> String {
    "private".to_string()
}

fn default_cache_sync_str() -> String {
    "send-changes".to_string()
}

fn default_sequence_start() -> i64 {
    1
}

impl Default for CoherenceConfig {
    fn default() -> Self {
        Self {
            lock_wait_timeout_ms: None,
            deferred_locks: true,
            suppress_validation: false,
            default_cascade: default_cascade_str(),
            cache_sync: default_cache_sync_str(),
            default_time_to_live_ms: None,
            sequence_start: default_sequence_start(),
        }
    }
}

impl CoherenceConfig {
    /// Parse `default_cascade`.
    ///
    /// # Errors
    ///
    /// Returns an error for an unknown cascade name.
    pub fn cascade_policy(&self) -> CoherenceResult<CascadePolicy> {
        match self.default_cascade.as_str() {
            "none" => Ok(CascadePolicy::None),
            "private" => Ok(CascadePolicy::PrivateParts),
            "all" => Ok(CascadePolicy::AllParts),
            "mapping" => Ok(CascadePolicy::ByMapping),
            other => Err(CoherenceError::config(format!(
                "Invalid default_cascade '{}'. Expected \"none\", \"private\", \"all\" or \"mapping\".",
                other
            ))),
        }
    }

    /// Parse `cache_sync`.
    ///
    /// # Errors
    ///
    /// Returns an error for an unknown synchronization type.
    pub fn sync_type(&self) -> CoherenceResult<CacheSynchronizationType> {
        match self.cache_sync.as_str() {
            "send-changes" => Ok(CacheSynchronizationType::SendObjectChanges),
            "invalidate" => Ok(CacheSynchronizationType::InvalidateChangedObjects),
            "send-new-and-changes" => Ok(CacheSynchronizationType::SendNewObjectsWithChanges),
            "none" => Ok(CacheSynchronizationType::DoNotSend),
            other => Err(CoherenceError::config(format!(
                "Invalid cache_sync '{}'. Expected \"send-changes\", \"invalidate\", \
                 \"send-new-and-changes\" or \"none\".",
                other
            ))),
        }
    }

    /// Blocking acquire bound.
    pub fn lock_wait_timeout(&self) -> Option<Duration> {
        self.lock_wait_timeout_ms.map(Duration::from_millis)
    }

    /// Invalidation policy for descriptors that do not set one.
    pub fn default_invalidation(&self) -> CacheInvalidationPolicy {
        match self.default_time_to_live_ms {
            Some(ms) => CacheInvalidationPolicy::TimeToLive(Duration::from_millis(ms)),
            None => CacheInvalidationPolicy::NoExpiry,
        }
    }

    /// Check every enum-valued setting.
    pub fn validate(&self) -> CoherenceResult<()> {
        self.cascade_policy()?;
        self.sync_type()?;
        Ok(())
    }

    /// Returns the default config file content with comments.
    pub fn default_toml() -> &'static str {
        r#"# Coherence session configuration
#
# Bound on blocking write-lock waits, in milliseconds (default: unbounded)
# lock_wait_timeout_ms = 5000

# Switch a merge to deferred locking when it meets a held entry while
# holding others (default: true). When false, contention always blocks.
deferred_locks = true

# Swallow suppressible validation errors raised during cascades
suppress_validation = false

# Cascade policy for clone merges: "none", "private", "all", "mapping"
default_cascade = "private"

# Cache synchronization for descriptors that do not set one:
# "send-changes", "invalidate", "send-new-and-changes", "none"
cache_sync = "send-changes"

# Time-to-live for cached objects, in milliseconds (default: never expire)
# default_time_to_live_ms = 60000

# First sequence number handed out per entity
sequence_start = 1
"#
    }

    /// Read and parse config from a file path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: &Path) -> CoherenceResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            CoherenceError::config(format!(
                "Failed to read config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        content.parse().map_err(|e: CoherenceError| {
            CoherenceError::config(format!("In '{}': {}", path.display(), e))
        })
    }

    /// Write the default config file if it does not already exist.
    pub fn write_default_if_missing(path: &Path) -> CoherenceResult<()> {
        if !path.exists() {
            std::fs::write(path, Self::default_toml()).map_err(|e| {
                CoherenceError::config(format!(
                    "Failed to write default config file '{}': {}",
                    path.display(),
                    e
                ))
            })?;
        }
        Ok(())
    }

    /// Serialize this config to TOML and write it to the given path.
    pub fn write_to_file(&self, path: &Path) -> CoherenceResult<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| CoherenceError::internal(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, content).map_err(|e| {
            CoherenceError::config(format!(
                "Failed to write config file '{}': {}",
                path.display(),
                e
            ))
        })
    }
}

impl FromStr for CoherenceConfig {
    type Err = CoherenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let config: CoherenceConfig = toml::from_str(s)
            .map_err(|e| CoherenceError::config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }
}
