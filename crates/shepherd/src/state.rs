//! Durable runtime state.
//!
//! Persists a flat JSON map of service name to [`RuntimeRecord`] so a
//! later manager invocation can find and terminate processes spawned by
//! an earlier one. The in-memory record map is a cache; this file is the
//! source of truth across manager restarts.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::Result;

/// Lifecycle status of a managed service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceStatus {
    Starting,
    HealthChecking,
    Running,
    Stopped,
    Failed,
}

impl ServiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceStatus::Starting => "starting",
            ServiceStatus::HealthChecking => "health_checking",
            ServiceStatus::Running => "running",
            ServiceStatus::Stopped => "stopped",
            ServiceStatus::Failed => "failed",
        }
    }
}

/// Whether a service failure is critical to the whole run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceClass {
    Base,
    Optional,
}

impl ServiceClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceClass::Base => "base",
            ServiceClass::Optional => "optional",
        }
    }
}

/// Last known runtime facts for one service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeRecord {
    /// OS process id, if the service runs in the background.
    #[serde(default)]
    pub pid: Option<u32>,
    /// Seconds since the Unix epoch at spawn time.
    pub start_time: u64,
    /// Invocation target (script path or program) used to re-identify
    /// the process after the handle is lost.
    #[serde(default)]
    pub script: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub cwd: Option<String>,
    /// Listening port, best-effort.
    #[serde(default)]
    pub port: Option<u16>,
    pub status: ServiceStatus,
    #[serde(rename = "type")]
    pub class: ServiceClass,
}

impl RuntimeRecord {
    pub fn uptime_secs(&self) -> u64 {
        now_secs().saturating_sub(self.start_time)
    }
}

/// Current timestamp in seconds since the Unix epoch.
pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Base directory for configuration, state and logs.
///
/// Resolution order: `SHEPHERD_HOME` env var, then `~/.shepherd`.
pub fn shepherd_home() -> PathBuf {
    std::env::var_os("SHEPHERD_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("/tmp"))
                .join(".shepherd")
        })
}

/// Default state file path.
pub fn default_state_file() -> PathBuf {
    shepherd_home().join("service_state.json")
}

/// Default directory for service log files.
pub fn default_log_dir() -> PathBuf {
    shepherd_home().join("logs")
}

/// Durable name-to-record map backed by a JSON file.
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

pub type StateMap = IndexMap<String, RuntimeRecord>;

impl StateStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Load the persisted state. A missing or corrupt file is treated as
    /// empty state: losing history must never prevent the manager from
    /// starting.
    pub fn load(&self) -> StateMap {
        if !self.path.exists() {
            return StateMap::new();
        }

        let content = match fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) => {
                log::warn!(
                    "Failed to read state file {}: {}; starting with empty state",
                    self.path.display(),
                    e
                );
                return StateMap::new();
            }
        };

        match serde_json::from_str(&content) {
            Ok(map) => map,
            Err(e) => {
                log::warn!(
                    "State file {} is corrupt: {}; starting with empty state",
                    self.path.display(),
                    e
                );
                StateMap::new()
            }
        }
    }

    /// Persist the full map, atomically replacing the previous file.
    pub fn save(&self, map: &StateMap) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = serde_json::to_string_pretty(map)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, content)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}
