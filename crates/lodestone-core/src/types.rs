//! Identity, lifecycle, and record types shared across Lodestone crates.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

/// File name of the persisted instance descriptor inside an instance directory.
pub const DOT_LODESTONE_CONFIG: &str = ".lodestone_config";

// ── Identity ──────────────────────────────────────────────────────

/// Unique identifier of a managed instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceUuid(Uuid);

impl InstanceUuid {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// First eight hex digits, used for directory names and log lines.
    pub fn short(&self) -> String {
        self.0.simple().to_string()[..8].to_string()
    }
}

impl Default for InstanceUuid {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for InstanceUuid {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl std::str::FromStr for InstanceUuid {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| Error::invalid_input(format!("invalid instance uuid {s:?}: {e}")))
    }
}

impl std::fmt::Display for InstanceUuid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Registry key of a game backend ("sandbox", "generic", ...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GameType(String);

impl GameType {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for GameType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// The game an instance runs, as reported by its backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Game {
    pub game_type: GameType,
    pub display_name: String,
}

// ── Lifecycle ─────────────────────────────────────────────────────

/// Lifecycle state of an instance. Only the supervisor mutates it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum State {
    Starting,
    Running,
    Stopping,
    Stopped,
    Error,
}

impl State {
    /// `Stopped` and `Error` are where kill and crash handling leave an instance.
    pub fn is_terminal(&self) -> bool {
        matches!(self, State::Stopped | State::Error)
    }

    pub fn is_transitional(&self) -> bool {
        matches!(self, State::Starting | State::Stopping)
    }
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            State::Starting => "starting",
            State::Running => "running",
            State::Stopping => "stopping",
            State::Stopped => "stopped",
            State::Error => "error",
        };
        f.write_str(s)
    }
}

/// The actor that initiated a request, carried into events for attribution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum CausedBy {
    User { user_id: String, user_name: String },
    ApiKey { key_id: String },
    Instance { instance_uuid: InstanceUuid },
    Macro { macro_pid: MacroPid },
    System,
    Unknown,
}

impl CausedBy {
    /// Lifecycle-changing calls must name a concrete actor.
    pub fn ensure_attributed(&self) -> Result<()> {
        match self {
            CausedBy::Unknown => Err(Error::permission_denied(
                "lifecycle calls must be attributed to an actor",
            )),
            CausedBy::User { user_id, .. } if user_id.trim().is_empty() => {
                Err(Error::permission_denied("caused_by user id is empty"))
            }
            CausedBy::ApiKey { key_id } if key_id.trim().is_empty() => {
                Err(Error::permission_denied("caused_by api key id is empty"))
            }
            _ => Ok(()),
        }
    }
}

// ── Runtime introspection ─────────────────────────────────────────

/// A player connected to an instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Player {
    pub id: String,
    pub name: String,
}

/// Resource usage sample reported by `Monitor`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceReport {
    /// Resident memory in bytes.
    pub memory_usage: Option<u64>,
    /// Disk usage of the instance directory in bytes.
    pub disk_usage: Option<u64>,
    /// CPU usage as a percentage of one core.
    pub cpu_usage: Option<f32>,
    /// Unix timestamp (seconds) when the server started.
    pub start_time: Option<u64>,
}

// ── Persisted descriptor ──────────────────────────────────────────

/// The `.lodestone_config` descriptor written into every instance directory.
///
/// The supervisor only relies on `uuid` and `game_type`; `metadata` belongs
/// to the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DotLodestoneConfig {
    pub uuid: InstanceUuid,
    pub game_type: GameType,
    #[serde(default)]
    pub creation_time: u64,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl DotLodestoneConfig {
    pub fn new(uuid: InstanceUuid, game_type: GameType) -> Self {
        Self {
            uuid,
            game_type,
            creation_time: epoch_secs(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::handler_fault(e.to_string()))
    }

    pub fn from_json(content: &str) -> Result<Self> {
        serde_json::from_str(content)
            .map_err(|e| Error::invalid_input(format!("malformed {DOT_LODESTONE_CONFIG}: {e}")))
    }
}

// ── Macros ────────────────────────────────────────────────────────

/// Process id of a macro run, unique within one host process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MacroPid(pub u32);

impl std::fmt::Display for MacroPid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MacroPID({})", self.0)
    }
}

/// How a macro run ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ExitStatus {
    Success { time: u64 },
    Killed { time: u64 },
    Error { time: u64, error_msg: String },
}

impl ExitStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, ExitStatus::Success { .. })
    }
}

/// A stored macro script.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MacroEntry {
    pub name: String,
    /// Unix timestamp (seconds) of the last modification, when known.
    pub last_modified: Option<u64>,
}

/// A macro run that has not finished yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskEntry {
    pub pid: MacroPid,
    pub name: String,
    pub args: Vec<String>,
    pub caused_by: CausedBy,
    /// Progression `event_id` tracking this run.
    pub event_id: String,
    pub creation_time: u64,
}

/// A finished macro run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub task: TaskEntry,
    pub exit_status: ExitStatus,
}

impl HistoryEntry {
    pub fn success(&self) -> bool {
        self.exit_status.is_success()
    }
}

/// Current Unix epoch in seconds.
pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Current Unix epoch in milliseconds.
pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
