//! Client-facing event payloads.

use lodestone_core::{CausedBy, ConfigurableValue, ExitStatus, InstanceUuid, MacroPid, Player, State};
use serde::{Deserialize, Serialize};

use crate::snowflake::Snowflake;

/// One entry of the event stream. `snowflake_str` is the dedup key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientEvent {
    pub event_inner: EventInner,
    pub details: String,
    pub snowflake: Snowflake,
    pub snowflake_str: String,
    pub caused_by: CausedBy,
}

impl ClientEvent {
    pub fn new(
        snowflake: Snowflake,
        event_inner: EventInner,
        details: impl Into<String>,
        caused_by: CausedBy,
    ) -> Self {
        Self {
            event_inner,
            details: details.into(),
            snowflake,
            snowflake_str: snowflake.to_string(),
            caused_by,
        }
    }

    pub fn timestamp_ms(&self) -> u64 {
        self.snowflake.timestamp_ms()
    }

    pub fn instance_uuid(&self) -> Option<InstanceUuid> {
        match &self.event_inner {
            EventInner::InstanceEvent(e) => Some(e.instance_uuid),
            EventInner::MacroEvent(e) => Some(e.instance_uuid),
            EventInner::ProgressionEvent(_) => None,
        }
    }

    pub fn progression(&self) -> Option<&ProgressionEvent> {
        match &self.event_inner {
            EventInner::ProgressionEvent(e) => Some(e),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EventInner {
    InstanceEvent(InstanceEvent),
    ProgressionEvent(ProgressionEvent),
    MacroEvent(MacroEvent),
}

// ── Instance events ───────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceEvent {
    pub instance_uuid: InstanceUuid,
    pub instance_name: String,
    pub instance_event_inner: InstanceEventInner,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum InstanceEventInner {
    StateTransition {
        from: State,
        to: State,
    },
    InstanceOutput {
        message: String,
    },
    /// `value` is `None` when the setting is secret.
    SettingChanged {
        section_id: String,
        setting_id: String,
        value: Option<ConfigurableValue>,
    },
    PlayerChange {
        player_list: Vec<Player>,
        players_joined: Vec<Player>,
        players_left: Vec<Player>,
    },
    SystemMessage {
        message: String,
    },
}

// ── Progression events ────────────────────────────────────────────

/// One step of a long-running operation grouped by `event_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressionEvent {
    pub event_id: String,
    pub progression_event_inner: ProgressionEventInner,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ProgressionEventInner {
    Start {
        progression_name: String,
        total: Option<f64>,
    },
    Update {
        progress: f64,
        progress_message: Option<String>,
    },
    End {
        success: bool,
        message: Option<String>,
    },
}

// ── Macro events ──────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MacroEvent {
    pub instance_uuid: InstanceUuid,
    pub macro_pid: MacroPid,
    pub macro_event_inner: MacroEventInner,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum MacroEventInner {
    Started,
    Stopped { exit_status: ExitStatus },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progression_event_wire_shape() {
        let event = ClientEvent::new(
            Snowflake::from_raw(1234),
            EventInner::ProgressionEvent(ProgressionEvent {
                event_id: "op-1".to_string(),
                progression_event_inner: ProgressionEventInner::Update {
                    progress: 2.0,
                    progress_message: Some("Downloading".to_string()),
                },
            }),
            "",
            CausedBy::System,
        );
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["snowflake_str"], "1234");
        assert_eq!(json["event_inner"]["type"], "ProgressionEvent");
        assert_eq!(json["event_inner"]["event_id"], "op-1");
        assert_eq!(
            json["event_inner"]["progression_event_inner"]["type"],
            "Update"
        );
        let back: ClientEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn macro_started_is_tagged_unit() {
        let inner = serde_json::to_value(MacroEventInner::Started).unwrap();
        assert_eq!(inner, serde_json::json!({ "type": "Started" }));
    }
}
