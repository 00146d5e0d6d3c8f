//! Procedure calls: the closed set of requests an instance can receive.

use std::path::PathBuf;

use lodestone_core::{
    CausedBy, ConfigurableValue, DotLodestoneConfig, Error, GameType, InstanceUuid, MacroPid,
    Result, SetupValue,
};
use serde::{Deserialize, Serialize};

use crate::result::{ProcedureCallResultInner, ResultKind};

/// Generates the payload enum, its kind enum, and the accepted result
/// kinds from one table.
macro_rules! procedure_calls {
    ($(
        $(#[$meta:meta])*
        $variant:ident { $( $(#[$fmeta:meta])* $field:ident : $ty:ty ),* $(,)? } => [$($result:ident),+ $(,)?]
    ),+ $(,)?) => {
        /// Typed payload of a procedure call, tagged on the wire by `type`.
        #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
        #[serde(tag = "type")]
        pub enum ProcedureCallInner {
            $(
                $(#[$meta])*
                $variant { $( $(#[$fmeta])* $field: $ty ),* },
            )+
        }

        /// Discriminant of [`ProcedureCallInner`].
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum ProcedureCallKind {
            $($variant,)+
        }

        impl ProcedureCallInner {
            pub fn kind(&self) -> ProcedureCallKind {
                match self {
                    $(ProcedureCallInner::$variant { .. } => ProcedureCallKind::$variant,)+
                }
            }
        }

        impl ProcedureCallKind {
            /// Every call kind, in declaration order.
            pub const ALL: &'static [ProcedureCallKind] = &[$(ProcedureCallKind::$variant,)+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $(ProcedureCallKind::$variant => stringify!($variant),)+
                }
            }

            /// Result shapes a handler may legitimately answer with.
            pub fn expected_results(&self) -> &'static [ResultKind] {
                match self {
                    $(ProcedureCallKind::$variant => &[$(ResultKind::$result,)+],)+
                }
            }
        }
    };
}

procedure_calls! {
    // Instance creation and removal.
    SetupInstance {
        dot_lodestone_config: DotLodestoneConfig,
        setup_value: SetupValue,
        path: PathBuf,
    } => [Void],
    RestoreInstance {
        dot_lodestone_config: DotLodestoneConfig,
        path: PathBuf,
    } => [Void],
    DestructInstance { instance_uuid: InstanceUuid, caused_by: CausedBy } => [Void],
    GetSetupManifest { game_type: GameType } => [SetupManifest],

    // Metadata.
    GetName { instance_uuid: InstanceUuid } => [String],
    GetDescription { instance_uuid: InstanceUuid } => [String],
    GetVersion { instance_uuid: InstanceUuid } => [String],
    GetGame { instance_uuid: InstanceUuid } => [Game],
    GetPort { instance_uuid: InstanceUuid } => [Num],
    GetAutoStart { instance_uuid: InstanceUuid } => [Bool],
    GetRestartOnCrash { instance_uuid: InstanceUuid } => [Bool],
    SetName { instance_uuid: InstanceUuid, new_name: String } => [Void],
    SetDescription { instance_uuid: InstanceUuid, new_description: String } => [Void],
    SetPort { instance_uuid: InstanceUuid, new_port: u32 } => [Void],
    SetAutoStart { instance_uuid: InstanceUuid, new_value: bool } => [Void],
    SetRestartOnCrash { instance_uuid: InstanceUuid, new_value: bool } => [Void],

    // Configuration.
    GetConfigurableManifest { instance_uuid: InstanceUuid } => [ConfigurableManifest],
    UpdateConfigurable {
        instance_uuid: InstanceUuid,
        section_id: String,
        setting_id: String,
        new_value: ConfigurableValue,
    } => [Void],

    // Lifecycle.
    /// With `block` the call returns once the instance is `Running` or `Error`.
    StartInstance {
        instance_uuid: InstanceUuid,
        caused_by: CausedBy,
        #[serde(default)]
        block: bool,
    } => [Void, State],
    StopInstance {
        instance_uuid: InstanceUuid,
        caused_by: CausedBy,
        #[serde(default)]
        block: bool,
    } => [Void, State],
    RestartInstance {
        instance_uuid: InstanceUuid,
        caused_by: CausedBy,
        #[serde(default)]
        block: bool,
    } => [Void, State],
    /// Bypasses the instance queue; always ends `Stopped` or `Error`.
    KillInstance { instance_uuid: InstanceUuid, caused_by: CausedBy } => [State, Void],
    GetState { instance_uuid: InstanceUuid } => [State],

    // Runtime.
    SendCommand { instance_uuid: InstanceUuid, command: String, caused_by: CausedBy } => [Void],
    Monitor { instance_uuid: InstanceUuid } => [Monitor],
    GetPlayerCount { instance_uuid: InstanceUuid } => [Num],
    GetMaxPlayerCount { instance_uuid: InstanceUuid } => [Num],
    SetMaxPlayerCount { instance_uuid: InstanceUuid, new_value: u32 } => [Void],
    GetPlayerList { instance_uuid: InstanceUuid } => [Player],

    // Macros.
    CreateMacro { instance_uuid: InstanceUuid, name: String, content: String } => [Void],
    DeleteMacro { instance_uuid: InstanceUuid, name: String } => [Void],
    /// Answers with the pid of the new task.
    RunMacro {
        instance_uuid: InstanceUuid,
        name: String,
        #[serde(default)]
        args: Vec<String>,
        caused_by: CausedBy,
    } => [Num],
    KillMacro { instance_uuid: InstanceUuid, pid: MacroPid } => [Void],
    GetMacroList { instance_uuid: InstanceUuid } => [MacroList],
    GetTaskList { instance_uuid: InstanceUuid } => [TaskList],
    GetHistoryList { instance_uuid: InstanceUuid } => [HistoryList],
}

impl ProcedureCallKind {
    /// Calls that change an instance's lifecycle and must name an actor.
    pub fn is_lifecycle(&self) -> bool {
        matches!(
            self,
            ProcedureCallKind::StartInstance
                | ProcedureCallKind::StopInstance
                | ProcedureCallKind::RestartInstance
                | ProcedureCallKind::KillInstance
                | ProcedureCallKind::DestructInstance
        )
    }

    pub fn accepts(&self, inner: &ProcedureCallResultInner) -> bool {
        self.expected_results().contains(&inner.kind())
    }
}

impl std::fmt::Display for ProcedureCallKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ProcedureCallInner {
    /// The instance this call targets. `None` only for `GetSetupManifest`.
    pub fn instance_uuid(&self) -> Option<InstanceUuid> {
        use ProcedureCallInner::*;
        match self {
            SetupInstance {
                dot_lodestone_config,
                ..
            }
            | RestoreInstance {
                dot_lodestone_config,
                ..
            } => Some(dot_lodestone_config.uuid),
            GetSetupManifest { .. } => None,
            DestructInstance { instance_uuid, .. }
            | GetName { instance_uuid }
            | GetDescription { instance_uuid }
            | GetVersion { instance_uuid }
            | GetGame { instance_uuid }
            | GetPort { instance_uuid }
            | GetAutoStart { instance_uuid }
            | GetRestartOnCrash { instance_uuid }
            | SetName { instance_uuid, .. }
            | SetDescription { instance_uuid, .. }
            | SetPort { instance_uuid, .. }
            | SetAutoStart { instance_uuid, .. }
            | SetRestartOnCrash { instance_uuid, .. }
            | GetConfigurableManifest { instance_uuid }
            | UpdateConfigurable { instance_uuid, .. }
            | StartInstance { instance_uuid, .. }
            | StopInstance { instance_uuid, .. }
            | RestartInstance { instance_uuid, .. }
            | KillInstance { instance_uuid, .. }
            | GetState { instance_uuid }
            | SendCommand { instance_uuid, .. }
            | Monitor { instance_uuid }
            | GetPlayerCount { instance_uuid }
            | GetMaxPlayerCount { instance_uuid }
            | SetMaxPlayerCount { instance_uuid, .. }
            | GetPlayerList { instance_uuid }
            | CreateMacro { instance_uuid, .. }
            | DeleteMacro { instance_uuid, .. }
            | RunMacro { instance_uuid, .. }
            | KillMacro { instance_uuid, .. }
            | GetMacroList { instance_uuid }
            | GetTaskList { instance_uuid }
            | GetHistoryList { instance_uuid } => Some(*instance_uuid),
        }
    }

    pub fn caused_by(&self) -> Option<&CausedBy> {
        use ProcedureCallInner::*;
        match self {
            DestructInstance { caused_by, .. }
            | StartInstance { caused_by, .. }
            | StopInstance { caused_by, .. }
            | RestartInstance { caused_by, .. }
            | KillInstance { caused_by, .. }
            | SendCommand { caused_by, .. }
            | RunMacro { caused_by, .. } => Some(caused_by),
            _ => None,
        }
    }

    /// Field-level checks that do not need the instance.
    pub fn validate(&self) -> Result<()> {
        if self.kind().is_lifecycle() {
            if let Some(caused_by) = self.caused_by() {
                caused_by.ensure_attributed()?;
            }
        }
        match self {
            ProcedureCallInner::SetName { new_name, .. } if new_name.trim().is_empty() => {
                Err(Error::invalid_input("instance name must not be empty"))
            }
            ProcedureCallInner::SetPort { new_port, .. } if !(1..=65535).contains(new_port) => {
                Err(Error::invalid_input(format!(
                    "port {new_port} is outside 1..=65535"
                )))
            }
            ProcedureCallInner::SendCommand { command, .. } if command.trim().is_empty() => {
                Err(Error::invalid_input("console command must not be empty"))
            }
            _ => Ok(()),
        }
    }
}

/// A procedure call with its correlation id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcedureCall {
    pub id: u64,
    #[serde(flatten)]
    pub inner: ProcedureCallInner,
}

impl ProcedureCall {
    pub fn new(id: u64, inner: ProcedureCallInner) -> Self {
        Self { id, inner }
    }

    pub fn kind(&self) -> ProcedureCallKind {
        self.inner.kind()
    }

    /// Parse and validate a call arriving from outside the process.
    pub fn from_json(content: &str) -> Result<Self> {
        let call: ProcedureCall = serde_json::from_str(content)
            .map_err(|e| Error::invalid_input(format!("malformed procedure call: {e}")))?;
        call.inner.validate()?;
        Ok(call)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::handler_fault(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lodestone_core::ErrorKind;

    fn user() -> CausedBy {
        CausedBy::User {
            user_id: "u-1".to_string(),
            user_name: "steve".to_string(),
        }
    }

    #[test]
    fn wire_shape_is_flat_and_tagged() {
        let uuid = InstanceUuid::new();
        let call = ProcedureCall::new(
            7,
            ProcedureCallInner::StartInstance {
                instance_uuid: uuid,
                caused_by: user(),
                block: true,
            },
        );
        let json = serde_json::to_value(&call).unwrap();
        assert_eq!(json["id"], 7);
        assert_eq!(json["type"], "StartInstance");
        assert_eq!(json["block"], true);
        assert_eq!(json["caused_by"]["type"], "User");
        assert_eq!(json["instance_uuid"], uuid.to_string());
    }

    #[test]
    fn from_json_parses_and_defaults_block() {
        let uuid = InstanceUuid::new();
        let content = format!(
            r#"{{"id":1,"type":"StopInstance","instance_uuid":"{uuid}","caused_by":{{"type":"System"}}}}"#
        );
        let call = ProcedureCall::from_json(&content).unwrap();
        assert_eq!(call.kind(), ProcedureCallKind::StopInstance);
        assert_eq!(
            call.inner,
            ProcedureCallInner::StopInstance {
                instance_uuid: uuid,
                caused_by: CausedBy::System,
                block: false,
            }
        );
    }

    #[test]
    fn missing_field_is_invalid_input() {
        let content = r#"{"id":1,"type":"SetName","new_name":"x"}"#;
        let err = ProcedureCall::from_json(content).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidInput);
    }

    #[test]
    fn unknown_kind_is_invalid_input() {
        let content = r#"{"id":1,"type":"FormatDisk"}"#;
        let err = ProcedureCall::from_json(content).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidInput);
    }

    #[test]
    fn unattributed_lifecycle_call_is_denied() {
        let uuid = InstanceUuid::new();
        let content = format!(
            r#"{{"id":1,"type":"KillInstance","instance_uuid":"{uuid}","caused_by":{{"type":"Unknown"}}}}"#
        );
        let err = ProcedureCall::from_json(&content).unwrap_err();
        assert_eq!(err.kind, ErrorKind::PermissionDenied);
    }

    #[test]
    fn bad_port_is_invalid_input() {
        let inner = ProcedureCallInner::SetPort {
            instance_uuid: InstanceUuid::new(),
            new_port: 70000,
        };
        assert!(inner.validate().unwrap_err().is(ErrorKind::InvalidInput));
    }

    #[test]
    fn every_kind_has_expected_results() {
        assert_eq!(ProcedureCallKind::ALL.len(), 36);
        for kind in ProcedureCallKind::ALL {
            assert!(!kind.expected_results().is_empty(), "{kind}");
        }
    }

    #[test]
    fn lifecycle_accepts_void_or_state_only() {
        let kind = ProcedureCallKind::StartInstance;
        assert!(kind.accepts(&ProcedureCallResultInner::Void));
        assert!(kind.accepts(&ProcedureCallResultInner::State(
            lodestone_core::State::Running
        )));
        assert!(!kind.accepts(&ProcedureCallResultInner::String("ok".to_string())));
        assert!(ProcedureCallKind::RunMacro.accepts(&ProcedureCallResultInner::Num(3)));
    }

    #[test]
    fn setup_targets_descriptor_uuid() {
        let dot = DotLodestoneConfig::new(InstanceUuid::new(), GameType::new("sandbox"));
        let uuid = dot.uuid;
        let inner = ProcedureCallInner::RestoreInstance {
            dot_lodestone_config: dot,
            path: PathBuf::from("/tmp/x"),
        };
        assert_eq!(inner.instance_uuid(), Some(uuid));
        let manifest = ProcedureCallInner::GetSetupManifest {
            game_type: GameType::new("sandbox"),
        };
        assert_eq!(manifest.instance_uuid(), None);
    }
}
