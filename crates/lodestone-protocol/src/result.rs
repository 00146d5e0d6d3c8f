//! Procedure call results.

use lodestone_core::{
    ConfigurableManifest, Error, Game, HistoryEntry, MacroEntry, PerformanceReport, Player,
    Result, SetupManifest, State, TaskEntry,
};
use serde::{Deserialize, Serialize};

use crate::call::ProcedureCallKind;

/// Successful payload of a procedure call.
///
/// Externally tagged: `{"String": "…"}`, `{"Num": 3}`, or the bare string
/// `"Void"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ProcedureCallResultInner {
    String(String),
    Num(u32),
    Bool(bool),
    State(State),
    Game(Game),
    Player(Vec<Player>),
    ConfigurableManifest(ConfigurableManifest),
    SetupManifest(SetupManifest),
    Monitor(PerformanceReport),
    MacroList(Vec<MacroEntry>),
    TaskList(Vec<TaskEntry>),
    HistoryList(Vec<HistoryEntry>),
    Void,
}

/// Discriminant of [`ProcedureCallResultInner`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResultKind {
    String,
    Num,
    Bool,
    State,
    Game,
    Player,
    ConfigurableManifest,
    SetupManifest,
    Monitor,
    MacroList,
    TaskList,
    HistoryList,
    Void,
}

impl ProcedureCallResultInner {
    pub fn kind(&self) -> ResultKind {
        match self {
            ProcedureCallResultInner::String(_) => ResultKind::String,
            ProcedureCallResultInner::Num(_) => ResultKind::Num,
            ProcedureCallResultInner::Bool(_) => ResultKind::Bool,
            ProcedureCallResultInner::State(_) => ResultKind::State,
            ProcedureCallResultInner::Game(_) => ResultKind::Game,
            ProcedureCallResultInner::Player(_) => ResultKind::Player,
            ProcedureCallResultInner::ConfigurableManifest(_) => ResultKind::ConfigurableManifest,
            ProcedureCallResultInner::SetupManifest(_) => ResultKind::SetupManifest,
            ProcedureCallResultInner::Monitor(_) => ResultKind::Monitor,
            ProcedureCallResultInner::MacroList(_) => ResultKind::MacroList,
            ProcedureCallResultInner::TaskList(_) => ResultKind::TaskList,
            ProcedureCallResultInner::HistoryList(_) => ResultKind::HistoryList,
            ProcedureCallResultInner::Void => ResultKind::Void,
        }
    }

    /// Unwrap helpers used by callers that already checked the call kind.
    pub fn into_string(self) -> Result<String> {
        match self {
            ProcedureCallResultInner::String(s) => Ok(s),
            other => Err(mismatch(ResultKind::String, &other)),
        }
    }

    pub fn into_num(self) -> Result<u32> {
        match self {
            ProcedureCallResultInner::Num(n) => Ok(n),
            other => Err(mismatch(ResultKind::Num, &other)),
        }
    }

    pub fn into_bool(self) -> Result<bool> {
        match self {
            ProcedureCallResultInner::Bool(b) => Ok(b),
            other => Err(mismatch(ResultKind::Bool, &other)),
        }
    }

    pub fn into_state(self) -> Result<State> {
        match self {
            ProcedureCallResultInner::State(s) => Ok(s),
            other => Err(mismatch(ResultKind::State, &other)),
        }
    }
}

fn mismatch(expected: ResultKind, got: &ProcedureCallResultInner) -> Error {
    Error::handler_fault(format!(
        "expected a {expected:?} result, got {:?}",
        got.kind()
    ))
}

/// Outcome of one procedure call, correlated by `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcedureCallResult {
    pub id: u64,
    pub procedure_call_kind: ProcedureCallKind,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inner: Option<ProcedureCallResultInner>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Error>,
}

impl ProcedureCallResult {
    pub fn ok(id: u64, kind: ProcedureCallKind, inner: ProcedureCallResultInner) -> Self {
        Self {
            id,
            procedure_call_kind: kind,
            success: true,
            inner: Some(inner),
            error: None,
        }
    }

    pub fn err(id: u64, kind: ProcedureCallKind, error: Error) -> Self {
        Self {
            id,
            procedure_call_kind: kind,
            success: false,
            inner: None,
            error: Some(error),
        }
    }

    pub fn from_result(
        id: u64,
        kind: ProcedureCallKind,
        result: Result<ProcedureCallResultInner>,
    ) -> Self {
        match result {
            Ok(inner) => Self::ok(id, kind, inner),
            Err(e) => Self::err(id, kind, e),
        }
    }

    /// Collapse into a `Result`, checking that a successful payload is one
    /// the call kind accepts.
    pub fn into_result(self) -> Result<ProcedureCallResultInner> {
        if !self.success {
            return Err(self
                .error
                .unwrap_or_else(|| Error::handler_fault("failed result carried no error")));
        }
        let inner = self.inner.unwrap_or(ProcedureCallResultInner::Void);
        if !self.procedure_call_kind.accepts(&inner) {
            return Err(Error::handler_fault(format!(
                "{} cannot answer with {:?}",
                self.procedure_call_kind,
                inner.kind()
            )));
        }
        Ok(inner)
    }
}
