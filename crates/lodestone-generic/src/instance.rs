//! Instance handler that forwards every capability to a worker.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use lodestone_core::{
    CausedBy, ConfigurableManifest, ConfigurableValue, Error, Game, GameType, InstanceUuid,
    PerformanceReport, Player, Result, SetupManifest, SetupValue, State,
};
use lodestone_events::ProgressReporter;
use lodestone_protocol::{ProcedureCall, ProcedureCallInner, ProcedureCallResultInner, ResultKind};
use lodestone_supervisor::{HandlerFactory, InstanceContext, InstanceHandler};
use tracing::{debug, info};

use crate::bridge::{NoticeSink, ProcedureBridge, WorkerNotice};

/// Sends calls with fresh ids and validates the answers.
///
/// Clones share one id counter, so every call on a bridge gets a unique id.
#[derive(Clone)]
struct Caller {
    bridge: Arc<dyn ProcedureBridge>,
    next_id: Arc<AtomicU64>,
}

impl Caller {
    fn new(bridge: Arc<dyn ProcedureBridge>) -> Self {
        Self {
            bridge,
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    async fn request(&self, inner: ProcedureCallInner) -> Result<ProcedureCallResultInner> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let kind = inner.kind();
        debug!(call_id = id, %kind, "forwarding call to worker");
        let result = self.bridge.call(ProcedureCall::new(id, inner)).await?;
        if result.id != id {
            return Err(Error::handler_fault(format!(
                "worker answered call {id} with id {}",
                result.id
            )));
        }
        result.into_result()
    }

    async fn void(&self, inner: ProcedureCallInner) -> Result<()> {
        self.request(inner).await.map(|_| ())
    }
}

fn unexpected(expected: ResultKind, got: &ProcedureCallResultInner) -> Error {
    Error::handler_fault(format!(
        "worker answered with {:?}, expected {expected:?}",
        got.kind()
    ))
}

// ── Notice routing ───────────────────────────────────────────────

struct Route {
    ctx: InstanceContext,
    /// Reporter of the lifecycle call in flight, if any.
    progress: Option<ProgressReporter>,
}

/// Hands worker notices to the context of the instance they name.
#[derive(Default)]
struct Routes {
    table: Mutex<HashMap<InstanceUuid, Route>>,
}

impl Routes {
    fn attach(&self, ctx: InstanceContext) {
        self.lock().insert(
            ctx.uuid,
            Route {
                ctx,
                progress: None,
            },
        );
    }

    fn detach(&self, uuid: InstanceUuid) {
        self.lock().remove(&uuid);
    }

    fn set_progress(&self, uuid: InstanceUuid, progress: Option<ProgressReporter>) {
        if let Some(route) = self.lock().get_mut(&uuid) {
            route.progress = progress;
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<InstanceUuid, Route>> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl NoticeSink for Routes {
    fn notice(&self, notice: WorkerNotice) {
        let uuid = notice.instance_uuid();
        let Some((ctx, progress)) = self
            .lock()
            .get(&uuid)
            .map(|route| (route.ctx.clone(), route.progress.clone()))
        else {
            debug!(instance = %uuid, "notice for an instance this factory does not serve");
            return;
        };
        match notice {
            WorkerNotice::Output {
                instance_name,
                message,
                ..
            } => ctx.output(&instance_name, message),
            WorkerNotice::SystemMessage {
                instance_name,
                message,
                ..
            } => ctx.system_message(&instance_name, message),
            WorkerNotice::PlayerChange {
                instance_name,
                player_list,
                players_joined,
                players_left,
                ..
            } => ctx.players_changed(&instance_name, player_list, players_joined, players_left),
            WorkerNotice::Progress {
                progress: amount,
                message,
                ..
            } => match progress {
                Some(progress) => progress.update(amount, message),
                None => debug!(instance = %uuid, "progress outside a lifecycle call, dropped"),
            },
            WorkerNotice::Exited { crashed, .. } => ctx.report_exit(crashed),
        }
    }
}

/// Clears the lifecycle reporter when the call ends or is aborted.
struct ProgressScope<'a> {
    routes: &'a Routes,
    uuid: InstanceUuid,
}

impl<'a> ProgressScope<'a> {
    fn enter(routes: &'a Routes, uuid: InstanceUuid, progress: ProgressReporter) -> Self {
        routes.set_progress(uuid, Some(progress));
        Self { routes, uuid }
    }
}

impl Drop for ProgressScope<'_> {
    fn drop(&mut self) {
        self.routes.set_progress(self.uuid, None);
    }
}

// ── Instance ─────────────────────────────────────────────────────

/// An instance whose game logic lives in an out-of-process worker.
///
/// Created by [`GenericFactory`], which shares its call ids and notice
/// routing with every instance it hands out.
pub struct GenericInstance {
    uuid: InstanceUuid,
    caller: Caller,
    routes: Arc<Routes>,
}

impl GenericInstance {
    async fn lifecycle(
        &self,
        inner: ProcedureCallInner,
        progress: Option<ProgressReporter>,
    ) -> Result<()> {
        let _scope = progress.map(|p| ProgressScope::enter(&self.routes, self.uuid, p));
        match self.caller.request(inner).await? {
            ProcedureCallResultInner::State(State::Error) => {
                Err(Error::handler_fault("worker reported the instance errored"))
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl InstanceHandler for GenericInstance {
    async fn start(&self, caused_by: CausedBy, progress: ProgressReporter) -> Result<()> {
        self.lifecycle(
            ProcedureCallInner::StartInstance {
                instance_uuid: self.uuid,
                caused_by,
                block: true,
            },
            Some(progress),
        )
        .await
    }

    async fn stop(&self, caused_by: CausedBy, progress: ProgressReporter) -> Result<()> {
        self.lifecycle(
            ProcedureCallInner::StopInstance {
                instance_uuid: self.uuid,
                caused_by,
                block: true,
            },
            Some(progress),
        )
        .await
    }

    async fn restart(&self, caused_by: CausedBy, progress: ProgressReporter) -> Result<()> {
        self.lifecycle(
            ProcedureCallInner::RestartInstance {
                instance_uuid: self.uuid,
                caused_by,
                block: true,
            },
            Some(progress),
        )
        .await
    }

    async fn kill(&self, caused_by: CausedBy) -> Result<()> {
        self.lifecycle(
            ProcedureCallInner::KillInstance {
                instance_uuid: self.uuid,
                caused_by,
            },
            None,
        )
        .await
    }

    async fn state(&self) -> Result<State> {
        self.caller
            .request(ProcedureCallInner::GetState {
                instance_uuid: self.uuid,
            })
            .await?
            .into_state()
    }

    async fn destruct(&self) -> Result<()> {
        self.routes.detach(self.uuid);
        self.caller
            .void(ProcedureCallInner::DestructInstance {
                instance_uuid: self.uuid,
                caused_by: CausedBy::System,
            })
            .await
    }

    async fn name(&self) -> Result<String> {
        self.caller
            .request(ProcedureCallInner::GetName {
                instance_uuid: self.uuid,
            })
            .await?
            .into_string()
    }

    async fn set_name(&self, name: String) -> Result<()> {
        self.caller
            .void(ProcedureCallInner::SetName {
                instance_uuid: self.uuid,
                new_name: name,
            })
            .await
    }

    async fn description(&self) -> Result<String> {
        self.caller
            .request(ProcedureCallInner::GetDescription {
                instance_uuid: self.uuid,
            })
            .await?
            .into_string()
    }

    async fn set_description(&self, description: String) -> Result<()> {
        self.caller
            .void(ProcedureCallInner::SetDescription {
                instance_uuid: self.uuid,
                new_description: description,
            })
            .await
    }

    async fn version(&self) -> Result<String> {
        self.caller
            .request(ProcedureCallInner::GetVersion {
                instance_uuid: self.uuid,
            })
            .await?
            .into_string()
    }

    async fn game(&self) -> Result<Game> {
        match self
            .caller
            .request(ProcedureCallInner::GetGame {
                instance_uuid: self.uuid,
            })
            .await?
        {
            ProcedureCallResultInner::Game(game) => Ok(game),
            other => Err(unexpected(ResultKind::Game, &other)),
        }
    }

    async fn port(&self) -> Result<u32> {
        self.caller
            .request(ProcedureCallInner::GetPort {
                instance_uuid: self.uuid,
            })
            .await?
            .into_num()
    }

    async fn set_port(&self, port: u32) -> Result<()> {
        self.caller
            .void(ProcedureCallInner::SetPort {
                instance_uuid: self.uuid,
                new_port: port,
            })
            .await
    }

    async fn auto_start(&self) -> Result<bool> {
        self.caller
            .request(ProcedureCallInner::GetAutoStart {
                instance_uuid: self.uuid,
            })
            .await?
            .into_bool()
    }

    async fn set_auto_start(&self, auto_start: bool) -> Result<()> {
        self.caller
            .void(ProcedureCallInner::SetAutoStart {
                instance_uuid: self.uuid,
                new_value: auto_start,
            })
            .await
    }

    async fn restart_on_crash(&self) -> Result<bool> {
        self.caller
            .request(ProcedureCallInner::GetRestartOnCrash {
                instance_uuid: self.uuid,
            })
            .await?
            .into_bool()
    }

    async fn set_restart_on_crash(&self, restart_on_crash: bool) -> Result<()> {
        self.caller
            .void(ProcedureCallInner::SetRestartOnCrash {
                instance_uuid: self.uuid,
                new_value: restart_on_crash,
            })
            .await
    }

    async fn send_command(&self, command: String, caused_by: CausedBy) -> Result<()> {
        self.caller
            .void(ProcedureCallInner::SendCommand {
                instance_uuid: self.uuid,
                command,
                caused_by,
            })
            .await
    }

    async fn monitor(&self) -> Result<PerformanceReport> {
        match self
            .caller
            .request(ProcedureCallInner::Monitor {
                instance_uuid: self.uuid,
            })
            .await?
        {
            ProcedureCallResultInner::Monitor(report) => Ok(report),
            other => Err(unexpected(ResultKind::Monitor, &other)),
        }
    }

    async fn player_count(&self) -> Result<u32> {
        self.caller
            .request(ProcedureCallInner::GetPlayerCount {
                instance_uuid: self.uuid,
            })
            .await?
            .into_num()
    }

    async fn max_player_count(&self) -> Result<u32> {
        self.caller
            .request(ProcedureCallInner::GetMaxPlayerCount {
                instance_uuid: self.uuid,
            })
            .await?
            .into_num()
    }

    async fn set_max_player_count(&self, max_player_count: u32) -> Result<()> {
        self.caller
            .void(ProcedureCallInner::SetMaxPlayerCount {
                instance_uuid: self.uuid,
                new_value: max_player_count,
            })
            .await
    }

    async fn player_list(&self) -> Result<Vec<Player>> {
        match self
            .caller
            .request(ProcedureCallInner::GetPlayerList {
                instance_uuid: self.uuid,
            })
            .await?
        {
            ProcedureCallResultInner::Player(players) => Ok(players),
            other => Err(unexpected(ResultKind::Player, &other)),
        }
    }

    async fn configurable_manifest(&self) -> Result<ConfigurableManifest> {
        match self
            .caller
            .request(ProcedureCallInner::GetConfigurableManifest {
                instance_uuid: self.uuid,
            })
            .await?
        {
            ProcedureCallResultInner::ConfigurableManifest(manifest) => Ok(manifest),
            other => Err(unexpected(ResultKind::ConfigurableManifest, &other)),
        }
    }

    async fn update_configurable(
        &self,
        section_id: String,
        setting_id: String,
        value: ConfigurableValue,
    ) -> Result<()> {
        self.caller
            .void(ProcedureCallInner::UpdateConfigurable {
                instance_uuid: self.uuid,
                section_id,
                setting_id,
                new_value: value,
            })
            .await
    }
}

/// Creates [`GenericInstance`]s for one game type served by one worker.
///
/// The factory routes the worker's notices (console output, players,
/// progress, exits) into each instance's [`InstanceContext`].
pub struct GenericFactory {
    game_type: GameType,
    caller: Caller,
    routes: Arc<Routes>,
}

impl GenericFactory {
    pub fn new(game_type: GameType, bridge: Arc<dyn ProcedureBridge>) -> Self {
        let routes = Arc::new(Routes::default());
        bridge.set_notice_sink(routes.clone());
        Self {
            game_type,
            caller: Caller::new(bridge),
            routes,
        }
    }

    fn instance(&self, ctx: InstanceContext) -> Arc<dyn InstanceHandler> {
        let uuid = ctx.uuid;
        self.routes.attach(ctx);
        Arc::new(GenericInstance {
            uuid,
            caller: self.caller.clone(),
            routes: Arc::clone(&self.routes),
        })
    }
}

#[async_trait]
impl HandlerFactory for GenericFactory {
    fn game_type(&self) -> GameType {
        self.game_type.clone()
    }

    async fn setup_manifest(&self) -> Result<SetupManifest> {
        match self
            .caller
            .request(ProcedureCallInner::GetSetupManifest {
                game_type: self.game_type.clone(),
            })
            .await?
        {
            ProcedureCallResultInner::SetupManifest(manifest) => Ok(manifest),
            other => Err(unexpected(ResultKind::SetupManifest, &other)),
        }
    }

    async fn setup(
        &self,
        ctx: InstanceContext,
        setup_value: SetupValue,
    ) -> Result<Arc<dyn InstanceHandler>> {
        self.caller
            .void(ProcedureCallInner::SetupInstance {
                dot_lodestone_config: ctx.dot_config.clone(),
                setup_value,
                path: ctx.path.clone(),
            })
            .await?;
        info!(instance = %ctx.uuid, protocol = %self.caller.bridge.protocol_version(), "worker instance set up");
        Ok(self.instance(ctx))
    }

    async fn restore(&self, ctx: InstanceContext) -> Result<Arc<dyn InstanceHandler>> {
        self.caller
            .void(ProcedureCallInner::RestoreInstance {
                dot_lodestone_config: ctx.dot_config.clone(),
                path: ctx.path.clone(),
            })
            .await?;
        info!(instance = %ctx.uuid, "worker instance restored");
        Ok(self.instance(ctx))
    }
}
