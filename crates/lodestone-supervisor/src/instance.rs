//! One supervised instance and the worker task that serializes its
//! state-mutating calls.

use std::path::PathBuf;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use lodestone_core::{
    CausedBy, ConfigurableValue, Error, ErrorKind, GameType, InstanceUuid, Result, State,
};
use lodestone_events::{EventBroadcaster, InstanceEventInner, ProgressReporter};
use lodestone_protocol::{ProcedureCallInner, ProcedureCallResultInner};
use tokio::sync::futures::Notified;
use tokio::sync::{Mutex, Notify, mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::context::ExitReport;
use crate::guard::{self, Outcome};
use crate::handler::InstanceHandler;
use crate::macros::{MacroStore, TaskTable};
use crate::state::{StateCell, Transition};

#[derive(Debug, Clone, Copy)]
pub(crate) struct Timeouts {
    pub call: Duration,
    pub lifecycle: Duration,
    pub kill: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Lifecycle {
    Start,
    Stop,
    Restart,
}

impl Lifecycle {
    fn label(&self) -> &'static str {
        match self {
            Lifecycle::Start => "start",
            Lifecycle::Stop => "stop",
            Lifecycle::Restart => "restart",
        }
    }
}

pub(crate) enum Op {
    Lifecycle(Lifecycle),
    /// A setter or configuration update, answered by the handler.
    Call(ProcedureCallInner),
}

pub(crate) type Reply = oneshot::Sender<Result<ProcedureCallResultInner>>;

pub(crate) struct Command {
    pub op: Op,
    pub caused_by: CausedBy,
    /// `None` for fire-and-forget lifecycle calls.
    pub reply: Option<Reply>,
}

pub(crate) struct Instance {
    pub uuid: InstanceUuid,
    pub path: PathBuf,
    pub game_type: GameType,
    name: RwLock<String>,
    state: StateCell,
    /// Set while an `Error` instance may still have a live server behind it.
    stale: AtomicBool,
    /// Wakes the operation the worker is running when a kill starts.
    cancel: Notify,
    kill_lock: Mutex<()>,
    handler: Arc<dyn InstanceHandler>,
    events: Arc<EventBroadcaster>,
    timeouts: Timeouts,
    pub macros: MacroStore,
    pub tasks: TaskTable,
}

impl Instance {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        uuid: InstanceUuid,
        path: PathBuf,
        game_type: GameType,
        name: String,
        initial: State,
        handler: Arc<dyn InstanceHandler>,
        events: Arc<EventBroadcaster>,
        timeouts: Timeouts,
        history_limit: usize,
    ) -> Self {
        Self {
            uuid,
            macros: MacroStore::new(&path),
            path,
            game_type,
            name: RwLock::new(name),
            state: StateCell::new(initial),
            stale: AtomicBool::new(false),
            cancel: Notify::new(),
            kill_lock: Mutex::new(()),
            handler,
            events,
            timeouts,
            tasks: TaskTable::new(history_limit),
        }
    }

    pub fn name(&self) -> String {
        self.name
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_cached_name(&self, name: String) {
        *self.name.write().unwrap_or_else(PoisonError::into_inner) = name;
    }

    pub fn state(&self) -> State {
        self.state.get()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<State> {
        self.state.subscribe()
    }

    pub fn handler(&self) -> Arc<dyn InstanceHandler> {
        Arc::clone(&self.handler)
    }

    // ── State bookkeeping ────────────────────────────────────────

    fn announce(&self, transition: Option<Transition>, caused_by: &CausedBy) {
        let Some(Transition { from, to }) = transition else {
            return;
        };
        debug!(instance = %self.uuid, %from, %to, "state transition");
        self.events.instance_event(
            self.uuid,
            self.name(),
            InstanceEventInner::StateTransition { from, to },
            caused_by.clone(),
        );
    }

    fn begin(&self, to: State, caused_by: &CausedBy) -> u64 {
        let (epoch, transition) = self.state.begin(to);
        self.announce(transition, caused_by);
        epoch
    }

    fn commit(&self, epoch: u64, to: State, caused_by: &CausedBy) -> bool {
        match self.state.commit(epoch, to) {
            Some(transition) => {
                self.announce(transition, caused_by);
                true
            }
            None => false,
        }
    }

    fn force(&self, to: State, caused_by: &CausedBy) {
        let transition = self.state.force(to);
        self.announce(transition, caused_by);
    }

    /// A handler fault moves a live instance to `Error`.
    fn fault(&self, error: &Error) {
        if error.is(ErrorKind::HandlerFault) && !self.state().is_terminal() {
            warn!(instance = %self.uuid, error = %error, "handler fault, marking instance errored");
            self.stale.store(true, Ordering::SeqCst);
            self.force(State::Error, &CausedBy::System);
        }
    }

    /// Ask the handler to kill whatever it is running.
    async fn reap(&self, caused_by: &CausedBy) -> Result<()> {
        let handler = self.handler();
        let cb = caused_by.clone();
        let result =
            guard::guarded("kill", self.timeouts.kill, async move { handler.kill(cb).await }).await;
        self.stale.store(result.is_err(), Ordering::SeqCst);
        result
    }

    fn system_message(&self, message: impl Into<String>) {
        self.events.instance_event(
            self.uuid,
            self.name(),
            InstanceEventInner::SystemMessage {
                message: message.into(),
            },
            CausedBy::System,
        );
    }

    // ── Direct calls ─────────────────────────────────────────────

    /// Invoke the handler for a non-lifecycle call under the call timeout.
    pub async fn call(&self, inner: ProcedureCallInner) -> Result<ProcedureCallResultInner> {
        let label = inner.kind().as_str();
        let result = guard::guarded(label, self.timeouts.call, call_handler(self.handler(), inner)).await;
        if let Err(e) = &result {
            self.fault(e);
        }
        result
    }

    // ── Kill ─────────────────────────────────────────────────────

    /// Bypasses the worker queue. A no-op once the instance is `Stopped`;
    /// an `Error` instance still has its handler killed.
    pub async fn kill(&self, caused_by: CausedBy) -> Result<State> {
        let _serial = self.kill_lock.lock().await;
        let current = self.state();
        if current == State::Stopped {
            debug!(instance = %self.uuid, "kill on a stopped instance is a no-op");
            return Ok(current);
        }
        let name = self.name();
        let progression =
            self.events
                .progression_start(format!("Killing {name}"), None, caused_by.clone());
        self.force(State::Stopping, &caused_by);
        self.cancel.notify_waiters();

        let to = match self.reap(&caused_by).await {
            Ok(()) => State::Stopped,
            Err(e) => {
                warn!(instance = %self.uuid, error = %e, "kill failed, marking instance errored");
                State::Error
            }
        };
        self.force(to, &caused_by);
        info!(instance = %self.uuid, state = %to, "instance killed");
        progression.end(to == State::Stopped, Some(format!("{name} is {to}")));
        Ok(to)
    }

    // ── Worker operations ────────────────────────────────────────

    async fn execute(&self, op: Op, caused_by: CausedBy) -> Result<ProcedureCallResultInner> {
        match op {
            Op::Lifecycle(lifecycle) => self
                .lifecycle(lifecycle, caused_by)
                .await
                .map(ProcedureCallResultInner::State),
            Op::Call(inner) => self.apply_call(inner).await,
        }
    }

    async fn lifecycle(&self, lifecycle: Lifecycle, caused_by: CausedBy) -> Result<State> {
        let name = self.name();
        let title = match lifecycle {
            Lifecycle::Start => format!("Starting {name}"),
            Lifecycle::Stop => format!("Stopping {name}"),
            Lifecycle::Restart => format!("Restarting {name}"),
        };
        let progression = self
            .events
            .progression_start(title, None, caused_by.clone());
        let progress = progression.reporter();

        let cancel = self.cancel.notified();
        tokio::pin!(cancel);
        let result = match lifecycle {
            Lifecycle::Start => self.start(&caused_by, progress, cancel.as_mut()).await,
            Lifecycle::Stop => self.stop(&caused_by, progress, cancel.as_mut()).await,
            Lifecycle::Restart => self.restart(&caused_by, progress, cancel.as_mut()).await,
        };

        match &result {
            Ok(state) => {
                info!(instance = %self.uuid, op = lifecycle.label(), %state, "lifecycle operation finished");
                progression.end(true, Some(format!("{name} is {state}")));
            }
            Err(e) => {
                warn!(instance = %self.uuid, op = lifecycle.label(), error = %e, "lifecycle operation failed");
                progression.end(false, Some(e.message.clone()));
            }
        }
        result
    }

    async fn start(
        &self,
        caused_by: &CausedBy,
        progress: ProgressReporter,
        cancel: Pin<&mut Notified<'_>>,
    ) -> Result<State> {
        let from = self.state();
        if !from.is_terminal() {
            return Err(Error::conflict(format!(
                "cannot start {}: instance is {from}",
                self.name()
            )));
        }
        if from == State::Error && self.stale.load(Ordering::SeqCst) {
            debug!(instance = %self.uuid, "killing the previous run before starting");
            match self.reap(caused_by).await {
                Ok(()) => {}
                Err(e) if e.is(ErrorKind::NotImplemented) => {
                    self.stale.store(false, Ordering::SeqCst);
                }
                Err(e) => {
                    return Err(Error::handler_fault(format!(
                        "cannot start {}: previous run could not be killed: {}",
                        self.name(),
                        e.message
                    )));
                }
            }
        }
        let epoch = self.begin(State::Starting, caused_by);
        let outcome = self
            .invoke(Lifecycle::Start, caused_by, progress, cancel)
            .await;
        self.settle(epoch, outcome, from, State::Running, caused_by)
    }

    async fn stop(
        &self,
        caused_by: &CausedBy,
        progress: ProgressReporter,
        cancel: Pin<&mut Notified<'_>>,
    ) -> Result<State> {
        let from = self.state();
        if from != State::Running {
            return Err(Error::conflict(format!(
                "cannot stop {}: instance is {from}",
                self.name()
            )));
        }
        let epoch = self.begin(State::Stopping, caused_by);
        let outcome = self
            .invoke(Lifecycle::Stop, caused_by, progress, cancel)
            .await;
        self.settle(epoch, outcome, from, State::Stopped, caused_by)
    }

    async fn restart(
        &self,
        caused_by: &CausedBy,
        progress: ProgressReporter,
        mut cancel: Pin<&mut Notified<'_>>,
    ) -> Result<State> {
        let from = self.state();
        if from != State::Running {
            return Err(Error::conflict(format!(
                "cannot restart {}: instance is {from}",
                self.name()
            )));
        }
        let epoch = self.begin(State::Stopping, caused_by);
        match self
            .invoke(Lifecycle::Restart, caused_by, progress.clone(), cancel.as_mut())
            .await
        {
            Outcome::Done(Err(e)) if e.is(ErrorKind::NotImplemented) => {
                debug!(instance = %self.uuid, "no native restart, stopping then starting");
                let outcome = self
                    .invoke(Lifecycle::Stop, caused_by, progress.clone(), cancel.as_mut())
                    .await;
                self.settle(epoch, outcome, from, State::Stopped, caused_by)?;
                let epoch = self.begin(State::Starting, caused_by);
                let outcome = self
                    .invoke(Lifecycle::Start, caused_by, progress, cancel)
                    .await;
                self.settle(epoch, outcome, State::Stopped, State::Running, caused_by)
            }
            outcome => self.settle(epoch, outcome, from, State::Running, caused_by),
        }
    }

    async fn invoke(
        &self,
        lifecycle: Lifecycle,
        caused_by: &CausedBy,
        progress: ProgressReporter,
        cancel: Pin<&mut Notified<'_>>,
    ) -> Outcome<()> {
        let handler = self.handler();
        let caused_by = caused_by.clone();
        let timeout = self.timeouts.lifecycle;
        match lifecycle {
            Lifecycle::Start => {
                guard::cancellable(
                    "start",
                    timeout,
                    async move { handler.start(caused_by, progress).await },
                    cancel,
                )
                .await
            }
            Lifecycle::Stop => {
                guard::cancellable(
                    "stop",
                    timeout,
                    async move { handler.stop(caused_by, progress).await },
                    cancel,
                )
                .await
            }
            Lifecycle::Restart => {
                guard::cancellable(
                    "restart",
                    timeout,
                    async move { handler.restart(caused_by, progress).await },
                    cancel,
                )
                .await
            }
        }
    }

    /// Commit the end state of a lifecycle step.
    ///
    /// A handler fault ends in `Error`; any other failure restores `from`.
    fn settle(
        &self,
        epoch: u64,
        outcome: Outcome<()>,
        from: State,
        to: State,
        caused_by: &CausedBy,
    ) -> Result<State> {
        match outcome {
            Outcome::Cancelled => Err(interrupted()),
            Outcome::Done(Ok(())) => {
                if self.commit(epoch, to, caused_by) {
                    Ok(to)
                } else {
                    Err(interrupted())
                }
            }
            Outcome::Done(Err(e)) => {
                let fallback = if e.is(ErrorKind::HandlerFault) {
                    self.stale.store(true, Ordering::SeqCst);
                    State::Error
                } else {
                    from
                };
                self.commit(epoch, fallback, caused_by);
                Err(e)
            }
        }
    }

    async fn apply_call(&self, inner: ProcedureCallInner) -> Result<ProcedureCallResultInner> {
        match &inner {
            ProcedureCallInner::UpdateConfigurable {
                section_id,
                setting_id,
                new_value,
                ..
            } => {
                let (section_id, setting_id, new_value) =
                    (section_id.clone(), setting_id.clone(), new_value.clone());
                self.update_configurable(inner, section_id, setting_id, new_value)
                    .await
            }
            ProcedureCallInner::SetName { new_name, .. } => {
                let new_name = new_name.clone();
                let result = self.call(inner).await?;
                info!(instance = %self.uuid, name = %new_name, "instance renamed");
                self.set_cached_name(new_name);
                Ok(result)
            }
            _ => self.call(inner).await,
        }
    }

    async fn update_configurable(
        &self,
        inner: ProcedureCallInner,
        section_id: String,
        setting_id: String,
        new_value: ConfigurableValue,
    ) -> Result<ProcedureCallResultInner> {
        let handler = self.handler();
        let manifest = guard::guarded("configurable_manifest", self.timeouts.call, async move {
            handler.configurable_manifest().await
        })
        .await
        .inspect_err(|e| self.fault(e))?;
        manifest.validate_update(&section_id, &setting_id, &new_value)?;
        let is_secret = manifest.setting(&section_id, &setting_id)?.is_secret;

        let result = self.call(inner).await?;
        info!(instance = %self.uuid, %section_id, %setting_id, "setting updated");
        self.events.instance_event(
            self.uuid,
            self.name(),
            InstanceEventInner::SettingChanged {
                section_id,
                setting_id,
                value: (!is_secret).then_some(new_value),
            },
            CausedBy::System,
        );
        Ok(result)
    }

    async fn handle_exit(&self, report: ExitReport) {
        self.stale.store(false, Ordering::SeqCst);
        let current = self.state();
        if current.is_terminal() {
            debug!(instance = %self.uuid, state = %current, "exit report for a terminal instance ignored");
            return;
        }
        if !report.crashed {
            info!(instance = %self.uuid, "instance exited");
            self.force(State::Stopped, &CausedBy::System);
            self.system_message("Instance exited");
            return;
        }

        warn!(instance = %self.uuid, "instance crashed");
        self.force(State::Error, &CausedBy::System);
        self.system_message("Instance crashed");

        let handler = self.handler();
        let restart = guard::guarded("restart_on_crash", self.timeouts.call, async move {
            handler.restart_on_crash().await
        })
        .await
        .unwrap_or(false);
        if restart {
            info!(instance = %self.uuid, "restarting crashed instance");
            // Failures are already logged and published by `lifecycle`.
            let _ = self.lifecycle(Lifecycle::Start, CausedBy::System).await;
        }
    }
}

fn interrupted() -> Error {
    Error::conflict("operation was interrupted by a kill")
}

/// Map a non-lifecycle call onto the matching handler method.
async fn call_handler(
    handler: Arc<dyn InstanceHandler>,
    inner: ProcedureCallInner,
) -> Result<ProcedureCallResultInner> {
    use ProcedureCallInner as Call;
    use ProcedureCallResultInner as Reply;

    let reply = match inner {
        Call::GetName { .. } => Reply::String(handler.name().await?),
        Call::GetDescription { .. } => Reply::String(handler.description().await?),
        Call::GetVersion { .. } => Reply::String(handler.version().await?),
        Call::GetGame { .. } => Reply::Game(handler.game().await?),
        Call::GetPort { .. } => Reply::Num(handler.port().await?),
        Call::GetAutoStart { .. } => Reply::Bool(handler.auto_start().await?),
        Call::GetRestartOnCrash { .. } => Reply::Bool(handler.restart_on_crash().await?),
        Call::SetName { new_name, .. } => {
            handler.set_name(new_name).await?;
            Reply::Void
        }
        Call::SetDescription {
            new_description, ..
        } => {
            handler.set_description(new_description).await?;
            Reply::Void
        }
        Call::SetPort { new_port, .. } => {
            handler.set_port(new_port).await?;
            Reply::Void
        }
        Call::SetAutoStart { new_value, .. } => {
            handler.set_auto_start(new_value).await?;
            Reply::Void
        }
        Call::SetRestartOnCrash { new_value, .. } => {
            handler.set_restart_on_crash(new_value).await?;
            Reply::Void
        }
        Call::GetConfigurableManifest { .. } => {
            Reply::ConfigurableManifest(handler.configurable_manifest().await?.redacted())
        }
        Call::UpdateConfigurable {
            section_id,
            setting_id,
            new_value,
            ..
        } => {
            handler
                .update_configurable(section_id, setting_id, new_value)
                .await?;
            Reply::Void
        }
        Call::SendCommand {
            command, caused_by, ..
        } => {
            handler.send_command(command, caused_by).await?;
            Reply::Void
        }
        Call::Monitor { .. } => Reply::Monitor(handler.monitor().await?),
        Call::GetPlayerCount { .. } => Reply::Num(handler.player_count().await?),
        Call::GetMaxPlayerCount { .. } => Reply::Num(handler.max_player_count().await?),
        Call::SetMaxPlayerCount { new_value, .. } => {
            handler.set_max_player_count(new_value).await?;
            Reply::Void
        }
        Call::GetPlayerList { .. } => Reply::Player(handler.player_list().await?),
        other => {
            return Err(Error::invalid_input(format!(
                "{} is not answered by the instance handler",
                other.kind()
            )));
        }
    };
    Ok(reply)
}

/// The per-instance worker: one command at a time, exit reports first.
pub(crate) async fn run_worker(
    instance: Arc<Instance>,
    mut commands: mpsc::Receiver<Command>,
    mut exits: mpsc::UnboundedReceiver<ExitReport>,
) {
    debug!(instance = %instance.uuid, game_type = %instance.game_type, "instance worker started");
    loop {
        tokio::select! {
            biased;
            Some(report) = exits.recv() => instance.handle_exit(report).await,
            command = commands.recv() => match command {
                Some(Command { op, caused_by, reply }) => {
                    let result = instance.execute(op, caused_by).await;
                    match reply {
                        Some(reply) => {
                            let _ = reply.send(result);
                        }
                        None => {
                            if let Err(e) = result {
                                debug!(instance = %instance.uuid, error = %e, "fire-and-forget call failed");
                            }
                        }
                    }
                }
                None => break,
            },
        }
    }
    debug!(instance = %instance.uuid, "instance worker stopped");
}
