//! Supervisor: owns every instance and converts procedure calls into
//! handler invocations.
//!
//! The supervisor is the only place where a failure becomes a
//! [`ProcedureCallResult`]. It:
//! - Resolves the target instance and rejects calls for unknown ones
//! - Serializes state-mutating calls per instance through a worker task
//! - Interprets the `block` flag of lifecycle calls
//! - Runs macros as tracked tasks
//! - Validates that every answer has a shape the call kind accepts

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use lodestone_core::{
    CausedBy, DOT_LODESTONE_CONFIG, DotLodestoneConfig, Error, ExitStatus, HostConfig,
    InstanceUuid, MacroPid, Result, SetupValue, State, TaskEntry, epoch_secs,
};
use lodestone_events::{EventBroadcaster, ProgressReporter};
use lodestone_protocol::{
    ProcedureCall, ProcedureCallInner, ProcedureCallResult, ProcedureCallResultInner,
};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{RwLock, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

use crate::context::{ExitReport, InstanceContext};
use crate::guard::guarded;
use crate::handler::{HandlerRegistry, InstanceHandler};
use crate::instance::{Command, Instance, Lifecycle, Op, Timeouts, run_worker};
use crate::macros::{self, Step};
use crate::ports::PortTable;

/// Timeouts and limits applied at the dispatch boundary.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub call_timeout: Duration,
    pub lifecycle_timeout: Duration,
    pub kill_timeout: Duration,
    pub queue_depth: usize,
    pub history_limit: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(30),
            lifecycle_timeout: Duration::from_secs(300),
            kill_timeout: Duration::from_secs(10),
            queue_depth: 32,
            history_limit: 100,
        }
    }
}

impl DispatchConfig {
    pub fn from_host_config(config: &HostConfig) -> Self {
        Self {
            call_timeout: config.dispatch.call_timeout(),
            lifecycle_timeout: config.dispatch.lifecycle_timeout(),
            kill_timeout: config.dispatch.kill_timeout(),
            queue_depth: config.dispatch.queue_depth.max(1),
            history_limit: config.macros.history_limit,
        }
    }

    pub fn with_call_timeout(self, call_timeout: Duration) -> Self {
        Self {
            call_timeout,
            ..self
        }
    }

    pub fn with_lifecycle_timeout(self, lifecycle_timeout: Duration) -> Self {
        Self {
            lifecycle_timeout,
            ..self
        }
    }

    pub fn with_kill_timeout(self, kill_timeout: Duration) -> Self {
        Self {
            kill_timeout,
            ..self
        }
    }

    pub fn with_queue_depth(self, queue_depth: usize) -> Self {
        Self {
            queue_depth: queue_depth.max(1),
            ..self
        }
    }

    fn timeouts(&self) -> Timeouts {
        Timeouts {
            call: self.call_timeout,
            lifecycle: self.lifecycle_timeout,
            kill: self.kill_timeout,
        }
    }
}

/// A registered instance and its worker.
struct InstanceSlot {
    instance: Arc<Instance>,
    commands: mpsc::Sender<Command>,
    worker: JoinHandle<()>,
}

struct Inner {
    registry: HandlerRegistry,
    events: Arc<EventBroadcaster>,
    config: DispatchConfig,
    /// Registered instances: uuid → slot.
    slots: RwLock<HashMap<InstanceUuid, Arc<InstanceSlot>>>,
    /// Uuids with a setup or restore in flight.
    reserved: Mutex<HashSet<InstanceUuid>>,
    ports: PortTable,
    next_pid: AtomicU32,
}

/// Owns every instance on this host. Cheap to clone.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl Supervisor {
    pub fn new(
        registry: HandlerRegistry,
        events: Arc<EventBroadcaster>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry,
                events,
                config,
                slots: RwLock::new(HashMap::new()),
                reserved: Mutex::new(HashSet::new()),
                ports: PortTable::default(),
                next_pid: AtomicU32::new(1),
            }),
        }
    }

    pub fn events(&self) -> Arc<EventBroadcaster> {
        Arc::clone(&self.inner.events)
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.inner.registry
    }

    pub async fn instances(&self) -> Vec<InstanceUuid> {
        let slots = self.inner.slots.read().await;
        let mut uuids: Vec<_> = slots.keys().copied().collect();
        uuids.sort();
        uuids
    }

    pub async fn state(&self, uuid: InstanceUuid) -> Result<State> {
        Ok(self.slot(uuid).await?.instance.state())
    }

    /// Follow state changes of one instance.
    pub async fn watch_state(&self, uuid: InstanceUuid) -> Result<watch::Receiver<State>> {
        Ok(self.slot(uuid).await?.instance.subscribe_state())
    }

    async fn slot(&self, uuid: InstanceUuid) -> Result<Arc<InstanceSlot>> {
        let slots = self.inner.slots.read().await;
        slots
            .get(&uuid)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("instance {uuid} not found")))
    }

    // ── Dispatch ─────────────────────────────────────────────────

    /// Execute one procedure call. Never fails: every error is carried in
    /// the returned result.
    pub async fn dispatch(&self, call: ProcedureCall) -> ProcedureCallResult {
        let ProcedureCall { id, inner } = call;
        let kind = inner.kind();
        let target = inner.instance_uuid();
        debug!(call_id = id, %kind, instance = ?target, "dispatching procedure call");

        let result = match inner.validate() {
            Ok(()) => self.route(inner).await,
            Err(e) => Err(e),
        };
        let result = result.and_then(|reply| {
            if kind.accepts(&reply) {
                Ok(reply)
            } else {
                Err(Error::handler_fault(format!(
                    "{kind} cannot answer with {:?}",
                    reply.kind()
                )))
            }
        });

        match &result {
            Ok(_) => debug!(call_id = id, %kind, "procedure call succeeded"),
            Err(e) => debug!(call_id = id, %kind, error = %e, "procedure call failed"),
        }
        ProcedureCallResult::from_result(id, kind, result)
    }

    async fn route(&self, inner: ProcedureCallInner) -> Result<ProcedureCallResultInner> {
        use ProcedureCallInner as Call;
        use ProcedureCallResultInner as Reply;

        match inner {
            Call::SetupInstance {
                dot_lodestone_config,
                setup_value,
                path,
            } => {
                self.setup(dot_lodestone_config, setup_value, path).await?;
                Ok(Reply::Void)
            }
            Call::RestoreInstance {
                dot_lodestone_config,
                path,
            } => {
                self.restore(dot_lodestone_config, path).await?;
                Ok(Reply::Void)
            }
            Call::DestructInstance {
                instance_uuid,
                caused_by,
            } => {
                self.destruct(instance_uuid, caused_by).await?;
                Ok(Reply::Void)
            }
            Call::GetSetupManifest { game_type } => {
                let factory = self.inner.registry.get(&game_type)?;
                let manifest = guarded(
                    "setup_manifest",
                    self.inner.config.call_timeout,
                    async move { factory.setup_manifest().await },
                )
                .await?;
                Ok(Reply::SetupManifest(manifest))
            }

            Call::GetState { instance_uuid } => Ok(Reply::State(
                self.slot(instance_uuid).await?.instance.state(),
            )),
            Call::KillInstance {
                instance_uuid,
                caused_by,
            } => {
                let slot = self.slot(instance_uuid).await?;
                Ok(Reply::State(slot.instance.kill(caused_by).await?))
            }
            Call::StartInstance {
                instance_uuid,
                caused_by,
                block,
            } => {
                self.lifecycle(instance_uuid, Lifecycle::Start, caused_by, block)
                    .await
            }
            Call::StopInstance {
                instance_uuid,
                caused_by,
                block,
            } => {
                self.lifecycle(instance_uuid, Lifecycle::Stop, caused_by, block)
                    .await
            }
            Call::RestartInstance {
                instance_uuid,
                caused_by,
                block,
            } => {
                self.lifecycle(instance_uuid, Lifecycle::Restart, caused_by, block)
                    .await
            }

            Call::CreateMacro {
                instance_uuid,
                name,
                content,
            } => {
                let slot = self.slot(instance_uuid).await?;
                slot.instance.macros.create(&name, &content).await?;
                info!(instance = %instance_uuid, macro_name = %name, "macro created");
                Ok(Reply::Void)
            }
            Call::DeleteMacro {
                instance_uuid,
                name,
            } => {
                let slot = self.slot(instance_uuid).await?;
                slot.instance.macros.delete(&name).await?;
                info!(instance = %instance_uuid, macro_name = %name, "macro deleted");
                Ok(Reply::Void)
            }
            Call::RunMacro {
                instance_uuid,
                name,
                args,
                caused_by,
            } => {
                let slot = self.slot(instance_uuid).await?;
                let pid = self
                    .run_macro(Arc::clone(&slot.instance), name, args, caused_by)
                    .await?;
                Ok(Reply::Num(pid.0))
            }
            Call::KillMacro { instance_uuid, pid } => {
                let slot = self.slot(instance_uuid).await?;
                slot.instance.tasks.kill(pid)?;
                info!(instance = %instance_uuid, %pid, "macro killed");
                Ok(Reply::Void)
            }
            Call::GetMacroList { instance_uuid } => {
                let slot = self.slot(instance_uuid).await?;
                Ok(Reply::MacroList(slot.instance.macros.list().await?))
            }
            Call::GetTaskList { instance_uuid } => {
                let slot = self.slot(instance_uuid).await?;
                Ok(Reply::TaskList(slot.instance.tasks.tasks()))
            }
            Call::GetHistoryList { instance_uuid } => {
                let slot = self.slot(instance_uuid).await?;
                Ok(Reply::HistoryList(slot.instance.tasks.history()))
            }

            Call::SetPort {
                instance_uuid,
                new_port,
            } => self.set_port(instance_uuid, new_port).await,
            call @ (Call::SetName { .. }
            | Call::SetDescription { .. }
            | Call::SetAutoStart { .. }
            | Call::SetRestartOnCrash { .. }
            | Call::SetMaxPlayerCount { .. }
            | Call::UpdateConfigurable { .. }) => self.enqueue(call).await,

            // Getters, console commands, and monitoring go straight to the handler.
            call => {
                let uuid = target_of(&call)?;
                self.slot(uuid).await?.instance.call(call).await
            }
        }
    }

    async fn lifecycle(
        &self,
        uuid: InstanceUuid,
        lifecycle: Lifecycle,
        caused_by: CausedBy,
        block: bool,
    ) -> Result<ProcedureCallResultInner> {
        let slot = self.slot(uuid).await?;
        if block {
            let (reply, answer) = oneshot::channel();
            slot.commands
                .send(Command {
                    op: Op::Lifecycle(lifecycle),
                    caused_by,
                    reply: Some(reply),
                })
                .await
                .map_err(|_| gone(uuid))?;
            answer.await.map_err(|_| gone(uuid))?
        } else {
            slot.commands
                .try_send(Command {
                    op: Op::Lifecycle(lifecycle),
                    caused_by,
                    reply: None,
                })
                .map_err(|e| match e {
                    TrySendError::Full(_) => {
                        Error::conflict(format!("instance {uuid} has too many pending operations"))
                    }
                    TrySendError::Closed(_) => gone(uuid),
                })?;
            Ok(ProcedureCallResultInner::Void)
        }
    }

    /// Queue a setter behind any pending lifecycle work and wait for it.
    async fn enqueue(&self, call: ProcedureCallInner) -> Result<ProcedureCallResultInner> {
        let uuid = target_of(&call)?;
        let slot = self.slot(uuid).await?;
        let (reply, answer) = oneshot::channel();
        slot.commands
            .send(Command {
                op: Op::Call(call),
                caused_by: CausedBy::System,
                reply: Some(reply),
            })
            .await
            .map_err(|_| gone(uuid))?;
        answer.await.map_err(|_| gone(uuid))?
    }

    /// Move an instance to another port, refusing ports other instances hold.
    async fn set_port(&self, uuid: InstanceUuid, new_port: u32) -> Result<ProcedureCallResultInner> {
        self.slot(uuid).await?;
        let previous = self.inner.ports.owned_by(uuid);
        let claim = self.inner.ports.claim(new_port, uuid)?;
        let reply = self
            .enqueue(ProcedureCallInner::SetPort {
                instance_uuid: uuid,
                new_port,
            })
            .await?;
        claim.keep();
        for port in previous.into_iter().filter(|p| *p != new_port) {
            self.inner.ports.release(port, uuid);
        }
        info!(instance = %uuid, port = new_port, "instance port changed");
        Ok(reply)
    }

    // ── Setup / restore / destruct ───────────────────────────────

    async fn setup(
        &self,
        dot: DotLodestoneConfig,
        setup_value: SetupValue,
        path: PathBuf,
    ) -> Result<()> {
        let uuid = dot.uuid;
        let factory = self.inner.registry.get(&dot.game_type)?;
        let _reservation = self.reserve(uuid).await?;

        let manifest = {
            let factory = Arc::clone(&factory);
            guarded("setup_manifest", self.inner.config.call_timeout, async move {
                factory.setup_manifest().await
            })
            .await?
        };
        manifest.validate(&setup_value)?;
        let port = self.inner.ports.claim(setup_value.port, uuid)?;

        let name = setup_value.name.clone();
        let progression = self.inner.events.progression_start(
            format!("Setting up {name}"),
            None,
            CausedBy::System,
        );
        let created_dir = !tokio::fs::try_exists(&path).await?;

        let result: Result<Arc<dyn InstanceHandler>> = async {
            tokio::fs::create_dir_all(&path).await?;
            tokio::fs::write(path.join(DOT_LODESTONE_CONFIG), dot.to_json_pretty()?).await?;
            let (ctx, exits) = InstanceContext::new(dot.clone(), path.clone(), self.events());
            let handler = guarded("setup", self.inner.config.lifecycle_timeout, async move {
                factory.setup(ctx, setup_value).await
            })
            .await?;
            self.register(&dot, &path, name.clone(), State::Stopped, Arc::clone(&handler), exits)
                .await;
            Ok(handler)
        }
        .await;

        match result {
            Ok(_) => {
                port.keep();
                info!(instance = %uuid, game_type = %dot.game_type, %name, "instance set up");
                progression.end(true, Some(format!("{name} is ready")));
                Ok(())
            }
            Err(e) => {
                warn!(instance = %uuid, error = %e, "instance setup failed");
                discard_setup(&path, created_dir).await;
                progression.end(false, Some(e.message.clone()));
                Err(e)
            }
        }
    }

    async fn restore(&self, dot: DotLodestoneConfig, path: PathBuf) -> Result<()> {
        let uuid = dot.uuid;
        let factory = self.inner.registry.get(&dot.game_type)?;
        let _reservation = self.reserve(uuid).await?;
        let call_timeout = self.inner.config.call_timeout;

        let (ctx, exits) = InstanceContext::new(dot.clone(), path.clone(), self.events());
        let handler = guarded("restore", self.inner.config.lifecycle_timeout, async move {
            factory.restore(ctx).await
        })
        .await?;

        let name = {
            let handler = Arc::clone(&handler);
            guarded("name", call_timeout, async move { handler.name().await })
                .await
                .unwrap_or_else(|_| uuid.short())
        };
        let reported = {
            let handler = Arc::clone(&handler);
            guarded("state", call_timeout, async move { handler.state().await }).await
        };
        let port = {
            let handler = Arc::clone(&handler);
            guarded("port", call_timeout, async move { handler.port().await }).await
        };
        match port.map(|port| (port, self.inner.ports.claim(port, uuid))) {
            Ok((_, Ok(claim))) => claim.keep(),
            Ok((port, Err(e))) => {
                warn!(instance = %uuid, port, error = %e, "restored instance shares a port");
            }
            Err(e) => debug!(instance = %uuid, error = %e, "restored instance reported no port"),
        }
        let initial = match reported {
            Ok(state) if !state.is_transitional() => state,
            Ok(state) => {
                warn!(instance = %uuid, %state, "restored instance reported a transitional state");
                State::Stopped
            }
            Err(_) => State::Stopped,
        };

        self.register(&dot, &path, name.clone(), initial, handler, exits)
            .await;
        info!(instance = %uuid, game_type = %dot.game_type, %name, state = %initial, "instance restored");
        Ok(())
    }

    async fn register(
        &self,
        dot: &DotLodestoneConfig,
        path: &Path,
        name: String,
        initial: State,
        handler: Arc<dyn InstanceHandler>,
        exits: mpsc::UnboundedReceiver<ExitReport>,
    ) {
        let config = &self.inner.config;
        let instance = Arc::new(Instance::new(
            dot.uuid,
            path.to_path_buf(),
            dot.game_type.clone(),
            name,
            initial,
            handler,
            self.events(),
            config.timeouts(),
            config.history_limit,
        ));
        let (commands, queue) = mpsc::channel(config.queue_depth);
        let worker = tokio::spawn(run_worker(Arc::clone(&instance), queue, exits));

        let mut slots = self.inner.slots.write().await;
        slots.insert(
            dot.uuid,
            Arc::new(InstanceSlot {
                instance,
                commands,
                worker,
            }),
        );
    }

    async fn destruct(&self, uuid: InstanceUuid, caused_by: CausedBy) -> Result<()> {
        let slot = {
            let mut slots = self.inner.slots.write().await;
            let slot = slots
                .get(&uuid)
                .ok_or_else(|| Error::not_found(format!("instance {uuid} not found")))?;
            let state = slot.instance.state();
            if !state.is_terminal() {
                return Err(Error::conflict(format!(
                    "cannot delete {}: instance is {state}, stop or kill it first",
                    slot.instance.name()
                )));
            }
            slots
                .remove(&uuid)
                .ok_or_else(|| Error::not_found(format!("instance {uuid} not found")))?
        };

        let instance = &slot.instance;
        let name = instance.name();
        slot.worker.abort();
        self.inner.ports.release_all(uuid);
        let killed = instance.tasks.kill_all();
        if killed > 0 {
            debug!(instance = %uuid, killed, "macro tasks killed before delete");
        }

        let progression =
            self.inner
                .events
                .progression_start(format!("Deleting {name}"), None, caused_by);
        let handler = instance.handler();
        if let Err(e) = guarded("destruct", self.inner.config.lifecycle_timeout, async move {
            handler.destruct().await
        })
        .await
        {
            warn!(instance = %uuid, error = %e, "backend cleanup failed, removing files anyway");
        }

        match tokio::fs::remove_dir_all(&instance.path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                let e = Error::from(e);
                progression.end(false, Some(e.message.clone()));
                return Err(e);
            }
        }
        info!(instance = %uuid, %name, "instance deleted");
        progression.end(true, Some(format!("{name} deleted")));
        Ok(())
    }

    async fn reserve(&self, uuid: InstanceUuid) -> Result<Reservation<'_>> {
        if self.inner.slots.read().await.contains_key(&uuid) {
            return Err(Error::conflict(format!("instance {uuid} already exists")));
        }
        let mut reserved = self
            .inner
            .reserved
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if !reserved.insert(uuid) {
            return Err(Error::conflict(format!(
                "instance {uuid} is already being created"
            )));
        }
        Ok(Reservation {
            reserved: &self.inner.reserved,
            uuid,
        })
    }

    // ── Macros ───────────────────────────────────────────────────

    async fn run_macro(
        &self,
        instance: Arc<Instance>,
        name: String,
        args: Vec<String>,
        caused_by: CausedBy,
    ) -> Result<MacroPid> {
        let content = instance.macros.read(&name).await?;
        let steps = macros::parse_script(&content, &args)?;
        let pid = MacroPid(self.inner.next_pid.fetch_add(1, Ordering::Relaxed));

        let progression = self.inner.events.progression_start(
            format!("Running macro {name}"),
            Some(steps.len() as f64),
            caused_by.clone(),
        );
        let progress = progression.reporter();
        let entry = TaskEntry {
            pid,
            name: name.clone(),
            args,
            caused_by: caused_by.clone(),
            event_id: progression.event_id().to_string(),
            creation_time: epoch_secs(),
        };
        // The table ends the progression when the task leaves it.
        let killed = instance.tasks.insert(entry, progression);
        let events = self.events();
        events.macro_started(instance.uuid, pid, caused_by.clone());
        info!(instance = %instance.uuid, %pid, macro_name = %name, "macro started");

        tokio::spawn(async move {
            let status = tokio::select! {
                status = run_steps(&instance, pid, &steps, &progress) => status,
                Ok(()) = killed => ExitStatus::Killed { time: epoch_secs() },
            };
            let status = instance.tasks.finish(pid, status);
            debug!(instance = %instance.uuid, %pid, macro_name = %name, ?status, "macro stopped");
            events.macro_stopped(instance.uuid, pid, status, caused_by);
        });
        Ok(pid)
    }

    // ── Host start and stop ──────────────────────────────────────

    /// Restore every instance found under `instances_dir`.
    ///
    /// Instances that fail to restore are logged and skipped.
    pub async fn restore_instances(&self, instances_dir: &Path) -> Vec<InstanceUuid> {
        let dir = instances_dir.to_path_buf();
        let found = match tokio::task::spawn_blocking(move || scan_instances(&dir)).await {
            Ok(found) => found,
            Err(e) => {
                error!(error = %e, "instance scan failed");
                return Vec::new();
            }
        };

        let mut restored = Vec::new();
        for (path, dot) in found {
            let uuid = dot.uuid;
            match self.restore(dot, path.clone()).await {
                Ok(()) => restored.push(uuid),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping instance that failed to restore")
                }
            }
        }
        info!(count = restored.len(), dir = %instances_dir.display(), "instances restored");
        restored
    }

    /// [`Supervisor::restore_instances`], then queue a start for every
    /// instance with auto start enabled.
    pub async fn restore_all(&self, instances_dir: &Path) -> Vec<InstanceUuid> {
        let restored = self.restore_instances(instances_dir).await;
        for uuid in &restored {
            self.auto_start(*uuid).await;
        }
        restored
    }

    async fn auto_start(&self, uuid: InstanceUuid) {
        let Ok(slot) = self.slot(uuid).await else {
            return;
        };
        if !slot.instance.state().is_terminal() {
            return;
        }
        let handler = slot.instance.handler();
        let enabled = guarded("auto_start", self.inner.config.call_timeout, async move {
            handler.auto_start().await
        })
        .await
        .unwrap_or(false);
        if !enabled {
            return;
        }
        info!(instance = %uuid, "auto starting instance");
        if let Err(e) = self
            .lifecycle(uuid, Lifecycle::Start, CausedBy::System, false)
            .await
        {
            warn!(instance = %uuid, error = %e, "auto start could not be queued");
        }
    }

    /// Kill every live instance and stop all workers.
    pub async fn shutdown(&self) {
        let slots: Vec<_> = {
            let mut slots = self.inner.slots.write().await;
            slots.drain().map(|(_, slot)| slot).collect()
        };
        for slot in slots {
            slot.instance.tasks.kill_all();
            if let Err(e) = slot.instance.kill(CausedBy::System).await {
                warn!(instance = %slot.instance.uuid, error = %e, "kill during shutdown failed");
            }
            slot.worker.abort();
        }
        info!("supervisor shut down");
    }
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("registry", &self.inner.registry)
            .field("config", &self.inner.config)
            .finish()
    }
}

/// Releases a uuid reserved for setup or restore.
struct Reservation<'a> {
    reserved: &'a Mutex<HashSet<InstanceUuid>>,
    uuid: InstanceUuid,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        self.reserved
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.uuid);
    }
}

fn target_of(call: &ProcedureCallInner) -> Result<InstanceUuid> {
    call.instance_uuid()
        .ok_or_else(|| Error::invalid_input(format!("{} does not target an instance", call.kind())))
}

fn gone(uuid: InstanceUuid) -> Error {
    Error::not_found(format!("instance {uuid} was removed"))
}

async fn run_steps(
    instance: &Instance,
    pid: MacroPid,
    steps: &[Step],
    progress: &ProgressReporter,
) -> ExitStatus {
    for step in steps {
        let message = match step {
            Step::Wait(duration) => {
                tokio::time::sleep(*duration).await;
                format!("waited {duration:?}")
            }
            Step::Command(command) => {
                let call = ProcedureCallInner::SendCommand {
                    instance_uuid: instance.uuid,
                    command: command.clone(),
                    caused_by: CausedBy::Macro { macro_pid: pid },
                };
                if let Err(e) = instance.call(call).await {
                    return ExitStatus::Error {
                        time: epoch_secs(),
                        error_msg: e.to_string(),
                    };
                }
                command.clone()
            }
        };
        progress.update(1.0, message);
    }
    ExitStatus::Success { time: epoch_secs() }
}

/// Undo the filesystem side of a failed setup.
async fn discard_setup(path: &Path, created_dir: bool) {
    let result = if created_dir {
        tokio::fs::remove_dir_all(path).await
    } else {
        tokio::fs::remove_file(path.join(DOT_LODESTONE_CONFIG)).await
    };
    if let Err(e) = result {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "failed to clean up after setup");
        }
    }
}

/// Find `<dir>/<instance>/.lodestone_config` descriptors.
fn scan_instances(dir: &Path) -> Vec<(PathBuf, DotLodestoneConfig)> {
    WalkDir::new(dir)
        .min_depth(1)
        .max_depth(2)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!(error = %e, "cannot read instance directory entry");
                None
            }
        })
        .filter(|entry| entry.file_type().is_file() && entry.file_name() == DOT_LODESTONE_CONFIG)
        .filter_map(|entry| {
            let descriptor = entry.path();
            let instance_dir = descriptor.parent()?.to_path_buf();
            let parsed = std::fs::read_to_string(descriptor)
                .map_err(Error::from)
                .and_then(|content| DotLodestoneConfig::from_json(&content));
            match parsed {
                Ok(dot) => Some((instance_dir, dot)),
                Err(e) => {
                    warn!(path = %descriptor.display(), error = %e, "skipping unreadable descriptor");
                    None
                }
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use lodestone_core::{ErrorKind, GameType, SetupManifest};
    use lodestone_protocol::ProcedureCallKind;

    use crate::handler::HandlerFactory;

    /// Records commands and sleeps or fails on demand.
    #[derive(Default)]
    struct Mock {
        start_delay: Duration,
        fail_start: Option<ErrorKind>,
        panic_on_start: bool,
        /// When set, `version` hangs this long instead of being unsupported.
        version_delay: Option<Duration>,
        starts: AtomicUsize,
        kills: AtomicUsize,
        commands: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl InstanceHandler for Mock {
        async fn start(&self, _caused_by: CausedBy, progress: ProgressReporter) -> Result<()> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            progress.update(0.5, "booting");
            tokio::time::sleep(self.start_delay).await;
            if self.panic_on_start {
                panic!("backend exploded");
            }
            match self.fail_start {
                Some(kind) => Err(Error::new(kind, "port already in use")),
                None => Ok(()),
            }
        }

        async fn stop(&self, _caused_by: CausedBy, _progress: ProgressReporter) -> Result<()> {
            Ok(())
        }

        async fn kill(&self, _caused_by: CausedBy) -> Result<()> {
            self.kills.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn name(&self) -> Result<String> {
            Ok("mock".to_string())
        }

        async fn version(&self) -> Result<String> {
            match self.version_delay {
                Some(delay) => {
                    tokio::time::sleep(delay).await;
                    Ok("1.0".to_string())
                }
                None => Err(Error::not_implemented("version")),
            }
        }

        async fn set_port(&self, _port: u32) -> Result<()> {
            Ok(())
        }

        async fn send_command(&self, command: String, _caused_by: CausedBy) -> Result<()> {
            self.commands
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(command);
            Ok(())
        }
    }

    struct MockFactory(Arc<Mock>);

    #[async_trait]
    impl HandlerFactory for MockFactory {
        fn game_type(&self) -> GameType {
            GameType::new("mock")
        }

        async fn setup_manifest(&self) -> Result<SetupManifest> {
            Ok(SetupManifest::default())
        }

        async fn setup(
            &self,
            _ctx: InstanceContext,
            _setup_value: SetupValue,
        ) -> Result<Arc<dyn InstanceHandler>> {
            Ok(self.0.clone())
        }

        async fn restore(&self, _ctx: InstanceContext) -> Result<Arc<dyn InstanceHandler>> {
            Ok(self.0.clone())
        }
    }

    fn user() -> CausedBy {
        CausedBy::User {
            user_id: "u1".to_string(),
            user_name: "steve".to_string(),
        }
    }

    fn supervisor_with(mock: Mock) -> (Supervisor, Arc<Mock>) {
        let mock = Arc::new(mock);
        let registry = HandlerRegistry::new().with_factory(Arc::new(MockFactory(mock.clone())));
        let config = DispatchConfig::default()
            .with_call_timeout(Duration::from_secs(2))
            .with_lifecycle_timeout(Duration::from_secs(5));
        let supervisor = Supervisor::new(registry, Arc::new(EventBroadcaster::new(256)), config);
        (supervisor, mock)
    }

    async fn setup(supervisor: &Supervisor, dir: &Path) -> InstanceUuid {
        let uuid = InstanceUuid::new();
        let result = setup_on(supervisor, dir, uuid, 25565).await;
        assert!(result.success, "setup failed: {:?}", result.error);
        uuid
    }

    async fn setup_on(
        supervisor: &Supervisor,
        dir: &Path,
        uuid: InstanceUuid,
        port: u32,
    ) -> ProcedureCallResult {
        supervisor
            .dispatch(ProcedureCall::new(
                1,
                ProcedureCallInner::SetupInstance {
                    dot_lodestone_config: DotLodestoneConfig::new(uuid, GameType::new("mock")),
                    setup_value: SetupValue {
                        name: "survival".to_string(),
                        description: None,
                        port,
                        auto_start: false,
                        restart_on_crash: false,
                        setting_sections: Default::default(),
                    },
                    path: dir.join(uuid.to_string()),
                },
            ))
            .await
    }

    async fn call(supervisor: &Supervisor, inner: ProcedureCallInner) -> Result<ProcedureCallResultInner> {
        supervisor.dispatch(ProcedureCall::new(7, inner)).await.into_result()
    }

    fn start(uuid: InstanceUuid, block: bool) -> ProcedureCallInner {
        ProcedureCallInner::StartInstance {
            instance_uuid: uuid,
            caused_by: user(),
            block,
        }
    }

    async fn wait_for_state(supervisor: &Supervisor, uuid: InstanceUuid, want: State) {
        let mut rx = supervisor.watch_state(uuid).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| *s == want))
            .await
            .expect("state never reached")
            .unwrap();
    }

    #[tokio::test]
    async fn setup_writes_descriptor_and_registers_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let (supervisor, _) = supervisor_with(Mock::default());
        let uuid = setup(&supervisor, dir.path()).await;

        assert!(dir.path().join(uuid.to_string()).join(DOT_LODESTONE_CONFIG).exists());
        assert_eq!(supervisor.state(uuid).await.unwrap(), State::Stopped);
        assert_eq!(supervisor.instances().await, vec![uuid]);
    }

    #[tokio::test]
    async fn blocking_start_returns_final_state() {
        let dir = tempfile::tempdir().unwrap();
        let (supervisor, _) = supervisor_with(Mock::default());
        let uuid = setup(&supervisor, dir.path()).await;

        let reply = call(&supervisor, start(uuid, true)).await.unwrap();
        assert_eq!(reply, ProcedureCallResultInner::State(State::Running));

        let err = call(&supervisor, start(uuid, true)).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Conflict);
        assert_eq!(supervisor.state(uuid).await.unwrap(), State::Running);
    }

    #[tokio::test]
    async fn non_blocking_start_returns_void() {
        let dir = tempfile::tempdir().unwrap();
        let (supervisor, _) = supervisor_with(Mock {
            start_delay: Duration::from_millis(50),
            ..Mock::default()
        });
        let uuid = setup(&supervisor, dir.path()).await;

        let reply = call(&supervisor, start(uuid, false)).await.unwrap();
        assert_eq!(reply, ProcedureCallResultInner::Void);
        wait_for_state(&supervisor, uuid, State::Running).await;
    }

    #[tokio::test]
    async fn ordinary_start_failure_reverts_state() {
        let dir = tempfile::tempdir().unwrap();
        let (supervisor, _) = supervisor_with(Mock {
            fail_start: Some(ErrorKind::Conflict),
            ..Mock::default()
        });
        let uuid = setup(&supervisor, dir.path()).await;

        let err = call(&supervisor, start(uuid, true)).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Conflict);
        assert_eq!(supervisor.state(uuid).await.unwrap(), State::Stopped);
    }

    #[tokio::test]
    async fn panicking_start_is_a_fault() {
        let dir = tempfile::tempdir().unwrap();
        let (supervisor, _) = supervisor_with(Mock {
            panic_on_start: true,
            ..Mock::default()
        });
        let uuid = setup(&supervisor, dir.path()).await;

        let err = call(&supervisor, start(uuid, true)).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::HandlerFault);
        assert_eq!(supervisor.state(uuid).await.unwrap(), State::Error);
    }

    #[tokio::test]
    async fn kill_interrupts_start_and_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let (supervisor, _) = supervisor_with(Mock {
            start_delay: Duration::from_secs(30),
            ..Mock::default()
        });
        let uuid = setup(&supervisor, dir.path()).await;

        let pending = {
            let supervisor = supervisor.clone();
            tokio::spawn(async move { call(&supervisor, start(uuid, true)).await })
        };
        wait_for_state(&supervisor, uuid, State::Starting).await;

        let kill = ProcedureCallInner::KillInstance {
            instance_uuid: uuid,
            caused_by: user(),
        };
        let reply = call(&supervisor, kill.clone()).await.unwrap();
        assert_eq!(reply, ProcedureCallResultInner::State(State::Stopped));

        let err = pending.await.unwrap().unwrap_err();
        assert_eq!(err.kind, ErrorKind::Conflict);
        assert!(err.message.contains("interrupted"));
        assert_eq!(supervisor.state(uuid).await.unwrap(), State::Stopped);

        let again = call(&supervisor, kill).await.unwrap();
        assert_eq!(again, ProcedureCallResultInner::State(State::Stopped));
    }

    #[tokio::test]
    async fn kill_reaches_the_handler_after_a_getter_fault() {
        let dir = tempfile::tempdir().unwrap();
        let (supervisor, mock) = supervisor_with(Mock {
            version_delay: Some(Duration::from_secs(30)),
            ..Mock::default()
        });
        let uuid = setup(&supervisor, dir.path()).await;
        call(&supervisor, start(uuid, true)).await.unwrap();

        let err = call(&supervisor, ProcedureCallInner::GetVersion { instance_uuid: uuid })
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::HandlerFault);
        assert_eq!(supervisor.state(uuid).await.unwrap(), State::Error);

        let kill = ProcedureCallInner::KillInstance {
            instance_uuid: uuid,
            caused_by: user(),
        };
        let reply = call(&supervisor, kill.clone()).await.unwrap();
        assert_eq!(reply, ProcedureCallResultInner::State(State::Stopped));
        assert_eq!(mock.kills.load(Ordering::SeqCst), 1);

        let again = call(&supervisor, kill).await.unwrap();
        assert_eq!(again, ProcedureCallResultInner::State(State::Stopped));
        assert_eq!(mock.kills.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn start_after_a_getter_fault_kills_the_previous_run() {
        let dir = tempfile::tempdir().unwrap();
        let (supervisor, mock) = supervisor_with(Mock {
            version_delay: Some(Duration::from_secs(30)),
            ..Mock::default()
        });
        let uuid = setup(&supervisor, dir.path()).await;
        call(&supervisor, start(uuid, true)).await.unwrap();
        call(&supervisor, ProcedureCallInner::GetVersion { instance_uuid: uuid })
            .await
            .unwrap_err();
        assert_eq!(supervisor.state(uuid).await.unwrap(), State::Error);

        let reply = call(&supervisor, start(uuid, true)).await.unwrap();
        assert_eq!(reply, ProcedureCallResultInner::State(State::Running));
        assert_eq!(mock.starts.load(Ordering::SeqCst), 2);
        assert_eq!(mock.kills.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unimplemented_capability_leaves_state_alone() {
        let dir = tempfile::tempdir().unwrap();
        let (supervisor, _) = supervisor_with(Mock::default());
        let uuid = setup(&supervisor, dir.path()).await;

        let err = call(&supervisor, ProcedureCallInner::GetVersion { instance_uuid: uuid })
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotImplemented);
        assert_eq!(supervisor.state(uuid).await.unwrap(), State::Stopped);
    }

    #[tokio::test]
    async fn unknown_instance_and_unattributed_calls_are_rejected() {
        let (supervisor, _) = supervisor_with(Mock::default());
        let missing = InstanceUuid::new();

        let result = supervisor
            .dispatch(ProcedureCall::new(3, ProcedureCallInner::GetState { instance_uuid: missing }))
            .await;
        assert!(!result.success);
        assert_eq!(result.id, 3);
        assert_eq!(result.procedure_call_kind, ProcedureCallKind::GetState);
        assert_eq!(result.error.unwrap().kind, ErrorKind::NotFound);

        let err = call(
            &supervisor,
            ProcedureCallInner::StartInstance {
                instance_uuid: missing,
                caused_by: CausedBy::Unknown,
                block: true,
            },
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind, ErrorKind::PermissionDenied);
    }

    #[tokio::test]
    async fn macro_runs_commands_and_lands_in_history() {
        let dir = tempfile::tempdir().unwrap();
        let (supervisor, mock) = supervisor_with(Mock::default());
        let uuid = setup(&supervisor, dir.path()).await;

        call(
            &supervisor,
            ProcedureCallInner::CreateMacro {
                instance_uuid: uuid,
                name: "greet".to_string(),
                content: "say hello $1\n# comment\nsay bye".to_string(),
            },
        )
        .await
        .unwrap();

        let pid = call(
            &supervisor,
            ProcedureCallInner::RunMacro {
                instance_uuid: uuid,
                name: "greet".to_string(),
                args: vec!["alex".to_string()],
                caused_by: user(),
            },
        )
        .await
        .unwrap()
        .into_num()
        .unwrap();

        let history = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let reply = call(&supervisor, ProcedureCallInner::GetHistoryList { instance_uuid: uuid })
                    .await
                    .unwrap();
                if let ProcedureCallResultInner::HistoryList(history) = reply {
                    if !history.is_empty() {
                        return history;
                    }
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(history[0].task.pid, MacroPid(pid));
        assert!(history[0].success());
        let commands = mock.commands.lock().unwrap().clone();
        assert_eq!(commands, vec!["say hello alex", "say bye"]);
    }

    #[tokio::test]
    async fn killed_macro_is_recorded_as_killed() {
        let dir = tempfile::tempdir().unwrap();
        let (supervisor, _) = supervisor_with(Mock::default());
        let uuid = setup(&supervisor, dir.path()).await;

        call(
            &supervisor,
            ProcedureCallInner::CreateMacro {
                instance_uuid: uuid,
                name: "slow".to_string(),
                content: "wait 60s\nsay never".to_string(),
            },
        )
        .await
        .unwrap();
        let pid = call(
            &supervisor,
            ProcedureCallInner::RunMacro {
                instance_uuid: uuid,
                name: "slow".to_string(),
                args: vec![],
                caused_by: user(),
            },
        )
        .await
        .unwrap()
        .into_num()
        .unwrap();

        let tasks = call(&supervisor, ProcedureCallInner::GetTaskList { instance_uuid: uuid })
            .await
            .unwrap();
        assert!(matches!(tasks, ProcedureCallResultInner::TaskList(ref t) if t.len() == 1));

        call(
            &supervisor,
            ProcedureCallInner::KillMacro {
                instance_uuid: uuid,
                pid: MacroPid(pid),
            },
        )
        .await
        .unwrap();

        let reply = call(&supervisor, ProcedureCallInner::GetHistoryList { instance_uuid: uuid })
            .await
            .unwrap();
        let ProcedureCallResultInner::HistoryList(history) = reply else {
            panic!("unexpected reply {reply:?}");
        };
        assert_eq!(history.len(), 1);
        assert!(matches!(history[0].exit_status, ExitStatus::Killed { .. }));
    }

    #[tokio::test]
    async fn destruct_requires_a_stopped_instance() {
        let dir = tempfile::tempdir().unwrap();
        let (supervisor, _) = supervisor_with(Mock::default());
        let uuid = setup(&supervisor, dir.path()).await;
        call(&supervisor, start(uuid, true)).await.unwrap();

        let destruct = ProcedureCallInner::DestructInstance {
            instance_uuid: uuid,
            caused_by: user(),
        };
        let err = call(&supervisor, destruct.clone()).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Conflict);

        call(
            &supervisor,
            ProcedureCallInner::StopInstance {
                instance_uuid: uuid,
                caused_by: user(),
                block: true,
            },
        )
        .await
        .unwrap();
        call(&supervisor, destruct).await.unwrap();

        assert!(!dir.path().join(uuid.to_string()).exists());
        assert!(supervisor.instances().await.is_empty());
    }

    #[tokio::test]
    async fn ports_are_held_until_the_instance_is_destructed() {
        let dir = tempfile::tempdir().unwrap();
        let (supervisor, _) = supervisor_with(Mock::default());
        let first = setup(&supervisor, dir.path()).await;

        let clash = InstanceUuid::new();
        let err = setup_on(&supervisor, dir.path(), clash, 25565)
            .await
            .into_result()
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Conflict);
        assert!(!supervisor.instances().await.contains(&clash));

        let second = InstanceUuid::new();
        assert!(setup_on(&supervisor, dir.path(), second, 25566).await.success);
        let move_onto = |uuid, new_port| ProcedureCallInner::SetPort {
            instance_uuid: uuid,
            new_port,
        };
        let err = call(&supervisor, move_onto(second, 25565)).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Conflict);

        // Moving frees the old port for others.
        call(&supervisor, move_onto(second, 25567)).await.unwrap();
        let third = InstanceUuid::new();
        assert!(setup_on(&supervisor, dir.path(), third, 25566).await.success);

        call(
            &supervisor,
            ProcedureCallInner::DestructInstance {
                instance_uuid: first,
                caused_by: user(),
            },
        )
        .await
        .unwrap();
        assert!(setup_on(&supervisor, dir.path(), clash, 25565).await.success);
    }

    #[tokio::test]
    async fn restore_all_picks_up_descriptors() {
        let dir = tempfile::tempdir().unwrap();
        let uuid = {
            let (supervisor, _) = supervisor_with(Mock::default());
            setup(&supervisor, dir.path()).await
        };
        std::fs::create_dir_all(dir.path().join("junk")).unwrap();
        std::fs::write(dir.path().join("junk").join(DOT_LODESTONE_CONFIG), "not json").unwrap();

        let (supervisor, _) = supervisor_with(Mock::default());
        let restored = supervisor.restore_all(dir.path()).await;
        assert_eq!(restored, vec![uuid]);
        assert_eq!(supervisor.state(uuid).await.unwrap(), State::Stopped);
    }
}
