//! The capability surface every instance backend implements.

use std::sync::Arc;

use async_trait::async_trait;
use indexmap::IndexMap;
use lodestone_core::{
    CausedBy, ConfigurableManifest, ConfigurableValue, Error, Game, GameType, PerformanceReport,
    Player, Result, SetupManifest, SetupValue, State,
};
use lodestone_events::ProgressReporter;

use crate::context::InstanceContext;

/// One running instance as seen by the supervisor.
///
/// Every capability is optional: the default body answers
/// `NotImplemented`, which the supervisor passes back to the caller as a
/// typed error without touching the instance state. Backends override only
/// what they support.
///
/// Handlers never change the lifecycle state themselves. The supervisor
/// moves `Stopped → Starting → Running` around a successful
/// [`InstanceHandler::start`], and so on. Unexpected process exits are
/// reported through [`InstanceContext::report_exit`].
#[async_trait]
pub trait InstanceHandler: Send + Sync {
    // ── Lifecycle ────────────────────────────────────────────────

    /// Bring the server up. Return once it is ready to accept players.
    async fn start(&self, caused_by: CausedBy, progress: ProgressReporter) -> Result<()> {
        let _ = (caused_by, progress);
        Err(Error::not_implemented("Starting instance"))
    }

    /// Shut the server down gracefully. Return once it has exited.
    async fn stop(&self, caused_by: CausedBy, progress: ProgressReporter) -> Result<()> {
        let _ = (caused_by, progress);
        Err(Error::not_implemented("Stopping instance"))
    }

    /// Without an override the supervisor restarts with `stop` then `start`.
    async fn restart(&self, caused_by: CausedBy, progress: ProgressReporter) -> Result<()> {
        let _ = (caused_by, progress);
        Err(Error::not_implemented("Restarting instance"))
    }

    /// Terminate immediately. Must not wait on the server's cooperation.
    async fn kill(&self, caused_by: CausedBy) -> Result<()> {
        let _ = caused_by;
        Err(Error::not_implemented("Killing instance"))
    }

    /// Query the real state. Used only to seed the state of a restored instance.
    async fn state(&self) -> Result<State> {
        Err(Error::not_implemented("Probing state"))
    }

    /// Release backend resources before the instance directory is removed.
    async fn destruct(&self) -> Result<()> {
        Ok(())
    }

    // ── Metadata ─────────────────────────────────────────────────

    async fn name(&self) -> Result<String> {
        Err(Error::not_implemented("Getting name"))
    }

    async fn set_name(&self, name: String) -> Result<()> {
        let _ = name;
        Err(Error::not_implemented("Setting name"))
    }

    async fn description(&self) -> Result<String> {
        Err(Error::not_implemented("Getting description"))
    }

    async fn set_description(&self, description: String) -> Result<()> {
        let _ = description;
        Err(Error::not_implemented("Setting description"))
    }

    async fn version(&self) -> Result<String> {
        Err(Error::not_implemented("Getting version"))
    }

    async fn game(&self) -> Result<Game> {
        Err(Error::not_implemented("Getting game"))
    }

    async fn port(&self) -> Result<u32> {
        Err(Error::not_implemented("Getting port"))
    }

    async fn set_port(&self, port: u32) -> Result<()> {
        let _ = port;
        Err(Error::not_implemented("Setting port"))
    }

    async fn auto_start(&self) -> Result<bool> {
        Err(Error::not_implemented("Getting auto start"))
    }

    async fn set_auto_start(&self, auto_start: bool) -> Result<()> {
        let _ = auto_start;
        Err(Error::not_implemented("Setting auto start"))
    }

    async fn restart_on_crash(&self) -> Result<bool> {
        Err(Error::not_implemented("Getting restart on crash"))
    }

    async fn set_restart_on_crash(&self, restart_on_crash: bool) -> Result<()> {
        let _ = restart_on_crash;
        Err(Error::not_implemented("Setting restart on crash"))
    }

    // ── Runtime ──────────────────────────────────────────────────

    async fn send_command(&self, command: String, caused_by: CausedBy) -> Result<()> {
        let _ = (command, caused_by);
        Err(Error::not_implemented("Sending command"))
    }

    async fn monitor(&self) -> Result<PerformanceReport> {
        Err(Error::not_implemented("Monitoring"))
    }

    async fn player_count(&self) -> Result<u32> {
        Err(Error::not_implemented("Getting player count"))
    }

    async fn max_player_count(&self) -> Result<u32> {
        Err(Error::not_implemented("Getting max player count"))
    }

    async fn set_max_player_count(&self, max_player_count: u32) -> Result<()> {
        let _ = max_player_count;
        Err(Error::not_implemented("Setting max player count"))
    }

    async fn player_list(&self) -> Result<Vec<Player>> {
        Err(Error::not_implemented("Getting player list"))
    }

    // ── Configuration ────────────────────────────────────────────

    async fn configurable_manifest(&self) -> Result<ConfigurableManifest> {
        Err(Error::not_implemented("Getting configurable manifest"))
    }

    /// Called only after the value passed the manifest's own validation.
    async fn update_configurable(
        &self,
        section_id: String,
        setting_id: String,
        value: ConfigurableValue,
    ) -> Result<()> {
        let _ = (section_id, setting_id, value);
        Err(Error::not_implemented("Updating configurable"))
    }
}

/// Creates handlers for one game type.
#[async_trait]
pub trait HandlerFactory: Send + Sync {
    fn game_type(&self) -> GameType;

    /// Settings a caller must fill in before `setup`.
    async fn setup_manifest(&self) -> Result<SetupManifest>;

    /// Create a brand new instance in `ctx.path`. The `.lodestone_config`
    /// descriptor has already been written there.
    async fn setup(
        &self,
        ctx: InstanceContext,
        setup_value: SetupValue,
    ) -> Result<Arc<dyn InstanceHandler>>;

    /// Rebuild an instance previously created by `setup`.
    async fn restore(&self, ctx: InstanceContext) -> Result<Arc<dyn InstanceHandler>>;
}

/// Game type → factory. Game types are chosen when an instance is created.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    factories: IndexMap<GameType, Arc<dyn HandlerFactory>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, factory: Arc<dyn HandlerFactory>) {
        self.factories.insert(factory.game_type(), factory);
    }

    pub fn with_factory(mut self, factory: Arc<dyn HandlerFactory>) -> Self {
        self.register(factory);
        self
    }

    pub fn get(&self, game_type: &GameType) -> Result<Arc<dyn HandlerFactory>> {
        self.factories
            .get(game_type)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("no backend registered for game type {game_type}")))
    }

    pub fn game_types(&self) -> Vec<GameType> {
        self.factories.keys().cloned().collect()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("game_types", &self.game_types())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lodestone_core::ErrorKind;

    struct Bare;

    #[async_trait]
    impl InstanceHandler for Bare {}

    #[tokio::test]
    async fn defaults_are_not_implemented() {
        let handler = Bare;
        let err = handler.player_count().await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotImplemented);
        assert_eq!(
            err.message,
            "Getting player count is unsupported for this instance"
        );
        assert!(handler.kill(CausedBy::System).await.unwrap_err().is(ErrorKind::NotImplemented));
        assert!(handler.destruct().await.is_ok());
    }

    #[test]
    fn unknown_game_type_is_not_found() {
        let registry = HandlerRegistry::new();
        let err = registry.get(&GameType::new("minecraft")).err().unwrap();
        assert_eq!(err.kind, ErrorKind::NotFound);
    }
}
