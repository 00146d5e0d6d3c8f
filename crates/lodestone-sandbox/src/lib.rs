//! lodestone-sandbox: an in-process simulated game server.
//!
//! The sandbox backend exercises every capability of the handler interface
//! without launching anything: staged start-up with progress, a console,
//! a player roster, and a typed settings manifest persisted next to the
//! instance's `.lodestone_config`.

pub mod instance;
pub mod settings;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lodestone_core::{GameType, Result, SetupManifest, SetupValue};
use lodestone_supervisor::{HandlerFactory, InstanceContext, InstanceHandler};
use tracing::info;

pub use instance::SandboxInstance;
pub use settings::{Persisted, SANDBOX_FILE};

/// Game type served by [`SandboxFactory`].
pub const GAME_TYPE: &str = "sandbox";

/// How long the simulated server takes for each step.
#[derive(Debug, Clone)]
pub struct SandboxTimings {
    /// Pause after each start stage and before a stop completes.
    pub stage_delay: Duration,
}

impl Default for SandboxTimings {
    fn default() -> Self {
        Self {
            stage_delay: Duration::from_millis(250),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SandboxFactory {
    timings: SandboxTimings,
}

impl SandboxFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timings(timings: SandboxTimings) -> Self {
        Self { timings }
    }
}

#[async_trait]
impl HandlerFactory for SandboxFactory {
    fn game_type(&self) -> GameType {
        GameType::new(GAME_TYPE)
    }

    async fn setup_manifest(&self) -> Result<SetupManifest> {
        Ok(settings::manifest().to_setup_manifest())
    }

    async fn setup(
        &self,
        ctx: InstanceContext,
        setup_value: SetupValue,
    ) -> Result<Arc<dyn InstanceHandler>> {
        let persisted = Persisted::from_setup(&setup_value)?;
        persisted.save(&ctx.path).await?;
        info!(instance = %ctx.uuid, name = %persisted.name, port = persisted.port, "sandbox instance created");
        Ok(Arc::new(SandboxInstance::new(
            ctx,
            persisted,
            self.timings.clone(),
        )))
    }

    async fn restore(&self, ctx: InstanceContext) -> Result<Arc<dyn InstanceHandler>> {
        let persisted = Persisted::load(&ctx.path).await?;
        info!(instance = %ctx.uuid, name = %persisted.name, "sandbox instance loaded");
        Ok(Arc::new(SandboxInstance::new(
            ctx,
            persisted,
            self.timings.clone(),
        )))
    }
}
