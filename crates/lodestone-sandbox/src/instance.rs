//! The simulated server.
//!
//! A sandbox instance has no process behind it. Starting walks through a
//! few timed stages, the console understands a handful of commands, and
//! players come and go through `join <name>` and `leave <name>`.

use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use lodestone_core::{
    CausedBy, ConfigurableManifest, ConfigurableValue, Error, Game, GameType, PerformanceReport,
    Player, Result, State, epoch_secs,
};
use lodestone_events::ProgressReporter;
use lodestone_supervisor::{InstanceContext, InstanceHandler};
use tracing::{debug, info};

use crate::settings::{MAX_PLAYERS, Persisted, SERVER_SECTION};
use crate::{GAME_TYPE, SandboxTimings};

const START_STAGES: &[&str] = &["Preparing level", "Loading spawn area", "Opening port"];
const VERSION: &str = "1.0.0-sandbox";

#[derive(Default)]
struct Runtime {
    online: bool,
    started_at: Option<u64>,
    players: Vec<Player>,
    joins: u32,
}

pub struct SandboxInstance {
    ctx: InstanceContext,
    timings: SandboxTimings,
    settings: tokio::sync::Mutex<Persisted>,
    runtime: Mutex<Runtime>,
}

impl SandboxInstance {
    pub fn new(ctx: InstanceContext, settings: Persisted, timings: SandboxTimings) -> Self {
        Self {
            ctx,
            timings,
            settings: tokio::sync::Mutex::new(settings),
            runtime: Mutex::new(Runtime::default()),
        }
    }

    fn runtime(&self) -> MutexGuard<'_, Runtime> {
        self.runtime.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn name_now(&self) -> String {
        self.settings.lock().await.name.clone()
    }

    /// Apply `change` to the settings and persist them.
    async fn persist<F>(&self, change: F) -> Result<()>
    where
        F: FnOnce(&mut Persisted) -> Result<()>,
    {
        let mut settings = self.settings.lock().await;
        let mut updated = settings.clone();
        change(&mut updated)?;
        updated.save(&self.ctx.path).await?;
        *settings = updated;
        Ok(())
    }

    /// Take the server offline and announce everyone who got disconnected.
    fn go_offline(&self, name: &str) {
        let left = {
            let mut runtime = self.runtime();
            runtime.online = false;
            runtime.started_at = None;
            std::mem::take(&mut runtime.players)
        };
        if !left.is_empty() {
            self.ctx.players_changed(name, Vec::new(), Vec::new(), left);
        }
    }

    fn join(&self, name: &str, player_name: &str, max_players: u32) {
        let outcome = {
            let mut runtime = self.runtime();
            if runtime.players.iter().any(|p| p.name == player_name) {
                Err(format!("{player_name} is already online"))
            } else if runtime.players.len() as u32 >= max_players {
                Err(format!("Server is full ({max_players} players)"))
            } else {
                runtime.joins += 1;
                let player = Player {
                    id: format!("sandbox-{}", runtime.joins),
                    name: player_name.to_string(),
                };
                runtime.players.push(player.clone());
                Ok((runtime.players.clone(), player))
            }
        };
        match outcome {
            Ok((list, player)) => {
                self.ctx
                    .output(name, format!("{player_name} joined the game"));
                self.ctx.players_changed(name, list, vec![player], Vec::new());
            }
            Err(message) => self.ctx.output(name, message),
        }
    }

    fn leave(&self, name: &str, player_name: &str) {
        let outcome = {
            let mut runtime = self.runtime();
            let index = runtime.players.iter().position(|p| p.name == player_name);
            index.map(|index| {
                let player = runtime.players.remove(index);
                (runtime.players.clone(), player)
            })
        };
        match outcome {
            Some((list, player)) => {
                self.ctx.output(name, format!("{player_name} left the game"));
                self.ctx.players_changed(name, list, Vec::new(), vec![player]);
            }
            None => self
                .ctx
                .output(name, format!("No player named {player_name} is online")),
        }
    }
}

#[async_trait]
impl InstanceHandler for SandboxInstance {
    async fn start(&self, _caused_by: CausedBy, progress: ProgressReporter) -> Result<()> {
        let (name, port, motd) = {
            let settings = self.settings.lock().await;
            (settings.name.clone(), settings.port, settings.motd())
        };
        self.ctx
            .output(&name, format!("Starting sandbox server on port {port}"));
        for (index, stage) in START_STAGES.iter().enumerate() {
            progress.update(1.0, *stage);
            self.ctx.output(
                &name,
                format!("[{}/{}] {stage}", index + 1, START_STAGES.len()),
            );
            tokio::time::sleep(self.timings.stage_delay).await;
        }
        {
            let mut runtime = self.runtime();
            runtime.online = true;
            runtime.started_at = Some(epoch_secs());
        }
        self.ctx.output(&name, format!("Done! {motd}"));
        info!(instance = %self.ctx.uuid, port, "sandbox server online");
        Ok(())
    }

    async fn stop(&self, _caused_by: CausedBy, progress: ProgressReporter) -> Result<()> {
        let name = self.name_now().await;
        progress.update(1.0, "Saving world");
        self.ctx.output(&name, "Stopping the server");
        self.go_offline(&name);
        tokio::time::sleep(self.timings.stage_delay).await;
        self.ctx.output(&name, "Server stopped");
        Ok(())
    }

    async fn kill(&self, _caused_by: CausedBy) -> Result<()> {
        let name = self.name_now().await;
        self.go_offline(&name);
        self.ctx.output(&name, "Server killed");
        Ok(())
    }

    /// There is no process to find after a host restart.
    async fn state(&self) -> Result<State> {
        Ok(State::Stopped)
    }

    async fn destruct(&self) -> Result<()> {
        debug!(instance = %self.ctx.uuid, "sandbox instance released");
        Ok(())
    }

    async fn name(&self) -> Result<String> {
        Ok(self.name_now().await)
    }

    async fn set_name(&self, name: String) -> Result<()> {
        self.persist(|s| {
            s.name = name;
            Ok(())
        })
        .await
    }

    async fn description(&self) -> Result<String> {
        Ok(self.settings.lock().await.description.clone())
    }

    async fn set_description(&self, description: String) -> Result<()> {
        self.persist(|s| {
            s.description = description;
            Ok(())
        })
        .await
    }

    async fn version(&self) -> Result<String> {
        Ok(VERSION.to_string())
    }

    async fn game(&self) -> Result<Game> {
        Ok(Game {
            game_type: GameType::new(GAME_TYPE),
            display_name: "Sandbox".to_string(),
        })
    }

    async fn port(&self) -> Result<u32> {
        Ok(self.settings.lock().await.port)
    }

    async fn set_port(&self, port: u32) -> Result<()> {
        if self.runtime().online {
            return Err(Error::conflict("cannot change the port while the server is online"));
        }
        self.persist(|s| {
            s.port = port;
            Ok(())
        })
        .await
    }

    async fn auto_start(&self) -> Result<bool> {
        Ok(self.settings.lock().await.auto_start)
    }

    async fn set_auto_start(&self, auto_start: bool) -> Result<()> {
        self.persist(|s| {
            s.auto_start = auto_start;
            Ok(())
        })
        .await
    }

    async fn restart_on_crash(&self) -> Result<bool> {
        Ok(self.settings.lock().await.restart_on_crash)
    }

    async fn set_restart_on_crash(&self, restart_on_crash: bool) -> Result<()> {
        self.persist(|s| {
            s.restart_on_crash = restart_on_crash;
            Ok(())
        })
        .await
    }

    async fn send_command(&self, command: String, _caused_by: CausedBy) -> Result<()> {
        if !self.runtime().online {
            return Err(Error::conflict("the server is not running"));
        }
        let (name, max_players) = {
            let settings = self.settings.lock().await;
            (settings.name.clone(), settings.max_players())
        };
        self.ctx.output(&name, format!("> {command}"));

        let (verb, rest) = match command.trim().split_once(' ') {
            Some((verb, rest)) => (verb, rest.trim()),
            None => (command.trim(), ""),
        };
        match verb {
            "say" => self.ctx.output(&name, format!("[Server] {rest}")),
            "join" if !rest.is_empty() => self.join(&name, rest, max_players),
            "leave" if !rest.is_empty() => self.leave(&name, rest),
            "list" => {
                let names: Vec<_> = self
                    .runtime()
                    .players
                    .iter()
                    .map(|p| p.name.clone())
                    .collect();
                self.ctx.output(
                    &name,
                    format!(
                        "There are {} of a max of {max_players} players online: {}",
                        names.len(),
                        names.join(", ")
                    ),
                );
            }
            "stop" => {
                self.go_offline(&name);
                self.ctx.output(&name, "Server stopped");
                self.ctx.report_exit(false);
            }
            "crash" => {
                self.go_offline(&name);
                self.ctx.output(&name, "Exception in server tick loop");
                self.ctx.report_exit(true);
            }
            _ => self
                .ctx
                .output(&name, "Unknown command. Type \"help\" for help."),
        }
        Ok(())
    }

    async fn monitor(&self) -> Result<PerformanceReport> {
        let runtime = self.runtime();
        if !runtime.online {
            return Ok(PerformanceReport::default());
        }
        let players = runtime.players.len() as u64;
        Ok(PerformanceReport {
            memory_usage: Some((64 + 4 * players) * 1024 * 1024),
            disk_usage: None,
            cpu_usage: Some(2.0 + players as f32 * 0.5),
            start_time: runtime.started_at,
        })
    }

    async fn player_count(&self) -> Result<u32> {
        Ok(self.runtime().players.len() as u32)
    }

    async fn max_player_count(&self) -> Result<u32> {
        Ok(self.settings.lock().await.max_players())
    }

    async fn set_max_player_count(&self, max_player_count: u32) -> Result<()> {
        self.persist(|s| {
            s.manifest.update(
                SERVER_SECTION,
                MAX_PLAYERS,
                ConfigurableValue::UnsignedInteger(max_player_count),
            )
        })
        .await
    }

    async fn player_list(&self) -> Result<Vec<Player>> {
        Ok(self.runtime().players.clone())
    }

    async fn configurable_manifest(&self) -> Result<ConfigurableManifest> {
        Ok(self.settings.lock().await.manifest.clone())
    }

    async fn update_configurable(
        &self,
        section_id: String,
        setting_id: String,
        value: ConfigurableValue,
    ) -> Result<()> {
        self.persist(|s| s.manifest.update(&section_id, &setting_id, value))
            .await
    }
}

impl std::fmt::Debug for SandboxInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxInstance")
            .field("uuid", &self.ctx.uuid)
            .field("online", &self.runtime().online)
            .finish()
    }
}

