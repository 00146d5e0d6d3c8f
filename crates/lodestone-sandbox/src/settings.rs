//! Sandbox settings: the typed manifest and the restore file.

use std::path::{Path, PathBuf};

use lodestone_core::{
    ConfigurableManifest, ConfigurableValue, ConfigurableValueType, Error, Result,
    SectionManifest, SettingManifest, SetupValue,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Restore file written into the instance directory.
pub const SANDBOX_FILE: &str = ".lodestone_sandbox.json";

pub const SERVER_SECTION: &str = "server";
pub const RCON_SECTION: &str = "rcon";
pub const MAX_PLAYERS: &str = "max_players";

/// Every setting the sandbox understands, with defaults and no values.
pub fn manifest() -> ConfigurableManifest {
    ConfigurableManifest::new()
        .with_section(
            SectionManifest::new(SERVER_SECTION, "Server", "Gameplay and listing settings")
                .with_setting(
                    SettingManifest::new(
                        "motd",
                        "Message of the day",
                        "Shown in the server list",
                        ConfigurableValueType::String {
                            regex: Some(r"^[^\n]{1,59}$".to_string()),
                        },
                    )
                    .with_default(ConfigurableValue::String(
                        "A Lodestone sandbox".to_string(),
                    )),
                )
                .with_setting(
                    SettingManifest::new(
                        MAX_PLAYERS,
                        "Max players",
                        "Players allowed online at once",
                        ConfigurableValueType::UnsignedInteger {
                            min: Some(1),
                            max: Some(100),
                        },
                    )
                    .with_default(ConfigurableValue::UnsignedInteger(20)),
                )
                .with_setting(
                    SettingManifest::new(
                        "difficulty",
                        "Difficulty",
                        "World difficulty",
                        ConfigurableValueType::Enum {
                            options: ["peaceful", "easy", "normal", "hard"]
                                .into_iter()
                                .map(String::from)
                                .collect(),
                        },
                    )
                    .with_default(ConfigurableValue::Enum("normal".to_string())),
                )
                .with_setting(
                    SettingManifest::new(
                        "pvp",
                        "PvP",
                        "Whether players can hurt each other",
                        ConfigurableValueType::Boolean,
                    )
                    .with_default(ConfigurableValue::Boolean(true)),
                )
                .with_setting(
                    SettingManifest::new(
                        "level_seed",
                        "Level seed",
                        "Seed used to generate the world; fixed once the world exists",
                        ConfigurableValueType::String { regex: None },
                    )
                    .with_default(ConfigurableValue::String("lodestone".to_string()))
                    .immutable(),
                ),
        )
        .with_section(
            SectionManifest::new(RCON_SECTION, "Remote console", "Remote administration")
                .with_setting(
                    SettingManifest::new(
                        "rcon_password",
                        "RCON password",
                        "Password for remote console access",
                        ConfigurableValueType::String {
                            regex: Some(r"^\S{8,}$".to_string()),
                        },
                    )
                    .secret(),
                ),
        )
}

/// Everything needed to rebuild a sandbox instance.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct Persisted {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub port: u32,
    #[serde(default)]
    pub auto_start: bool,
    #[serde(default)]
    pub restart_on_crash: bool,
    pub manifest: ConfigurableManifest,
}

impl Persisted {
    /// Fresh settings from a validated setup request.
    pub fn from_setup(setup: &SetupValue) -> Result<Self> {
        let manifest = manifest().to_setup_manifest().apply(setup)?;
        Ok(Self {
            name: setup.name.clone(),
            description: setup.description.clone().unwrap_or_default(),
            port: setup.port,
            auto_start: setup.auto_start,
            restart_on_crash: setup.restart_on_crash,
            manifest,
        })
    }

    pub fn max_players(&self) -> u32 {
        self.manifest
            .value(SERVER_SECTION, MAX_PLAYERS)
            .and_then(ConfigurableValue::as_u32)
            .unwrap_or(20)
    }

    pub fn motd(&self) -> String {
        self.manifest
            .value(SERVER_SECTION, "motd")
            .and_then(ConfigurableValue::as_str)
            .unwrap_or_default()
            .to_string()
    }

    pub async fn load(dir: &Path) -> Result<Self> {
        let path = file_path(dir);
        let content = tokio::fs::read_to_string(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::not_found(format!("{} is missing", path.display()))
            } else {
                Error::from(e)
            }
        })?;
        serde_json::from_str(&content)
            .map_err(|e| Error::invalid_input(format!("malformed {SANDBOX_FILE}: {e}")))
    }

    /// Writes a temporary file and renames it over the old one.
    pub async fn save(&self, dir: &Path) -> Result<()> {
        let path = file_path(dir);
        let tmp = path.with_extension("json.tmp");
        let content =
            serde_json::to_string_pretty(self).map_err(|e| Error::handler_fault(e.to_string()))?;
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, &path).await?;
        debug!(path = %path.display(), "sandbox settings saved");
        Ok(())
    }
}

impl std::fmt::Debug for Persisted {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Persisted")
            .field("name", &self.name)
            .field("port", &self.port)
            .field("manifest", &self.manifest.redacted())
            .finish()
    }
}

fn file_path(dir: &Path) -> PathBuf {
    dir.join(SANDBOX_FILE)
}
