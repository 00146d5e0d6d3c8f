//! lodestoned: the Lodestone host daemon.
//!
//! Assembles the instance host:
//! - Event broadcaster and buffered event log
//! - Handler registry (sandbox backend)
//! - Supervisor, restored from the instances directory
//!
//! # Usage
//!
//! ```text
//! lodestoned init --config lodestone.toml
//! lodestoned run --config lodestone.toml
//! lodestoned exec --config lodestone.toml '{"id":1,"type":"GetState","instance_uuid":"…"}'
//! ```

use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use lodestone_core::HostConfig;
use lodestone_events::{ClientEvent, EventBroadcaster, EventInner};
use lodestone_protocol::{PROTOCOL_VERSION, ProcedureCall};
use lodestone_sandbox::SandboxFactory;
use lodestone_supervisor::{DispatchConfig, HandlerRegistry, Supervisor};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, info, warn};

const DEFAULT_FILTER: &str = "info,lodestoned=debug,lodestone=debug";

#[derive(Parser)]
#[command(name = "lodestoned", about = "Lodestone instance host daemon")]
struct Cli {
    /// Log output format.
    #[arg(long, value_enum, default_value = "text", global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Write a default lodestone.toml.
    Init {
        #[arg(long, default_value = "lodestone.toml")]
        config: PathBuf,

        /// Host name recorded in the config.
        #[arg(long, default_value = "lodestone")]
        name: String,

        /// Directory holding one subdirectory per instance.
        #[arg(long, default_value = "instances")]
        instances_dir: PathBuf,

        /// Overwrite an existing config.
        #[arg(long)]
        force: bool,
    },
    /// Restore all instances and supervise them until Ctrl-C.
    Run {
        #[arg(long, default_value = "lodestone.toml")]
        config: PathBuf,
    },
    /// Restore all instances, dispatch one procedure call, print the result.
    Exec {
        #[arg(long, default_value = "lodestone.toml")]
        config: PathBuf,

        /// The call as JSON, or "-" to read it from stdin.
        call: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match cli.command {
        Command::Init {
            config,
            name,
            instances_dir,
            force,
        } => init(&config, &name, &instances_dir, force),
        Command::Run { config } => run(&config).await,
        Command::Exec { config, call } => exec(&config, &call).await,
    }
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(DEFAULT_FILTER));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn init(path: &Path, name: &str, instances_dir: &Path, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        anyhow::bail!("{} already exists (use --force to overwrite)", path.display());
    }
    let config = HostConfig::scaffold(name, instances_dir);
    std::fs::write(path, config.to_toml_string()?)
        .with_context(|| format!("writing {}", path.display()))?;
    info!(path = %path.display(), "config written");
    Ok(())
}

/// Load the config and assemble a supervisor over its instances directory.
fn assemble(path: &Path) -> anyhow::Result<(HostConfig, Supervisor)> {
    let config =
        HostConfig::from_file(path).with_context(|| format!("loading {}", path.display()))?;
    std::fs::create_dir_all(&config.host.instances_dir).with_context(|| {
        format!("creating {}", config.host.instances_dir.display())
    })?;

    let events = Arc::new(EventBroadcaster::new(config.host.event_buffer));
    let registry = HandlerRegistry::new().with_factory(Arc::new(SandboxFactory::new()));
    info!(game_types = ?registry.game_types(), protocol = PROTOCOL_VERSION, "backends registered");

    let supervisor = Supervisor::new(registry, events, DispatchConfig::from_host_config(&config));
    Ok((config, supervisor))
}

async fn run(path: &Path) -> anyhow::Result<()> {
    let (config, supervisor) = assemble(path)?;
    info!(host = %config.host.name, "Lodestone host starting");

    let logger = tokio::spawn(log_events(supervisor.events().subscribe()));
    let restored = supervisor.restore_all(&config.host.instances_dir).await;
    info!(count = restored.len(), "host ready");

    tokio::signal::ctrl_c()
        .await
        .context("installing Ctrl-C handler")?;
    info!("shutdown signal received");

    supervisor.shutdown().await;
    logger.abort();
    info!("Lodestone host stopped");
    Ok(())
}

async fn exec(path: &Path, raw: &str) -> anyhow::Result<()> {
    let raw = if raw == "-" {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("reading call from stdin")?;
        buf
    } else {
        raw.to_string()
    };
    let call = ProcedureCall::from_json(&raw).context("parsing procedure call")?;

    let (config, supervisor) = assemble(path)?;
    supervisor
        .restore_instances(&config.host.instances_dir)
        .await;

    let result = supervisor.dispatch(call).await;
    println!("{}", serde_json::to_string_pretty(&result)?);

    supervisor.shutdown().await;
    if !result.success {
        std::process::exit(1);
    }
    Ok(())
}

async fn log_events(mut rx: broadcast::Receiver<ClientEvent>) {
    loop {
        match rx.recv().await {
            Ok(event) => log_event(&event),
            Err(RecvError::Lagged(skipped)) => warn!(skipped, "event log fell behind"),
            Err(RecvError::Closed) => break,
        }
    }
}

fn log_event(event: &ClientEvent) {
    let id = event.snowflake_str.as_str();
    match &event.event_inner {
        EventInner::InstanceEvent(e) => {
            info!(event = id, instance = %e.instance_uuid, name = %e.instance_name, detail = ?e.instance_event_inner, "instance event")
        }
        EventInner::ProgressionEvent(e) => {
            debug!(event = id, event_id = %e.event_id, detail = ?e.progression_event_inner, "progression event")
        }
        EventInner::MacroEvent(e) => {
            info!(event = id, instance = %e.instance_uuid, pid = %e.macro_pid, detail = ?e.macro_event_inner, "macro event")
        }
    }
}
