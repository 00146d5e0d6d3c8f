//! What a backend receives about the instance it manages.

use std::path::PathBuf;
use std::sync::Arc;

use lodestone_core::{CausedBy, DotLodestoneConfig, InstanceUuid, Player};
use lodestone_events::{EventBroadcaster, InstanceEventInner};
use tokio::sync::mpsc;
use tracing::warn;

/// An unexpected end of the server process, reported by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ExitReport {
    pub crashed: bool,
}

/// Identity, location, and event access for one instance.
///
/// Cheap to clone. Backends keep it for as long as the instance lives.
#[derive(Debug, Clone)]
pub struct InstanceContext {
    pub uuid: InstanceUuid,
    pub path: PathBuf,
    pub dot_config: DotLodestoneConfig,
    pub events: Arc<EventBroadcaster>,
    exits: mpsc::UnboundedSender<ExitReport>,
}

impl InstanceContext {
    pub(crate) fn new(
        dot_config: DotLodestoneConfig,
        path: PathBuf,
        events: Arc<EventBroadcaster>,
    ) -> (Self, mpsc::UnboundedReceiver<ExitReport>) {
        let (exits, exits_rx) = mpsc::unbounded_channel();
        let ctx = Self {
            uuid: dot_config.uuid,
            path,
            dot_config,
            events,
            exits,
        };
        (ctx, exits_rx)
    }

    /// A context not attached to a supervisor. Exit reports are dropped.
    pub fn standalone(
        dot_config: DotLodestoneConfig,
        path: PathBuf,
        events: Arc<EventBroadcaster>,
    ) -> Self {
        Self::new(dot_config, path, events).0
    }

    /// The server process ended without being asked to.
    ///
    /// A clean exit leaves the instance `Stopped`; a crash moves it to
    /// `Error` and, when the backend has restart-on-crash enabled, queues a
    /// start attributed to the system.
    pub fn report_exit(&self, crashed: bool) {
        if self.exits.send(ExitReport { crashed }).is_err() {
            warn!(instance = %self.uuid, "exit reported for an instance that is no longer supervised");
        }
    }

    /// Publish a line of console output.
    pub fn output(&self, instance_name: &str, message: impl Into<String>) {
        self.emit(
            instance_name,
            InstanceEventInner::InstanceOutput {
                message: message.into(),
            },
        );
    }

    pub fn system_message(&self, instance_name: &str, message: impl Into<String>) {
        self.emit(
            instance_name,
            InstanceEventInner::SystemMessage {
                message: message.into(),
            },
        );
    }

    pub fn players_changed(
        &self,
        instance_name: &str,
        player_list: Vec<Player>,
        players_joined: Vec<Player>,
        players_left: Vec<Player>,
    ) {
        self.emit(
            instance_name,
            InstanceEventInner::PlayerChange {
                player_list,
                players_joined,
                players_left,
            },
        );
    }

    fn emit(&self, instance_name: &str, inner: InstanceEventInner) {
        self.events
            .instance_event(self.uuid, instance_name, inner, CausedBy::System);
    }
}
