//! Multi-producer, multi-consumer event stream with a bounded replay log.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use lodestone_core::{CausedBy, ExitStatus, InstanceUuid, MacroPid};
use tokio::sync::broadcast;
use tracing::{debug, trace};

use crate::event::{
    ClientEvent, EventInner, InstanceEvent, InstanceEventInner, MacroEvent, MacroEventInner,
    ProgressionEvent, ProgressionEventInner,
};
use crate::snowflake::SnowflakeGenerator;

/// Fans every emitted [`ClientEvent`] out to all subscribers.
///
/// Minting the snowflake, appending to the log, and publishing happen under
/// one lock, so every subscriber observes events in snowflake order.
pub struct EventBroadcaster {
    tx: broadcast::Sender<ClientEvent>,
    log: Mutex<VecDeque<ClientEvent>>,
    log_capacity: usize,
    snowflakes: SnowflakeGenerator,
}

impl EventBroadcaster {
    pub fn new(capacity: usize) -> Self {
        Self::with_node_id(capacity, 0)
    }

    pub fn with_node_id(capacity: usize, node_id: u16) -> Self {
        let capacity = capacity.max(1);
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            log: Mutex::new(VecDeque::with_capacity(capacity)),
            log_capacity: capacity,
            snowflakes: SnowflakeGenerator::new(node_id),
        }
    }

    /// A live receiver. Does not replay history; see [`Self::buffered`].
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Stamp `inner` with a fresh snowflake and publish it.
    pub fn emit(
        &self,
        inner: EventInner,
        details: impl Into<String>,
        caused_by: CausedBy,
    ) -> ClientEvent {
        let mut log = self.log.lock().unwrap_or_else(PoisonError::into_inner);
        let event = ClientEvent::new(self.snowflakes.generate(), inner, details, caused_by);
        self.publish_locked(&mut log, event.clone());
        event
    }

    /// Publish an already-stamped event, e.g. one relayed from another host.
    pub fn send(&self, event: ClientEvent) {
        let mut log = self.log.lock().unwrap_or_else(PoisonError::into_inner);
        self.publish_locked(&mut log, event);
    }

    fn publish_locked(&self, log: &mut VecDeque<ClientEvent>, event: ClientEvent) {
        if log.len() == self.log_capacity {
            log.pop_front();
        }
        log.push_back(event.clone());
        trace!(snowflake = %event.snowflake, "event published");
        // No receivers is not an error; the log still records the event.
        let _ = self.tx.send(event);
    }

    /// The most recent `limit` events (all buffered when `None`), oldest first.
    pub fn buffered(&self, limit: Option<usize>) -> Vec<ClientEvent> {
        let log = self.log.lock().unwrap_or_else(PoisonError::into_inner);
        let skip = limit.map_or(0, |limit| log.len().saturating_sub(limit));
        log.iter().skip(skip).cloned().collect()
    }

    pub fn instance_event(
        &self,
        instance_uuid: InstanceUuid,
        instance_name: impl Into<String>,
        inner: InstanceEventInner,
        caused_by: CausedBy,
    ) -> ClientEvent {
        self.emit(
            EventInner::InstanceEvent(InstanceEvent {
                instance_uuid,
                instance_name: instance_name.into(),
                instance_event_inner: inner,
            }),
            "",
            caused_by,
        )
    }

    pub fn macro_started(
        &self,
        instance_uuid: InstanceUuid,
        macro_pid: MacroPid,
        caused_by: CausedBy,
    ) -> ClientEvent {
        self.emit(
            EventInner::MacroEvent(MacroEvent {
                instance_uuid,
                macro_pid,
                macro_event_inner: MacroEventInner::Started,
            }),
            "",
            caused_by,
        )
    }

    pub fn macro_stopped(
        &self,
        instance_uuid: InstanceUuid,
        macro_pid: MacroPid,
        exit_status: ExitStatus,
        caused_by: CausedBy,
    ) -> ClientEvent {
        self.emit(
            EventInner::MacroEvent(MacroEvent {
                instance_uuid,
                macro_pid,
                macro_event_inner: MacroEventInner::Stopped { exit_status },
            }),
            "",
            caused_by,
        )
    }

    /// Open a progression. Its `event_id` is the snowflake of the `Start` event.
    pub fn progression_start(
        self: &Arc<Self>,
        progression_name: impl Into<String>,
        total: Option<f64>,
        caused_by: CausedBy,
    ) -> ProgressionHandle {
        let progression_name = progression_name.into();
        let mut log = self.log.lock().unwrap_or_else(PoisonError::into_inner);
        let snowflake = self.snowflakes.generate();
        let event_id = snowflake.to_string();
        let event = ClientEvent::new(
            snowflake,
            EventInner::ProgressionEvent(ProgressionEvent {
                event_id: event_id.clone(),
                progression_event_inner: ProgressionEventInner::Start {
                    progression_name: progression_name.clone(),
                    total,
                },
            }),
            progression_name,
            caused_by.clone(),
        );
        self.publish_locked(&mut log, event);
        drop(log);
        debug!(%event_id, "progression started");
        ProgressionHandle {
            events: Arc::clone(self),
            event_id,
            caused_by,
            ended: false,
        }
    }
}

impl std::fmt::Debug for EventBroadcaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBroadcaster")
            .field("log_capacity", &self.log_capacity)
            .field("subscribers", &self.tx.receiver_count())
            .finish()
    }
}

/// Emits the `Update`/`End` events of one progression.
///
/// A handle dropped without [`ProgressionHandle::end`] closes the
/// progression as failed, so no record stays ongoing forever.
#[derive(Debug)]
pub struct ProgressionHandle {
    events: Arc<EventBroadcaster>,
    event_id: String,
    caused_by: CausedBy,
    ended: bool,
}

impl ProgressionHandle {
    pub fn event_id(&self) -> &str {
        &self.event_id
    }

    pub fn update(&self, progress: f64, progress_message: Option<String>) {
        self.emit(ProgressionEventInner::Update {
            progress,
            progress_message,
        });
    }

    /// An update-only view that can be moved into a backend task.
    pub fn reporter(&self) -> ProgressReporter {
        ProgressReporter {
            events: Arc::clone(&self.events),
            event_id: self.event_id.clone(),
            caused_by: self.caused_by.clone(),
        }
    }

    pub fn end(mut self, success: bool, message: Option<String>) {
        self.ended = true;
        self.emit(ProgressionEventInner::End { success, message });
    }

    fn emit(&self, inner: ProgressionEventInner) {
        self.events.emit(
            EventInner::ProgressionEvent(ProgressionEvent {
                event_id: self.event_id.clone(),
                progression_event_inner: inner,
            }),
            "",
            self.caused_by.clone(),
        );
    }
}

/// Cloneable handle that can only report progress on an open progression.
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    events: Arc<EventBroadcaster>,
    event_id: String,
    caused_by: CausedBy,
}

impl ProgressReporter {
    pub fn event_id(&self) -> &str {
        &self.event_id
    }

    pub fn update(&self, progress: f64, progress_message: impl Into<String>) {
        self.events.emit(
            EventInner::ProgressionEvent(ProgressionEvent {
                event_id: self.event_id.clone(),
                progression_event_inner: ProgressionEventInner::Update {
                    progress,
                    progress_message: Some(progress_message.into()),
                },
            }),
            "",
            self.caused_by.clone(),
        );
    }
}

impl Drop for ProgressionHandle {
    fn drop(&mut self) {
        if !self.ended {
            debug!(event_id = %self.event_id, "progression abandoned");
            self.emit(ProgressionEventInner::End {
                success: false,
                message: Some("operation was abandoned".to_string()),
            });
        }
    }
}
