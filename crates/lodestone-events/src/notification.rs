//! Per-session notification state built by folding the event stream.
//!
//! A [`NotificationCenter`] belongs to one client session. It keeps the
//! list of events the session has accepted and one
//! [`OngoingNotificationItem`] per progression `event_id`. Both are
//! bounded: the oldest accepted events and the oldest finished records
//! are evicted once the center holds `capacity` of them.

use std::collections::{HashSet, VecDeque};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::{self, error::TryRecvError};
use tracing::{debug, warn};

use crate::event::{ClientEvent, ProgressionEventInner};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationState {
    Ongoing,
    Done,
    Error,
}

/// Client-visible record of one long-running operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OngoingNotificationItem {
    pub state: NotificationState,
    pub progress: f64,
    pub total: Option<f64>,
    pub title: String,
    pub message: Option<String>,
    pub event_id: String,
    /// Stable list key; the snowflake of the `Start` event.
    pub key: String,
    /// Unix milliseconds of the last event folded into this record.
    pub timestamp: u64,
}

/// What happened to an event handed to [`NotificationCenter::ingest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ingest {
    Accepted,
    Duplicate,
}

/// How many events and finished records a center keeps by default.
pub const DEFAULT_NOTIFICATION_CAPACITY: usize = 1024;

#[derive(Debug)]
pub struct NotificationCenter {
    /// Snowflakes of the events in `events`, nothing older.
    seen: HashSet<String>,
    events: VecDeque<ClientEvent>,
    ongoing: IndexMap<String, OngoingNotificationItem>,
    capacity: usize,
}

impl Default for NotificationCenter {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_NOTIFICATION_CAPACITY)
    }
}

impl NotificationCenter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            seen: HashSet::with_capacity(capacity),
            events: VecDeque::with_capacity(capacity),
            ongoing: IndexMap::new(),
            capacity,
        }
    }

    /// Start from a replayed log, e.g. `EventBroadcaster::buffered`.
    pub fn with_history(history: impl IntoIterator<Item = ClientEvent>) -> Self {
        let mut center = Self::new();
        for event in history {
            center.ingest(event);
        }
        center
    }

    pub fn ingest(&mut self, event: ClientEvent) -> Ingest {
        if !self.seen.insert(event.snowflake_str.clone()) {
            warn!(snowflake = %event.snowflake_str, "duplicate event rejected");
            return Ingest::Duplicate;
        }
        if let Some(progression) = event.progression() {
            self.fold(
                &progression.event_id,
                &progression.progression_event_inner,
                &event,
            );
        }
        self.events.push_back(event);
        while self.events.len() > self.capacity {
            if let Some(evicted) = self.events.pop_front() {
                self.seen.remove(&evicted.snowflake_str);
            }
        }
        self.trim_finished();
        Ingest::Accepted
    }

    /// Evict the oldest finished records past capacity. Ongoing records
    /// are never evicted.
    fn trim_finished(&mut self) {
        let mut excess = self.ongoing.len().saturating_sub(self.capacity);
        if excess == 0 {
            return;
        }
        self.ongoing.retain(|_, item| {
            if excess > 0 && item.state != NotificationState::Ongoing {
                excess -= 1;
                false
            } else {
                true
            }
        });
    }

    fn fold(&mut self, event_id: &str, inner: &ProgressionEventInner, event: &ClientEvent) {
        let timestamp = event.timestamp_ms();
        match inner {
            ProgressionEventInner::Start {
                progression_name,
                total,
            } => {
                if self.ongoing.contains_key(event_id) {
                    warn!(%event_id, "progression started twice, keeping the first");
                    return;
                }
                self.ongoing.insert(
                    event_id.to_string(),
                    OngoingNotificationItem {
                        state: NotificationState::Ongoing,
                        progress: 0.0,
                        total: *total,
                        title: progression_name.clone(),
                        message: None,
                        event_id: event_id.to_string(),
                        key: event.snowflake_str.clone(),
                        timestamp,
                    },
                );
            }
            ProgressionEventInner::Update {
                progress,
                progress_message,
            } => {
                let Some(item) = self.ongoing.get_mut(event_id) else {
                    debug!(%event_id, "update for unknown progression dropped");
                    return;
                };
                item.progress += progress;
                if let Some(total) = item.total {
                    item.progress = item.progress.min(total);
                }
                if let Some(message) = progress_message {
                    item.message = Some(message.clone());
                }
                item.timestamp = timestamp;
            }
            ProgressionEventInner::End { success, message } => {
                let Some(item) = self.ongoing.get_mut(event_id) else {
                    debug!(%event_id, "end for unknown progression dropped");
                    return;
                };
                item.state = if *success {
                    NotificationState::Done
                } else {
                    NotificationState::Error
                };
                item.progress = item.total.unwrap_or(0.0);
                if let Some(message) = message {
                    item.message = Some(message.clone());
                }
                item.timestamp = timestamp;
            }
        }
    }

    /// Ingest everything currently queued on `rx` without waiting.
    ///
    /// Returns how many events were accepted. A lagged receiver skips the
    /// lost events and keeps draining.
    pub fn try_drain(&mut self, rx: &mut broadcast::Receiver<ClientEvent>) -> usize {
        let mut accepted = 0;
        loop {
            match rx.try_recv() {
                Ok(event) => {
                    if self.ingest(event) == Ingest::Accepted {
                        accepted += 1;
                    }
                }
                Err(TryRecvError::Lagged(skipped)) => {
                    warn!(skipped, "notification receiver lagged");
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return accepted,
            }
        }
    }

    /// The most recent accepted events, in arrival order.
    pub fn events(&self) -> &VecDeque<ClientEvent> {
        &self.events
    }

    pub fn get(&self, event_id: &str) -> Option<&OngoingNotificationItem> {
        self.ongoing.get(event_id)
    }

    /// All progression records, oldest first.
    pub fn items(&self) -> impl Iterator<Item = &OngoingNotificationItem> {
        self.ongoing.values()
    }

    pub fn ongoing_count(&self) -> usize {
        self.ongoing
            .values()
            .filter(|item| item.state == NotificationState::Ongoing)
            .count()
    }

    /// Drop finished records; ongoing ones are kept.
    pub fn clear_finished(&mut self) {
        self.ongoing
            .retain(|_, item| item.state == NotificationState::Ongoing);
    }
}
