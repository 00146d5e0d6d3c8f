//! lodestone-events: the client-facing event pipeline.
//!
//! Producers publish through one [`EventBroadcaster`]; every event is stamped
//! with a [`Snowflake`] that doubles as its total-order position and dedup
//! key. Long-running operations report through a [`ProgressionHandle`], and
//! each client session folds what it receives into a [`NotificationCenter`].

pub mod broadcaster;
pub mod event;
pub mod notification;
pub mod snowflake;

pub use broadcaster::{EventBroadcaster, ProgressReporter, ProgressionHandle};
pub use event::{
    ClientEvent, EventInner, InstanceEvent, InstanceEventInner, MacroEvent, MacroEventInner,
    ProgressionEvent, ProgressionEventInner,
};
pub use notification::{
    DEFAULT_NOTIFICATION_CAPACITY, Ingest, NotificationCenter, NotificationState,
    OngoingNotificationItem,
};
pub use snowflake::{Snowflake, SnowflakeGenerator};
