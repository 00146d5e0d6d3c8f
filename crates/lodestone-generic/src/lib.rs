//! lodestone-generic: backends that live outside the host process.
//!
//! A worker (a script runtime, a sidecar, another process) speaks the same
//! procedure-call protocol the host speaks. [`GenericFactory`] and
//! [`GenericInstance`] adapt it to the handler interface; a
//! [`ProcedureBridge`] carries the calls one way and [`WorkerNotice`]s
//! the other.

pub mod bridge;
pub mod instance;

pub use bridge::{ChannelBridge, NoticeSink, ProcedureBridge, WorkerEnd, WorkerNotice};
pub use instance::{GenericFactory, GenericInstance};
