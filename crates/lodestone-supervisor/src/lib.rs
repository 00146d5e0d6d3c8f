//! lodestone-supervisor: runs game server instances on one host.
//!
//! Backends implement [`InstanceHandler`] and register a [`HandlerFactory`]
//! per game type. The [`Supervisor`] owns every instance, keeps the
//! lifecycle state machine, serializes mutating calls per instance, and
//! turns procedure calls into handler invocations.

mod context;
mod guard;
mod handler;
mod instance;
mod macros;
mod ports;
mod state;
pub mod supervisor;

pub use context::InstanceContext;
pub use handler::{HandlerFactory, HandlerRegistry, InstanceHandler};
pub use supervisor::{DispatchConfig, Supervisor};
