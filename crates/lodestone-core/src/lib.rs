//! lodestone-core: shared types for the Lodestone instance host.
//!
//! Everything that more than one Lodestone crate needs to agree on lives
//! here: instance identity, lifecycle [`State`], actor attribution
//! ([`CausedBy`]), the configurable [`manifest`] model, the error taxonomy
//! surfaced across the procedure-call boundary, and the host's TOML config.

pub mod config;
pub mod error;
pub mod manifest;
pub mod types;

pub use config::HostConfig;
pub use error::{Error, ErrorKind, Result};
pub use manifest::{
    ConfigurableManifest, ConfigurableValue, ConfigurableValueType, SectionManifest,
    SettingManifest, SetupManifest, SetupValue,
};
pub use types::*;
