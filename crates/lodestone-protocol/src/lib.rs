//! lodestone-protocol: the closed procedure-call vocabulary.
//!
//! The host and every instance backend talk exclusively in
//! [`ProcedureCall`]s and [`ProcedureCallResult`]s. The set of calls is
//! closed: each [`ProcedureCallKind`] has exactly one payload shape and a
//! fixed set of acceptable [`ResultKind`]s, checked with
//! [`ProcedureCallKind::accepts`] wherever a result crosses the boundary.
//!
//! # Wire shape
//!
//! ```text
//! call:   { "id": 7, "type": "StartInstance", "instance_uuid": "…", "caused_by": {…}, "block": true }
//! result: { "id": 7, "procedure_call_kind": "StartInstance", "success": true, "inner": { "State": "Running" } }
//!         { "id": 8, "procedure_call_kind": "SetName", "success": true, "inner": "Void" }
//! ```

pub mod call;
pub mod result;

pub use call::{ProcedureCall, ProcedureCallInner, ProcedureCallKind};
pub use result::{ProcedureCallResult, ProcedureCallResultInner, ResultKind};

use semver::{Version, VersionReq};

macro_rules! protocol_constants {
    ($major:literal . $minor:literal) => {
        /// Major version of the procedure-call protocol spoken by this host.
        pub const PROTOCOL_MAJOR: u64 = $major;
        /// Minor version; workers with the same major and at least this minor are compatible.
        pub const PROTOCOL_MINOR: u64 = $minor;
        /// Protocol version advertised in bridge handshakes.
        pub const PROTOCOL_VERSION: &str = concat!($major, ".", $minor, ".0");
    };
}

protocol_constants!(1 . 0);

/// The protocol version this host speaks.
pub fn protocol_version() -> Version {
    Version::new(PROTOCOL_MAJOR, PROTOCOL_MINOR, 0)
}

/// Whether a peer advertising `version` can be driven by this host.
pub fn is_compatible(version: &Version) -> bool {
    VersionReq::parse(&format!("^{PROTOCOL_MAJOR}.{PROTOCOL_MINOR}"))
        .map(|req| req.matches(version))
        .unwrap_or(false)
}
