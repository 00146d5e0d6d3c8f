//! 64-bit time-ordered event ids.
//!
//! Layout, most significant bit first:
//!
//! ```text
//! | 1 unused | 41 bits ms since LODESTONE_EPOCH_MS | 10 bits node | 12 bits sequence |
//! ```

use std::sync::{Mutex, PoisonError};

use lodestone_core::{Error, Result, epoch_millis};
use serde::{Deserialize, Serialize};

/// 2022-01-01T00:00:00Z in Unix milliseconds.
pub const LODESTONE_EPOCH_MS: u64 = 1_640_995_200_000;

const NODE_BITS: u32 = 10;
const SEQUENCE_BITS: u32 = 12;
const TIMESTAMP_SHIFT: u32 = NODE_BITS + SEQUENCE_BITS;
const MAX_NODE: u16 = (1 << NODE_BITS) - 1;
const MAX_SEQUENCE: u64 = (1 << SEQUENCE_BITS) - 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Snowflake(i64);

impl Snowflake {
    pub fn from_raw(raw: i64) -> Self {
        Self(raw)
    }

    pub fn as_i64(&self) -> i64 {
        self.0
    }

    /// Unix milliseconds at which this id was minted.
    pub fn timestamp_ms(&self) -> u64 {
        ((self.0 as u64) >> TIMESTAMP_SHIFT) + LODESTONE_EPOCH_MS
    }

    pub fn node_id(&self) -> u16 {
        (((self.0 as u64) >> SEQUENCE_BITS) & MAX_NODE as u64) as u16
    }

    pub fn sequence(&self) -> u16 {
        ((self.0 as u64) & MAX_SEQUENCE) as u16
    }
}

impl std::fmt::Display for Snowflake {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for Snowflake {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        s.parse::<i64>()
            .map(Self)
            .map_err(|e| Error::invalid_input(format!("invalid snowflake {s:?}: {e}")))
    }
}

#[derive(Debug, Default)]
struct GeneratorState {
    last_ms: u64,
    sequence: u64,
}

/// Mints strictly increasing snowflakes for one node.
///
/// When more than 4096 ids are requested within one millisecond, or the
/// wall clock steps backwards, the generator runs ahead of the clock rather
/// than repeat an id.
#[derive(Debug)]
pub struct SnowflakeGenerator {
    node_id: u16,
    state: Mutex<GeneratorState>,
}

impl SnowflakeGenerator {
    pub fn new(node_id: u16) -> Self {
        Self {
            node_id: node_id & MAX_NODE,
            state: Mutex::new(GeneratorState::default()),
        }
    }

    pub fn generate(&self) -> Snowflake {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let mut now = epoch_millis()
            .saturating_sub(LODESTONE_EPOCH_MS)
            .max(state.last_ms);
        if now == state.last_ms {
            state.sequence = (state.sequence + 1) & MAX_SEQUENCE;
            if state.sequence == 0 {
                now += 1;
            }
        } else {
            state.sequence = 0;
        }
        state.last_ms = now;
        let raw = (now << TIMESTAMP_SHIFT) | ((self.node_id as u64) << SEQUENCE_BITS) | state.sequence;
        Snowflake(raw as i64)
    }
}

impl Default for SnowflakeGenerator {
    fn default() -> Self {
        Self::new(0)
    }
}
