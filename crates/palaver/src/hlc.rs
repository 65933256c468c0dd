//! Hybrid Logical Clock.
//!
//! Every outbound publish is stamped with an HLC and every inbound publish
//! is merged back in, so timestamps are totally ordered across invokers and
//! executors even when wall clocks disagree. Encoded on the wire as
//! `"<wall_ms>:<counter>:<node_id>"`.

use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::error::ProtocolError;

/// Default bound on how far a received timestamp may sit from the local
/// wall clock before the engine refuses to merge it.
pub const DEFAULT_MAX_CLOCK_DRIFT: Duration = Duration::from_secs(60);

/// A single HLC timestamp: milliseconds since the Unix epoch, a logical
/// counter for same-millisecond ordering, and the id of the node that
/// issued it.
///
/// Field order gives the derived `Ord` the comparison the protocol needs:
/// wall time first, counter second, node id as the tie-breaker.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HybridLogicalClock {
    pub wall_ms: u64,
    pub counter: u32,
    pub node_id: String,
}

impl HybridLogicalClock {
    pub fn new(wall_ms: u64, counter: u32, node_id: impl Into<String>) -> Self {
        Self {
            wall_ms,
            counter,
            node_id: node_id.into(),
        }
    }
}

impl fmt::Display for HybridLogicalClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.wall_ms, self.counter, self.node_id)
    }
}

/// Failure to parse the wire encoding of an HLC.
#[derive(Debug, thiserror::Error)]
pub enum HlcParseError {
    #[error("expected <wall_ms>:<counter>:<node_id>, got {0:?}")]
    Malformed(String),
    #[error("invalid wall clock milliseconds: {0:?}")]
    WallClock(String),
    #[error("invalid counter: {0:?}")]
    Counter(String),
    #[error("empty node id")]
    EmptyNode,
}

impl FromStr for HybridLogicalClock {
    type Err = HlcParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // node_id may itself contain ':', so split only twice from the left.
        let mut parts = s.splitn(3, ':');
        let (wall, counter, node) = match (parts.next(), parts.next(), parts.next()) {
            (Some(w), Some(c), Some(n)) => (w, c, n),
            _ => return Err(HlcParseError::Malformed(s.to_string())),
        };
        let wall_ms = wall
            .parse::<u64>()
            .map_err(|_| HlcParseError::WallClock(wall.to_string()))?;
        let counter = counter
            .parse::<u32>()
            .map_err(|_| HlcParseError::Counter(counter.to_string()))?;
        if node.is_empty() {
            return Err(HlcParseError::EmptyNode);
        }
        Ok(Self::new(wall_ms, counter, node))
    }
}

/// The node-local clock. One instance per invoker or executor; all stamping
/// and merging goes through a single mutex so publish-time stamps are
/// atomic with respect to each other.
#[derive(Debug)]
pub struct HlcClock {
    node_id: String,
    max_drift: Duration,
    state: Mutex<(u64, u32)>,
}

impl HlcClock {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            max_drift: DEFAULT_MAX_CLOCK_DRIFT,
            state: Mutex::new((0, 0)),
        }
    }

    pub fn with_max_drift(mut self, max_drift: Duration) -> Self {
        self.max_drift = max_drift;
        self
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Advance the clock and return a fresh stamp. Strictly greater than
    /// every stamp previously returned by this node.
    pub fn stamp(&self) -> Result<HybridLogicalClock, ProtocolError> {
        self.stamp_at(wall_now_ms()?)
    }

    /// Merge a received timestamp. The local clock becomes at least as
    /// large as the received one, so later stamps sort after it.
    pub fn observe(&self, remote: &HybridLogicalClock) -> Result<(), ProtocolError> {
        self.observe_at(remote, wall_now_ms()?)
    }

    fn stamp_at(&self, now_ms: u64) -> Result<HybridLogicalClock, ProtocolError> {
        let mut state = self.state.lock().map_err(|_| poisoned())?;
        if now_ms > state.0 {
            state.0 = now_ms;
            state.1 = 0;
        } else {
            state.1 = bump(state.1)?;
        }
        Ok(HybridLogicalClock::new(state.0, state.1, self.node_id.clone()))
    }

    fn observe_at(&self, remote: &HybridLogicalClock, now_ms: u64) -> Result<(), ProtocolError> {
        let drift_ms = now_ms.abs_diff(remote.wall_ms);
        if Duration::from_millis(drift_ms) > self.max_drift {
            return Err(ProtocolError::state_invalid(format!(
                "received timestamp {} drifts {drift_ms}ms from local wall clock (max {}ms)",
                remote,
                self.max_drift.as_millis()
            )));
        }

        let mut state = self.state.lock().map_err(|_| poisoned())?;
        if now_ms > state.0 && now_ms > remote.wall_ms {
            state.0 = now_ms;
            state.1 = 0;
        } else if state.0 == remote.wall_ms {
            state.1 = bump(state.1.max(remote.counter))?;
        } else if state.0 > remote.wall_ms {
            state.1 = bump(state.1)?;
        } else {
            state.0 = remote.wall_ms;
            state.1 = bump(remote.counter)?;
        }
        Ok(())
    }
}

fn bump(counter: u32) -> Result<u32, ProtocolError> {
    counter
        .checked_add(1)
        .ok_or_else(|| ProtocolError::internal_logic("HLC counter overflow"))
}

fn poisoned() -> ProtocolError {
    ProtocolError::internal_logic("HLC mutex poisoned")
}

fn wall_now_ms() -> Result<u64, ProtocolError> {
    let elapsed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|_| ProtocolError::internal_logic("system clock before Unix epoch"))?;
    Ok(elapsed.as_millis() as u64)
}
