//! Request priority levels and backlog ordering.

use std::{cmp::Ordering, fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::ThrottleError;

// ============================================================================
// RequestPriority
// ============================================================================

/// Priority levels for queued requests.
///
/// Higher priority requests are dispatched first whenever a queue has a
/// free slot and more than one pending entry.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum RequestPriority {
    /// Background work such as periodic sync
    Low = 0,
    /// Regular bulk operations such as exports
    #[default]
    Normal = 1,
    /// Interactive requests a user is waiting on
    High = 2,
    /// Work that must run ahead of everything else
    Critical = 3,
}

impl RequestPriority {
    /// All levels, lowest first.
    pub const ALL: [RequestPriority; 4] = [
        RequestPriority::Low,
        RequestPriority::Normal,
        RequestPriority::High,
        RequestPriority::Critical,
    ];

    /// Returns the lowercase name of the level.
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestPriority::Low => "low",
            RequestPriority::Normal => "normal",
            RequestPriority::High => "high",
            RequestPriority::Critical => "critical",
        }
    }
}

impl fmt::Display for RequestPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<u8> for RequestPriority {
    type Error = ThrottleError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(RequestPriority::Low),
            1 => Ok(RequestPriority::Normal),
            2 => Ok(RequestPriority::High),
            3 => Ok(RequestPriority::Critical),
            other => Err(ThrottleError::InvalidPriority(format!(
                "level {other} is outside 0..=3"
            ))),
        }
    }
}

impl FromStr for RequestPriority {
    type Err = ThrottleError;

    /// Accepts a level name in any case, or its numeric level.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if let Ok(level) = trimmed.parse::<u8>() {
            return Self::try_from(level);
        }
        match trimmed.to_ascii_lowercase().as_str() {
            "low" => Ok(RequestPriority::Low),
            "normal" => Ok(RequestPriority::Normal),
            "high" => Ok(RequestPriority::High),
            "critical" => Ok(RequestPriority::Critical),
            _ => Err(ThrottleError::InvalidPriority(format!(
                "unknown priority '{s}'"
            ))),
        }
    }
}

// ============================================================================
// QueueOrder
// ============================================================================

/// Position of a pending entry in a backlog.
///
/// Orders so that the greatest value is the next one to dispatch: higher
/// priority first, then the lower (earlier) sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct QueueOrder {
    pub(crate) priority: RequestPriority,
    pub(crate) seq: u64,
}

impl Ord for QueueOrder {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueueOrder {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
