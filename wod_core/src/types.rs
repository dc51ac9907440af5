//! Core runtime types shared by blocks, behaviors, the trace and memory.
//!
//! This module defines:
//! - Block identity and classification
//! - Result spans (intervals of active time)
//! - Timer and round state buckets
//! - Metric values published by blocks

use crate::script::{StatementId, TimerDirection};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// ============================================================================
// Block identity
// ============================================================================

/// Unique key of one compiled block instance
///
/// A statement compiled for three rounds produces three different keys.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlockKey(pub Uuid);

impl BlockKey {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for BlockKey {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for BlockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of block a strategy produced
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum BlockType {
    /// Bottom of the stack, walks the top-level statements
    Root,
    /// Time-bound statement
    Timer,
    /// Leaf piece of work
    Effort,
    /// Round-bound statement
    Rounds,
    /// Placeholder for a statement with nothing to execute
    Completion,
    /// Waiting for the first Start
    Idle,
    /// Lap-marked statement whose children run as one unit
    Group,
}

/// Where a block is in its lifecycle
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum BlockStatus {
    #[default]
    Created,
    Mounted,
    Completed,
    Errored,
    Unmounted,
}

// ============================================================================
// Spans
// ============================================================================

/// One interval of active time; `stop` is `None` while the clock runs
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResultSpan {
    pub start: DateTime<Utc>,
    pub stop: Option<DateTime<Utc>>,
}

impl ResultSpan {
    pub fn open(start: DateTime<Utc>) -> Self {
        Self { start, stop: None }
    }

    pub fn is_open(&self) -> bool {
        self.stop.is_none()
    }

    /// Length of the span, measuring an open span up to `now`
    pub fn duration_ms(&self, now: DateTime<Utc>) -> i64 {
        let end = self.stop.unwrap_or(now);
        (end - self.start).num_milliseconds().max(0)
    }
}

/// Total active time across spans
pub fn elapsed_ms(spans: &[ResultSpan], now: DateTime<Utc>) -> i64 {
    spans.iter().map(|s| s.duration_ms(now)).sum()
}

// ============================================================================
// State buckets
// ============================================================================

/// Timer configuration of a time-bound block
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct TimerState {
    pub direction: TimerDirection,
    pub duration_ms: Option<i64>,
}

impl TimerState {
    /// Time left on a countdown; `None` for open-ended timers
    pub fn remaining_ms(&self, elapsed: i64) -> Option<i64> {
        match (self.direction, self.duration_ms) {
            (TimerDirection::Down, Some(duration)) => Some((duration - elapsed).max(0)),
            _ => None,
        }
    }

    /// A countdown that has run out
    pub fn is_expired(&self, elapsed: i64) -> bool {
        matches!(self.remaining_ms(elapsed), Some(0))
    }
}

/// Progress of a repeated group
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct RoundState {
    /// Rounds started so far (1-based once the first round begins)
    pub current: u32,
    pub total: Option<u32>,
}

impl RoundState {
    pub fn with_total(total: u32) -> Self {
        Self {
            current: 0,
            total: Some(total),
        }
    }
}

/// A measured value a block publishes
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct MetricValue {
    pub key: String,
    pub value: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    pub source: StatementId,
}
