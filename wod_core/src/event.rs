//! Runtime events fed into the dispatch loop.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// What happened
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Start,
    Stop,
    Pause,
    Reset,
    Next,
    Tick,
}

impl EventKind {
    /// Commands a user can issue (everything but Tick)
    pub fn is_command(&self) -> bool {
        !matches!(self, EventKind::Tick)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EventKind::Start => "start",
            EventKind::Stop => "stop",
            EventKind::Pause => "pause",
            EventKind::Reset => "reset",
            EventKind::Next => "next",
            EventKind::Tick => "tick",
        };
        f.write_str(name)
    }
}

impl FromStr for EventKind {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "start" | "resume" => Ok(EventKind::Start),
            "stop" => Ok(EventKind::Stop),
            "pause" => Ok(EventKind::Pause),
            "reset" => Ok(EventKind::Reset),
            "next" | "n" => Ok(EventKind::Next),
            "tick" => Ok(EventKind::Tick),
            other => Err(crate::Error::Other(format!("Unknown command: {}", other))),
        }
    }
}

/// An event with the moment it was produced
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct RuntimeEvent {
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
}

impl RuntimeEvent {
    pub fn new(kind: EventKind, timestamp: DateTime<Utc>) -> Self {
        Self { kind, timestamp }
    }

    /// Event stamped with the current wall clock
    pub fn now(kind: EventKind) -> Self {
        Self::new(kind, Utc::now())
    }

    pub fn is_tick(&self) -> bool {
        self.kind == EventKind::Tick
    }
}
