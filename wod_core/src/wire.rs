//! Wire envelope for runtime actions.
//!
//! Observers (displays, cast receivers) get each action wrapped in a
//! versioned envelope, one JSON object per line.

use crate::action::RuntimeAction;
use crate::config::CastConfig;
use crate::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::{BufRead, Write};

/// One action as it travels to an observer
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct WireMessage {
    pub namespace: String,
    pub version: u32,
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    pub payload: serde_json::Value,
}

impl WireMessage {
    pub fn from_action(action: &RuntimeAction, cast: &CastConfig, at: DateTime<Utc>) -> Result<Self> {
        Ok(Self {
            namespace: cast.namespace.clone(),
            version: cast.version,
            event_type: action.event_type().to_string(),
            timestamp: at,
            payload: serde_json::to_value(action)?,
        })
    }

    /// Recover the action carried in the payload
    pub fn action(&self) -> Result<RuntimeAction> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

/// Receives every action the runtime emits
pub trait ActionSink {
    fn emit(&mut self, action: &RuntimeAction, at: DateTime<Utc>) -> Result<()>;
}

/// Collects actions in memory
impl ActionSink for Vec<RuntimeAction> {
    fn emit(&mut self, action: &RuntimeAction, _at: DateTime<Utc>) -> Result<()> {
        self.push(action.clone());
        Ok(())
    }
}

/// Writes one envelope per line
pub struct JsonlSink<W: Write> {
    writer: W,
    cast: CastConfig,
    written: usize,
}

impl<W: Write> JsonlSink<W> {
    pub fn new(writer: W, cast: CastConfig) -> Self {
        Self {
            writer,
            cast,
            written: 0,
        }
    }

    /// Envelopes written so far
    pub fn written(&self) -> usize {
        self.written
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write> ActionSink for JsonlSink<W> {
    fn emit(&mut self, action: &RuntimeAction, at: DateTime<Utc>) -> Result<()> {
        let message = WireMessage::from_action(action, &self.cast, at)?;
        let line = serde_json::to_string(&message)?;
        self.writer.write_all(line.as_bytes())?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;

        self.written += 1;
        tracing::trace!("Emitted {} ({} total)", message.event_type, self.written);
        Ok(())
    }
}

/// Read envelopes back, skipping lines that do not parse
pub fn read_messages<R: BufRead>(reader: R) -> Result<Vec<WireMessage>> {
    let mut messages = Vec::new();

    for (line_num, line_result) in reader.lines().enumerate() {
        let line = line_result?;
        if line.trim().is_empty() {
            continue;
        }

        match serde_json::from_str::<WireMessage>(&line) {
            Ok(message) => messages.push(message),
            Err(e) => {
                tracing::warn!("Failed to parse message at line {}: {}", line_num + 1, e);
            }
        }
    }

    tracing::debug!("Read {} wire messages", messages.len());
    Ok(messages)
}
