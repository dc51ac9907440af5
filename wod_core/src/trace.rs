//! Execution trace: round counters, compilation history and event log.
//!
//! Counters are keyed by source statement. `lifetime_total` counts every
//! compilation of a statement since the last reset; `current_round` counts
//! compilations under the current instance of its parent block and starts
//! over whenever that parent is compiled again.

use crate::event::RuntimeEvent;
use crate::script::StatementId;
use crate::stack::ExecutionStack;
use crate::types::{BlockKey, ResultSpan};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
struct RoundCounter {
    parent: Option<BlockKey>,
    current: u32,
    lifetime: u32,
}

/// One compiled block instance
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct HistoryEntry {
    pub source: StatementId,
    pub block_key: BlockKey,
    pub round: u32,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub spans: Vec<ResultSpan>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, Default)]
pub struct ExecutionTrace {
    counters: HashMap<StatementId, RoundCounter>,
    history: Vec<HistoryEntry>,
    events: Vec<RuntimeEvent>,
}

impl ExecutionTrace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the block just pushed on top of `stack`
    ///
    /// Blocks without a source statement (root, idle) are not counted.
    /// Returns the block's round number when it was recorded.
    pub fn set(&mut self, stack: &ExecutionStack, now: DateTime<Utc>) -> Option<u32> {
        let block = stack.current()?;
        let source = block.source()?;

        let counter = self.counters.entry(source).or_default();
        if counter.parent != block.parent() {
            counter.parent = block.parent();
            counter.current = 0;
        }
        counter.current += 1;
        counter.lifetime += 1;
        let round = counter.current;

        self.history.push(HistoryEntry {
            source,
            block_key: block.key(),
            round,
            timestamp: now,
            spans: Vec::new(),
            completed_at: None,
        });

        tracing::debug!(
            "Trace {} round {} (lifetime {})",
            source,
            round,
            counter.lifetime
        );
        Some(round)
    }

    /// Rounds of `id` under its current parent; 0 if never compiled
    pub fn current_round(&self, id: StatementId) -> u32 {
        self.counters.get(&id).map_or(0, |c| c.current)
    }

    /// Rounds of `id` compiled under the block instance `parent`
    ///
    /// A counter left behind by an earlier instance of the parent reads 0.
    pub fn rounds_under(&self, id: StatementId, parent: BlockKey) -> u32 {
        self.counters
            .get(&id)
            .filter(|c| c.parent == Some(parent))
            .map_or(0, |c| c.current)
    }

    /// Compilations of `id` since the last reset; 0 if never compiled
    pub fn lifetime_total(&self, id: StatementId) -> u32 {
        self.counters.get(&id).map_or(0, |c| c.lifetime)
    }

    /// Store the final spans of a popped block in its history entry
    pub fn finalize(&mut self, block_key: BlockKey, spans: &[ResultSpan], now: DateTime<Utc>) {
        if let Some(entry) = self
            .history
            .iter_mut()
            .rev()
            .find(|e| e.block_key == block_key)
        {
            entry.spans = spans.to_vec();
            entry.completed_at = Some(now);
        }
    }

    /// Log a user event; ticks are skipped to keep the log bounded
    pub fn record_event(&mut self, event: &RuntimeEvent) {
        if !event.is_tick() {
            self.events.push(*event);
        }
    }

    pub fn history(&self) -> &[HistoryEntry] {
        &self.history
    }

    pub fn events(&self) -> &[RuntimeEvent] {
        &self.events
    }

    pub fn reset(&mut self) {
        self.counters.clear();
        self.history.clear();
        self.events.clear();
    }
}
