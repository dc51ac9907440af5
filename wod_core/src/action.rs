//! Runtime actions: the only externally observable effects of the engine.
//!
//! Every action is plain data so presentation layers and cast transports can
//! serialize it without holding references into the runtime.

use crate::script::StatementId;
use crate::types::{BlockKey, BlockStatus, BlockType, MetricValue, ResultSpan};
use serde::{Deserialize, Serialize};

/// How bad an error action is
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Warning,
    Error,
}

/// Controls a presentation layer should offer
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Button {
    Start,
    Pause,
    Next,
    Stop,
    Reset,
}

/// What the active block wants shown
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct DisplayState {
    pub block_key: BlockKey,
    pub block_type: BlockType,
    pub label: String,
    pub elapsed_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remaining_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub round: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_rounds: Option<u32>,
}

/// Finalised outcome of a popped block
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct BlockResult {
    pub block_key: BlockKey,
    pub block_type: BlockType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<StatementId>,
    pub label: String,
    pub status: BlockStatus,
    pub elapsed_ms: i64,
    pub spans: Vec<ResultSpan>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub metrics: Vec<MetricValue>,
}

/// Effect emitted by a behavior or by the dispatch loop
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuntimeAction {
    DisplayUpdate(DisplayState),
    SetButtons { buttons: Vec<Button> },
    SetResult(BlockResult),
    /// Compile a statement and mount it on top of the stack
    PushBlock { source: StatementId },
    /// Unmount the given block; ignored unless it is the active block
    PopBlock { block_key: BlockKey },
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        block_key: Option<BlockKey>,
        severity: Severity,
        message: String,
    },
}

impl RuntimeAction {
    /// Stable name used as the wire event type
    pub fn event_type(&self) -> &'static str {
        match self {
            RuntimeAction::DisplayUpdate(_) => "display_update",
            RuntimeAction::SetButtons { .. } => "set_buttons",
            RuntimeAction::SetResult(_) => "set_result",
            RuntimeAction::PushBlock { .. } => "push_block",
            RuntimeAction::PopBlock { .. } => "pop_block",
            RuntimeAction::Error { .. } => "error",
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, RuntimeAction::Error { .. })
    }

    /// Whether this action asks for `key` to be popped
    pub fn completes(&self, key: BlockKey) -> bool {
        matches!(self, RuntimeAction::PopBlock { block_key } if *block_key == key)
    }
}
