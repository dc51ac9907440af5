#![forbid(unsafe_code)]

//! Core runtime for workout scripts.
//!
//! This crate provides:
//! - Statement model loaded from parser output
//! - Strategy registry compiling statements into execution blocks
//! - Blocks built from composable behaviors
//! - Execution stack, trace and owned memory space
//! - Event dispatch loop emitting runtime actions
//! - Wire envelope and sinks for observers

pub mod types;
pub mod error;
pub mod config;
pub mod logging;
pub mod script;
pub mod event;
pub mod action;
pub mod memory;
pub mod behavior;
pub mod block;
pub mod stack;
pub mod trace;
pub mod strategy;
pub mod compiler;
pub mod runtime;
pub mod feed;
pub mod wire;

// Re-export commonly used types
pub use error::{CompileError, Error, Result};
pub use types::*;
pub use config::{Config, OutputFormat};
pub use script::{Fragment, Script, Statement, StatementId, TimerDirection};
pub use event::{EventKind, RuntimeEvent};
pub use action::{Button, RuntimeAction, Severity};
pub use memory::{MemoryFilter, MemoryKind, MemorySpace};
pub use block::{Block, BlockSnapshot};
pub use compiler::{build_default_registry, StrategyRegistry};
pub use runtime::{RunStatus, Runtime, RuntimeSnapshot};
pub use feed::{EventFeed, Ticker};
pub use wire::{ActionSink, JsonlSink, WireMessage};
