//! Dispatch loop: turns events into actions by driving the block stack.
//!
//! The runtime owns every moving part (script, registry, stack, trace and
//! memory) and processes one event at a time. Each event is handled to the
//! end, including every push and pop it causes, before the next one is
//! taken off the queue.
//!
//! ## Clock
//!
//! - `Idle`: compiled but not started; an idle block sits above the root
//! - `Running`: every mounted block has an open span and ticks are delivered
//! - `Paused`: spans closed, ticks dropped
//! - `Done`: the stack emptied or Stop was issued; only Reset does anything

use crate::action::{Button, RuntimeAction, Severity};
use crate::block::{Block, BlockSnapshot, NextContext};
use crate::compiler::StrategyRegistry;
use crate::event::{EventKind, RuntimeEvent};
use crate::memory::{MemoryEntry, MemoryFilter, MemorySpace};
use crate::script::{Script, StatementId};
use crate::stack::ExecutionStack;
use crate::trace::{ExecutionTrace, HistoryEntry};
use crate::types::{BlockKey, BlockType};
use crate::wire::ActionSink;
use crate::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::mpsc::Receiver;

/// Where the runtime clock stands
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    Idle,
    Running,
    Paused,
    Done,
}

/// Everything an inspector may want, detached from the runtime
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct RuntimeSnapshot {
    pub status: RunStatus,
    pub at: DateTime<Utc>,
    pub stack: Vec<BlockSnapshot>,
    pub memory: Vec<MemoryEntry>,
    pub history: Vec<HistoryEntry>,
    pub events: Vec<RuntimeEvent>,
}

pub struct Runtime {
    script: Script,
    registry: StrategyRegistry,
    stack: ExecutionStack,
    trace: ExecutionTrace,
    memory: MemorySpace,
    queue: VecDeque<RuntimeEvent>,
    /// Actions produced outside of event handling (initial load)
    outbox: Vec<RuntimeAction>,
    status: RunStatus,
    /// Timestamp of the last event handled
    now: DateTime<Utc>,
}

impl Runtime {
    /// Runtime with the built-in strategies
    pub fn new(script: Script) -> Self {
        Self::with_registry(script, StrategyRegistry::default())
    }

    pub fn with_registry(script: Script, registry: StrategyRegistry) -> Self {
        Self::starting_at(script, registry, Utc::now())
    }

    /// Runtime whose clock starts at `now` (virtual clocks, tests)
    pub fn starting_at(script: Script, registry: StrategyRegistry, now: DateTime<Utc>) -> Self {
        let mut runtime = Self {
            script,
            registry,
            stack: ExecutionStack::new(),
            trace: ExecutionTrace::new(),
            memory: MemorySpace::new(),
            queue: VecDeque::new(),
            outbox: Vec::new(),
            status: RunStatus::Idle,
            now,
        };
        let problems = runtime.script.validate();
        for problem in &problems {
            tracing::warn!("Script problem: {}", problem);
        }
        runtime.outbox = problems
            .into_iter()
            .map(|message| RuntimeAction::Error {
                block_key: None,
                severity: Severity::Warning,
                message,
            })
            .collect();
        let loaded = runtime.load(now);
        runtime.outbox.extend(loaded);
        tracing::info!(
            "Runtime ready with {} statements",
            runtime.script.len()
        );
        runtime
    }

    /// Queue an event; nothing is dropped or merged
    pub fn enqueue(&mut self, event: RuntimeEvent) {
        self.queue.push_back(event);
    }

    /// Handle every queued event in arrival order
    pub fn dispatch(&mut self) -> Vec<RuntimeAction> {
        let mut actions = std::mem::take(&mut self.outbox);
        while let Some(event) = self.queue.pop_front() {
            actions.extend(self.handle_event(event));
        }
        actions
    }

    /// Feed events from a channel until it closes or the workout is done
    pub fn run(&mut self, events: Receiver<RuntimeEvent>, sink: &mut dyn ActionSink) -> Result<()> {
        for action in std::mem::take(&mut self.outbox) {
            sink.emit(&action, self.now)?;
        }

        for event in events {
            self.enqueue(event);
            for action in self.dispatch() {
                sink.emit(&action, self.now)?;
            }
            if self.status == RunStatus::Done {
                tracing::info!("Workout done, leaving event loop");
                break;
            }
        }
        Ok(())
    }

    /// Handle one event completely
    pub fn handle_event(&mut self, event: RuntimeEvent) -> Vec<RuntimeAction> {
        if event.is_tick() && self.status != RunStatus::Running {
            return Vec::new();
        }

        let now = event.timestamp;
        self.now = now;
        if !event.is_tick() {
            tracing::debug!("Event {} while {:?}", event.kind, self.status);
        }

        let actions = match event.kind {
            EventKind::Reset => self.reset(now),
            EventKind::Stop => self.stop(now),
            _ if self.status == RunStatus::Done => {
                tracing::debug!("Ignoring {} after the workout ended", event.kind);
                Vec::new()
            }
            EventKind::Start => self.start(&event),
            EventKind::Pause => self.pause(now),
            EventKind::Next | EventKind::Tick => self.deliver(&event),
        };

        // Reset starts a fresh log rather than opening it
        if event.kind != EventKind::Reset {
            self.trace.record_event(&event);
        }
        actions
    }

    // ------------------------------------------------------------------
    // Clock commands
    // ------------------------------------------------------------------

    fn start(&mut self, event: &RuntimeEvent) -> Vec<RuntimeAction> {
        let was = self.status;
        if was == RunStatus::Running {
            return Vec::new();
        }

        for block in self.stack.blocks_mut() {
            block.resume(event.timestamp);
            block.publish(&mut self.memory);
        }
        self.status = RunStatus::Running;
        tracing::info!("Clock running");

        let mut actions = vec![buttons(self.status)];
        // Only the first Start reaches a block: it releases the idle block
        if was == RunStatus::Idle {
            actions.extend(self.deliver(event));
        }
        actions
    }

    fn pause(&mut self, now: DateTime<Utc>) -> Vec<RuntimeAction> {
        if self.status != RunStatus::Running {
            return Vec::new();
        }

        for block in self.stack.blocks_mut() {
            block.suspend(now);
            block.publish(&mut self.memory);
        }
        self.status = RunStatus::Paused;
        tracing::info!("Clock paused");
        vec![buttons(self.status)]
    }

    /// Pop everything, reporting each result
    fn stop(&mut self, now: DateTime<Utc>) -> Vec<RuntimeAction> {
        if self.status == RunStatus::Done {
            return Vec::new();
        }

        let mut actions = Vec::new();
        while let Some(key) = self.stack.current().map(Block::key) {
            actions.push(RuntimeAction::PopBlock { block_key: key });
            actions.extend(self.pop(now));
        }
        actions.extend(self.finish());
        actions
    }

    /// Drop all state and compile the script again
    fn reset(&mut self, now: DateTime<Utc>) -> Vec<RuntimeAction> {
        for mut block in self.stack.drain() {
            block.unmount(&mut self.memory, now);
        }
        self.memory.clear();
        self.trace.reset();
        self.status = RunStatus::Idle;
        tracing::info!("Runtime reset");
        self.load(now)
    }

    fn finish(&mut self) -> Vec<RuntimeAction> {
        self.status = RunStatus::Done;
        tracing::info!("Workout complete");
        vec![buttons(self.status)]
    }

    // ------------------------------------------------------------------
    // Stack movement
    // ------------------------------------------------------------------

    /// Mount root and the idle block
    fn load(&mut self, now: DateTime<Utc>) -> Vec<RuntimeAction> {
        let root = self.registry.compile_root(&self.script);
        let idle = self.registry.idle_block();

        let mut actions = self.mount(root, now);
        actions.extend(self.mount(idle, now));
        actions.push(buttons(self.status));
        actions
    }

    /// Hand an event to the active block and apply what it asks for
    fn deliver(&mut self, event: &RuntimeEvent) -> Vec<RuntimeAction> {
        let Some(block) = self.stack.current_mut() else {
            return Vec::new();
        };

        if block.is_errored() {
            // Next skips past a broken block; everything else is ignored
            if event.kind == EventKind::Next {
                let key = block.key();
                return self.apply(vec![RuntimeAction::PopBlock { block_key: key }], event.timestamp);
            }
            return Vec::new();
        }

        let emitted = block.handle(event, &mut self.memory, &self.trace);
        self.apply(emitted, event.timestamp)
    }

    /// Apply actions in order, passing observable ones through
    fn apply(&mut self, actions: Vec<RuntimeAction>, now: DateTime<Utc>) -> Vec<RuntimeAction> {
        let mut out = Vec::new();

        for action in actions {
            match action {
                RuntimeAction::PopBlock { block_key } => {
                    if self.stack.current().map(Block::key) != Some(block_key) {
                        tracing::warn!("Ignoring pop of {}: not the active block", block_key);
                        continue;
                    }
                    out.push(action);
                    out.extend(self.pop(now));
                    out.extend(self.advance(now));
                }
                RuntimeAction::PushBlock { source } => {
                    out.push(action);
                    match self.push_statement(source, now) {
                        Some(mounted) => {
                            out.extend(mounted);
                            out.extend(self.advance(now));
                        }
                        None => out.push(RuntimeAction::Error {
                            block_key: self.stack.current().map(Block::key),
                            severity: Severity::Warning,
                            message: format!("unknown statement {}", source),
                        }),
                    }
                }
                RuntimeAction::Error {
                    block_key,
                    severity,
                    ref message,
                } => {
                    tracing::warn!("Block {:?} reported: {}", block_key, message);
                    if let (Some(key), Severity::Error) = (block_key, severity) {
                        self.mark_errored(key);
                    }
                    out.push(action);
                }
                other => out.push(other),
            }
        }
        out
    }

    fn mark_errored(&mut self, key: BlockKey) {
        if let Some(block) = self.stack.get_mut(key) {
            block.mark_errored();
        }
    }

    /// Push a compiled block and run its mount hooks
    fn mount(&mut self, block: Block, now: DateTime<Utc>) -> Vec<RuntimeAction> {
        let running = self.status == RunStatus::Running;
        self.stack.push(block);
        self.trace.set(&self.stack, now);

        let Some(top) = self.stack.current_mut() else {
            return Vec::new();
        };
        tracing::info!("Pushed {} ({})", top.id(), top.label());
        let emitted = top.mount(&mut self.memory, &self.trace, now, running);

        let mut out = Vec::new();
        for action in emitted {
            if let RuntimeAction::Error {
                block_key: Some(key),
                severity: Severity::Error,
                ref message,
            } = action
            {
                tracing::warn!("Block {} failed to mount: {}", key, message);
                self.mark_errored(key);
            }
            out.push(action);
        }
        out
    }

    /// Compile and mount a statement; `None` when the script has no such id
    fn push_statement(
        &mut self,
        source: StatementId,
        now: DateTime<Utc>,
    ) -> Option<Vec<RuntimeAction>> {
        let parent = self.stack.current().map(Block::key);
        let Some(statement) = self.script.get(source) else {
            tracing::warn!("Cannot push unknown statement {}", source);
            return None;
        };

        let block = self.registry.compile(statement, &self.script, parent);
        Some(self.mount(block, now))
    }

    fn pop(&mut self, now: DateTime<Utc>) -> Vec<RuntimeAction> {
        let Some(mut block) = self.stack.pop() else {
            return Vec::new();
        };

        let result = block.unmount(&mut self.memory, now);
        self.trace.finalize(block.key(), &result.spans, now);
        tracing::info!("Popped {} after {} ms", block.id(), result.elapsed_ms);

        // Every block under a popped container is gone too
        if block.is_container() {
            let swept = self.memory.sweep();
            tracing::debug!("Swept {} invalid memory entries", swept);
        }

        if block.block_type() == BlockType::Idle {
            Vec::new()
        } else {
            vec![RuntimeAction::SetResult(result)]
        }
    }

    /// Descend until a leaf is active, popping exhausted containers
    fn advance(&mut self, now: DateTime<Utc>) -> Vec<RuntimeAction> {
        let mut out = Vec::new();

        loop {
            let Some(top) = self.stack.current_mut() else {
                if self.status != RunStatus::Done {
                    out.extend(self.finish());
                }
                break;
            };
            if !top.is_container() || top.is_errored() {
                break;
            }

            let key = top.key();
            let next = top.next(&NextContext {
                trace: &self.trace,
                now,
            });
            top.publish(&mut self.memory);

            match next {
                Some(source) => {
                    out.push(RuntimeAction::PushBlock { source });
                    match self.push_statement(source, now) {
                        Some(mounted) => out.extend(mounted),
                        None => {
                            // The container would ask for the same child again
                            self.mark_errored(key);
                            out.push(RuntimeAction::Error {
                                block_key: Some(key),
                                severity: Severity::Error,
                                message: format!("unknown statement {}", source),
                            });
                            break;
                        }
                    }
                }
                None => {
                    out.push(RuntimeAction::PopBlock { block_key: key });
                    out.extend(self.pop(now));
                }
            }
        }
        out
    }

    // ------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------

    pub fn status(&self) -> RunStatus {
        self.status
    }

    pub fn script(&self) -> &Script {
        &self.script
    }

    pub fn registry(&self) -> &StrategyRegistry {
        &self.registry
    }

    pub fn stack(&self) -> &ExecutionStack {
        &self.stack
    }

    pub fn trace(&self) -> &ExecutionTrace {
        &self.trace
    }

    pub fn memory(&self) -> &MemorySpace {
        &self.memory
    }

    /// Events waiting to be dispatched
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Bottom-to-top view of the stack as of the last event
    pub fn stack_snapshot(&self) -> Vec<BlockSnapshot> {
        self.stack.snapshot(self.now)
    }

    pub fn memory_snapshot(&self, filter: &MemoryFilter) -> Vec<MemoryEntry> {
        self.memory.search(filter).into_iter().cloned().collect()
    }

    pub fn snapshot(&self) -> RuntimeSnapshot {
        RuntimeSnapshot {
            status: self.status,
            at: self.now,
            stack: self.stack_snapshot(),
            memory: self.memory_snapshot(&MemoryFilter::default()),
            history: self.trace.history().to_vec(),
            events: self.trace.events().to_vec(),
        }
    }
}

/// Controls that make sense in each clock state
fn buttons(status: RunStatus) -> RuntimeAction {
    let buttons = match status {
        RunStatus::Idle => vec![Button::Start],
        RunStatus::Running => vec![Button::Pause, Button::Next, Button::Stop],
        RunStatus::Paused => vec![Button::Start, Button::Stop, Button::Reset],
        RunStatus::Done => vec![Button::Reset],
    };
    RuntimeAction::SetButtons { buttons }
}
