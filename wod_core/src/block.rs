//! Execution blocks: one compiled statement with its state and behaviors.
//!
//! Lifecycle: `Created` inside a strategy's compile, `Mounted` when pushed,
//! `Completed` once a behavior asks for the block to be popped, and
//! `Unmounted` when the dispatch loop pops it. `Errored` is entered when a
//! behavior reports invalid state.

use crate::action::{BlockResult, RuntimeAction};
use crate::behavior::{Behavior, BehaviorContext, BlockState};
use crate::event::RuntimeEvent;
use crate::memory::{MemoryId, MemorySpace, MemoryValue};
use crate::script::{StatementId, TimerDirection};
use crate::trace::ExecutionTrace;
use crate::types::{BlockKey, BlockStatus, BlockType, MetricValue, RoundState, TimerState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Inputs a container needs to pick its next statement
pub struct NextContext<'a> {
    pub trace: &'a ExecutionTrace,
    pub now: DateTime<Utc>,
}

/// Ids of the memory entries a mounted block published
#[derive(Clone, Debug, Default)]
struct PublishedMemory {
    handlers: Option<MemoryId>,
    timer: Option<MemoryId>,
    rounds: Option<MemoryId>,
    spans: Option<MemoryId>,
}

/// Compiled, executable unit
#[derive(Clone, Debug)]
pub struct Block {
    key: BlockKey,
    id: String,
    label: String,
    block_type: BlockType,
    source: Option<StatementId>,
    pub(crate) parent: Option<BlockKey>,
    behaviors: Vec<Behavior>,
    state: BlockState,
    children: Vec<StatementId>,
    grouped: Vec<StatementId>,
    cursor: usize,
    published: PublishedMemory,
}

impl Block {
    /// Create a block with a fresh key
    pub fn new(block_type: BlockType, label: impl Into<String>) -> Self {
        let id = match block_type {
            BlockType::Root => "root".to_string(),
            BlockType::Idle => "idle".to_string(),
            other => format!("{:?}", other).to_lowercase(),
        };

        Self {
            key: BlockKey::new(),
            id,
            label: label.into(),
            block_type,
            source: None,
            parent: None,
            behaviors: Vec::new(),
            state: BlockState::default(),
            children: Vec::new(),
            grouped: Vec::new(),
            cursor: 0,
            published: PublishedMemory::default(),
        }
    }

    pub fn with_source(mut self, source: StatementId) -> Self {
        self.id = format!("{}:{}", self.id, source.0);
        self.source = Some(source);
        self
    }

    pub fn with_behavior(mut self, behavior: Behavior) -> Self {
        self.behaviors.push(behavior);
        self
    }

    /// Statements pushed one after another beneath this block
    pub fn with_children(mut self, children: Vec<StatementId>) -> Self {
        self.children = children;
        self
    }

    /// Statements folded into this block as one unit
    pub fn with_grouped(mut self, grouped: Vec<StatementId>) -> Self {
        self.grouped = grouped;
        self
    }

    pub fn with_metrics(mut self, metrics: Vec<MetricValue>) -> Self {
        self.state.metrics = metrics;
        self
    }

    pub fn key(&self) -> BlockKey {
        self.key
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn block_type(&self) -> BlockType {
        self.block_type
    }

    pub fn source(&self) -> Option<StatementId> {
        self.source
    }

    pub fn parent(&self) -> Option<BlockKey> {
        self.parent
    }

    pub fn behaviors(&self) -> &[Behavior] {
        &self.behaviors
    }

    pub fn state(&self) -> &BlockState {
        &self.state
    }

    pub fn status(&self) -> BlockStatus {
        self.state.status
    }

    pub fn children(&self) -> &[StatementId] {
        &self.children
    }

    pub fn grouped(&self) -> &[StatementId] {
        &self.grouped
    }

    /// Blocks that push other blocks rather than taking events themselves
    pub fn is_container(&self) -> bool {
        self.block_type == BlockType::Root || !self.children.is_empty()
    }

    pub fn is_errored(&self) -> bool {
        self.state.status == BlockStatus::Errored
    }

    pub fn mark_errored(&mut self) {
        self.state.status = BlockStatus::Errored;
    }

    /// Run every behavior over one event, in registration order
    ///
    /// Stops at the first behavior that reports an error so later ones do
    /// not act on broken state.
    fn run_behaviors<F>(
        &mut self,
        trace: &ExecutionTrace,
        now: DateTime<Utc>,
        mut f: F,
    ) -> Vec<RuntimeAction>
    where
        F: FnMut(&mut Behavior, &mut BlockState, &BehaviorContext<'_>) -> Vec<RuntimeAction>,
    {
        let ctx = BehaviorContext {
            block_key: self.key,
            block_type: self.block_type,
            label: &self.label,
            now,
            trace,
            children: &self.children,
        };

        let mut actions = Vec::new();
        for behavior in self.behaviors.iter_mut() {
            let emitted = f(behavior, &mut self.state, &ctx);
            let failed = emitted.iter().any(RuntimeAction::is_error);
            actions.extend(emitted);
            if failed {
                break;
            }
        }

        let completed = actions.iter().any(|a| a.completes(self.key));
        if completed && self.state.status == BlockStatus::Mounted {
            self.state.status = BlockStatus::Completed;
        }
        actions
    }

    /// Mount the block: open its clock if running, publish memory, run
    /// the behaviors' mount hooks
    pub fn mount(
        &mut self,
        memory: &mut MemorySpace,
        trace: &ExecutionTrace,
        now: DateTime<Utc>,
        running: bool,
    ) -> Vec<RuntimeAction> {
        self.state.status = BlockStatus::Mounted;
        if running {
            self.state.open_span(now);
        }

        let actions = self.run_behaviors(trace, now, |b, state, ctx| b.on_mount(state, ctx));
        self.allocate(memory);
        tracing::debug!("Mounted {} ({})", self.id, self.label);
        actions
    }

    /// Hand one event to the behaviors
    pub fn handle(
        &mut self,
        event: &RuntimeEvent,
        memory: &mut MemorySpace,
        trace: &ExecutionTrace,
    ) -> Vec<RuntimeAction> {
        let actions = self.run_behaviors(trace, event.timestamp, |b, state, ctx| {
            b.handle(event, state, ctx)
        });
        self.publish(memory);
        actions
    }

    /// Next statement this block wants pushed, if any
    pub fn next(&mut self, ctx: &NextContext<'_>) -> Option<StatementId> {
        let first = *self.children.first()?;

        let elapsed = self.state.elapsed_ms(ctx.now);
        if self.state.timer.as_ref().is_some_and(|t| t.is_expired(elapsed)) {
            tracing::debug!("{} time limit reached", self.id);
            return None;
        }

        if self.cursor >= self.children.len() {
            if !self.repeats() {
                return None;
            }
            self.cursor = 0;
        }

        if self.cursor == 0 {
            let started = ctx.trace.rounds_under(first, self.key);
            for behavior in &self.behaviors {
                if let Behavior::LoopCoordinator(looper) = behavior {
                    if !looper.begin_round(&mut self.state, started) {
                        tracing::debug!("{} finished {} rounds", self.id, started);
                        return None;
                    }
                }
            }
        }

        let next = self.children[self.cursor];
        self.cursor += 1;
        Some(next)
    }

    /// Whether children run again after the last one finishes
    fn repeats(&self) -> bool {
        let countdown = self.state.timer.as_ref().is_some_and(|t| {
            t.direction == TimerDirection::Down && t.duration_ms.is_some()
        });
        countdown
            || self
                .behaviors
                .iter()
                .any(|b| matches!(b, Behavior::LoopCoordinator(_)))
    }

    pub fn resume(&mut self, now: DateTime<Utc>) {
        self.state.open_span(now);
    }

    pub fn suspend(&mut self, now: DateTime<Utc>) {
        self.state.close_span(now);
    }

    fn allocate(&mut self, memory: &mut MemorySpace) {
        let names = self.behaviors.iter().map(|b| b.name().to_string()).collect();
        self.published.handlers = Some(memory.allocate(self.key, MemoryValue::Handlers(names)));

        if let Some(timer) = &self.state.timer {
            self.published.timer =
                Some(memory.allocate(self.key, MemoryValue::TimerState(timer.clone())));
        }
        if let Some(rounds) = &self.state.rounds {
            self.published.rounds =
                Some(memory.allocate(self.key, MemoryValue::LoopState(rounds.clone())));
        }
        for metric in &self.state.metrics {
            memory.allocate(self.key, MemoryValue::Metric(metric.clone()));
        }
        self.published.spans =
            Some(memory.allocate(self.key, MemoryValue::Spans(self.state.spans.clone())));
    }

    /// Push the current state into this block's memory entries
    pub fn publish(&self, memory: &mut MemorySpace) {
        let updates = [
            (
                self.published.timer,
                self.state.timer.clone().map(MemoryValue::TimerState),
            ),
            (
                self.published.rounds,
                self.state.rounds.clone().map(MemoryValue::LoopState),
            ),
            (
                self.published.spans,
                Some(MemoryValue::Spans(self.state.spans.clone())),
            ),
        ];

        for (id, value) in updates {
            if let (Some(id), Some(value)) = (id, value) {
                if let Err(e) = memory.update(id, self.key, value) {
                    tracing::warn!("Failed to publish state of {}: {}", self.id, e);
                }
            }
        }
    }

    /// Unmount: stop the clock, drop behaviors, invalidate memory
    ///
    /// Returns the finalised result for the trace and observers.
    pub fn unmount(&mut self, memory: &mut MemorySpace, now: DateTime<Utc>) -> BlockResult {
        self.suspend(now);
        self.publish(memory);
        self.behaviors.clear();
        memory.invalidate_owner(self.key);

        let result = BlockResult {
            block_key: self.key,
            block_type: self.block_type,
            source: self.source,
            label: self.label.clone(),
            status: self.state.status,
            elapsed_ms: self.state.elapsed_ms(now),
            spans: self.state.spans.clone(),
            metrics: self.state.metrics.clone(),
        };

        self.state.status = BlockStatus::Unmounted;
        tracing::debug!("Unmounted {} after {} ms", self.id, result.elapsed_ms);
        result
    }

    /// Serializable view for inspection
    pub fn snapshot(&self, now: DateTime<Utc>) -> BlockSnapshot {
        BlockSnapshot {
            key: self.key,
            id: self.id.clone(),
            label: self.label.clone(),
            block_type: self.block_type,
            source: self.source,
            parent: self.parent,
            status: self.state.status,
            behaviors: self.behaviors.iter().map(|b| b.name().to_string()).collect(),
            elapsed_ms: self.state.elapsed_ms(now),
            timer: self.state.timer.clone(),
            rounds: self.state.rounds.clone(),
        }
    }
}

/// Read-only description of a mounted block
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct BlockSnapshot {
    pub key: BlockKey,
    pub id: String,
    pub label: String,
    pub block_type: BlockType,
    pub source: Option<StatementId>,
    pub parent: Option<BlockKey>,
    pub status: BlockStatus,
    pub behaviors: Vec<String>,
    pub elapsed_ms: i64,
    pub timer: Option<TimerState>,
    pub rounds: Option<RoundState>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::behavior::{CompletionBehavior, CompletionTrigger, LoopCoordinator, TimerBehavior};
    use crate::event::EventKind;
    use crate::memory::{MemoryFilter, MemoryKind};
    use chrono::Duration;

    fn effort(source: u32) -> Block {
        Block::new(BlockType::Effort, "Pullups")
            .with_source(StatementId(source))
            .with_behavior(Behavior::Completion(CompletionBehavior {
                trigger: CompletionTrigger::FirstEvent,
            }))
    }

    #[test]
    fn test_mount_publishes_memory() {
        let mut memory = MemorySpace::new();
        let trace = ExecutionTrace::new();
        let mut block = Block::new(BlockType::Timer, "20:00 AMRAP")
            .with_source(StatementId(1))
            .with_behavior(Behavior::Timer(TimerBehavior {
                direction: TimerDirection::Down,
                duration_ms: Some(1_200_000),
            }));

        let actions = block.mount(&mut memory, &trace, Utc::now(), false);
        assert_eq!(actions.len(), 1);
        assert_eq!(block.status(), BlockStatus::Mounted);
        assert_eq!(block.state().timer.as_ref().unwrap().duration_ms, Some(1_200_000));

        let owned = memory.search(&MemoryFilter::owner(block.key()));
        assert!(owned.iter().any(|e| e.kind == MemoryKind::TimerState));
        assert!(owned.iter().any(|e| e.kind == MemoryKind::Handlers));
        assert!(owned.iter().any(|e| e.kind == MemoryKind::Spans));
    }

    #[test]
    fn test_first_event_completes_effort() {
        let mut memory = MemorySpace::new();
        let trace = ExecutionTrace::new();
        let mut block = effort(2);
        let now = Utc::now();

        assert!(block.mount(&mut memory, &trace, now, true).is_empty());
        let actions = block.handle(&RuntimeEvent::new(EventKind::Tick, now), &mut memory, &trace);

        assert!(actions[0].completes(block.key()));
        assert_eq!(block.status(), BlockStatus::Completed);
    }

    #[test]
    fn test_error_stops_later_behaviors() {
        let mut memory = MemorySpace::new();
        let trace = ExecutionTrace::new();
        let mut block = Block::new(BlockType::Timer, "bad")
            .with_behavior(Behavior::Timer(TimerBehavior {
                direction: TimerDirection::Down,
                duration_ms: Some(-1),
            }))
            .with_behavior(Behavior::Completion(CompletionBehavior {
                trigger: CompletionTrigger::FirstEvent,
            }));
        let now = Utc::now();
        block.mount(&mut memory, &trace, now, true);

        let actions = block.handle(&RuntimeEvent::new(EventKind::Next, now), &mut memory, &trace);
        assert_eq!(actions.len(), 1);
        assert!(actions[0].is_error());
        assert_eq!(block.status(), BlockStatus::Mounted);
    }

    #[test]
    fn test_unmount_invalidates_memory_and_finalises_spans() {
        let mut memory = MemorySpace::new();
        let trace = ExecutionTrace::new();
        let mut block = effort(3);
        let t0 = Utc::now();
        block.mount(&mut memory, &trace, t0, true);

        let result = block.unmount(&mut memory, t0 + Duration::seconds(30));
        assert_eq!(result.elapsed_ms, 30_000);
        assert!(result.spans.iter().all(|s| !s.is_open()));
        assert_eq!(block.status(), BlockStatus::Unmounted);
        assert!(block.behaviors().is_empty());
        assert!(memory
            .search(&MemoryFilter::owner(block.key()))
            .iter()
            .all(|e| !e.valid));
    }

    #[test]
    fn test_next_walks_children_once_without_loop() {
        let trace = ExecutionTrace::new();
        let mut block = Block::new(BlockType::Root, "root")
            .with_children(vec![StatementId(1), StatementId(2)]);
        let ctx = NextContext {
            trace: &trace,
            now: Utc::now(),
        };

        assert_eq!(block.next(&ctx), Some(StatementId(1)));
        assert_eq!(block.next(&ctx), Some(StatementId(2)));
        assert_eq!(block.next(&ctx), None);
    }

    #[test]
    fn test_next_stops_when_countdown_expired() {
        let mut memory = MemorySpace::new();
        let trace = ExecutionTrace::new();
        let mut block = Block::new(BlockType::Timer, "1:00 AMRAP")
            .with_behavior(Behavior::Timer(TimerBehavior {
                direction: TimerDirection::Down,
                duration_ms: Some(60_000),
            }))
            .with_children(vec![StatementId(2)]);
        let t0 = Utc::now();
        block.mount(&mut memory, &trace, t0, true);

        let early = NextContext { trace: &trace, now: t0 + Duration::seconds(10) };
        assert_eq!(block.next(&early), Some(StatementId(2)));
        // Countdown containers repeat their children
        assert_eq!(block.next(&early), Some(StatementId(2)));

        let late = NextContext { trace: &trace, now: t0 + Duration::seconds(61) };
        assert_eq!(block.next(&late), None);
    }

    #[test]
    fn test_loop_container_asks_coordinator_each_round() {
        let trace = ExecutionTrace::new();
        let mut block = Block::new(BlockType::Rounds, "(2)")
            .with_behavior(Behavior::LoopCoordinator(LoopCoordinator { total_rounds: 2 }))
            .with_children(vec![StatementId(5)]);
        let ctx = NextContext { trace: &trace, now: Utc::now() };

        // Empty trace: no round of the child has started yet
        assert_eq!(block.next(&ctx), Some(StatementId(5)));
        assert_eq!(block.state().rounds.as_ref().unwrap().current, 1);
    }
}
