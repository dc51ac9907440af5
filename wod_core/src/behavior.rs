//! Behavior modules attached to blocks.
//!
//! A block runs its behaviors in registration order for every event. Each
//! behavior sees the block state as left by the ones before it, may mutate
//! it, and returns the actions it wants applied. Behaviors never touch
//! other blocks: all they get is their own block's state and a read-only
//! context.

use crate::action::{DisplayState, RuntimeAction, Severity};
use crate::event::{EventKind, RuntimeEvent};
use crate::script::{StatementId, TimerDirection};
use crate::trace::ExecutionTrace;
use crate::types::{
    elapsed_ms, BlockKey, BlockStatus, BlockType, MetricValue, ResultSpan, RoundState,
    TimerState,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Block state bucket
// ============================================================================

/// Typed state owned by one block
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct BlockState {
    pub status: BlockStatus,
    pub timer: Option<TimerState>,
    pub rounds: Option<RoundState>,
    pub metrics: Vec<MetricValue>,
    pub spans: Vec<ResultSpan>,
}

impl BlockState {
    pub fn elapsed_ms(&self, now: DateTime<Utc>) -> i64 {
        elapsed_ms(&self.spans, now)
    }

    /// Open a span unless one is already running
    pub fn open_span(&mut self, now: DateTime<Utc>) {
        if !self.spans.last().is_some_and(ResultSpan::is_open) {
            self.spans.push(ResultSpan::open(now));
        }
    }

    pub fn close_span(&mut self, now: DateTime<Utc>) {
        if let Some(span) = self.spans.last_mut().filter(|s| s.is_open()) {
            span.stop = Some(now);
        }
    }
}

/// Read-only view handed to behaviors
pub struct BehaviorContext<'a> {
    pub block_key: BlockKey,
    pub block_type: BlockType,
    pub label: &'a str,
    pub now: DateTime<Utc>,
    pub trace: &'a ExecutionTrace,
    /// Statements the block traverses; empty for leaves
    pub children: &'a [StatementId],
}

impl BehaviorContext<'_> {
    fn display(&self, state: &BlockState) -> RuntimeAction {
        let elapsed = state.elapsed_ms(self.now);
        RuntimeAction::DisplayUpdate(DisplayState {
            block_key: self.block_key,
            block_type: self.block_type,
            label: self.label.to_string(),
            elapsed_ms: elapsed,
            remaining_ms: state.timer.as_ref().and_then(|t| t.remaining_ms(elapsed)),
            round: state.rounds.as_ref().map(|r| r.current),
            total_rounds: state.rounds.as_ref().and_then(|r| r.total),
        })
    }

    fn complete(&self) -> RuntimeAction {
        RuntimeAction::PopBlock {
            block_key: self.block_key,
        }
    }

    fn error(&self, message: impl Into<String>) -> RuntimeAction {
        RuntimeAction::Error {
            block_key: Some(self.block_key),
            severity: Severity::Error,
            message: message.into(),
        }
    }
}

// ============================================================================
// Behaviors
// ============================================================================

/// Behavior attached to a block
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "behavior", rename_all = "snake_case")]
pub enum Behavior {
    Timer(TimerBehavior),
    Completion(CompletionBehavior),
    LoopCoordinator(LoopCoordinator),
}

impl Behavior {
    pub fn name(&self) -> &'static str {
        match self {
            Behavior::Timer(_) => "timer",
            Behavior::Completion(_) => "completion",
            Behavior::LoopCoordinator(_) => "loop_coordinator",
        }
    }

    /// Called once when the block is pushed
    pub fn on_mount(
        &mut self,
        state: &mut BlockState,
        ctx: &BehaviorContext<'_>,
    ) -> Vec<RuntimeAction> {
        match self {
            Behavior::Timer(b) => b.on_mount(state, ctx),
            Behavior::Completion(_) => Vec::new(),
            Behavior::LoopCoordinator(b) => b.on_mount(state, ctx),
        }
    }

    pub fn handle(
        &mut self,
        event: &RuntimeEvent,
        state: &mut BlockState,
        ctx: &BehaviorContext<'_>,
    ) -> Vec<RuntimeAction> {
        match self {
            Behavior::Timer(b) => b.handle(event, state, ctx),
            Behavior::Completion(b) => b.handle(event, ctx),
            Behavior::LoopCoordinator(b) => b.handle(event, state, ctx),
        }
    }
}

/// Tracks elapsed time and ends countdowns
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TimerBehavior {
    pub direction: TimerDirection,
    pub duration_ms: Option<i64>,
}

impl TimerBehavior {
    fn check(&self) -> Option<String> {
        match self.duration_ms {
            Some(d) if d < 0 => Some(format!("timer duration is negative ({} ms)", d)),
            _ => None,
        }
    }

    fn on_mount(&mut self, state: &mut BlockState, ctx: &BehaviorContext<'_>) -> Vec<RuntimeAction> {
        if let Some(message) = self.check() {
            return vec![ctx.error(message)];
        }

        state.timer = Some(TimerState {
            direction: self.direction,
            duration_ms: self.duration_ms,
        });
        vec![ctx.display(state)]
    }

    fn handle(
        &mut self,
        event: &RuntimeEvent,
        state: &mut BlockState,
        ctx: &BehaviorContext<'_>,
    ) -> Vec<RuntimeAction> {
        let Some(timer) = state.timer.as_ref() else {
            return vec![ctx.error("timer state missing")];
        };
        if let Some(message) = self.check() {
            return vec![ctx.error(message)];
        }

        if event.kind != EventKind::Tick {
            return Vec::new();
        }

        let expired = timer.is_expired(state.elapsed_ms(ctx.now));
        let mut actions = vec![ctx.display(state)];
        if expired {
            tracing::debug!("Timer on {} ran out", ctx.label);
            actions.push(ctx.complete());
        }
        actions
    }
}

/// When a block signals it is done
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CompletionTrigger {
    /// The first event of any kind after mount
    FirstEvent,
    /// An explicit Next
    OnNext,
    /// The runtime starting
    OnStart,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct CompletionBehavior {
    pub trigger: CompletionTrigger,
}

impl CompletionBehavior {
    fn handle(&mut self, event: &RuntimeEvent, ctx: &BehaviorContext<'_>) -> Vec<RuntimeAction> {
        let done = match self.trigger {
            CompletionTrigger::FirstEvent => true,
            CompletionTrigger::OnNext => event.kind == EventKind::Next,
            CompletionTrigger::OnStart => event.kind == EventKind::Start,
        };

        if done {
            vec![ctx.complete()]
        } else {
            Vec::new()
        }
    }
}

/// Repeats a group while rounds remain
///
/// Loop semantics are provisional: the block keeps going while the current
/// round is below the total and completes otherwise. Containers consult it
/// at each round boundary through [`LoopCoordinator::begin_round`]; a leaf
/// advances one round per Next.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct LoopCoordinator {
    pub total_rounds: u32,
}

impl LoopCoordinator {
    /// Decide whether another round starts, given how many already did
    pub fn begin_round(&self, state: &mut BlockState, started: u32) -> bool {
        let rounds = state
            .rounds
            .get_or_insert_with(|| RoundState::with_total(self.total_rounds));

        if started < self.total_rounds {
            rounds.current = started + 1;
            true
        } else {
            false
        }
    }

    fn on_mount(&mut self, state: &mut BlockState, ctx: &BehaviorContext<'_>) -> Vec<RuntimeAction> {
        let mut rounds = RoundState::with_total(self.total_rounds);
        if ctx.children.is_empty() {
            rounds.current = 1;
        }
        state.rounds = Some(rounds);

        if ctx.children.is_empty() && state.timer.is_none() {
            vec![ctx.display(state)]
        } else {
            Vec::new()
        }
    }

    fn handle(
        &mut self,
        event: &RuntimeEvent,
        state: &mut BlockState,
        ctx: &BehaviorContext<'_>,
    ) -> Vec<RuntimeAction> {
        if !ctx.children.is_empty() || event.kind != EventKind::Next {
            return Vec::new();
        }

        let Some(rounds) = state.rounds.as_mut() else {
            return vec![ctx.error("loop state missing")];
        };

        if rounds.current >= self.total_rounds {
            vec![ctx.complete()]
        } else {
            rounds.current += 1;
            vec![ctx.display(state)]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn ctx<'a>(trace: &'a ExecutionTrace, key: BlockKey, now: DateTime<Utc>) -> BehaviorContext<'a> {
        BehaviorContext {
            block_key: key,
            block_type: BlockType::Timer,
            label: "test",
            now,
            trace,
            children: &[],
        }
    }

    fn event(kind: EventKind, at: DateTime<Utc>) -> RuntimeEvent {
        RuntimeEvent::new(kind, at)
    }

    #[test]
    fn test_negative_duration_reports_error_on_mount() {
        let trace = ExecutionTrace::new();
        let key = BlockKey::new();
        let now = Utc::now();
        let mut timer = Behavior::Timer(TimerBehavior {
            direction: TimerDirection::Down,
            duration_ms: Some(-5_000),
        });
        let mut state = BlockState::default();

        let actions = timer.on_mount(&mut state, &ctx(&trace, key, now));
        assert_eq!(actions.len(), 1);
        assert!(actions[0].is_error());
        assert!(state.timer.is_none());
    }

    #[test]
    fn test_countdown_completes_on_tick_after_expiry() {
        let trace = ExecutionTrace::new();
        let key = BlockKey::new();
        let t0 = Utc::now();
        let mut timer = Behavior::Timer(TimerBehavior {
            direction: TimerDirection::Down,
            duration_ms: Some(10_000),
        });
        let mut state = BlockState::default();
        state.open_span(t0);
        timer.on_mount(&mut state, &ctx(&trace, key, t0));

        let t1 = t0 + Duration::seconds(4);
        let actions = timer.handle(&event(EventKind::Tick, t1), &mut state, &ctx(&trace, key, t1));
        assert_eq!(actions.len(), 1);
        match &actions[0] {
            RuntimeAction::DisplayUpdate(d) => assert_eq!(d.remaining_ms, Some(6_000)),
            other => panic!("unexpected action {:?}", other),
        }

        let t2 = t0 + Duration::seconds(10);
        let actions = timer.handle(&event(EventKind::Tick, t2), &mut state, &ctx(&trace, key, t2));
        assert!(actions.iter().any(|a| a.completes(key)));
    }

    #[test]
    fn test_completion_triggers() {
        let trace = ExecutionTrace::new();
        let key = BlockKey::new();
        let now = Utc::now();
        let mut state = BlockState::default();

        let mut first = Behavior::Completion(CompletionBehavior {
            trigger: CompletionTrigger::FirstEvent,
        });
        let actions = first.handle(&event(EventKind::Tick, now), &mut state, &ctx(&trace, key, now));
        assert!(actions[0].completes(key));

        let mut on_next = Behavior::Completion(CompletionBehavior {
            trigger: CompletionTrigger::OnNext,
        });
        assert!(on_next
            .handle(&event(EventKind::Tick, now), &mut state, &ctx(&trace, key, now))
            .is_empty());
        assert!(on_next
            .handle(&event(EventKind::Next, now), &mut state, &ctx(&trace, key, now))[0]
            .completes(key));
    }

    #[test]
    fn test_leaf_loop_advances_per_next() {
        let trace = ExecutionTrace::new();
        let key = BlockKey::new();
        let now = Utc::now();
        let mut state = BlockState::default();
        let mut looper = Behavior::LoopCoordinator(LoopCoordinator { total_rounds: 2 });

        looper.on_mount(&mut state, &ctx(&trace, key, now));
        assert_eq!(state.rounds.as_ref().unwrap().current, 1);

        let actions = looper.handle(&event(EventKind::Next, now), &mut state, &ctx(&trace, key, now));
        assert!(!actions.iter().any(|a| a.completes(key)));
        assert_eq!(state.rounds.as_ref().unwrap().current, 2);

        let actions = looper.handle(&event(EventKind::Next, now), &mut state, &ctx(&trace, key, now));
        assert!(actions[0].completes(key));
    }

    #[test]
    fn test_begin_round_stops_at_total() {
        let looper = LoopCoordinator { total_rounds: 3 };
        let mut state = BlockState::default();

        assert!(looper.begin_round(&mut state, 0));
        assert_eq!(state.rounds.as_ref().unwrap().current, 1);
        assert!(looper.begin_round(&mut state, 2));
        assert_eq!(state.rounds.as_ref().unwrap().current, 3);
        assert!(!looper.begin_round(&mut state, 3));
    }

    #[test]
    fn test_span_helpers() {
        let t0 = Utc::now();
        let mut state = BlockState::default();
        state.open_span(t0);
        state.open_span(t0 + Duration::seconds(1));
        assert_eq!(state.spans.len(), 1);

        state.close_span(t0 + Duration::seconds(3));
        assert_eq!(state.elapsed_ms(t0 + Duration::seconds(9)), 3_000);
    }
}
