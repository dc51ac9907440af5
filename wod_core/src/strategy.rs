//! Compilation strategies: matcher + compiler pairs.
//!
//! Built-in precedence, highest first:
//! 1. [`TimeBoundStrategy`] - statement has a timer
//! 2. [`RoundBoundStrategy`] - statement has rounds and no timer
//! 3. [`LapGroupStrategy`] - lap-marked statement with children
//! 4. [`EffortStrategy`] - anything (the fallback)

use crate::behavior::{
    Behavior, CompletionBehavior, CompletionTrigger, LoopCoordinator, TimerBehavior,
};
use crate::block::Block;
use crate::error::CompileError;
use crate::script::{Fragment, Script, Statement, StatementId};
use crate::types::{BlockKey, BlockType, MetricValue};

/// Everything a strategy may read while compiling one statement
pub struct CompileContext<'a> {
    pub script: &'a Script,
    /// Block that will sit below the compiled one
    pub parent: Option<BlockKey>,
    /// Statements the block pushes one at a time
    pub children: Vec<StatementId>,
    /// Lap members folded into the block as one unit
    pub grouped: Vec<StatementId>,
}

impl<'a> CompileContext<'a> {
    /// Split a statement's children into traversal or grouped members
    ///
    /// A lap marker makes the statement a leaf for traversal even though it
    /// has children.
    pub fn for_statement(
        statement: &Statement,
        script: &'a Script,
        parent: Option<BlockKey>,
    ) -> Self {
        let (children, grouped) = if statement.is_lap() {
            (Vec::new(), statement.children.clone())
        } else {
            (statement.children.clone(), Vec::new())
        };

        Self {
            script,
            parent,
            children,
            grouped,
        }
    }

    fn members(&self) -> Vec<&Statement> {
        self.grouped
            .iter()
            .filter_map(|id| self.script.get(*id))
            .collect()
    }

    /// Statement label, with lap members appended
    pub fn label(&self, statement: &Statement) -> String {
        let members: Vec<String> = self.members().iter().map(|s| s.label()).collect();
        if members.is_empty() {
            statement.label()
        } else {
            format!("{} [{}]", statement.label(), members.join(" + "))
        }
    }

    /// Metric fragments of the statement and its lap members
    pub fn metrics(&self, statement: &Statement) -> Vec<MetricValue> {
        let mut sources = vec![statement];
        sources.extend(self.members());

        sources
            .into_iter()
            .flat_map(|s| {
                s.fragments.iter().filter_map(move |f| match f {
                    Fragment::Metric { key, value, unit } => Some(MetricValue {
                        key: key.clone(),
                        value: *value,
                        unit: unit.clone(),
                        source: s.id,
                    }),
                    _ => None,
                })
            })
            .collect()
    }

    /// Block skeleton shared by every strategy
    pub fn block(&self, block_type: BlockType, statement: &Statement) -> Block {
        Block::new(block_type, self.label(statement))
            .with_source(statement.id)
            .with_children(self.children.clone())
            .with_grouped(self.grouped.clone())
            .with_metrics(self.metrics(statement))
    }
}

/// Decides whether it applies to a statement and builds the block if so
pub trait CompileStrategy {
    fn name(&self) -> &'static str;

    fn matches(&self, statement: &Statement) -> bool;

    fn compile(
        &self,
        statement: &Statement,
        ctx: &CompileContext<'_>,
    ) -> Result<Block, CompileError>;
}

fn completion(trigger: CompletionTrigger) -> Behavior {
    Behavior::Completion(CompletionBehavior { trigger })
}

fn loop_over(statement: &Statement, count: u32) -> Result<Behavior, CompileError> {
    if count == 0 {
        return Err(CompileError::InvalidFragment {
            id: statement.id,
            message: "round count must be at least 1".into(),
        });
    }
    Ok(Behavior::LoopCoordinator(LoopCoordinator {
        total_rounds: count,
    }))
}

// ============================================================================
// Built-in strategies
// ============================================================================

/// Statements with a timer fragment
#[derive(Clone, Copy, Debug, Default)]
pub struct TimeBoundStrategy;

impl CompileStrategy for TimeBoundStrategy {
    fn name(&self) -> &'static str {
        "time_bound"
    }

    fn matches(&self, statement: &Statement) -> bool {
        statement.has_timer()
    }

    fn compile(
        &self,
        statement: &Statement,
        ctx: &CompileContext<'_>,
    ) -> Result<Block, CompileError> {
        let (duration_ms, direction) = statement.timer().ok_or(CompileError::MissingFragment {
            id: statement.id,
            fragment: "timer",
        })?;

        let mut block = ctx
            .block(BlockType::Timer, statement)
            .with_behavior(Behavior::Timer(TimerBehavior {
                direction,
                duration_ms: Some(duration_ms),
            }));

        // With rounds the loop decides when a leaf is done
        match statement.rounds() {
            Some(count) => block = block.with_behavior(loop_over(statement, count)?),
            None => block = block.with_behavior(completion(CompletionTrigger::OnNext)),
        }

        Ok(block)
    }
}

/// Statements with rounds but no timer
///
/// The loop behavior installed here is provisional and the piece most
/// likely to change.
#[derive(Clone, Copy, Debug, Default)]
pub struct RoundBoundStrategy;

impl CompileStrategy for RoundBoundStrategy {
    fn name(&self) -> &'static str {
        "round_bound"
    }

    fn matches(&self, statement: &Statement) -> bool {
        statement.has_rounds() && !statement.has_timer()
    }

    fn compile(
        &self,
        statement: &Statement,
        ctx: &CompileContext<'_>,
    ) -> Result<Block, CompileError> {
        let count = statement.rounds().ok_or(CompileError::MissingFragment {
            id: statement.id,
            fragment: "rounds",
        })?;

        Ok(ctx
            .block(BlockType::Rounds, statement)
            .with_behavior(loop_over(statement, count)?))
    }
}

/// Lap-marked statements whose children form one unit
#[derive(Clone, Copy, Debug, Default)]
pub struct LapGroupStrategy;

impl CompileStrategy for LapGroupStrategy {
    fn name(&self) -> &'static str {
        "lap_group"
    }

    fn matches(&self, statement: &Statement) -> bool {
        statement.is_lap()
            && !statement.children.is_empty()
            && !statement.has_timer()
            && !statement.has_rounds()
    }

    fn compile(
        &self,
        statement: &Statement,
        ctx: &CompileContext<'_>,
    ) -> Result<Block, CompileError> {
        if ctx.grouped.is_empty() {
            return Err(CompileError::InvalidFragment {
                id: statement.id,
                message: "lap marker without grouped children".into(),
            });
        }

        Ok(ctx
            .block(BlockType::Group, statement)
            .with_behavior(completion(CompletionTrigger::OnNext)))
    }
}

/// Fallback: matches every statement
///
/// Produces an effort leaf that completes on the first event after mount.
/// A statement with neither fragments nor children becomes a `Completion`
/// placeholder with the same behavior.
#[derive(Clone, Copy, Debug, Default)]
pub struct EffortStrategy;

impl CompileStrategy for EffortStrategy {
    fn name(&self) -> &'static str {
        "effort"
    }

    fn matches(&self, _statement: &Statement) -> bool {
        true
    }

    fn compile(
        &self,
        statement: &Statement,
        ctx: &CompileContext<'_>,
    ) -> Result<Block, CompileError> {
        let block_type = if statement.fragments.is_empty() && statement.children.is_empty() {
            BlockType::Completion
        } else {
            BlockType::Effort
        };

        Ok(ctx
            .block(block_type, statement)
            .with_behavior(completion(CompletionTrigger::FirstEvent)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::TimerDirection;

    fn compile_with(
        strategy: &dyn CompileStrategy,
        statement: &Statement,
        script: &Script,
    ) -> Result<Block, CompileError> {
        let ctx = CompileContext::for_statement(statement, script, None);
        strategy.compile(statement, &ctx)
    }

    #[test]
    fn test_time_bound_block() {
        let stmt = Statement::new(
            1,
            vec![Fragment::Timer {
                duration_ms: 1_200_000,
                direction: TimerDirection::Down,
            }],
        );
        let script = Script::new(vec![stmt.clone()]);

        assert!(TimeBoundStrategy.matches(&stmt));
        let block = compile_with(&TimeBoundStrategy, &stmt, &script).unwrap();
        assert_eq!(block.block_type(), BlockType::Timer);
        assert_eq!(
            block.behaviors()[0],
            Behavior::Timer(TimerBehavior {
                direction: TimerDirection::Down,
                duration_ms: Some(1_200_000),
            })
        );
    }

    #[test]
    fn test_timer_with_rounds_adds_loop() {
        let stmt = Statement::new(
            1,
            vec![
                Fragment::Timer {
                    duration_ms: 600_000,
                    direction: TimerDirection::Up,
                },
                Fragment::Rounds { count: 3 },
            ],
        );
        let script = Script::new(vec![stmt.clone()]);
        let block = compile_with(&TimeBoundStrategy, &stmt, &script).unwrap();

        let names: Vec<_> = block.behaviors().iter().map(Behavior::name).collect();
        assert_eq!(names, vec!["timer", "loop_coordinator"]);
    }

    #[test]
    fn test_zero_rounds_is_compile_error() {
        let stmt = Statement::new(1, vec![Fragment::Rounds { count: 0 }]);
        let script = Script::new(vec![stmt.clone()]);

        assert!(matches!(
            compile_with(&RoundBoundStrategy, &stmt, &script),
            Err(CompileError::InvalidFragment { .. })
        ));
    }

    #[test]
    fn test_lap_children_are_grouped() {
        let mut lap = Statement::new(1, vec![Fragment::Lap]);
        lap.children = vec![StatementId(2), StatementId(3)];
        let mut a = Statement::new(
            2,
            vec![
                Fragment::Metric {
                    key: "reps".into(),
                    value: 10.0,
                    unit: None,
                },
                Fragment::Effort {
                    name: "Pushups".into(),
                },
            ],
        );
        a.parent = Some(StatementId(1));
        let mut b = Statement::new(
            3,
            vec![
                Fragment::Metric {
                    key: "reps".into(),
                    value: 15.0,
                    unit: None,
                },
                Fragment::Effort {
                    name: "Situps".into(),
                },
            ],
        );
        b.parent = Some(StatementId(1));
        let script = Script::new(vec![lap.clone(), a, b]);

        assert!(LapGroupStrategy.matches(&lap));
        let block = compile_with(&LapGroupStrategy, &lap, &script).unwrap();
        assert_eq!(block.block_type(), BlockType::Group);
        assert!(block.children().is_empty());
        assert!(!block.is_container());
        assert_eq!(block.grouped(), &[StatementId(2), StatementId(3)]);
        assert_eq!(block.label(), "+ [10 reps Pushups + 15 reps Situps]");
        assert_eq!(block.state().metrics.len(), 2);
    }

    #[test]
    fn test_fallback_placeholder_for_empty_statement() {
        let empty = Statement::new(1, vec![]);
        let script = Script::new(vec![empty.clone()]);
        let block = compile_with(&EffortStrategy, &empty, &script).unwrap();
        assert_eq!(block.block_type(), BlockType::Completion);

        let effort = Statement::new(
            2,
            vec![Fragment::Effort {
                name: "Run".into(),
            }],
        );
        let block = compile_with(&EffortStrategy, &effort, &script).unwrap();
        assert_eq!(block.block_type(), BlockType::Effort);
    }
}
