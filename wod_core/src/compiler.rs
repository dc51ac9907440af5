//! Strategy registry: compiles statements into blocks.
//!
//! Strategies are tried in order and the first match compiles the
//! statement. A fallback that accepts anything always sits at the end, so
//! every statement compiles to some block.

use crate::behavior::{Behavior, CompletionBehavior, CompletionTrigger};
use crate::block::Block;
use crate::script::{Script, Statement};
use crate::strategy::{
    CompileContext, CompileStrategy, EffortStrategy, LapGroupStrategy, RoundBoundStrategy,
    TimeBoundStrategy,
};
use crate::types::{BlockKey, BlockType};

/// Ordered strategy list with a mandatory terminal fallback
pub struct StrategyRegistry {
    strategies: Vec<Box<dyn CompileStrategy>>,
    fallback: Box<dyn CompileStrategy>,
}

impl Default for StrategyRegistry {
    fn default() -> Self {
        build_default_registry()
    }
}

/// Registry with the built-in strategies in precedence order
pub fn build_default_registry() -> StrategyRegistry {
    let mut registry = StrategyRegistry::new(Box::new(EffortStrategy));
    registry.register(Box::new(TimeBoundStrategy));
    registry.register(Box::new(RoundBoundStrategy));
    registry.register(Box::new(LapGroupStrategy));
    registry
}

impl StrategyRegistry {
    /// Empty registry; `fallback` must accept every statement
    pub fn new(fallback: Box<dyn CompileStrategy>) -> Self {
        Self {
            strategies: Vec::new(),
            fallback,
        }
    }

    /// Append a strategy just ahead of the fallback
    pub fn register(&mut self, strategy: Box<dyn CompileStrategy>) {
        self.strategies.push(strategy);
    }

    /// Insert a strategy at an explicit precedence position
    ///
    /// Callers must keep time-bound strategies ahead of round-bound ones.
    pub fn insert(&mut self, index: usize, strategy: Box<dyn CompileStrategy>) {
        let index = index.min(self.strategies.len());
        self.strategies.insert(index, strategy);
    }

    /// Names in the order they are tried, fallback last
    pub fn strategy_names(&self) -> Vec<&'static str> {
        self.strategies
            .iter()
            .chain(std::iter::once(&self.fallback))
            .map(|s| s.name())
            .collect()
    }

    /// Strategy that wins for this statement
    pub fn select(&self, statement: &Statement) -> &dyn CompileStrategy {
        match self.strategies.iter().find(|s| s.matches(statement)) {
            Some(strategy) => strategy.as_ref(),
            None => self.fallback.as_ref(),
        }
    }

    /// Compile a statement for mounting above `parent`
    ///
    /// A matching strategy that fails hands the statement to the fallback.
    pub fn compile(&self, statement: &Statement, script: &Script, parent: Option<BlockKey>) -> Block {
        let ctx = CompileContext::for_statement(statement, script, parent);
        let strategy = self.select(statement);

        match strategy.compile(statement, &ctx) {
            Ok(block) => {
                tracing::info!(
                    "Compiled {} with {} -> {}",
                    statement.id,
                    strategy.name(),
                    block.id()
                );
                return block;
            }
            Err(e) => {
                tracing::warn!(
                    "Strategy {} rejected {}: {}. Using fallback.",
                    strategy.name(),
                    statement.id,
                    e
                );
            }
        }

        match self.fallback.compile(statement, &ctx) {
            Ok(block) => block,
            Err(e) => {
                tracing::error!("Fallback failed on {}: {}", statement.id, e);
                Block::new(BlockType::Completion, statement.label())
                    .with_source(statement.id)
                    .with_behavior(Behavior::Completion(CompletionBehavior {
                        trigger: CompletionTrigger::FirstEvent,
                    }))
            }
        }
    }

    /// Root block walking the script's top-level statements
    pub fn compile_root(&self, script: &Script) -> Block {
        Block::new(BlockType::Root, "Workout").with_children(script.roots())
    }

    /// Block waiting for the first Start
    pub fn idle_block(&self) -> Block {
        Block::new(BlockType::Idle, "Ready").with_behavior(Behavior::Completion(
            CompletionBehavior {
                trigger: CompletionTrigger::OnStart,
            },
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CompileError;
    use crate::script::{Fragment, StatementId, TimerDirection};

    fn timer(ms: i64) -> Fragment {
        Fragment::Timer {
            duration_ms: ms,
            direction: TimerDirection::Down,
        }
    }

    fn all_strategies() -> Vec<Box<dyn CompileStrategy>> {
        vec![
            Box::new(TimeBoundStrategy),
            Box::new(RoundBoundStrategy),
            Box::new(LapGroupStrategy),
            Box::new(EffortStrategy),
        ]
    }

    #[test]
    fn test_default_precedence() {
        let registry = build_default_registry();
        assert_eq!(
            registry.strategy_names(),
            vec!["time_bound", "round_bound", "lap_group", "effort"]
        );
    }

    #[test]
    fn test_amrap_selects_time_bound() {
        let registry = build_default_registry();
        let mut stmt = Statement::new(1, vec![timer(1_200_000)]);
        stmt.meta.text = Some("20:00 AMRAP".into());
        let script = Script::new(vec![stmt.clone()]);

        assert_eq!(registry.select(&stmt).name(), "time_bound");
        let block = registry.compile(&stmt, &script, None);
        assert_eq!(block.block_type(), BlockType::Timer);

        // Duration lands in the timer state once mounted
        let mut memory = crate::memory::MemorySpace::new();
        let trace = crate::trace::ExecutionTrace::new();
        let mut block = block;
        block.mount(&mut memory, &trace, chrono::Utc::now(), false);
        assert_eq!(block.state().timer.as_ref().unwrap().duration_ms, Some(1_200_000));
    }

    #[test]
    fn test_rounds_without_timer_selects_round_bound() {
        let registry = build_default_registry();
        let stmt = Statement::new(2, vec![Fragment::Rounds { count: 5 }]);
        assert_eq!(registry.select(&stmt).name(), "round_bound");

        let both = Statement::new(3, vec![Fragment::Rounds { count: 5 }, timer(60_000)]);
        assert_eq!(registry.select(&both).name(), "time_bound");
    }

    #[test]
    fn test_plain_statement_selects_fallback() {
        let registry = build_default_registry();
        let stmt = Statement::new(
            4,
            vec![Fragment::Effort {
                name: "Run 400m".into(),
            }],
        );
        assert_eq!(registry.select(&stmt).name(), "effort");
        assert_eq!(registry.select(&Statement::new(5, vec![])).name(), "effort");
    }

    #[test]
    fn test_first_match_is_unique_in_precedence_order() {
        let registry = build_default_registry();
        let samples = vec![
            Statement::new(1, vec![timer(1_000)]),
            Statement::new(2, vec![Fragment::Rounds { count: 3 }]),
            Statement::new(3, vec![Fragment::Rounds { count: 3 }, timer(1_000)]),
            Statement::new(4, vec![Fragment::Lap]),
            Statement::new(5, vec![]),
        ];

        for stmt in &samples {
            let first = all_strategies()
                .into_iter()
                .find(|s| s.matches(stmt))
                .map(|s| s.name());
            assert_eq!(first, Some(registry.select(stmt).name()));
        }
    }

    #[test]
    fn test_recompile_gives_fresh_key_same_configuration() {
        let registry = build_default_registry();
        let stmt = Statement::new(1, vec![timer(300_000), Fragment::Rounds { count: 3 }]);
        let script = Script::new(vec![stmt.clone()]);

        let a = registry.compile(&stmt, &script, None);
        let b = registry.compile(&stmt, &script, None);
        assert_ne!(a.key(), b.key());
        assert_eq!(a.block_type(), b.block_type());
        assert_eq!(a.behaviors(), b.behaviors());
    }

    #[test]
    fn test_compile_error_falls_back() {
        let registry = build_default_registry();
        let stmt = Statement::new(6, vec![Fragment::Rounds { count: 0 }]);
        let script = Script::new(vec![stmt.clone()]);

        let block = registry.compile(&stmt, &script, None);
        assert_eq!(block.block_type(), BlockType::Effort);
        assert_eq!(block.source(), Some(StatementId(6)));
    }

    struct Rejecting;

    impl CompileStrategy for Rejecting {
        fn name(&self) -> &'static str {
            "rejecting"
        }

        fn matches(&self, _statement: &Statement) -> bool {
            true
        }

        fn compile(
            &self,
            statement: &Statement,
            _ctx: &CompileContext<'_>,
        ) -> Result<Block, CompileError> {
            Err(CompileError::MissingFragment {
                id: statement.id,
                fragment: "anything",
            })
        }
    }

    #[test]
    fn test_registered_strategy_runs_before_fallback() {
        let mut registry = build_default_registry();
        registry.insert(0, Box::new(Rejecting));
        assert_eq!(registry.strategy_names()[0], "rejecting");

        let stmt = Statement::new(7, vec![timer(10_000)]);
        let script = Script::new(vec![stmt.clone()]);
        // Rejecting wins selection, fails, and the fallback takes over
        let block = registry.compile(&stmt, &script, None);
        assert_eq!(block.block_type(), BlockType::Effort);
    }

    #[test]
    fn test_root_walks_top_level_statements() {
        let registry = build_default_registry();
        let mut child = Statement::new(2, vec![]);
        child.parent = Some(StatementId(1));
        let mut parent = Statement::new(1, vec![Fragment::Rounds { count: 2 }]);
        parent.children = vec![StatementId(2)];
        let script = Script::new(vec![parent, child, Statement::new(3, vec![])]);

        let root = registry.compile_root(&script);
        assert_eq!(root.children(), &[StatementId(1), StatementId(3)]);
        assert!(root.is_container());
    }
}
