//! Execution stack: the live chain of mounted blocks.
//!
//! Parents are referenced by [`BlockKey`] and resolved against the stack,
//! so a block never owns or outlives the block above or below it.

use crate::block::{Block, BlockSnapshot};
use crate::types::BlockKey;
use chrono::{DateTime, Utc};

#[derive(Clone, Debug, Default)]
pub struct ExecutionStack {
    blocks: Vec<Block>,
}

impl ExecutionStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a block, linking it to the current top as its parent
    pub fn push(&mut self, mut block: Block) {
        block.parent = self.current().map(Block::key);
        tracing::debug!(
            "Push {} (depth {}) parent={:?}",
            block.id(),
            self.blocks.len() + 1,
            block.parent
        );
        self.blocks.push(block);
    }

    pub fn pop(&mut self) -> Option<Block> {
        self.blocks.pop()
    }

    /// Active block (top of stack)
    pub fn current(&self) -> Option<&Block> {
        self.blocks.last()
    }

    pub fn current_mut(&mut self) -> Option<&mut Block> {
        self.blocks.last_mut()
    }

    pub fn get(&self, key: BlockKey) -> Option<&Block> {
        self.blocks.iter().find(|b| b.key() == key)
    }

    pub fn get_mut(&mut self, key: BlockKey) -> Option<&mut Block> {
        self.blocks.iter_mut().find(|b| b.key() == key)
    }

    pub fn contains(&self, key: BlockKey) -> bool {
        self.get(key).is_some()
    }

    pub fn parent_of(&self, key: BlockKey) -> Option<&Block> {
        self.get(key)
            .and_then(Block::parent)
            .and_then(|parent| self.get(parent))
    }

    /// Walk from `key` towards the root, excluding `key` itself
    pub fn ancestors(&self, key: BlockKey) -> Vec<&Block> {
        let mut chain = Vec::new();
        let mut cursor = self.parent_of(key);
        while let Some(block) = cursor {
            chain.push(block);
            cursor = self.parent_of(block.key());
        }
        chain
    }

    /// Blocks from root to active
    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn blocks_mut(&mut self) -> impl Iterator<Item = &mut Block> {
        self.blocks.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Remove every block, top first
    pub fn drain(&mut self) -> Vec<Block> {
        let mut drained = std::mem::take(&mut self.blocks);
        drained.reverse();
        drained
    }

    /// Bottom-to-top snapshots for inspection
    pub fn snapshot(&self, now: DateTime<Utc>) -> Vec<BlockSnapshot> {
        self.blocks.iter().map(|b| b.snapshot(now)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BlockType;

    #[test]
    fn test_push_links_parent() {
        let mut stack = ExecutionStack::new();
        let root = Block::new(BlockType::Root, "root");
        let root_key = root.key();
        stack.push(root);

        let child = Block::new(BlockType::Effort, "Pullups");
        let child_key = child.key();
        stack.push(child);

        assert_eq!(stack.len(), 2);
        assert_eq!(stack.current().unwrap().key(), child_key);
        assert_eq!(stack.parent_of(child_key).unwrap().key(), root_key);
        assert!(stack.parent_of(root_key).is_none());
    }

    #[test]
    fn test_ancestors_walk_to_root() {
        let mut stack = ExecutionStack::new();
        let keys: Vec<_> = [BlockType::Root, BlockType::Rounds, BlockType::Effort]
            .into_iter()
            .map(|t| {
                let block = Block::new(t, format!("{:?}", t));
                let key = block.key();
                stack.push(block);
                key
            })
            .collect();

        let ancestors: Vec<_> = stack.ancestors(keys[2]).iter().map(|b| b.key()).collect();
        assert_eq!(ancestors, vec![keys[1], keys[0]]);
    }

    #[test]
    fn test_pop_and_drain_order() {
        let mut stack = ExecutionStack::new();
        stack.push(Block::new(BlockType::Root, "root"));
        stack.push(Block::new(BlockType::Timer, "timer"));
        stack.push(Block::new(BlockType::Effort, "effort"));

        assert_eq!(stack.pop().unwrap().block_type(), BlockType::Effort);
        let drained: Vec<_> = stack.drain().iter().map(|b| b.block_type()).collect();
        assert_eq!(drained, vec![BlockType::Timer, BlockType::Root]);
        assert!(stack.is_empty());
    }

    #[test]
    fn test_popped_block_no_longer_resolves() {
        let mut stack = ExecutionStack::new();
        stack.push(Block::new(BlockType::Root, "root"));
        let child = Block::new(BlockType::Effort, "effort");
        let key = child.key();
        stack.push(child);

        stack.pop();
        assert!(!stack.contains(key));
        assert!(stack.parent_of(key).is_none());
    }
}
