//! Owned memory space for state blocks publish to the outside world.
//!
//! Every entry belongs to the block that allocated it. When that block is
//! popped its entries are flagged invalid: they stay queryable for
//! inspection but drop out of any aggregate over live state.

use crate::types::{BlockKey, MetricValue, ResultSpan, RoundState, TimerState};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Id of one memory entry
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MemoryId(pub u64);

/// Type tag of an entry
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MemoryKind {
    Metric,
    TimerState,
    LoopState,
    Handlers,
    Spans,
}

/// Typed payload of an entry
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum MemoryValue {
    Metric(MetricValue),
    TimerState(TimerState),
    LoopState(RoundState),
    /// Names of the behaviors handling events for the owner
    Handlers(Vec<String>),
    Spans(Vec<ResultSpan>),
}

impl MemoryValue {
    pub fn kind(&self) -> MemoryKind {
        match self {
            MemoryValue::Metric(_) => MemoryKind::Metric,
            MemoryValue::TimerState(_) => MemoryKind::TimerState,
            MemoryValue::LoopState(_) => MemoryKind::LoopState,
            MemoryValue::Handlers(_) => MemoryKind::Handlers,
            MemoryValue::Spans(_) => MemoryKind::Spans,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct MemoryEntry {
    pub id: MemoryId,
    pub kind: MemoryKind,
    pub owner: BlockKey,
    pub value: MemoryValue,
    pub valid: bool,
}

/// Errors from writes that break ownership rules
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MemoryError {
    #[error("memory entry {0:?} does not exist")]
    UnknownEntry(MemoryId),

    #[error("block {owner} does not own memory entry {id:?}")]
    NotOwner { id: MemoryId, owner: BlockKey },

    #[error("memory entry {0:?} was invalidated")]
    Invalidated(MemoryId),

    #[error("memory entry {id:?} holds {expected:?}, not {found:?}")]
    KindMismatch {
        id: MemoryId,
        expected: MemoryKind,
        found: MemoryKind,
    },
}

/// Search criteria; unset fields match everything
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct MemoryFilter {
    pub id: Option<MemoryId>,
    pub owner: Option<BlockKey>,
    pub kind: Option<MemoryKind>,
    pub valid: Option<bool>,
}

impl MemoryFilter {
    pub fn owner(owner: BlockKey) -> Self {
        Self {
            owner: Some(owner),
            ..Self::default()
        }
    }

    pub fn kind(mut self, kind: MemoryKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn valid_only(mut self) -> Self {
        self.valid = Some(true);
        self
    }

    fn matches(&self, entry: &MemoryEntry) -> bool {
        self.id.map_or(true, |id| entry.id == id)
            && self.owner.map_or(true, |owner| entry.owner == owner)
            && self.kind.map_or(true, |kind| entry.kind == kind)
            && self.valid.map_or(true, |valid| entry.valid == valid)
    }
}

/// Flat allocation table keyed by entry id
#[derive(Clone, Debug, Default)]
pub struct MemorySpace {
    entries: BTreeMap<MemoryId, MemoryEntry>,
    next_id: u64,
}

impl MemorySpace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a value on behalf of `owner`; the kind follows from the value
    pub fn allocate(&mut self, owner: BlockKey, value: MemoryValue) -> MemoryId {
        let id = MemoryId(self.next_id);
        self.next_id += 1;

        let entry = MemoryEntry {
            id,
            kind: value.kind(),
            owner,
            value,
            valid: true,
        };
        tracing::trace!("Allocated {:?} {:?} for block {}", entry.kind, id, owner);
        self.entries.insert(id, entry);
        id
    }

    pub fn get(&self, id: MemoryId) -> Option<&MemoryEntry> {
        self.entries.get(&id)
    }

    /// Entries matching the filter, in allocation order
    pub fn search(&self, filter: &MemoryFilter) -> Vec<&MemoryEntry> {
        self.entries.values().filter(|e| filter.matches(e)).collect()
    }

    /// Replace the value of an entry the caller owns
    pub fn update(
        &mut self,
        id: MemoryId,
        owner: BlockKey,
        value: MemoryValue,
    ) -> std::result::Result<(), MemoryError> {
        let entry = self
            .entries
            .get_mut(&id)
            .ok_or(MemoryError::UnknownEntry(id))?;

        if entry.owner != owner {
            return Err(MemoryError::NotOwner { id, owner });
        }
        if !entry.valid {
            return Err(MemoryError::Invalidated(id));
        }
        if entry.kind != value.kind() {
            return Err(MemoryError::KindMismatch {
                id,
                expected: entry.kind,
                found: value.kind(),
            });
        }

        entry.value = value;
        Ok(())
    }

    /// Flag every entry of `owner` invalid, returning how many changed
    pub fn invalidate_owner(&mut self, owner: BlockKey) -> usize {
        let mut count = 0;
        for entry in self.entries.values_mut() {
            if entry.owner == owner && entry.valid {
                entry.valid = false;
                count += 1;
            }
        }
        tracing::debug!("Invalidated {} memory entries of block {}", count, owner);
        count
    }

    /// Drop invalid entries, returning how many were removed
    pub fn sweep(&mut self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| e.valid);
        before - self.entries.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.next_id = 0;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sum of a metric over live entries only
    pub fn live_metric_total(&self, key: &str) -> f64 {
        self.entries
            .values()
            .filter(|e| e.valid)
            .filter_map(|e| match &e.value {
                MemoryValue::Metric(m) if m.key == key => Some(m.value),
                _ => None,
            })
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::StatementId;

    fn reps(value: f64) -> MemoryValue {
        MemoryValue::Metric(MetricValue {
            key: "reps".into(),
            value,
            unit: None,
            source: StatementId(1),
        })
    }

    #[test]
    fn test_allocate_and_search() {
        let mut memory = MemorySpace::new();
        let a = BlockKey::new();
        let b = BlockKey::new();

        let id = memory.allocate(a, reps(5.0));
        memory.allocate(a, MemoryValue::Handlers(vec!["timer".into()]));
        memory.allocate(b, reps(10.0));

        assert_eq!(memory.get(id).unwrap().kind, MemoryKind::Metric);
        assert_eq!(memory.search(&MemoryFilter::owner(a)).len(), 2);
        assert_eq!(
            memory
                .search(&MemoryFilter::default().kind(MemoryKind::Metric))
                .len(),
            2
        );
    }

    #[test]
    fn test_invalidate_owner_only_touches_owner() {
        let mut memory = MemorySpace::new();
        let popped = BlockKey::new();
        let survivor = BlockKey::new();
        memory.allocate(popped, reps(5.0));
        memory.allocate(popped, MemoryValue::Spans(vec![]));
        let kept = memory.allocate(survivor, reps(10.0));

        assert_eq!(memory.invalidate_owner(popped), 2);
        assert!(memory.get(kept).unwrap().valid);
        assert!(memory
            .search(&MemoryFilter::owner(popped))
            .iter()
            .all(|e| !e.valid));

        // Invalid entries remain visible until swept
        assert_eq!(memory.len(), 3);
        assert_eq!(memory.sweep(), 2);
        assert_eq!(memory.len(), 1);
    }

    #[test]
    fn test_live_metric_total_skips_invalid() {
        let mut memory = MemorySpace::new();
        let done = BlockKey::new();
        let active = BlockKey::new();
        memory.allocate(done, reps(5.0));
        memory.allocate(active, reps(10.0));

        assert_eq!(memory.live_metric_total("reps"), 15.0);
        memory.invalidate_owner(done);
        assert_eq!(memory.live_metric_total("reps"), 10.0);
    }

    #[test]
    fn test_update_enforces_ownership() {
        let mut memory = MemorySpace::new();
        let owner = BlockKey::new();
        let id = memory.allocate(owner, MemoryValue::LoopState(RoundState::with_total(3)));

        let other = BlockKey::new();
        assert_eq!(
            memory.update(id, other, MemoryValue::LoopState(RoundState::default())),
            Err(MemoryError::NotOwner { id, owner: other })
        );
        assert!(matches!(
            memory.update(id, owner, reps(1.0)),
            Err(MemoryError::KindMismatch { .. })
        ));

        let next = RoundState {
            current: 1,
            total: Some(3),
        };
        memory
            .update(id, owner, MemoryValue::LoopState(next.clone()))
            .unwrap();
        assert_eq!(
            memory.get(id).unwrap().value,
            MemoryValue::LoopState(next)
        );

        memory.invalidate_owner(owner);
        assert_eq!(
            memory.update(id, owner, MemoryValue::LoopState(RoundState::default())),
            Err(MemoryError::Invalidated(id))
        );
    }
}
