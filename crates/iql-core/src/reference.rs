//! Liveness tracking for pushed stats and dynamic metrics.
//!
//! Both registries hand out small `Copy`/`Clone` handles stamped with a generation. Popping a
//! stat (or invalidating a metric) drops the generation from the registry, so any handle that
//! outlives its owner fails deterministically on the next use instead of silently reading
//! whatever now occupies the slot.
use crate::engine::{IqlError, IqlResult};
use crate::stats::{AggregateOp, Stat};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Source of registry identities, so a handle minted by one stack or metric registry is never
/// accepted by another. Only ids are allocated here; all liveness state stays in the owning
/// registry.
static NEXT_REGISTRY_ID: AtomicU64 = AtomicU64::new(1);

fn next_registry_id() -> u64 {
    NEXT_REGISTRY_ID.fetch_add(1, Ordering::Relaxed)
}

/// Handle to one occupied evaluation stack slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SingleStatReference {
    stack: u64,
    depth: usize,
    generation: u64,
}

impl SingleStatReference {
    /// Depth of the evaluation stack at the moment this slot was pushed.
    pub fn depth(&self) -> usize {
        self.depth
    }
}

/// The result of pushing a [`Stat`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StatReference {
    Single(SingleStatReference),
    Aggregate {
        op: AggregateOp,
        left: SingleStatReference,
        right: SingleStatReference,
    },
}

impl StatReference {
    pub fn depth(&self) -> usize {
        match self {
            StatReference::Single(single) => single.depth,
            StatReference::Aggregate { left, .. } => left.depth,
        }
    }

    /// Read this stat's value out of a per-slot row (one value per stack slot).
    ///
    /// Slots past the end of the row read as zero; the engine omits trailing inactive slots.
    pub fn read(&self, row: &[f64]) -> f64 {
        let slot = |single: &SingleStatReference| row.get(single.depth).copied().unwrap_or(0.0);
        match self {
            StatReference::Single(single) => slot(single),
            StatReference::Aggregate { op, left, right } => op.combine(slot(left), slot(right)),
        }
    }
}

/// Tracks which stats occupy the session's evaluation stack.
#[derive(Debug)]
pub struct StatStack {
    id: u64,
    /// Generation stamped on each occupied slot.
    slots: Vec<u64>,
    /// Width of each pushed stat, innermost last.
    entries: Vec<usize>,
    next_generation: u64,
}

impl Default for StatStack {
    fn default() -> Self {
        Self::new()
    }
}

impl StatStack {
    pub fn new() -> Self {
        Self {
            id: next_registry_id(),
            slots: Vec::new(),
            entries: Vec::new(),
            next_generation: 1,
        }
    }

    pub fn depth(&self) -> usize {
        self.slots.len()
    }

    /// Number of pushed stats (an aggregate stat counts once but occupies two slots).
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn alloc_slot(&mut self) -> SingleStatReference {
        let generation = self.next_generation;
        self.next_generation += 1;
        let depth = self.slots.len();
        self.slots.push(generation);
        SingleStatReference {
            stack: self.id,
            depth,
            generation,
        }
    }

    /// Record that `stat` now sits on top of the stack.
    pub fn push(&mut self, stat: &Stat) -> StatReference {
        self.entries.push(stat.width());
        match stat {
            Stat::AggregateBinOp(agg) => {
                let left = self.alloc_slot();
                let right = self.alloc_slot();
                StatReference::Aggregate {
                    op: agg.op(),
                    left,
                    right,
                }
            }
            _ => StatReference::Single(self.alloc_slot()),
        }
    }

    /// Drop the innermost stat, returning how many slots it occupied.
    pub fn pop(&mut self) -> IqlResult<usize> {
        let width = self.entries.pop().ok_or(IqlError::StackUnderflow)?;
        let remaining = self.slots.len().saturating_sub(width);
        self.slots.truncate(remaining);
        Ok(width)
    }

    fn slot_is_live(&self, single: &SingleStatReference) -> bool {
        single.stack == self.id && self.slots.get(single.depth) == Some(&single.generation)
    }

    pub fn is_valid(&self, reference: &StatReference) -> bool {
        match reference {
            StatReference::Single(single) => self.slot_is_live(single),
            StatReference::Aggregate { left, right, .. } => {
                self.slot_is_live(left) && self.slot_is_live(right)
            }
        }
    }

    pub fn require_valid(&self, reference: &StatReference) -> IqlResult<()> {
        if self.is_valid(reference) {
            Ok(())
        } else {
            Err(IqlError::StaleReference {
                depth: reference.depth(),
            })
        }
    }

    pub(crate) fn require_valid_slot(&self, single: &SingleStatReference) -> IqlResult<()> {
        self.require_valid(&StatReference::Single(*single))
    }
}

/// Handle to an externally registered, mutable named metric.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct DynamicMetric {
    name: Arc<str>,
    registry: u64,
    generation: u64,
}

impl DynamicMetric {
    pub fn name(&self) -> &str {
        &self.name
    }
}

#[derive(Debug)]
pub struct MetricRegistry {
    id: u64,
    live: HashMap<Arc<str>, u64>,
    next_generation: u64,
}

impl Default for MetricRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricRegistry {
    pub fn new() -> Self {
        Self {
            id: next_registry_id(),
            live: HashMap::new(),
            next_generation: 1,
        }
    }

    /// Register `name`, replacing (and invalidating) any earlier metric of the same name.
    pub fn register(&mut self, name: &str) -> DynamicMetric {
        let generation = self.next_generation;
        self.next_generation += 1;
        let name: Arc<str> = Arc::from(name);
        self.live.insert(name.clone(), generation);
        DynamicMetric {
            name,
            registry: self.id,
            generation,
        }
    }

    /// Returns whether a live metric of that name existed.
    pub fn invalidate(&mut self, name: &str) -> bool {
        self.live.remove(name).is_some()
    }

    pub fn invalidate_all(&mut self) {
        self.live.clear();
    }

    pub fn is_valid(&self, metric: &DynamicMetric) -> bool {
        metric.registry == self.id && self.live.get(&metric.name) == Some(&metric.generation)
    }

    pub fn require_valid(&self, metric: &DynamicMetric) -> IqlResult<()> {
        if self.is_valid(metric) {
            Ok(())
        } else {
            Err(IqlError::StaleMetric {
                name: metric.name.to_string(),
            })
        }
    }
}
