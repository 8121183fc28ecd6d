use crate::engine::IqlResult;
use crate::key::{Field, GroupKeyMap, Term};
use crate::reference::{MetricRegistry, StatReference, StatStack};
use crate::stats::{CompileContext, Stat, Token};
use std::sync::Arc;

/// One element of the sorted (field, term, group) stream.
#[derive(Clone, Debug, PartialEq)]
pub struct FtgsRecord {
    pub field: Arc<str>,
    pub term: Term,
    pub group: u32,
    /// Aggregated value of every evaluation stack slot for this (term, group), bottom first.
    pub stats: Vec<f64>,
}

/// Lazy, finite, non-restartable term stream. An `Err` item means the engine aborted the
/// iteration; nothing after it is meaningful.
pub type FtgsStream<'a> = Box<dyn Iterator<Item = IqlResult<FtgsRecord>> + 'a>;

/// Connection to the engine that stores documents and evaluates pushed stats.
///
/// Implementors provide the raw engine calls; stat compilation, reference bookkeeping and
/// aggregate-reference reads are layered on top as provided methods so every session applies
/// them the same way.
pub trait Session {
    fn stat_stack(&self) -> &StatStack;
    fn stat_stack_mut(&mut self) -> &mut StatStack;
    fn metrics(&self) -> &MetricRegistry;

    /// Load compiled instructions that leave `width` new slots on the evaluation stack.
    fn load_stat(&mut self, tokens: &[Token], width: usize) -> IqlResult<()>;

    /// Drop the top `width` slots of the evaluation stack.
    fn unload_stat(&mut self, width: usize) -> IqlResult<()>;

    /// One past the highest live group id (group 0 included).
    fn group_count(&self) -> usize;

    /// Keep every parent group as is.
    fn split_all(&mut self, field: &Field, group_keys: &GroupKeyMap) -> IqlResult<GroupKeyMap>;

    /// Split every parent group into at most `k` children, one per term, chosen by `sort_stat`
    /// (largest first, or smallest first when `bottom`).
    fn split_all_top_k(
        &mut self,
        field: &Field,
        group_keys: &GroupKeyMap,
        k: usize,
        sort_stat: &Stat,
        bottom: bool,
    ) -> IqlResult<GroupKeyMap>;

    /// Split every parent group into one child per distinct term.
    fn split_all_explode(&mut self, field: &Field, group_keys: &GroupKeyMap)
        -> IqlResult<GroupKeyMap>;

    /// Stream (field, term, group, stats) sorted by field, then term, then group.
    fn iterate_sorted_terms(&mut self, fields: &[Field]) -> IqlResult<FtgsStream<'_>>;

    /// Per-group totals of one evaluation stack slot, indexed by group id.
    fn slot_group_stats(&mut self, depth: usize) -> IqlResult<Vec<f64>>;

    fn current_stack_depth(&self) -> usize {
        self.stat_stack().depth()
    }

    fn push_stat(&mut self, stat: &Stat) -> IqlResult<StatReference> {
        let tokens = {
            let ctx = CompileContext::new(self.stat_stack(), self.metrics());
            stat.compile(&ctx)?
        };
        log::debug!(
            "push {stat} at depth {} ({} tokens)",
            self.current_stack_depth(),
            tokens.len()
        );
        self.load_stat(&tokens, stat.width())?;
        Ok(self.stat_stack_mut().push(stat))
    }

    fn pop_stat(&mut self) -> IqlResult<()> {
        let width = self.stat_stack_mut().pop()?;
        log::debug!("pop {width} slot(s), depth now {}", self.current_stack_depth());
        self.unload_stat(width)
    }

    /// Per-group values of a pushed stat, indexed by group id.
    fn group_stats(&mut self, reference: &StatReference) -> IqlResult<Vec<f64>> {
        self.stat_stack().require_valid(reference)?;
        match reference {
            StatReference::Single(single) => self.slot_group_stats(single.depth()),
            StatReference::Aggregate { op, left, right } => {
                let left = self.slot_group_stats(left.depth())?;
                let right = self.slot_group_stats(right.depth())?;
                Ok(left
                    .iter()
                    .zip(right.iter())
                    .map(|(l, r)| op.combine(*l, *r))
                    .collect())
            }
        }
    }
}
