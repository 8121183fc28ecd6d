use super::topk::TopKCallback;
use super::GroupStatsIter;
use crate::config::EngineConfig;
use crate::engine::{IqlError, IqlResult};
use crate::ftgs::{fold_stream, Deadline, FtgsCallback};
use crate::key::{Field, GroupKeyMap, GroupStats, Term};
use crate::reference::StatReference;
use crate::session::Session;
use crate::stats::Stat;
use std::slice;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct FieldGroupingOptions {
    /// Keep at most this many terms per parent group; 0 means unbounded.
    pub top_k: usize,
    /// Ranks terms for top-K. Falls back to [`EngineConfig::default_sort_stat`].
    pub sort_stat: Option<Stat>,
    /// Keep the smallest sort values instead of the largest.
    pub bottom: bool,
    /// Iterate terms without creating a new group level.
    pub no_explode: bool,
}

impl FieldGroupingOptions {
    pub fn top(k: usize) -> Self {
        Self {
            top_k: k,
            ..Self::default()
        }
    }

    pub fn bottom(k: usize) -> Self {
        Self {
            top_k: k,
            bottom: true,
            ..Self::default()
        }
    }

    pub fn no_explode() -> Self {
        Self {
            no_explode: true,
            ..Self::default()
        }
    }

    pub fn with_sort_stat(mut self, stat: Stat) -> Self {
        self.sort_stat = Some(stat);
        self
    }
}

/// How a field grouping splits its parent groups.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SplitMode {
    TopK(usize),
    Passthrough,
    Explode,
}

/// Group by the terms of one field.
#[derive(Clone, Debug, PartialEq)]
pub struct FieldGrouping {
    field: Field,
    top_k: usize,
    sort_stat: Stat,
    bottom: bool,
    no_explode: bool,
}

impl FieldGrouping {
    pub fn new(field: Field, options: FieldGroupingOptions, config: &EngineConfig) -> IqlResult<Self> {
        if options.top_k > config.group_limit {
            return Err(IqlError::TopKExceedsLimit {
                field: field.name().to_string(),
                requested: options.top_k,
                limit: config.group_limit,
            });
        }
        Ok(Self {
            field,
            top_k: options.top_k,
            sort_stat: options
                .sort_stat
                .unwrap_or_else(|| config.default_sort_stat.clone()),
            bottom: options.bottom,
            no_explode: options.no_explode,
        })
    }

    /// Full explode with default options.
    pub fn explode(field: Field, config: &EngineConfig) -> IqlResult<Self> {
        Self::new(field, FieldGroupingOptions::default(), config)
    }

    pub fn field(&self) -> &Field {
        &self.field
    }

    pub fn top_k(&self) -> usize {
        self.top_k
    }

    pub fn sort_stat(&self) -> &Stat {
        &self.sort_stat
    }

    pub fn is_bottom(&self) -> bool {
        self.bottom
    }

    pub fn is_no_explode(&self) -> bool {
        self.no_explode
    }

    pub fn mode(&self) -> SplitMode {
        if self.top_k > 0 {
            SplitMode::TopK(self.top_k)
        } else if self.no_explode {
            SplitMode::Passthrough
        } else {
            SplitMode::Explode
        }
    }

    pub(crate) fn regroup<S: Session + ?Sized>(
        &self,
        session: &mut S,
        group_keys: &GroupKeyMap,
    ) -> IqlResult<GroupKeyMap> {
        let mode = self.mode();
        log::debug!("split {} with {mode:?}", self.field);
        match mode {
            SplitMode::TopK(k) => {
                session.split_all_top_k(&self.field, group_keys, k, &self.sort_stat, self.bottom)
            }
            SplitMode::Passthrough => session.split_all(&self.field, group_keys),
            SplitMode::Explode => session.split_all_explode(&self.field, group_keys),
        }
    }

    pub(crate) fn collect_group_stats<'s, S: Session + ?Sized>(
        &self,
        session: &'s mut S,
        group_keys: &GroupKeyMap,
        stat_refs: &[StatReference],
        deadline: &Deadline,
    ) -> IqlResult<GroupStatsIter<'s>> {
        // Every document was filtered out upstream; there is nothing to stream.
        if group_keys.is_empty() {
            return Ok(Box::new(std::iter::empty()));
        }

        match self.mode() {
            SplitMode::TopK(k) => {
                let sort_ref = session.push_stat(&self.sort_stat)?;
                let folded = self.fold_top_k(session, group_keys, stat_refs, sort_ref, k, deadline);
                let popped = session.pop_stat();
                let rows = folded?;
                popped?;
                Ok(Box::new(rows.into_iter().map(Ok)))
            }
            SplitMode::Passthrough => {
                let keys = group_keys.clone();
                let refs = stat_refs.to_vec();
                let deadline = *deadline;
                let stream = session.iterate_sorted_terms(slice::from_ref(&self.field))?;
                let mut seen = 0usize;
                Ok(Box::new(stream.filter_map(move |record| {
                    if deadline.due(seen) {
                        if let Err(err) = deadline.check() {
                            return Some(Err(err));
                        }
                    }
                    seen += 1;
                    let record = match record {
                        Ok(record) => record,
                        Err(err) => return Some(Err(err)),
                    };
                    let parent = keys.get(&record.group)?;
                    let values = refs.iter().map(|r| r.read(&record.stats)).collect();
                    Some(Ok(GroupStats::new(parent.add(record.term), values)))
                })))
            }
            SplitMode::Explode => {
                let mut callback = ExplodeCallback {
                    group_keys,
                    stat_refs,
                    rows: Vec::new(),
                };
                let stream = session.iterate_sorted_terms(slice::from_ref(&self.field))?;
                fold_stream(stream, &mut callback, deadline)?;
                Ok(Box::new(callback.rows.into_iter().map(Ok)))
            }
        }
    }

    fn fold_top_k<S: Session + ?Sized>(
        &self,
        session: &mut S,
        group_keys: &GroupKeyMap,
        stat_refs: &[StatReference],
        sort_ref: StatReference,
        k: usize,
        deadline: &Deadline,
    ) -> IqlResult<Vec<GroupStats>> {
        let mut callback = TopKCallback::new(k, self.bottom, sort_ref, stat_refs.to_vec(), group_keys);
        let stream = session.iterate_sorted_terms(slice::from_ref(&self.field))?;
        fold_stream(stream, &mut callback, deadline)?;
        Ok(callback.finish())
    }
}

/// One row per (group, term) record, in stream order.
struct ExplodeCallback<'a> {
    group_keys: &'a GroupKeyMap,
    stat_refs: &'a [StatReference],
    rows: Vec<GroupStats>,
}

impl ExplodeCallback<'_> {
    fn emit(&mut self, group: u32, term: Term, stats: &[f64]) {
        let Some(parent) = self.group_keys.get(&group) else {
            return;
        };
        let values = self.stat_refs.iter().map(|r| r.read(stats)).collect();
        self.rows.push(GroupStats::new(parent.add(term), values));
    }
}

impl FtgsCallback for ExplodeCallback<'_> {
    fn int_term_group(&mut self, _field: &str, term: i64, group: u32, stats: &[f64]) -> IqlResult<()> {
        self.emit(group, Term::Int(term), stats);
        Ok(())
    }

    fn string_term_group(
        &mut self,
        _field: &str,
        term: &str,
        group: u32,
        stats: &[f64],
    ) -> IqlResult<()> {
        self.emit(group, Term::Str(term.to_string()), stats);
        Ok(())
    }
}
