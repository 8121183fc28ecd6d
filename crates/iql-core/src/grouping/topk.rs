use crate::engine::IqlResult;
use crate::ftgs::FtgsCallback;
use crate::key::{GroupKeyMap, GroupStats, Term};
use crate::reference::StatReference;
use ordered_float::OrderedFloat;
use std::cmp::Ordering;
use std::collections::{BTreeMap, BinaryHeap};

/// A term competing for one of a group's K slots.
///
/// Ordered so that the *worst* candidate is the greatest: lower `rank` is better, and on equal
/// rank the term seen earlier in the stream wins.
#[derive(Debug)]
struct Candidate {
    rank: OrderedFloat<f64>,
    seq: u64,
    term: Term,
    values: Vec<f64>,
}

impl Candidate {
    fn sort_key(&self) -> (OrderedFloat<f64>, u64) {
        (self.rank, self.seq)
    }
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.sort_key() == other.sort_key()
    }
}

impl Eq for Candidate {}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sort_key().cmp(&other.sort_key())
    }
}

#[derive(Debug, Default)]
struct GroupSelection {
    /// Max-heap on badness; the root is the next candidate to evict.
    heap: BinaryHeap<Candidate>,
    terms_seen: u64,
}

/// Keeps, per group, the K terms with the largest (or smallest, when `bottom`) sort stat.
pub struct TopKCallback<'a> {
    k: usize,
    bottom: bool,
    sort_ref: StatReference,
    stat_refs: Vec<StatReference>,
    group_keys: &'a GroupKeyMap,
    groups: BTreeMap<u32, GroupSelection>,
    seq: u64,
}

impl<'a> TopKCallback<'a> {
    pub fn new(
        k: usize,
        bottom: bool,
        sort_ref: StatReference,
        stat_refs: Vec<StatReference>,
        group_keys: &'a GroupKeyMap,
    ) -> Self {
        Self {
            k,
            bottom,
            sort_ref,
            stat_refs,
            group_keys,
            groups: BTreeMap::new(),
            seq: 0,
        }
    }

    /// Terms with activity seen so far for `group`, kept or not.
    pub fn terms_seen(&self, group: u32) -> u64 {
        self.groups.get(&group).map_or(0, |g| g.terms_seen)
    }

    fn offer(&mut self, group: u32, stats: &[f64], term: impl FnOnce() -> Term) {
        if self.k == 0 || !self.group_keys.contains_key(&group) {
            return;
        }
        let score = self.sort_ref.read(stats);
        let rank = OrderedFloat(if self.bottom { score } else { -score });
        let seq = self.seq;
        self.seq += 1;

        let selection = self.groups.entry(group).or_default();
        selection.terms_seen += 1;
        if selection.heap.len() >= self.k {
            match selection.heap.peek() {
                Some(worst) if (rank, seq) < worst.sort_key() => {
                    selection.heap.pop();
                }
                _ => return,
            }
        }
        let values = self.stat_refs.iter().map(|r| r.read(stats)).collect();
        selection.heap.push(Candidate {
            rank,
            seq,
            term: term(),
            values,
        });
    }

    /// Rows ordered by group id, then best term first.
    pub fn finish(self) -> Vec<GroupStats> {
        let mut rows = Vec::new();
        for (group, selection) in self.groups {
            let Some(parent) = self.group_keys.get(&group) else {
                continue;
            };
            for candidate in selection.heap.into_sorted_vec() {
                rows.push(GroupStats::new(parent.add(candidate.term), candidate.values));
            }
        }
        log::trace!("top-{} selection produced {} rows", self.k, rows.len());
        rows
    }
}

impl FtgsCallback for TopKCallback<'_> {
    fn int_term_group(&mut self, _field: &str, term: i64, group: u32, stats: &[f64]) -> IqlResult<()> {
        self.offer(group, stats, || Term::Int(term));
        Ok(())
    }

    fn string_term_group(
        &mut self,
        _field: &str,
        term: &str,
        group: u32,
        stats: &[f64],
    ) -> IqlResult<()> {
        self.offer(group, stats, || Term::Str(term.to_string()));
        Ok(())
    }
}
