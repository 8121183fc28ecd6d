//! Nearest-rank percentiles over integer terms.
//!
//! Two passes per query: the count stat is pushed once and its per-group totals turn every
//! requested percentile into a target cumulative rank; then each distinct field is streamed in
//! term order while a running per-group count detects which term crosses each target.
use super::GroupStatsIter;
use crate::engine::{IqlError, IqlResult};
use crate::ftgs::{fold_stream, Deadline, FtgsCallback};
use crate::key::{Field, GroupKeyMap, GroupStats};
use crate::reference::StatReference;
use crate::result::merge_percentile_row;
use crate::session::Session;
use crate::stats::Stat;
use std::collections::HashMap;
use std::slice;

#[derive(Clone, Debug, PartialEq)]
pub struct PercentileQuery {
    field: Field,
    percentile: f64,
    projection_position: usize,
}

impl PercentileQuery {
    pub fn field(&self) -> &Field {
        &self.field
    }

    pub fn percentile(&self) -> f64 {
        self.percentile
    }

    /// Output column this percentile occupies in each row.
    pub fn projection_position(&self) -> usize {
        self.projection_position
    }
}

/// Terminal grouping that computes percentiles for the groups it receives.
#[derive(Clone, Debug, PartialEq)]
pub struct PercentileGrouping {
    count_stat: Stat,
    queries: Vec<PercentileQuery>,
}

impl PercentileGrouping {
    pub fn new(count_stat: Stat) -> Self {
        Self {
            count_stat,
            queries: Vec::new(),
        }
    }

    pub fn add_percentile_query(
        &mut self,
        field: Field,
        percentile: f64,
        projection_position: usize,
    ) -> IqlResult<()> {
        if !(0.0..=100.0).contains(&percentile) {
            return Err(IqlError::InvalidConfig(format!(
                "percentile {percentile} for field {field} is outside 0..=100"
            )));
        }
        if self
            .queries
            .iter()
            .any(|q| q.projection_position == projection_position)
        {
            return Err(IqlError::InvalidConfig(format!(
                "two percentiles projected at column {projection_position}"
            )));
        }
        self.queries.push(PercentileQuery {
            field,
            percentile,
            projection_position,
        });
        Ok(())
    }

    pub fn with_percentile(
        mut self,
        field: Field,
        percentile: f64,
        projection_position: usize,
    ) -> IqlResult<Self> {
        self.add_percentile_query(field, percentile, projection_position)?;
        Ok(self)
    }

    pub fn count_stat(&self) -> &Stat {
        &self.count_stat
    }

    pub fn queries(&self) -> &[PercentileQuery] {
        &self.queries
    }

    fn unique_fields(&self) -> Vec<&Field> {
        let mut fields: Vec<&Field> = Vec::new();
        for query in &self.queries {
            if !fields.contains(&&query.field) {
                fields.push(&query.field);
            }
        }
        fields
    }

    pub(crate) fn collect_group_stats<'s, S: Session + ?Sized>(
        &self,
        session: &'s mut S,
        group_keys: &GroupKeyMap,
        stat_refs: &[StatReference],
        deadline: &Deadline,
    ) -> IqlResult<GroupStatsIter<'s>> {
        let count_ref = session.push_stat(&self.count_stat)?;
        let percentiles = self.percentile_values(session, group_keys, count_ref, deadline);
        let popped = session.pop_stat();
        let percentiles = percentiles?;
        popped?;

        let ordinary = stat_refs
            .iter()
            .map(|reference| session.group_stats(reference))
            .collect::<IqlResult<Vec<_>>>()?;

        let width = stat_refs.len() + self.queries.len();
        let group_count = u32::try_from(session.group_count()).unwrap_or(u32::MAX);
        let mut rows = Vec::new();
        for group in 1..group_count {
            let Some(key) = group_keys.get(&group) else {
                continue;
            };
            let stats: Vec<f64> = ordinary
                .iter()
                .map(|values| values.get(group as usize).copied().unwrap_or(0.0))
                .collect();
            let values = merge_percentile_row(width, percentiles.get(&group), &stats);
            rows.push(GroupStats::new(key.clone(), values));
        }
        Ok(Box::new(rows.into_iter().map(Ok)))
    }

    /// Percentile terms per group, keyed by projection position.
    fn percentile_values<S: Session + ?Sized>(
        &self,
        session: &mut S,
        group_keys: &GroupKeyMap,
        count_ref: StatReference,
        deadline: &Deadline,
    ) -> IqlResult<HashMap<u32, HashMap<usize, i64>>> {
        let counts: Vec<i64> = session
            .group_stats(&count_ref)?
            .iter()
            .map(|count| count.round() as i64)
            .collect();

        let mut by_position: HashMap<u32, HashMap<usize, i64>> = group_keys
            .keys()
            .map(|group| (*group, HashMap::new()))
            .collect();

        for field in self.unique_fields() {
            let (percentiles, positions): (Vec<f64>, Vec<usize>) = self
                .queries
                .iter()
                .filter(|q| &q.field == field)
                .map(|q| (q.percentile, q.projection_position))
                .unzip();

            let targets: HashMap<u32, Vec<f64>> = group_keys
                .keys()
                .map(|group| {
                    let total = counts.get(*group as usize).copied().unwrap_or(0) as f64;
                    (*group, percentiles.iter().map(|p| p / 100.0 * total).collect())
                })
                .collect();

            // String fields are read through their integer view; string terms cannot be ranked.
            let ftgs_field = if field.is_int() {
                field.clone()
            } else {
                field.as_int_field()
            };
            let mut callback = PercentileCallback::new(count_ref, targets);
            let stream = session.iterate_sorted_terms(slice::from_ref(&ftgs_field))?;
            fold_stream(stream, &mut callback, deadline)?;

            for (group, values) in callback.finish() {
                let slots = by_position.entry(group).or_default();
                for (value, position) in values.into_iter().zip(&positions) {
                    slots.insert(*position, value);
                }
            }
        }

        Ok(by_position)
    }
}

/// Cumulative-count crossing detection for one field.
pub struct PercentileCallback {
    count_ref: StatReference,
    /// Target cumulative rank of each requested percentile, per group.
    targets: HashMap<u32, Vec<f64>>,
    found: HashMap<u32, Vec<Option<i64>>>,
    cumulative: HashMap<u32, i64>,
    last_term: HashMap<u32, i64>,
}

impl PercentileCallback {
    pub fn new(count_ref: StatReference, targets: HashMap<u32, Vec<f64>>) -> Self {
        let found = targets
            .iter()
            .map(|(group, ranks)| (*group, vec![None; ranks.len()]))
            .collect();
        Self {
            count_ref,
            targets,
            found,
            cumulative: HashMap::new(),
            last_term: HashMap::new(),
        }
    }

    pub fn cumulative_count(&self, group: u32) -> i64 {
        self.cumulative.get(&group).copied().unwrap_or(0)
    }

    /// Percentile terms per group, in the order the targets were given. A target the stream
    /// never crossed takes the last term seen for its group (0 if the group saw none).
    pub fn finish(self) -> HashMap<u32, Vec<i64>> {
        let mut out = HashMap::with_capacity(self.found.len());
        for (group, found) in self.found {
            let fallback = self.last_term.get(&group).copied().unwrap_or(0);
            if found.iter().any(Option::is_none) {
                log::warn!("percentile rank never reached for group {group}; using last term {fallback}");
            }
            out.insert(
                group,
                found.into_iter().map(|v| v.unwrap_or(fallback)).collect(),
            );
        }
        out
    }
}

impl FtgsCallback for PercentileCallback {
    fn int_term_group(&mut self, _field: &str, term: i64, group: u32, stats: &[f64]) -> IqlResult<()> {
        let Some(targets) = self.targets.get(&group) else {
            return Ok(());
        };
        let prev = self.cumulative.get(&group).copied().unwrap_or(0);
        let next = prev + self.count_ref.read(stats).round() as i64;

        if let Some(found) = self.found.get_mut(&group) {
            for (slot, target) in found.iter_mut().zip(targets) {
                if *target > prev as f64 && *target <= next as f64 {
                    *slot = Some(term);
                }
            }
        }

        self.cumulative.insert(group, next);
        self.last_term.insert(group, term);
        Ok(())
    }

    fn string_term_group(
        &mut self,
        field: &str,
        _term: &str,
        _group: u32,
        _stats: &[f64],
    ) -> IqlResult<()> {
        Err(IqlError::StringTermUnsupported {
            field: field.to_string(),
        })
    }
}
