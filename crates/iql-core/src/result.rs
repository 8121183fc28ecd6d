//! Assembling grouping output into the final result table.
use crate::engine::{IqlError, IqlResult};
use crate::grouping::GroupStatsIter;
use crate::key::GroupStats;
use std::collections::HashMap;

/// Lay out `width` cells: positions present in `spliced` take that value, every other position
/// takes the next value of `rest` in order, and anything left over gets `fill`.
fn splice<T: Clone>(
    width: usize,
    spliced: Option<&HashMap<usize, T>>,
    rest: impl IntoIterator<Item = T>,
    fill: impl Fn(usize) -> T,
) -> Vec<T> {
    let mut rest = rest.into_iter();
    (0..width)
        .map(|idx| match spliced.and_then(|s| s.get(&idx)) {
            Some(value) => value.clone(),
            None => rest.next().unwrap_or_else(|| fill(idx)),
        })
        .collect()
}

/// One row of `width` values: percentile terms at their projection positions, the ordinary
/// stat values filling the remaining positions in order, zero where neither applies.
pub fn merge_percentile_row(
    width: usize,
    percentiles: Option<&HashMap<usize, i64>>,
    stats: &[f64],
) -> Vec<f64> {
    let percentiles: Option<HashMap<usize, f64>> =
        percentiles.map(|p| p.iter().map(|(pos, v)| (*pos, *v as f64)).collect());
    splice(width, percentiles.as_ref(), stats.iter().copied(), |_| 0.0)
}

/// Column names for a result row.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ColumnLayout {
    names: Vec<String>,
}

impl ColumnLayout {
    /// `stat_names` in declaration order with each `(position, name)` percentile column spliced
    /// in at its projection position.
    pub fn new(stat_names: &[String], percentile_columns: &[(usize, String)]) -> IqlResult<Self> {
        let width = stat_names.len() + percentile_columns.len();
        let spliced: HashMap<usize, String> = percentile_columns.iter().cloned().collect();
        if spliced.len() != percentile_columns.len() {
            return Err(IqlError::InvalidConfig(
                "percentile columns share a projection position".into(),
            ));
        }
        if let Some(pos) = spliced.keys().find(|pos| **pos >= width) {
            return Err(IqlError::InvalidConfig(format!(
                "percentile projected at column {pos} but rows have {width} columns"
            )));
        }
        let names = splice(width, Some(&spliced), stat_names.iter().cloned(), |idx| {
            format!("column{idx}")
        });
        Ok(Self { names })
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn width(&self) -> usize {
        self.names.len()
    }
}

/// Final output of a query.
#[derive(Clone, Debug, PartialEq)]
pub struct ResultTable {
    pub columns: Vec<String>,
    pub rows: Vec<GroupStats>,
}

/// Concatenate stage outputs in pipeline order, keeping each stage's own row order.
///
/// Any error discards everything assembled so far.
pub fn assemble<'a>(stages: impl IntoIterator<Item = GroupStatsIter<'a>>) -> IqlResult<Vec<GroupStats>> {
    let mut rows = Vec::new();
    for stage in stages {
        for row in stage {
            rows.push(row?);
        }
    }
    Ok(rows)
}
