use crate::key::Field;
use crate::stats::Stat;

/// Difference of one field's top terms under two filters.
///
/// Carries configuration only. The planner rewrites it into an executable plan; reaching
/// execution with one still in place fails in [`super::Grouping::regroup`] and
/// [`super::Grouping::collect_group_stats`].
#[derive(Clone, Debug, PartialEq)]
pub struct DiffGrouping {
    field: Field,
    filter1: Stat,
    filter2: Stat,
    top_k: usize,
}

impl DiffGrouping {
    pub fn new(field: Field, filter1: Stat, filter2: Stat, top_k: usize) -> Self {
        Self {
            field,
            filter1,
            filter2,
            top_k,
        }
    }

    pub fn field(&self) -> &Field {
        &self.field
    }

    pub fn filter1(&self) -> &Stat {
        &self.filter1
    }

    pub fn filter2(&self) -> &Stat {
        &self.filter2
    }

    pub fn top_k(&self) -> usize {
        self.top_k
    }
}
