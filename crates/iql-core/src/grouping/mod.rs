//! Grouping stages: how a query's group-id space is split, and how final values are pulled
//! out of it.
mod diff;
mod field;
mod percentile;
mod topk;

pub use diff::DiffGrouping;
pub use field::{FieldGrouping, FieldGroupingOptions, SplitMode};
pub use percentile::{PercentileCallback, PercentileGrouping, PercentileQuery};
pub use topk::TopKCallback;

use crate::engine::{IqlError, IqlResult};
use crate::ftgs::Deadline;
use crate::key::{GroupKeyMap, GroupStats};
use crate::reference::StatReference;
use crate::session::Session;
use std::fmt;

/// Lazy, finite, non-restartable sequence of result rows.
pub type GroupStatsIter<'a> = Box<dyn Iterator<Item = IqlResult<GroupStats>> + 'a>;

#[derive(Clone, Debug, PartialEq)]
pub enum Grouping {
    Field(FieldGrouping),
    Percentile(PercentileGrouping),
    /// Placeholder the planner must rewrite away before execution.
    Diff(DiffGrouping),
}

impl Grouping {
    /// Split the parent groups, returning the child group keys.
    pub fn regroup<S: Session + ?Sized>(
        &self,
        session: &mut S,
        group_keys: &GroupKeyMap,
    ) -> IqlResult<GroupKeyMap> {
        log::debug!("regroup {self} over {} parent group(s)", group_keys.len());
        match self {
            Grouping::Field(grouping) => grouping.regroup(session, group_keys),
            Grouping::Percentile(_) => Err(IqlError::Unsupported {
                grouping: self.to_string(),
                operation: "regroup",
                reason: "percentiles must be used as the last group",
            }),
            Grouping::Diff(_) => Err(IqlError::Unsupported {
                grouping: self.to_string(),
                operation: "regroup",
                reason: "diff groupings must be rewritten before execution",
            }),
        }
    }

    /// Produce the final rows for the groups in `group_keys`, one value per entry of
    /// `stat_refs` (plus any percentile columns this grouping owns).
    pub fn collect_group_stats<'s, S: Session + ?Sized>(
        &self,
        session: &'s mut S,
        group_keys: &GroupKeyMap,
        stat_refs: &[StatReference],
        deadline: &Deadline,
    ) -> IqlResult<GroupStatsIter<'s>> {
        log::debug!("collect {self} over {} group(s)", group_keys.len());
        for reference in stat_refs {
            session.stat_stack().require_valid(reference)?;
        }
        match self {
            Grouping::Field(grouping) => {
                grouping.collect_group_stats(session, group_keys, stat_refs, deadline)
            }
            Grouping::Percentile(grouping) => {
                grouping.collect_group_stats(session, group_keys, stat_refs, deadline)
            }
            Grouping::Diff(_) => Err(IqlError::Unsupported {
                grouping: self.to_string(),
                operation: "collect group stats",
                reason: "diff groupings must be rewritten before execution",
            }),
        }
    }

    /// Number of extra columns this grouping splices into each row.
    pub fn percentile_count(&self) -> usize {
        match self {
            Grouping::Percentile(grouping) => grouping.queries().len(),
            _ => 0,
        }
    }
}

impl fmt::Display for Grouping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Grouping::Field(grouping) => write!(f, "field grouping on {}", grouping.field()),
            Grouping::Percentile(grouping) => {
                write!(f, "percentile grouping ({} queries)", grouping.queries().len())
            }
            Grouping::Diff(grouping) => write!(f, "diff grouping on {}", grouping.field()),
        }
    }
}

impl From<FieldGrouping> for Grouping {
    fn from(grouping: FieldGrouping) -> Self {
        Grouping::Field(grouping)
    }
}

impl From<PercentileGrouping> for Grouping {
    fn from(grouping: PercentileGrouping) -> Self {
        Grouping::Percentile(grouping)
    }
}

impl From<DiffGrouping> for Grouping {
    fn from(grouping: DiffGrouping) -> Self {
        Grouping::Diff(grouping)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StageState {
    Unexecuted,
    Regrouped,
    Collected,
}

/// A grouping together with where it is in its lifecycle: regroup at most once, collect at
/// most once and never before a pending regroup.
#[derive(Debug)]
pub struct GroupingStage {
    grouping: Grouping,
    state: StageState,
}

impl GroupingStage {
    pub fn new(grouping: Grouping) -> Self {
        Self {
            grouping,
            state: StageState::Unexecuted,
        }
    }

    pub fn grouping(&self) -> &Grouping {
        &self.grouping
    }

    pub fn state(&self) -> StageState {
        self.state
    }

    fn transition(&self, operation: &'static str, allowed: &[StageState]) -> IqlResult<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(IqlError::InvalidStageState {
                grouping: self.grouping.to_string(),
                operation,
                state: self.state,
            })
        }
    }

    pub fn regroup<S: Session + ?Sized>(
        &mut self,
        session: &mut S,
        group_keys: &GroupKeyMap,
    ) -> IqlResult<GroupKeyMap> {
        self.transition("regroup", &[StageState::Unexecuted])?;
        let keys = self.grouping.regroup(session, group_keys)?;
        self.state = StageState::Regrouped;
        Ok(keys)
    }

    pub fn collect_group_stats<'s, S: Session + ?Sized>(
        &mut self,
        session: &'s mut S,
        group_keys: &GroupKeyMap,
        stat_refs: &[StatReference],
        deadline: &Deadline,
    ) -> IqlResult<GroupStatsIter<'s>> {
        self.transition(
            "collect group stats",
            &[StageState::Unexecuted, StageState::Regrouped],
        )?;
        let rows = self
            .grouping
            .collect_group_stats(session, group_keys, stat_refs, deadline)?;
        self.state = StageState::Collected;
        Ok(rows)
    }
}
