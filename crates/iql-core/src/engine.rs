//! Query pipeline execution.
//!
//! A query is a list of stats plus an ordered list of groupings. Every stat is pushed once up
//! front; each grouping except the last then regroups the live group-id space (its output keys
//! feed the next stage), and the last grouping streams the final rows. Whatever happens, every
//! stat the query pushed is popped again before returning, innermost first.
use crate::config::EngineConfig;
use crate::ftgs::Deadline;
use crate::grouping::{Grouping, GroupingStage, StageState};
use crate::key::{GroupKey, GroupKeyMap, GroupStats};
use crate::reference::StatReference;
use crate::result::{assemble, ColumnLayout, ResultTable};
use crate::session::Session;
use crate::stats::Stat;
use std::time::Duration;

pub type IqlResult<T> = Result<T, IqlError>;

#[derive(Debug, thiserror::Error)]
pub enum IqlError {
    #[error(
        "number of requested top terms ({requested}) for field {field} exceeds the limit ({limit}); please simplify the query"
    )]
    TopKExceedsLimit {
        field: String,
        requested: usize,
        limit: usize,
    },

    #[error("result of aggregate operation `{op}` can't be used as input for further calculations")]
    AggregateOperand { op: String },

    #[error("operator `{op}` needs at least one operand")]
    EmptyOperands { op: String },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("stat reference pushed at depth {depth} is no longer valid")]
    StaleReference { depth: usize },

    #[error("dynamic metric {name} is not valid anymore")]
    StaleMetric { name: String },

    #[error("{grouping} does not support {operation}: {reason}")]
    Unsupported {
        grouping: String,
        operation: &'static str,
        reason: &'static str,
    },

    #[error("percentiles do not work with string fields ({field})")]
    StringTermUnsupported { field: String },

    #[error("cannot {operation} {grouping} in state {state:?}")]
    InvalidStageState {
        grouping: String,
        operation: &'static str,
        state: StageState,
    },

    #[error("term stream over {field} aborted: {reason}")]
    StreamAborted { field: String, reason: String },

    #[error("query deadline exceeded after {elapsed:?}")]
    DeadlineExceeded { elapsed: Duration },

    #[error("evaluation stack underflow")]
    StackUnderflow,

    #[error("back-reference {offset} points below the evaluation stack")]
    UnknownReference { offset: usize },

    #[error("regroup would create {groups} groups, exceeding the limit of {limit}")]
    GroupLimitExceeded { groups: usize, limit: usize },

    #[error("session error: {0}")]
    Session(String),
}

/// Stats and groupings handed over by the planner.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Query {
    stats: Vec<(String, Stat)>,
    groupings: Vec<Grouping>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a stat column named after the stat itself.
    pub fn stat(self, stat: Stat) -> Self {
        let name = stat.to_string();
        self.named_stat(name, stat)
    }

    pub fn named_stat(mut self, name: impl Into<String>, stat: Stat) -> Self {
        self.stats.push((name.into(), stat));
        self
    }

    pub fn grouping(mut self, grouping: impl Into<Grouping>) -> Self {
        self.groupings.push(grouping.into());
        self
    }

    pub fn stats(&self) -> impl Iterator<Item = &Stat> {
        self.stats.iter().map(|(_, stat)| stat)
    }

    pub fn groupings(&self) -> &[Grouping] {
        &self.groupings
    }

    fn layout(&self) -> IqlResult<ColumnLayout> {
        let stat_names: Vec<String> = self.stats.iter().map(|(name, _)| name.clone()).collect();
        let percentile_columns: Vec<(usize, String)> = match self.groupings.last() {
            Some(Grouping::Percentile(grouping)) => grouping
                .queries()
                .iter()
                .map(|q| {
                    (
                        q.projection_position(),
                        format!("percentile({}, {})", q.field(), q.percentile()),
                    )
                })
                .collect(),
            _ => Vec::new(),
        };
        ColumnLayout::new(&stat_names, &percentile_columns)
    }
}

#[derive(Clone, Debug, Default)]
pub struct QueryEngine {
    config: EngineConfig,
}

impl QueryEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn execute<S: Session + ?Sized>(&self, session: &mut S, query: Query) -> IqlResult<ResultTable> {
        self.config.validate()?;
        let deadline = Deadline::from_config(&self.config);
        let pushed_before = session.stat_stack().len();

        let result = self.run(session, query, &deadline);

        let mut unwind = Ok(());
        while session.stat_stack().len() > pushed_before {
            if let Err(err) = session.pop_stat() {
                unwind = Err(err);
                break;
            }
        }

        let table = result?;
        unwind?;
        Ok(table)
    }

    fn run<S: Session + ?Sized>(
        &self,
        session: &mut S,
        query: Query,
        deadline: &Deadline,
    ) -> IqlResult<ResultTable> {
        let layout = query.layout()?;

        let mut stat_refs = Vec::with_capacity(query.stats.len());
        for (_, stat) in &query.stats {
            stat_refs.push(session.push_stat(stat)?);
        }

        let mut keys = GroupKeyMap::from([(1, GroupKey::root())]);
        let mut stages: Vec<GroupingStage> =
            query.groupings.into_iter().map(GroupingStage::new).collect();

        let Some(mut terminal) = stages.pop() else {
            let rows = ungrouped_rows(session, &keys, &stat_refs)?;
            return Ok(ResultTable {
                columns: layout.names().to_vec(),
                rows,
            });
        };

        for stage in &mut stages {
            keys = stage.regroup(session, &keys)?;
            deadline.check()?;
            log::debug!("{} live group(s) after {}", keys.len(), stage.grouping());
        }

        let rows = assemble([terminal.collect_group_stats(session, &keys, &stat_refs, deadline)?])?;
        log::debug!("query produced {} row(s)", rows.len());
        Ok(ResultTable {
            columns: layout.names().to_vec(),
            rows,
        })
    }
}

fn ungrouped_rows<S: Session + ?Sized>(
    session: &mut S,
    keys: &GroupKeyMap,
    stat_refs: &[StatReference],
) -> IqlResult<Vec<GroupStats>> {
    let per_stat = stat_refs
        .iter()
        .map(|reference| session.group_stats(reference))
        .collect::<IqlResult<Vec<_>>>()?;
    Ok(keys
        .iter()
        .map(|(group, key)| {
            let values = per_stat
                .iter()
                .map(|values| values.get(*group as usize).copied().unwrap_or(0.0))
                .collect();
            GroupStats::new(key.clone(), values)
        })
        .collect())
}
