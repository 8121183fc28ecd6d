mod config;
mod engine;
mod ftgs;
mod grouping;
mod key;
mod memory;
mod reference;
mod result;
mod session;
mod stats;

pub use crate::engine::{IqlError, IqlResult, Query, QueryEngine};

pub use crate::config::{
    EngineConfig, DEFAULT_DEADLINE_CHECK_INTERVAL, DEFAULT_GROUP_LIMIT, GROUP_LIMIT_ENV,
    QUERY_TIMEOUT_ENV,
};
pub use crate::ftgs::{fold_stream, Deadline, FtgsCallback};
pub use crate::grouping::{
    DiffGrouping, FieldGrouping, FieldGroupingOptions, GroupStatsIter, Grouping, GroupingStage,
    PercentileCallback, PercentileGrouping, PercentileQuery, SplitMode, StageState, TopKCallback,
};
pub use crate::key::{Field, FieldKind, GroupKey, GroupKeyMap, GroupStats, Term};
pub use crate::memory::{Document, InMemorySession};
pub use crate::reference::{
    DynamicMetric, MetricRegistry, SingleStatReference, StatReference, StatStack,
};
pub use crate::result::{assemble, merge_percentile_row, ColumnLayout, ResultTable};
pub use crate::session::{FtgsRecord, FtgsStream, Session};
pub use crate::stats::{
    AggregateBinOpStat, AggregateOp, BinOpStat, CompileContext, Stat, StatOp, Token,
};
