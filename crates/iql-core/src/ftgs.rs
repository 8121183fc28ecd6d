//! Folding the sorted term stream into per-group accumulators.
use crate::config::EngineConfig;
use crate::engine::{IqlError, IqlResult};
use crate::key::Term;
use crate::session::FtgsRecord;
use std::time::{Duration, Instant};

/// Receives one call per (field, term, group) record, in stream order.
///
/// `stats` holds the aggregated value of every evaluation stack slot; read individual stats
/// with [`crate::StatReference::read`]. Implementations must not block.
pub trait FtgsCallback {
    fn int_term_group(&mut self, field: &str, term: i64, group: u32, stats: &[f64])
        -> IqlResult<()>;

    fn string_term_group(
        &mut self,
        field: &str,
        term: &str,
        group: u32,
        stats: &[f64],
    ) -> IqlResult<()>;
}

/// Cooperative query deadline checked while folding.
#[derive(Clone, Copy, Debug)]
pub struct Deadline {
    started: Instant,
    limit: Option<Duration>,
    check_interval: usize,
}

impl Deadline {
    pub fn none() -> Self {
        Self {
            started: Instant::now(),
            limit: None,
            check_interval: 0,
        }
    }

    pub fn after(limit: Duration, check_interval: usize) -> Self {
        Self {
            started: Instant::now(),
            limit: Some(limit),
            check_interval: check_interval.max(1),
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        match config.query_timeout {
            Some(limit) => Self::after(limit, config.deadline_check_interval),
            None => Self::none(),
        }
    }

    pub fn check(&self) -> IqlResult<()> {
        match self.limit {
            Some(limit) if self.started.elapsed() >= limit => Err(IqlError::DeadlineExceeded {
                elapsed: self.started.elapsed(),
            }),
            _ => Ok(()),
        }
    }

    pub(crate) fn due(&self, seen: usize) -> bool {
        self.limit.is_some() && seen % self.check_interval == 0
    }
}

/// Drive `callback` over every record of `stream`, returning the number of records folded.
///
/// The first stream error, callback error or missed deadline stops the fold; callers must then
/// drop whatever the callback accumulated.
pub fn fold_stream<I, C>(stream: I, callback: &mut C, deadline: &Deadline) -> IqlResult<usize>
where
    I: IntoIterator<Item = IqlResult<FtgsRecord>>,
    C: FtgsCallback + ?Sized,
{
    let mut seen = 0usize;
    for record in stream {
        if deadline.due(seen) {
            deadline.check()?;
        }
        let record = record?;
        match &record.term {
            Term::Int(term) => {
                callback.int_term_group(&record.field, *term, record.group, &record.stats)?
            }
            Term::Str(term) => {
                callback.string_term_group(&record.field, term, record.group, &record.stats)?
            }
        }
        seen += 1;
    }
    log::trace!("folded {seen} term/group records");
    Ok(seen)
}
