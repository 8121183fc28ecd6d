use crate::engine::{IqlError, IqlResult};
use crate::stats::Stat;
use std::time::Duration;

/// Hard ceiling on the number of groups a session may hold, and therefore on top-K.
pub const DEFAULT_GROUP_LIMIT: usize = 1_000_000;

/// Records folded between two deadline checks.
pub const DEFAULT_DEADLINE_CHECK_INTERVAL: usize = 4096;

pub const GROUP_LIMIT_ENV: &str = "IQL_GROUP_LIMIT";
pub const QUERY_TIMEOUT_ENV: &str = "IQL_QUERY_TIMEOUT_MS";

#[derive(Clone, Debug, PartialEq)]
pub struct EngineConfig {
    pub group_limit: usize,
    /// Sort stat used by top-K field groupings that do not name one.
    pub default_sort_stat: Stat,
    pub query_timeout: Option<Duration>,
    pub deadline_check_interval: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            group_limit: DEFAULT_GROUP_LIMIT,
            default_sort_stat: Stat::count(),
            query_timeout: None,
            deadline_check_interval: DEFAULT_DEADLINE_CHECK_INTERVAL,
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by `IQL_GROUP_LIMIT` and `IQL_QUERY_TIMEOUT_MS`.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`EngineConfig::from_env`] but reading variables through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(raw) = lookup(GROUP_LIMIT_ENV) {
            match parse_count(&raw) {
                Some(limit) if limit > 0 => config.group_limit = limit,
                _ => log::warn!(
                    "ignoring {GROUP_LIMIT_ENV}={raw:?}; using default {}",
                    config.group_limit
                ),
            }
        }

        if let Some(raw) = lookup(QUERY_TIMEOUT_ENV) {
            match parse_count(&raw) {
                Some(0) => config.query_timeout = None,
                Some(ms) => config.query_timeout = Some(Duration::from_millis(ms as u64)),
                None => log::warn!("ignoring {QUERY_TIMEOUT_ENV}={raw:?}; queries run without a timeout"),
            }
        }

        config
    }

    pub fn with_group_limit(mut self, limit: usize) -> Self {
        self.group_limit = limit;
        self
    }

    pub fn with_query_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout = Some(timeout);
        self
    }

    pub fn with_default_sort_stat(mut self, stat: Stat) -> Self {
        self.default_sort_stat = stat;
        self
    }

    pub fn validate(&self) -> IqlResult<()> {
        if self.group_limit == 0 {
            return Err(IqlError::InvalidConfig("group limit must be positive".into()));
        }
        if self.deadline_check_interval == 0 && self.query_timeout.is_some() {
            return Err(IqlError::InvalidConfig(
                "a query timeout needs a positive deadline check interval".into(),
            ));
        }
        Ok(())
    }
}

fn parse_count(raw: &str) -> Option<usize> {
    raw.trim().replace('_', "").parse().ok()
}
