//! Driver configuration.
//!
//! A plain builder validated at construction, in the idiom of
//! `raya-core`'s `ResourceLimits`/`ResourceCounters` pair (vm/context.rs):
//! a value struct plus small, composable setters, no file-backed config
//! layer. `new(config)` in the spec (§6) is an in-process call from the
//! external CLI, which never needed one of its own.

use std::fmt;
use std::sync::Arc;

use crate::error::ConfigError;

/// A predicate deciding whether a filename is tracked at all (§6
/// `source_filter`). Filtered-out files are never decoded or edited
/// (S4): their lines never appear in any report set.
pub type SourceFilter = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Validated configuration for a [`crate::driver::Driver`].
#[derive(Clone)]
pub struct Config {
    /// Whether branch coverage is tracked (requires the pre-instrumenter
    /// on the bytecode backend, or native branch events on the
    /// monitoring backend).
    pub branch: bool,
    /// Whether probes patch their own leading `NOP` into a jump on their
    /// first D-miss, ahead of a host-wide deinstrument round.
    pub immediate: bool,
    /// §6 threshold sentinels: `-2` never removes or deinstruments
    /// (diagnostic mode); `-1` removes the probe locally without
    /// requesting a host-wide round; `n >= 0` requests a round after `n`
    /// D-misses.
    pub d_miss_threshold: i64,
    /// Whether [`crate::driver::Driver::get_coverage`] aggregates
    /// per-probe hit/D-miss/U-miss counters into its `stats` field.
    pub collect_stats: bool,
    /// Predicate deciding whether a given filename is tracked.
    pub source_filter: SourceFilter,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("branch", &self.branch)
            .field("immediate", &self.immediate)
            .field("d_miss_threshold", &self.d_miss_threshold)
            .field("collect_stats", &self.collect_stats)
            .field("source_filter", &"<predicate>")
            .finish()
    }
}

impl Config {
    /// Start building a [`Config`] with the teacher's fluent-builder
    /// convention (cf. `ResourceLimits::with_heap_limit`).
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }
}

/// Builder for [`Config`]. Unvalidated until [`ConfigBuilder::build`] is
/// called, which is where `ConfigError` can surface (§7: fatal at init).
pub struct ConfigBuilder {
    branch: bool,
    immediate: bool,
    d_miss_threshold: i64,
    collect_stats: bool,
    source_filter: Option<SourceFilter>,
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self {
            branch: false,
            immediate: false,
            d_miss_threshold: 50,
            collect_stats: false,
            source_filter: None,
        }
    }
}

impl ConfigBuilder {
    /// Enable branch coverage.
    pub fn branch(mut self, enabled: bool) -> Self {
        self.branch = enabled;
        self
    }

    /// Enable immediate single-byte self-disable on a probe's first
    /// D-miss.
    pub fn immediate(mut self, enabled: bool) -> Self {
        self.immediate = enabled;
        self
    }

    /// Set the D-miss threshold. See [`Config::d_miss_threshold`] for the
    /// sentinel values; validated in [`Self::build`].
    pub fn d_miss_threshold(mut self, threshold: i64) -> Self {
        self.d_miss_threshold = threshold;
        self
    }

    /// Enable per-probe hit/D-miss/U-miss aggregation in coverage reports.
    pub fn collect_stats(mut self, enabled: bool) -> Self {
        self.collect_stats = enabled;
        self
    }

    /// Restrict tracked files to those for which `filter` returns `true`.
    pub fn source_filter(mut self, filter: impl Fn(&str) -> bool + Send + Sync + 'static) -> Self {
        self.source_filter = Some(Arc::new(filter));
        self
    }

    /// Validate and produce a [`Config`].
    pub fn build(self) -> Result<Config, ConfigError> {
        if self.d_miss_threshold < -2 {
            return Err(ConfigError::InvalidThreshold(self.d_miss_threshold));
        }
        Ok(Config {
            branch: self.branch,
            immediate: self.immediate,
            d_miss_threshold: self.d_miss_threshold,
            collect_stats: self.collect_stats,
            source_filter: self.source_filter.unwrap_or_else(|| Arc::new(|_: &str| true)),
        })
    }
}
