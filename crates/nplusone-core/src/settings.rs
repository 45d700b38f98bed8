//! Process-wide configuration for query collection and reporting.
//!
//! Every algorithm in this crate takes an explicit [`Settings`] value. A single
//! process-lifetime default is kept behind [`Settings::global`] for convenience;
//! it is initialized from the environment on first use:
//!
//! - `NPLUSONE_VERBOSE=1` — dump collected queries on failure
//! - `NPLUSONE_FILTER` — default matching pattern (case-insensitive)
//! - `NPLUSONE_TRUNCATE` — truncate dumped queries to this many characters
//! - `NPLUSONE_BACKTRACE` — number of call-site lines attached to each query
//! - `NPLUSONE_EVENT` — event name the `db` collector subscribes to

use std::fmt;
use std::sync::{Arc, LazyLock, PoisonError, RwLock};

use regex::{Regex, RegexBuilder};
use tracing::warn;

/// Scale factors used when none are given explicitly.
pub const DEFAULT_SCALE_FACTORS: [u32; 2] = [2, 3];

/// Event name instrumented SQL is published under by default.
pub const DEFAULT_EVENT: &str = "sql.query";

/// Default matching pattern: only SELECT statements are counted.
pub const DEFAULT_MATCHING: &str = "^SELECT";

/// Transaction control statements never count as queries.
pub const DEFAULT_IGNORE: &str = "^(BEGIN|COMMIT|ROLLBACK|SAVEPOINT|RELEASE)";

/// Cleans raw call-site locations down to the frames worth showing.
pub type BacktraceCleaner = Arc<dyn Fn(Vec<String>) -> Vec<String> + Send + Sync>;

static GLOBAL: LazyLock<RwLock<Arc<Settings>>> = LazyLock::new(|| {
    let settings = Settings::from_env().unwrap_or_else(|e| {
        warn!("ignoring invalid environment configuration: {}", e);
        Settings::default()
    });
    RwLock::new(Arc::new(settings))
});

/// Error raised while reading configuration from the environment.
#[derive(Debug)]
pub enum SettingsError {
    /// A pattern variable did not compile.
    InvalidPattern { var: String, source: regex::Error },
    /// A numeric variable did not parse.
    InvalidNumber { var: String, value: String },
}

impl fmt::Display for SettingsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SettingsError::InvalidPattern { var, source } => {
                write!(f, "{}: invalid pattern: {}", var, source)
            }
            SettingsError::InvalidNumber { var, value } => {
                write!(f, "{}: expected a non-negative integer, got '{}'", var, value)
            }
        }
    }
}

impl std::error::Error for SettingsError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SettingsError::InvalidPattern { source, .. } => Some(source),
            SettingsError::InvalidNumber { .. } => None,
        }
    }
}

/// Compiles a user-supplied matching pattern.
///
/// Patterns are case-insensitive and `.` also matches newlines, so multi-line
/// SQL is matched as a whole.
pub fn compile_pattern(pattern: &str) -> Result<Regex, regex::Error> {
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .dot_matches_new_line(true)
        .build()
}

/// Configuration consulted by collectors, the executor and reports.
#[derive(Clone)]
pub struct Settings {
    /// Scale factors used when the caller gives none.
    pub default_scale_factors: Vec<u32>,
    /// Matching rule used when the caller gives none. `None` matches everything.
    pub default_matching: Option<Regex>,
    /// Events whose payload matches are dropped unconditionally.
    pub ignore: Option<Regex>,
    /// Drop events served from a cache.
    pub ignore_cached_queries: bool,
    /// Append every collected query to failure messages.
    pub verbose: bool,
    /// Append per-table usage deltas to failure messages.
    pub show_table_stats: bool,
    /// Maximum length of a dumped query, trace excluded.
    pub truncate_query_size: Option<usize>,
    /// Number of call-site lines kept per query.
    pub backtrace_length: usize,
    /// Call-site tracing is enabled only when a cleaner is set.
    pub backtrace_cleaner: Option<BacktraceCleaner>,
    /// Event name the `db` collector subscribes to.
    pub event: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            default_scale_factors: DEFAULT_SCALE_FACTORS.to_vec(),
            default_matching: compile_pattern(DEFAULT_MATCHING).ok(),
            ignore: Regex::new(DEFAULT_IGNORE).ok(),
            ignore_cached_queries: false,
            verbose: false,
            show_table_stats: true,
            truncate_query_size: None,
            backtrace_length: 1,
            backtrace_cleaner: None,
            event: DEFAULT_EVENT.to_string(),
        }
    }
}

impl fmt::Debug for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Settings")
            .field("default_scale_factors", &self.default_scale_factors)
            .field(
                "default_matching",
                &self.default_matching.as_ref().map(Regex::as_str),
            )
            .field("ignore", &self.ignore.as_ref().map(Regex::as_str))
            .field("ignore_cached_queries", &self.ignore_cached_queries)
            .field("verbose", &self.verbose)
            .field("show_table_stats", &self.show_table_stats)
            .field("truncate_query_size", &self.truncate_query_size)
            .field("backtrace_length", &self.backtrace_length)
            .field("backtrace_cleaner", &self.backtrace_cleaner.is_some())
            .field("event", &self.event)
            .finish()
    }
}

impl Settings {
    /// Builds settings from defaults overridden by `NPLUSONE_*` variables.
    pub fn from_env() -> Result<Self, SettingsError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Same as [`Settings::from_env`] with an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, SettingsError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut settings = Self::default();

        if let Some(value) = lookup("NPLUSONE_VERBOSE") {
            settings.verbose = value == "1";
        }

        if let Some(pattern) = lookup("NPLUSONE_FILTER") {
            settings.default_matching =
                Some(compile_pattern(&pattern).map_err(|source| {
                    SettingsError::InvalidPattern {
                        var: "NPLUSONE_FILTER".to_string(),
                        source,
                    }
                })?);
        }

        if let Some(value) = lookup("NPLUSONE_TRUNCATE") {
            settings.truncate_query_size = Some(parse_number("NPLUSONE_TRUNCATE", &value)?);
        }

        if let Some(value) = lookup("NPLUSONE_BACKTRACE") {
            settings.backtrace_length = parse_number("NPLUSONE_BACKTRACE", &value)?;
        }

        if let Some(event) = lookup("NPLUSONE_EVENT") {
            settings.event = event;
        }

        Ok(settings)
    }

    /// Returns the process-wide default settings.
    pub fn global() -> Arc<Settings> {
        GLOBAL
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replaces the process-wide default settings.
    pub fn set_global(settings: Settings) {
        *GLOBAL.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(settings);
    }

    /// Applies `f` to a copy of the process-wide settings and installs the result.
    ///
    /// Returns the settings that were active before the update so callers can
    /// restore them.
    pub fn update_global<F>(f: F) -> Arc<Settings>
    where
        F: FnOnce(&mut Settings),
    {
        let mut guard = GLOBAL.write().unwrap_or_else(PoisonError::into_inner);
        let previous = guard.clone();
        let mut next = (*previous).clone();
        f(&mut next);
        *guard = Arc::new(next);
        previous
    }

    /// Installs a backtrace cleaner, enabling call-site tracing in verbose mode.
    pub fn with_backtrace_cleaner<F>(mut self, cleaner: F) -> Self
    where
        F: Fn(Vec<String>) -> Vec<String> + Send + Sync + 'static,
    {
        self.backtrace_cleaner = Some(Arc::new(cleaner));
        self
    }

    /// Returns true if collectors should attach call-site traces.
    pub fn traces_call_sites(&self) -> bool {
        self.verbose && self.backtrace_cleaner.is_some()
    }
}

fn parse_number(var: &str, value: &str) -> Result<usize, SettingsError> {
    value
        .trim()
        .parse::<usize>()
        .map_err(|_| SettingsError::InvalidNumber {
            var: var.to_string(),
            value: value.to_string(),
        })
}
