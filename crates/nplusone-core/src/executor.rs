//! Scale-driven executor.
//!
//! For every scale factor the executor opens a transaction, populates the
//! dataset, subscribes the requested collectors, runs the observed block once,
//! snapshots what each collector captured and rolls the transaction back.
//! Rollback happens on every path, including errors and panics, so each
//! cycle starts from the same baseline.

use std::cell::Cell;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use regex::Regex;
use serde::Serialize;
use tracing::{debug, warn};

use crate::collector::{Collector, CollectorRegistry, RegistryError};
use crate::event::{EventRecord, Notifications};
use crate::settings::Settings;

/// Boxed error raised by user callbacks and transaction providers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Collector key → events captured during one cycle.
pub type CollectorResult = BTreeMap<String, Vec<EventRecord>>;

/// Collector used when none are requested.
pub const DEFAULT_COLLECTOR: &str = "db";

thread_local! {
    static CURRENT_SCALE: Cell<Option<u32>> = const { Cell::new(None) };
}

/// Scale factor of the cycle currently running on this thread.
///
/// Lets an observed block parameterize itself without capturing the scale.
pub fn current_scale() -> Option<u32> {
    CURRENT_SCALE.with(Cell::get)
}

/// Restores the previous thread-local scale on drop.
struct ScaleScope {
    previous: Option<u32>,
}

impl ScaleScope {
    fn enter(scale: u32) -> Self {
        let previous = CURRENT_SCALE.with(|c| c.replace(Some(scale)));
        Self { previous }
    }
}

impl Drop for ScaleScope {
    fn drop(&mut self) {
        CURRENT_SCALE.with(|c| c.set(self.previous));
    }
}

/// Error type for [`Executor::call`].
#[derive(Debug)]
pub enum ExecError {
    /// No observed block was supplied.
    MissingBlock,
    /// No population callback could be resolved.
    MissingPopulation,
    /// The collector key list is empty.
    NoCollectors,
    /// Requested collector keys are not registered.
    UnknownCollector {
        missing: Vec<String>,
        registered: Vec<String>,
    },
    /// The scale factor list is empty.
    NoScaleFactors,
    /// The population or observed block failed.
    Observed(BoxError),
    /// Beginning or rolling back the transaction failed.
    Transaction(BoxError),
}

impl fmt::Display for ExecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecError::MissingBlock => write!(f, "Block is required!"),
            ExecError::MissingPopulation => write!(
                f,
                "Populate block is missing! Provide a population callback, \
                 e.g. `.populate(|n| db.create_posts(n))`"
            ),
            ExecError::UnknownCollector {
                missing,
                registered,
            } => write!(
                f,
                "No collectors for keys: {}, existing collectors are: {}",
                missing.join(", "),
                registered.join(", ")
            ),
            ExecError::NoCollectors => write!(f, "At least one collector key is required"),
            ExecError::NoScaleFactors => write!(f, "At least one scale factor is required"),
            ExecError::Observed(e) => write!(f, "{}", e),
            ExecError::Transaction(e) => write!(f, "transaction error: {}", e),
        }
    }
}

impl std::error::Error for ExecError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ExecError::Observed(e) | ExecError::Transaction(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

impl From<RegistryError> for ExecError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::UnknownCollectors {
                missing,
                registered,
            } => ExecError::UnknownCollector {
                missing,
                registered,
            },
            RegistryError::NotFound { key, registered } => ExecError::UnknownCollector {
                missing: vec![key],
                registered,
            },
        }
    }
}

/// Begin/rollback boundary wrapped around each cycle.
///
/// Implementations must be nesting-safe: a `begin` inside an already open
/// application transaction must not let that transaction commit the cycle's
/// changes.
pub trait TransactionProvider {
    fn begin(&mut self) -> Result<(), BoxError>;
    fn rollback(&mut self) -> Result<(), BoxError>;
}

/// Provider for code with no transactional side effects.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoTransaction;

impl TransactionProvider for NoTransaction {
    fn begin(&mut self) -> Result<(), BoxError> {
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), BoxError> {
        Ok(())
    }
}

impl<T: TransactionProvider + ?Sized> TransactionProvider for &mut T {
    fn begin(&mut self) -> Result<(), BoxError> {
        (**self).begin()
    }

    fn rollback(&mut self) -> Result<(), BoxError> {
        (**self).rollback()
    }
}

impl<T: TransactionProvider + ?Sized> TransactionProvider for Box<T> {
    fn begin(&mut self) -> Result<(), BoxError> {
        (**self).begin()
    }

    fn rollback(&mut self) -> Result<(), BoxError> {
        (**self).rollback()
    }
}

/// Rolls back on drop unless [`Cycle::rollback`] already did.
struct Cycle<'t, T: TransactionProvider + ?Sized> {
    transaction: &'t mut T,
    open: bool,
}

impl<'t, T: TransactionProvider + ?Sized> Cycle<'t, T> {
    fn begin(transaction: &'t mut T) -> Result<Self, ExecError> {
        transaction.begin().map_err(ExecError::Transaction)?;
        Ok(Self {
            transaction,
            open: true,
        })
    }

    fn rollback(mut self) -> Result<(), ExecError> {
        self.open = false;
        self.transaction.rollback().map_err(ExecError::Transaction)
    }
}

impl<T: TransactionProvider + ?Sized> Drop for Cycle<'_, T> {
    fn drop(&mut self) {
        if self.open
            && let Err(e) = self.transaction.rollback()
        {
            warn!("rollback failed while unwinding cycle: {}", e);
        }
    }
}

/// Queries collected at one scale factor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunResult {
    pub scale: u32,
    pub collected: CollectorResult,
}

impl RunResult {
    /// Events captured by `key`; empty if the key was not collected.
    pub fn queries(&self, key: &str) -> &[EventRecord] {
        self.collected.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn count(&self, key: &str) -> usize {
        self.queries(key).len()
    }
}

type Population<'a> = Box<dyn FnMut(u32) -> Result<(), BoxError> + 'a>;
type Observed<'a> = Box<dyn FnMut() -> Result<(), BoxError> + 'a>;

/// Runs an observed block once per scale factor and collects its queries.
///
/// # Example
///
/// ```
/// use nplusone_core::event::Notifications;
/// use nplusone_core::executor::Executor;
/// use nplusone_core::mock::MockDatabase;
///
/// let bus = Notifications::new();
/// let db = MockDatabase::new(bus.clone());
///
/// let populate_db = db.clone();
/// let observed_db = db.clone();
/// let results = Executor::new()
///     .with_notifications(bus)
///     .with_transaction(db.clone())
///     .population(move |n| {
///         populate_db.create_posts(n);
///         Ok(())
///     })
///     .observe(move || {
///         for post in observed_db.posts() {
///             observed_db.user(post.user_id);
///         }
///         Ok(())
///     })
///     .call()
///     .unwrap();
///
/// let counts: Vec<usize> = results.iter().map(|r| r.count("db")).collect();
/// assert_eq!(counts, vec![3, 4]);
/// ```
pub struct Executor<'a> {
    population: Option<Population<'a>>,
    observed: Option<Observed<'a>>,
    scale_factors: Option<Vec<u32>>,
    matching: Option<Regex>,
    collectors: Vec<String>,
    settings: Arc<Settings>,
    registry: CollectorRegistry,
    notifications: Notifications,
    transaction: Box<dyn TransactionProvider + 'a>,
    scale: Option<u32>,
}

impl Default for Executor<'_> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a> Executor<'a> {
    /// Creates an executor over the process-wide settings, registry and bus.
    pub fn new() -> Self {
        Self {
            population: None,
            observed: None,
            scale_factors: None,
            matching: None,
            collectors: vec![DEFAULT_COLLECTOR.to_string()],
            settings: Settings::global(),
            registry: CollectorRegistry::global(),
            notifications: Notifications::global().clone(),
            transaction: Box::new(NoTransaction),
            scale: None,
        }
    }

    pub fn with_settings(mut self, settings: Arc<Settings>) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_registry(mut self, registry: CollectorRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_notifications(mut self, notifications: Notifications) -> Self {
        self.notifications = notifications;
        self
    }

    pub fn with_transaction<T: TransactionProvider + 'a>(mut self, transaction: T) -> Self {
        self.transaction = Box::new(transaction);
        self
    }

    /// Callback creating a dataset of the given size before each observation.
    pub fn population<F>(mut self, f: F) -> Self
    where
        F: FnMut(u32) -> Result<(), BoxError> + 'a,
    {
        self.population = Some(Box::new(f));
        self
    }

    /// The block whose queries are counted.
    pub fn observe<F>(mut self, f: F) -> Self
    where
        F: FnMut() -> Result<(), BoxError> + 'a,
    {
        self.observed = Some(Box::new(f));
        self
    }

    /// Scale factors to run, in order. Defaults to [`Settings::default_scale_factors`].
    pub fn scale_factors<I: IntoIterator<Item = u32>>(mut self, factors: I) -> Self {
        self.scale_factors = Some(factors.into_iter().collect());
        self
    }

    /// Matching rule applied by every collector. `None` matches everything.
    pub fn matching(mut self, pattern: Option<Regex>) -> Self {
        self.matching = pattern;
        self
    }

    /// Collector keys to run. Defaults to `["db"]`.
    pub fn collectors<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.collectors = keys.into_iter().map(Into::into).collect();
        self
    }

    pub fn settings(&self) -> &Arc<Settings> {
        &self.settings
    }

    pub fn registry(&self) -> &CollectorRegistry {
        &self.registry
    }

    /// Scale of the cycle in progress, or of the last cycle run.
    pub fn current_scale(&self) -> Option<u32> {
        self.scale
    }

    /// Runs every cycle and returns one [`RunResult`] per scale factor.
    pub fn call(&mut self) -> Result<Vec<RunResult>, ExecError> {
        let Some(observed) = self.observed.as_mut() else {
            return Err(ExecError::MissingBlock);
        };

        if self.collectors.is_empty() {
            return Err(ExecError::NoCollectors);
        }
        let descriptors = self.registry.slice(&self.collectors)?;

        let scale_factors = self
            .scale_factors
            .clone()
            .unwrap_or_else(|| self.settings.default_scale_factors.clone());
        if scale_factors.is_empty() {
            return Err(ExecError::NoScaleFactors);
        }

        let mut collectors: Vec<Collector> = descriptors
            .into_iter()
            .map(|d| Collector::new(d, self.matching.clone(), self.settings.clone()))
            .collect();

        let mut results = Vec::with_capacity(scale_factors.len());

        for scale in scale_factors {
            self.scale = Some(scale);
            let _scope = ScaleScope::enter(scale);
            debug!(scale, "starting cycle");

            let cycle = Cycle::begin(self.transaction.as_mut())?;

            let outcome = run_cycle(
                scale,
                self.population.as_mut(),
                observed,
                &mut collectors,
                &self.notifications,
            );

            for collector in &mut collectors {
                collector.reset();
            }

            match outcome {
                Ok(collected) => {
                    cycle.rollback()?;
                    for (key, queries) in &collected {
                        debug!(scale, collector = key.as_str(), count = queries.len(), "cycle finished");
                    }
                    results.push(RunResult { scale, collected });
                }
                Err(e) => {
                    // Cycle's drop rolls back; the callback error takes precedence.
                    drop(cycle);
                    return Err(e);
                }
            }
        }

        Ok(results)
    }
}

fn run_cycle(
    scale: u32,
    population: Option<&mut Population<'_>>,
    observed: &mut Observed<'_>,
    collectors: &mut [Collector],
    notifications: &Notifications,
) -> Result<CollectorResult, ExecError> {
    if let Some(populate) = population {
        populate(scale).map_err(ExecError::Observed)?;
    }

    for collector in collectors.iter_mut() {
        collector.subscribe(notifications);
    }

    observed().map_err(ExecError::Observed)?;

    Ok(collectors
        .iter()
        .map(|c| (c.key().to_string(), c.queries()))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::DbCollector;
    use crate::event::Event;
    use std::cell::RefCell;
    use std::rc::Rc;

    /// Records begin/rollback calls.
    #[derive(Clone, Default)]
    struct Journal(Rc<RefCell<Vec<String>>>);

    impl Journal {
        fn push(&self, entry: impl Into<String>) {
            self.0.borrow_mut().push(entry.into());
        }

        fn entries(&self) -> Vec<String> {
            self.0.borrow().clone()
        }
    }

    impl TransactionProvider for Journal {
        fn begin(&mut self) -> Result<(), BoxError> {
            self.push("begin");
            Ok(())
        }

        fn rollback(&mut self) -> Result<(), BoxError> {
            self.push("rollback");
            Ok(())
        }
    }

    fn executor<'a>(bus: &Notifications) -> Executor<'a> {
        Executor::new()
            .with_settings(Arc::new(Settings::default()))
            .with_registry(CollectorRegistry::with_defaults())
            .with_notifications(bus.clone())
    }

    fn emit(bus: &Notifications, sql: &str) {
        bus.instrument("sql.query", Event::new(sql));
    }

    #[test]
    fn test_missing_block() {
        let bus = Notifications::new();
        let err = executor(&bus).call().unwrap_err();
        assert!(matches!(err, ExecError::MissingBlock));
        assert_eq!(err.to_string(), "Block is required!");
    }

    #[test]
    fn test_unknown_collector_before_any_cycle() {
        let bus = Notifications::new();
        let journal = Journal::default();
        let err = executor(&bus)
            .with_transaction(journal.clone())
            .collectors(["db", "redis"])
            .observe(|| Ok(()))
            .call()
            .unwrap_err();

        match err {
            ExecError::UnknownCollector {
                missing,
                registered,
            } => {
                assert_eq!(missing, vec!["redis"]);
                assert_eq!(registered, vec!["db"]);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(journal.entries().is_empty());
    }

    #[test]
    fn test_registry_lookup_error_keeps_registered_keys() {
        let err = ExecError::from(
            CollectorRegistry::with_defaults()
                .get("redis")
                .err()
                .unwrap(),
        );
        assert_eq!(
            err.to_string(),
            "No collectors for keys: redis, existing collectors are: db"
        );
    }

    #[test]
    fn test_empty_collector_list() {
        let bus = Notifications::new();
        let journal = Journal::default();
        let err = executor(&bus)
            .with_transaction(journal.clone())
            .collectors(Vec::<String>::new())
            .observe(|| Ok(()))
            .call()
            .unwrap_err();
        assert!(matches!(err, ExecError::NoCollectors));
        assert!(journal.entries().is_empty());
    }

    #[test]
    fn test_empty_scale_factors() {
        let bus = Notifications::new();
        let err = executor(&bus)
            .scale_factors(Vec::new())
            .observe(|| Ok(()))
            .call()
            .unwrap_err();
        assert!(matches!(err, ExecError::NoScaleFactors));
    }

    #[test]
    fn test_cycle_order_and_counts() {
        let bus = Notifications::new();
        let journal = Journal::default();
        let size = Rc::new(Cell::new(0u32));

        let populate_journal = journal.clone();
        let populate_size = size.clone();
        let observed_bus = bus.clone();
        let observed_size = size.clone();
        let observed_journal = journal.clone();

        let results = executor(&bus)
            .with_transaction(journal.clone())
            .scale_factors([5, 10, 100])
            .population(move |n| {
                populate_journal.push(format!("populate {n}"));
                populate_size.set(n);
                Ok(())
            })
            .observe(move || {
                observed_journal.push("observe");
                emit(&observed_bus, "SELECT * FROM posts");
                for _ in 0..observed_size.get() {
                    emit(&observed_bus, "SELECT * FROM users WHERE id = $1");
                }
                Ok(())
            })
            .call()
            .unwrap();

        let summary: Vec<(u32, usize)> = results.iter().map(|r| (r.scale, r.count("db"))).collect();
        assert_eq!(summary, vec![(5, 6), (10, 11), (100, 101)]);
        assert_eq!(
            journal.entries(),
            vec![
                "begin", "populate 5", "observe", "rollback",
                "begin", "populate 10", "observe", "rollback",
                "begin", "populate 100", "observe", "rollback",
            ]
        );
    }

    #[test]
    fn test_population_queries_not_counted() {
        let bus = Notifications::new();
        let populate_bus = bus.clone();

        let results = executor(&bus)
            .matching(None)
            .population(move |_| {
                emit(&populate_bus, "SELECT * FROM users");
                Ok(())
            })
            .observe(|| Ok(()))
            .call()
            .unwrap();

        assert!(results.iter().all(|r| r.count("db") == 0));
        assert_eq!(bus.subscriber_count("sql.query"), 0);
    }

    #[test]
    fn test_matching_rule_applies() {
        let bus = Notifications::new();
        let observed_bus = bus.clone();

        let results = executor(&bus)
            .matching(Some(Regex::new("users").unwrap()))
            .observe(move || {
                emit(&observed_bus, "SELECT * FROM posts");
                emit(&observed_bus, "SELECT * FROM users");
                Ok(())
            })
            .call()
            .unwrap();

        assert!(results.iter().all(|r| r.count("db") == 1));
    }

    #[test]
    fn test_every_result_has_every_key() {
        let bus = Notifications::new();
        let mut registry = CollectorRegistry::with_defaults();
        registry.register(Arc::new(DbCollector::with_key("replica").on_event("sql.replica")));
        let observed_bus = bus.clone();

        let results = executor(&bus)
            .with_registry(registry)
            .collectors(["db", "replica"])
            .observe(move || {
                emit(&observed_bus, "SELECT 1");
                Ok(())
            })
            .call()
            .unwrap();

        for result in &results {
            let keys: Vec<&String> = result.collected.keys().collect();
            assert_eq!(keys, vec!["db", "replica"]);
            assert_eq!(result.count("db"), 1);
            assert_eq!(result.count("replica"), 0);
        }
    }

    #[test]
    fn test_observed_error_propagates_after_rollback() {
        let bus = Notifications::new();
        let journal = Journal::default();
        let calls = Rc::new(Cell::new(0));
        let observed_calls = calls.clone();

        let err = executor(&bus)
            .with_transaction(journal.clone())
            .observe(move || {
                observed_calls.set(observed_calls.get() + 1);
                Err("boom".into())
            })
            .call()
            .unwrap_err();

        assert!(matches!(err, ExecError::Observed(_)));
        assert_eq!(err.to_string(), "boom");
        assert_eq!(calls.get(), 1);
        assert_eq!(journal.entries(), vec!["begin", "rollback"]);
        assert_eq!(bus.subscriber_count("sql.query"), 0);
    }

    #[test]
    fn test_population_error_propagates_after_rollback() {
        let bus = Notifications::new();
        let journal = Journal::default();

        let err = executor(&bus)
            .with_transaction(journal.clone())
            .population(|_| Err("factory failed".into()))
            .observe(|| Ok(()))
            .call()
            .unwrap_err();

        assert_eq!(err.to_string(), "factory failed");
        assert_eq!(journal.entries(), vec!["begin", "rollback"]);
    }

    #[test]
    fn test_rollback_on_panic() {
        let journal = Journal::default();
        let panicking = journal.clone();

        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            let bus = Notifications::new();
            let _ = executor(&bus)
                .with_transaction(panicking)
                .observe(|| panic!("observed block panicked"))
                .call();
        }));

        assert!(outcome.is_err());
        assert_eq!(journal.entries(), vec!["begin", "rollback"]);
        assert_eq!(current_scale(), None);
    }

    #[test]
    fn test_current_scale_side_channel() {
        let bus = Notifications::new();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let observed_seen = seen.clone();

        let mut exec = executor(&bus)
            .scale_factors([1, 4])
            .observe(move || {
                observed_seen.borrow_mut().push(current_scale());
                Ok(())
            });
        exec.call().unwrap();

        assert_eq!(*seen.borrow(), vec![Some(1), Some(4)]);
        assert_eq!(exec.current_scale(), Some(4));
        assert_eq!(current_scale(), None);
    }

    #[test]
    fn test_default_scale_factors_from_settings() {
        let bus = Notifications::new();
        let settings = Settings {
            default_scale_factors: vec![7],
            ..Settings::default()
        };

        let results = executor(&bus)
            .with_settings(Arc::new(settings))
            .observe(|| Ok(()))
            .call()
            .unwrap();

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].scale, 7);
    }

    #[test]
    fn test_begin_failure_is_transaction_error() {
        struct Refusing;
        impl TransactionProvider for Refusing {
            fn begin(&mut self) -> Result<(), BoxError> {
                Err("no connection".into())
            }
            fn rollback(&mut self) -> Result<(), BoxError> {
                Ok(())
            }
        }

        let bus = Notifications::new();
        let err = executor(&bus)
            .with_transaction(Refusing)
            .observe(|| Ok(()))
            .call()
            .unwrap_err();
        assert!(matches!(err, ExecError::Transaction(_)));
        assert_eq!(err.to_string(), "transaction error: no connection");
    }
}
