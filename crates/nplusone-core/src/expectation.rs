//! Assertion helpers for tests.
//!
//! ```
//! use nplusone_core::expectation::expect_queries;
//! use nplusone_core::event::Notifications;
//! use nplusone_core::mock::MockDatabase;
//!
//! let bus = Notifications::new();
//! let db = MockDatabase::new(bus.clone());
//! let observed = db.clone();
//! let populate = db.clone();
//!
//! expect_queries(move || {
//!     for (_post, _user) in observed.posts_with_users() {}
//!     Ok(())
//! })
//! .populate(move |n| {
//!     populate.create_posts(n);
//!     Ok(())
//! })
//! .with_notifications(bus)
//! .with_transaction(db)
//! .to_perform_constant_number()
//! .unwrap()
//! .assert();
//! ```

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use regex::Regex;
use tracing::debug;

use crate::collector::CollectorRegistry;
use crate::event::Notifications;
use crate::executor::{BoxError, DEFAULT_COLLECTOR, ExecError, Executor, RunResult, TransactionProvider};
use crate::settings::Settings;
use crate::verdict::{Check, Verdict};

/// Scale factors used by the exact-count check when none are given.
pub const EXACT_SCALE_FACTORS: [u32; 1] = [1];

/// Test fixture supplying population and an optional warmup.
pub trait Fixture {
    /// Creates a dataset of size `scale`.
    fn populate(&mut self, scale: u32) -> Result<(), BoxError>;

    /// Runs once before any cycle, outside the transaction.
    fn warmup(&mut self) -> Result<(), BoxError> {
        Ok(())
    }
}

type Callback<'a> = Box<dyn FnMut() -> Result<(), BoxError> + 'a>;
type Population<'a> = Box<dyn FnMut(u32) -> Result<(), BoxError> + 'a>;

/// Builder for one query-count expectation.
pub struct QueryExpectation<'a> {
    observed: Callback<'a>,
    population: Option<Population<'a>>,
    warmup: Option<Callback<'a>>,
    warm_up_with_observed: bool,
    require_population: bool,
    scale_factors: Option<Vec<u32>>,
    matching: Option<Regex>,
    collectors: Vec<String>,
    settings: Option<Arc<Settings>>,
    registry: Option<CollectorRegistry>,
    notifications: Option<Notifications>,
    transaction: Option<Box<dyn TransactionProvider + 'a>>,
    results: Vec<RunResult>,
}

/// Starts an expectation about the queries `observed` performs.
pub fn expect_queries<'a, F>(observed: F) -> QueryExpectation<'a>
where
    F: FnMut() -> Result<(), BoxError> + 'a,
{
    QueryExpectation {
        observed: Box::new(observed),
        population: None,
        warmup: None,
        warm_up_with_observed: false,
        require_population: true,
        scale_factors: None,
        matching: None,
        collectors: vec![DEFAULT_COLLECTOR.to_string()],
        settings: None,
        registry: None,
        notifications: None,
        transaction: None,
        results: Vec::new(),
    }
}

impl<'a> QueryExpectation<'a> {
    pub fn populate<F>(mut self, f: F) -> Self
    where
        F: FnMut(u32) -> Result<(), BoxError> + 'a,
    {
        self.population = Some(Box::new(f));
        self
    }

    /// Uses a fixture's `populate` and `warmup`. Explicit callbacks win.
    pub fn fixture<T: Fixture + 'a>(mut self, fixture: T) -> Self {
        let fixture = Rc::new(RefCell::new(fixture));

        if self.population.is_none() {
            let f = fixture.clone();
            self.population = Some(Box::new(move |n| f.borrow_mut().populate(n)));
        }
        if self.warmup.is_none() {
            self.warmup = Some(Box::new(move || fixture.borrow_mut().warmup()));
        }
        self
    }

    /// Runs the observed block without a population step; the block reads the
    /// scale through [`crate::executor::current_scale`].
    pub fn without_population(mut self) -> Self {
        self.require_population = false;
        self
    }

    /// Runs `f` once before measuring, outside any transaction.
    pub fn warmup<F>(mut self, f: F) -> Self
    where
        F: FnMut() -> Result<(), BoxError> + 'a,
    {
        self.warmup = Some(Box::new(f));
        self
    }

    /// Runs the observed block once before measuring to warm caches.
    pub fn with_warming_up(mut self) -> Self {
        self.warm_up_with_observed = true;
        self
    }

    pub fn with_scale_factors<I: IntoIterator<Item = u32>>(mut self, factors: I) -> Self {
        self.scale_factors = Some(factors.into_iter().collect());
        self
    }

    /// Counts only queries matching `pattern`, instead of the default matching.
    pub fn matching(mut self, pattern: Regex) -> Self {
        self.matching = Some(pattern);
        self
    }

    /// Collectors to check. Defaults to `db`; an empty list is an error.
    pub fn to<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.collectors = keys.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_settings(mut self, settings: Arc<Settings>) -> Self {
        self.settings = Some(settings);
        self
    }

    pub fn with_registry(mut self, registry: CollectorRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_notifications(mut self, notifications: Notifications) -> Self {
        self.notifications = Some(notifications);
        self
    }

    pub fn with_transaction<T: TransactionProvider + 'a>(mut self, transaction: T) -> Self {
        self.transaction = Some(Box::new(transaction));
        self
    }

    /// Passes if the query count is the same at every scale.
    pub fn to_perform_constant_number(self) -> Result<Verdict, ExecError> {
        self.evaluate(Check::Constant)
    }

    /// Passes if the query count grows by at most `slope` per unit of scale.
    pub fn to_perform_linear_number(self, slope: i64) -> Result<Verdict, ExecError> {
        self.evaluate(Check::Linear { slope })
    }

    /// Passes if exactly `expected` queries run. Uses scale factor 1 unless
    /// others are given.
    pub fn to_perform_exact_number(mut self, expected: usize) -> Result<Verdict, ExecError> {
        if self.scale_factors.is_none() {
            self.scale_factors = Some(EXACT_SCALE_FACTORS.to_vec());
        }
        self.evaluate(Check::Exact { expected })
    }

    /// Runs the expectation and also returns the raw results.
    pub fn run(self, check: Check) -> Result<(Verdict, Vec<RunResult>), ExecError> {
        let mut this = self;
        let verdict = this.execute(check)?;
        Ok((verdict, std::mem::take(&mut this.results)))
    }

    fn evaluate(mut self, check: Check) -> Result<Verdict, ExecError> {
        self.execute(check)
    }

    fn execute(&mut self, check: Check) -> Result<Verdict, ExecError> {
        if self.require_population && self.population.is_none() {
            return Err(ExecError::MissingPopulation);
        }

        let settings = self.settings.clone().unwrap_or_else(Settings::global);
        let registry = self.registry.clone().unwrap_or_else(CollectorRegistry::global);
        let notifications = self
            .notifications
            .clone()
            .unwrap_or_else(|| Notifications::global().clone());
        if self.collectors.is_empty() {
            return Err(ExecError::NoCollectors);
        }
        let descriptors = registry.slice(&self.collectors)?;

        if let Some(warmup) = self.warmup.as_mut() {
            debug!("running warmup");
            warmup().map_err(ExecError::Observed)?;
        }
        if self.warm_up_with_observed {
            debug!("warming up with observed block");
            (self.observed)().map_err(ExecError::Observed)?;
        }

        let matching = self
            .matching
            .clone()
            .or_else(|| settings.default_matching.clone());

        let observed = &mut self.observed;
        let mut executor = Executor::new()
            .with_settings(settings.clone())
            .with_registry(registry)
            .with_notifications(notifications)
            .matching(matching)
            .collectors(self.collectors.clone())
            .observe(move || observed());
        if let Some(populate) = self.population.as_mut() {
            executor = executor.population(move |n| populate(n));
        }
        if let Some(factors) = self.scale_factors.clone() {
            executor = executor.scale_factors(factors);
        }
        if let Some(transaction) = self.transaction.as_mut() {
            executor = executor.with_transaction(transaction);
        }

        let results = executor.call()?;
        let verdict = Verdict::evaluate(check, &results, &descriptors, &settings);
        self.results = results;
        Ok(verdict)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Event;
    use crate::executor::current_scale;
    use std::cell::Cell;

    fn emit(bus: &Notifications, sql: &str) {
        bus.instrument("sql.query", Event::new(sql));
    }

    fn isolated<'a>(
        bus: &Notifications,
        observed: impl FnMut() -> Result<(), BoxError> + 'a,
    ) -> QueryExpectation<'a> {
        expect_queries(observed)
            .with_notifications(bus.clone())
            .with_settings(Arc::new(Settings::default()))
            .with_registry(CollectorRegistry::with_defaults())
    }

    #[test]
    fn test_missing_population() {
        let bus = Notifications::new();
        let err = isolated(&bus, || Ok(()))
            .to_perform_constant_number()
            .unwrap_err();
        assert!(matches!(err, ExecError::MissingPopulation));
        assert!(err.to_string().contains("Populate block is missing"));
    }

    #[test]
    fn test_without_population_uses_current_scale() {
        let bus = Notifications::new();
        let observed_bus = bus.clone();

        let verdict = isolated(&bus, move || {
            for _ in 0..current_scale().unwrap_or(0) {
                emit(&observed_bus, "SELECT 1");
            }
            Ok(())
        })
        .without_population()
        .to_perform_linear_number(1)
        .unwrap();

        assert!(verdict.passed);
    }

    #[test]
    fn test_matching_overrides_default() {
        let bus = Notifications::new();
        let observed_bus = bus.clone();
        let size = Rc::new(Cell::new(0));
        let populate_size = size.clone();

        let verdict = isolated(&bus, move || {
            emit(&observed_bus, r#"SELECT * FROM "posts""#);
            for _ in 0..size.get() {
                emit(&observed_bus, r#"SELECT * FROM "users""#);
            }
            Ok(())
        })
        .populate(move |n| {
            populate_size.set(n);
            Ok(())
        })
        .matching(Regex::new("posts").unwrap())
        .to_perform_constant_number()
        .unwrap();

        assert!(verdict.passed);
    }

    #[test]
    fn test_run_returns_results() {
        let bus = Notifications::new();
        let observed_bus = bus.clone();

        let (verdict, results) = isolated(&bus, move || {
            emit(&observed_bus, "SELECT 1");
            Ok(())
        })
        .populate(|_| Ok(()))
        .run(Check::Exact { expected: 1 })
        .unwrap();

        assert!(verdict.passed);
        let scales: Vec<u32> = results.iter().map(|r| r.scale).collect();
        assert_eq!(scales, vec![2, 3]);
    }

    #[test]
    fn test_exact_defaults_to_single_scale() {
        let bus = Notifications::new();
        let observed_bus = bus.clone();
        let verdict = isolated(&bus, move || {
            emit(&observed_bus, "SELECT 1");
            emit(&observed_bus, "SELECT 2");
            Ok(())
        })
        .populate(|_| Ok(()))
        .to_perform_exact_number(1)
        .unwrap();

        assert!(!verdict.passed);
        assert!(verdict.message.contains("  2 for N=1\n"));
    }

    #[test]
    fn test_warmup_runs_once_before_cycles() {
        let bus = Notifications::new();
        let log = Rc::new(RefCell::new(Vec::new()));
        let warm_log = log.clone();
        let observed_log = log.clone();

        isolated(&bus, move || {
            observed_log.borrow_mut().push("observe");
            Ok(())
        })
        .populate(|_| Ok(()))
        .warmup(move || {
            warm_log.borrow_mut().push("warmup");
            Ok(())
        })
        .to_perform_constant_number()
        .unwrap()
        .assert();

        assert_eq!(*log.borrow(), vec!["warmup", "observe", "observe"]);
    }

    #[test]
    fn test_with_warming_up_runs_observed_one_extra_time() {
        let bus = Notifications::new();
        let calls = Rc::new(Cell::new(0));
        let observed_calls = calls.clone();

        isolated(&bus, move || {
            observed_calls.set(observed_calls.get() + 1);
            Ok(())
        })
        .populate(|_| Ok(()))
        .with_warming_up()
        .to_perform_constant_number()
        .unwrap();

        assert_eq!(calls.get(), 3);
    }

    struct CountingFixture {
        populated: Rc<RefCell<Vec<u32>>>,
        warmed: Rc<Cell<bool>>,
    }

    impl Fixture for CountingFixture {
        fn populate(&mut self, scale: u32) -> Result<(), BoxError> {
            self.populated.borrow_mut().push(scale);
            Ok(())
        }

        fn warmup(&mut self) -> Result<(), BoxError> {
            self.warmed.set(true);
            Ok(())
        }
    }

    #[test]
    fn test_fixture_supplies_population_and_warmup() {
        let bus = Notifications::new();
        let populated = Rc::new(RefCell::new(Vec::new()));
        let warmed = Rc::new(Cell::new(false));

        isolated(&bus, || Ok(()))
            .fixture(CountingFixture {
                populated: populated.clone(),
                warmed: warmed.clone(),
            })
            .with_scale_factors([1, 2, 5])
            .to_perform_constant_number()
            .unwrap()
            .assert();

        assert_eq!(*populated.borrow(), vec![1, 2, 5]);
        assert!(warmed.get());
    }

    #[test]
    fn test_unknown_collector() {
        let bus = Notifications::new();
        let err = isolated(&bus, || Ok(()))
            .populate(|_| Ok(()))
            .to(["db", "__missing"])
            .to_perform_constant_number()
            .unwrap_err();

        assert!(err.to_string().contains("__missing"));
        assert!(err.to_string().contains("existing collectors are: db"));
    }

    #[test]
    fn test_empty_collector_list_is_rejected() {
        let bus = Notifications::new();
        let calls = Rc::new(Cell::new(0));
        let observed_calls = calls.clone();
        let observed_bus = bus.clone();

        let err = isolated(&bus, move || {
            observed_calls.set(observed_calls.get() + 1);
            emit(&observed_bus, "SELECT * FROM posts");
            for _ in 0..current_scale().unwrap_or(0) {
                emit(&observed_bus, "SELECT * FROM users WHERE id = $1");
            }
            Ok(())
        })
        .populate(|_| Ok(()))
        .to(Vec::<String>::new())
        .to_perform_constant_number()
        .unwrap_err();

        assert!(matches!(err, ExecError::NoCollectors));
        assert_eq!(err.to_string(), "At least one collector key is required");
        assert_eq!(calls.get(), 0);
    }
}
