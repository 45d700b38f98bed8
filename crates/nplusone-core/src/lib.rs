//! nplusone-core: N+1 query detection for tests.
//!
//! Runs a block of code against datasets of increasing size, counts the
//! database queries it issues at each size and checks how the count grows.
//!
//! Provides:
//! - `event` — synchronous notification bus and captured event records
//! - `settings` — configuration, process-wide default and `NPLUSONE_*` loading
//! - `collector` — collector descriptors, registry and live collectors
//! - `executor` — scale/transaction/populate/observe/collect cycles
//! - `verdict` — constant, linear and exact checks
//! - `report` — failure message rendering and table usage statistics
//! - `expectation` — test-facing `expect_queries(..)` builder
//! - `mock` — in-memory users/posts database emitting SQL events
//!
//! With `postgres` feature (default):
//! - `pg` — instrumented PostgreSQL client and transaction provider

pub mod collector;
pub mod event;
pub mod executor;
pub mod expectation;
pub mod mock;
pub mod report;
pub mod settings;
pub mod verdict;

#[cfg(feature = "postgres")]
pub mod pg;

pub use collector::{Collector, CollectorDescriptor, CollectorRegistry, DbCollector, EventSource};
pub use event::{Event, EventRecord, Notifications};
pub use executor::{BoxError, ExecError, Executor, RunResult, TransactionProvider, current_scale};
pub use expectation::{Fixture, expect_queries};
pub use settings::Settings;
pub use verdict::{Check, CheckKind, Verdict};
