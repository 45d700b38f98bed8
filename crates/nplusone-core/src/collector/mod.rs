//! Query collectors.
//!
//! A collector subscribes to one named event stream on a [`Notifications`]
//! bus and accumulates the events that survive filtering. Collector kinds are
//! described by a [`CollectorDescriptor`] (key, display name, event source,
//! reporting) and registered in a [`CollectorRegistry`] under their key.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────┐      lookup by key     ┌──────────────────────┐
//! │  CollectorRegistry   │ ─────────────────────▶ │ CollectorDescriptor  │
//! │  "db" → DbCollector  │                        │  key / name / event  │
//! └──────────────────────┘                        └──────────┬───────────┘
//!                                                            │ one per cycle
//!                      ┌──────────────┐  subscribe  ┌────────▼─────────┐
//!   instrumented  ───▶ │Notifications │ ──────────▶ │    Collector     │
//!   code               └──────────────┘   events    │ Vec<EventRecord> │
//!                                                   └──────────────────┘
//! ```
//!
//! # Usage
//!
//! ```
//! use std::sync::Arc;
//! use nplusone_core::collector::{Collector, DbCollector};
//! use nplusone_core::event::{Event, Notifications};
//! use nplusone_core::settings::Settings;
//!
//! let bus = Notifications::new();
//! let settings = Arc::new(Settings::default());
//! let mut collector = Collector::new(Arc::new(DbCollector::new()), None, settings.clone());
//!
//! collector.subscribe(&bus);
//! bus.instrument(&settings.event, Event::new("SELECT 1"));
//! assert_eq!(collector.queries().len(), 1);
//!
//! collector.reset();
//! assert!(collector.queries().is_empty());
//! ```

mod db;
pub mod registry;

use std::backtrace::Backtrace;
use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use regex::Regex;
use tracing::trace;

use crate::event::{Event, EventRecord, Listener, Notifications, SubscriptionId};
use crate::executor::RunResult;
use crate::report;
use crate::settings::Settings;
use crate::verdict::CheckKind;

pub use db::DbCollector;
pub use registry::{CollectorRegistry, RegistryError};

/// Event name a collector subscribes to.
///
/// `Computed` is resolved each time a collector subscribes, so it follows
/// settings changes made after registration.
#[derive(Clone)]
pub enum EventSource {
    Static(String),
    Computed(Arc<dyn Fn(&Settings) -> String + Send + Sync>),
}

impl EventSource {
    pub fn computed<F>(f: F) -> Self
    where
        F: Fn(&Settings) -> String + Send + Sync + 'static,
    {
        EventSource::Computed(Arc::new(f))
    }

    /// Resolves the event name against `settings`.
    pub fn resolve(&self, settings: &Settings) -> String {
        match self {
            EventSource::Static(name) => name.clone(),
            EventSource::Computed(f) => f(settings),
        }
    }
}

impl fmt::Debug for EventSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventSource::Static(name) => f.debug_tuple("Static").field(name).finish(),
            EventSource::Computed(_) => f.write_str("Computed(..)"),
        }
    }
}

impl From<&str> for EventSource {
    fn from(name: &str) -> Self {
        EventSource::Static(name.to_string())
    }
}

impl From<String> for EventSource {
    fn from(name: String) -> Self {
        EventSource::Static(name)
    }
}

/// Describes a kind of collector.
///
/// Implementors supply identity and the event source; filtering and failure
/// reporting have defaults that kinds may override.
pub trait CollectorDescriptor: Send + Sync {
    /// Unique registry key.
    fn key(&self) -> &str;

    /// Human-readable name used in failure messages.
    fn name(&self) -> Option<&str> {
        None
    }

    /// Event stream the collector subscribes to.
    fn event(&self) -> &EventSource;

    /// Name shown in reports: the display name, or the upper-cased key.
    fn display_name(&self) -> String {
        match self.name() {
            Some(name) => name.to_string(),
            None => self.key().to_uppercase(),
        }
    }

    /// Decides whether an event is a real query, before pattern matching.
    fn accepts(&self, event: &Event, settings: &Settings) -> bool {
        is_countable(event, settings)
    }

    /// Renders this collector's part of a failure message.
    fn failure_message(&self, kind: CheckKind, runs: &[RunResult], _settings: &Settings) -> String {
        report::summary(kind, &self.display_name(), self.key(), runs)
    }
}

/// Reserved categories, the ignore rule and the cached flag, in that order.
pub fn is_countable(event: &Event, settings: &Settings) -> bool {
    if event.is_reserved() {
        return false;
    }
    if settings
        .ignore
        .as_ref()
        .is_some_and(|re| re.is_match(&event.payload))
    {
        return false;
    }
    !(settings.ignore_cached_queries && event.cached)
}

/// Raw `file:line:col` locations of the current thread's stack.
pub fn capture_locations() -> Vec<String> {
    Backtrace::force_capture()
        .to_string()
        .lines()
        .filter_map(|line| line.trim().strip_prefix("at "))
        .map(str::to_string)
        .collect()
}

/// Source root of this crate as recorded at build time.
const LIBRARY_SRC: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/src/");

/// Returns true if `location` points into this crate's sources.
///
/// Backtraces print paths under the working directory as `./...`, so those are
/// resolved against it before comparing with the crate's source root.
fn is_library_frame(location: &str) -> bool {
    if location.contains("nplusone-core/src/") || location.starts_with(LIBRARY_SRC) {
        return true;
    }
    let Some(relative) = location.strip_prefix("./") else {
        return false;
    };
    std::env::current_dir()
        .map(|cwd| cwd.join(relative).starts_with(Path::new(LIBRARY_SRC)))
        .unwrap_or(false)
}

/// Cleaner keeping only frames outside the standard library, cargo registry
/// dependencies and this crate.
pub fn application_frames(locations: Vec<String>) -> Vec<String> {
    locations
        .into_iter()
        .filter(|loc| {
            !(loc.starts_with("/rustc/")
                || loc.contains("/.cargo/registry/")
                || is_library_frame(loc))
        })
        .collect()
}

fn call_site(event: &Event, settings: &Settings) -> Vec<String> {
    let Some(cleaner) = settings.backtrace_cleaner.as_ref() else {
        return Vec::new();
    };
    let locations = match &event.call_site {
        Some(locations) => locations.clone(),
        None => capture_locations(),
    };
    cleaner(locations)
        .into_iter()
        .take(settings.backtrace_length)
        .collect()
}

/// Accumulates matching events while subscribed.
pub struct Collector {
    descriptor: Arc<dyn CollectorDescriptor>,
    pattern: Option<Regex>,
    settings: Arc<Settings>,
    queries: Arc<Mutex<Vec<EventRecord>>>,
    subscription: Option<(Notifications, SubscriptionId)>,
}

impl fmt::Debug for Collector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collector")
            .field("key", &self.descriptor.key())
            .field("pattern", &self.pattern.as_ref().map(Regex::as_str))
            .field("subscribed", &self.subscription.is_some())
            .finish()
    }
}

impl Collector {
    pub fn new(
        descriptor: Arc<dyn CollectorDescriptor>,
        pattern: Option<Regex>,
        settings: Arc<Settings>,
    ) -> Self {
        Self {
            descriptor,
            pattern,
            settings,
            queries: Arc::new(Mutex::new(Vec::new())),
            subscription: None,
        }
    }

    pub fn key(&self) -> &str {
        self.descriptor.key()
    }

    pub fn descriptor(&self) -> &Arc<dyn CollectorDescriptor> {
        &self.descriptor
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscription.is_some()
    }

    /// Starts accumulating events from the descriptor's event stream.
    ///
    /// Subscribing an already subscribed collector is a no-op.
    pub fn subscribe(&mut self, bus: &Notifications) {
        if self.subscription.is_some() {
            return;
        }

        let event_name = self.descriptor.event().resolve(&self.settings);
        let descriptor = self.descriptor.clone();
        let pattern = self.pattern.clone();
        let settings = self.settings.clone();
        let queries = self.queries.clone();

        let listener: Listener = Arc::new(move |event: &Event| {
            if !descriptor.accepts(event, &settings) {
                return;
            }
            if pattern.as_ref().is_some_and(|re| !re.is_match(&event.payload)) {
                return;
            }

            let source = if settings.traces_call_sites() {
                call_site(event, &settings)
            } else {
                Vec::new()
            };

            trace!(collector = descriptor.key(), "captured: {}", event.payload);
            queries
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(EventRecord::capture(event, source));
        });

        let id = bus.subscribe(event_name, listener);
        self.subscription = Some((bus.clone(), id));
    }

    /// Unsubscribes and clears accumulated events.
    pub fn reset(&mut self) {
        self.unsubscribe();
        self.queries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Snapshot of the events accumulated so far, in capture order.
    pub fn queries(&self) -> Vec<EventRecord> {
        self.queries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn unsubscribe(&mut self) {
        if let Some((bus, id)) = self.subscription.take() {
            bus.unsubscribe(id);
        }
    }
}

impl Drop for Collector {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::compile_pattern;

    fn collector(pattern: Option<&str>, settings: Settings) -> (Collector, Notifications) {
        let bus = Notifications::new();
        let collector = Collector::new(
            Arc::new(DbCollector::new()),
            pattern.map(|p| compile_pattern(p).unwrap()),
            Arc::new(settings),
        );
        (collector, bus)
    }

    fn payloads(collector: &Collector) -> Vec<String> {
        collector.queries().into_iter().map(|q| q.payload).collect()
    }

    #[test]
    fn test_collects_only_while_subscribed() {
        let (mut collector, bus) = collector(None, Settings::default());

        bus.instrument("sql.query", Event::new("SELECT 0"));
        collector.subscribe(&bus);
        bus.instrument("sql.query", Event::new("SELECT 1"));
        collector.reset();
        bus.instrument("sql.query", Event::new("SELECT 2"));

        assert!(collector.queries().is_empty());
        assert!(!collector.is_subscribed());
        assert_eq!(bus.subscriber_count("sql.query"), 0);
    }

    #[test]
    fn test_keeps_capture_order_and_duplicates() {
        let (mut collector, bus) = collector(None, Settings::default());
        collector.subscribe(&bus);

        for sql in ["SELECT 1", "SELECT 2", "SELECT 1"] {
            bus.instrument("sql.query", Event::new(sql));
        }

        assert_eq!(payloads(&collector), vec!["SELECT 1", "SELECT 2", "SELECT 1"]);
    }

    #[test]
    fn test_filters_reserved_ignored_and_unmatched() {
        let (mut collector, bus) = collector(Some("^SELECT"), Settings::default());
        collector.subscribe(&bus);

        bus.instrument("sql.query", Event::new("SELECT 1").with_category("CACHE"));
        bus.instrument("sql.query", Event::new("SELECT 2").with_category("SCHEMA"));
        bus.instrument("sql.query", Event::new("BEGIN"));
        bus.instrument("sql.query", Event::new("INSERT INTO users VALUES (1)"));
        bus.instrument("sql.query", Event::new("select 3").with_category("User Load"));

        assert_eq!(payloads(&collector), vec!["select 3"]);
    }

    #[test]
    fn test_cached_events_dropped_only_when_configured() {
        let settings = Settings {
            ignore_cached_queries: true,
            ..Settings::default()
        };
        let (mut strict, bus) = collector(None, settings);
        strict.subscribe(&bus);
        let mut lenient = Collector::new(
            Arc::new(DbCollector::new()),
            None,
            Arc::new(Settings::default()),
        );
        lenient.subscribe(&bus);

        bus.instrument("sql.query", Event::new("SELECT 1"));
        bus.instrument("sql.query", Event::new("SELECT 1").cached(true));

        assert_eq!(strict.queries().len(), 1);
        assert_eq!(lenient.queries().len(), 2);
    }

    #[test]
    fn test_reset_is_idempotent() {
        let (mut collector, bus) = collector(None, Settings::default());
        collector.subscribe(&bus);
        bus.instrument("sql.query", Event::new("SELECT 1"));

        collector.reset();
        assert!(collector.queries().is_empty());
        collector.reset();
        assert!(collector.queries().is_empty());
    }

    #[test]
    fn test_double_subscribe_does_not_duplicate() {
        let (mut collector, bus) = collector(None, Settings::default());
        collector.subscribe(&bus);
        collector.subscribe(&bus);
        bus.instrument("sql.query", Event::new("SELECT 1"));

        assert_eq!(collector.queries().len(), 1);
    }

    #[test]
    fn test_drop_unsubscribes() {
        let (mut collector, bus) = collector(None, Settings::default());
        collector.subscribe(&bus);
        drop(collector);
        assert_eq!(bus.subscriber_count("sql.query"), 0);
    }

    #[test]
    fn test_computed_event_resolved_at_subscribe() {
        let mut settings = Settings::default();
        settings.event = "sql.replica".to_string();
        let (mut collector, bus) = collector(None, settings);
        collector.subscribe(&bus);

        bus.instrument("sql.query", Event::new("SELECT 1"));
        bus.instrument("sql.replica", Event::new("SELECT 2"));

        assert_eq!(payloads(&collector), vec!["SELECT 2"]);
    }

    #[test]
    fn test_trace_attached_in_verbose_mode() {
        let settings = Settings {
            verbose: true,
            backtrace_length: 2,
            ..Settings::default()
        }
        .with_backtrace_cleaner(|lines| lines.into_iter().filter(|l| l.starts_with("app/")).collect());
        let (mut collector, bus) = collector(None, settings);
        collector.subscribe(&bus);

        let site = vec![
            "vendor/orm.rs:1:1".to_string(),
            "app/posts.rs:10:5".to_string(),
            "app/handler.rs:20:9".to_string(),
            "app/main.rs:3:1".to_string(),
        ];
        bus.instrument("sql.query", Event::new("SELECT 1").with_call_site(site));

        let queries = collector.queries();
        assert_eq!(queries[0].payload, "SELECT 1");
        assert_eq!(queries[0].source, vec!["app/posts.rs:10:5", "app/handler.rs:20:9"]);
    }

    #[test]
    fn test_no_trace_without_verbose() {
        let settings = Settings::default().with_backtrace_cleaner(|lines| lines);
        let (mut collector, bus) = collector(None, settings);
        collector.subscribe(&bus);
        bus.instrument(
            "sql.query",
            Event::new("SELECT 1").with_call_site(vec!["app/x.rs:1:1".into()]),
        );

        assert!(collector.queries()[0].source.is_empty());
    }

    #[test]
    fn test_application_frames() {
        let frames = application_frames(vec![
            "/rustc/abc/library/std/src/rt.rs:1:1".into(),
            "/home/u/.cargo/registry/src/x/lib.rs:2:2".into(),
            "/work/crates/nplusone-core/src/executor.rs:3:3".into(),
            "/work/app/src/posts.rs:4:4".into(),
        ]);
        assert_eq!(frames, vec!["/work/app/src/posts.rs:4:4"]);
    }

    #[test]
    fn test_application_frames_drops_working_dir_relative_library_paths() {
        let frames = application_frames(vec![
            "./src/collector/mod.rs:161:5".into(),
            format!("{}event.rs:80:9", LIBRARY_SRC),
            "./tests/scenarios.rs:42:13".into(),
        ]);
        assert_eq!(frames, vec!["./tests/scenarios.rs:42:13"]);
    }

    #[test]
    fn test_event_source_debug_and_resolve() {
        let settings = Settings::default();
        let source = EventSource::from("sql.cache");
        assert_eq!(source.resolve(&settings), "sql.cache");
        assert_eq!(format!("{:?}", source), "Static(\"sql.cache\")");

        let computed = EventSource::computed(|s| format!("{}.x", s.event));
        assert_eq!(computed.resolve(&settings), "sql.query.x");
    }
}
