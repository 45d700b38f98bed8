//! Database query collector.

use crate::collector::{CollectorDescriptor, EventSource};
use crate::executor::RunResult;
use crate::report;
use crate::settings::Settings;
use crate::verdict::CheckKind;

/// Key of the default database collector.
pub const DB_KEY: &str = "db";

/// Collects SQL statements published under [`Settings::event`].
///
/// Failure messages include per-table usage deltas and, in verbose mode, the
/// full list of collected statements.
#[derive(Debug, Clone)]
pub struct DbCollector {
    key: String,
    name: Option<String>,
    event: EventSource,
}

impl Default for DbCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl DbCollector {
    pub fn new() -> Self {
        Self {
            key: DB_KEY.to_string(),
            name: Some("database".to_string()),
            event: EventSource::computed(|settings| settings.event.clone()),
        }
    }

    /// A database collector registered under another key, e.g. a replica.
    pub fn with_key(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            name: None,
            ..Self::new()
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn on_event(mut self, event: impl Into<EventSource>) -> Self {
        self.event = event.into();
        self
    }
}

impl CollectorDescriptor for DbCollector {
    fn key(&self) -> &str {
        &self.key
    }

    fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn event(&self) -> &EventSource {
        &self.event
    }

    fn failure_message(&self, kind: CheckKind, runs: &[RunResult], settings: &Settings) -> String {
        let mut msg = report::summary(kind, &self.display_name(), &self.key, runs);

        if settings.show_table_stats {
            match runs {
                [] => {}
                [only] => msg.push_str(&report::table_usage_counts(only.queries(&self.key))),
                [first, .., last] => msg.push_str(&report::table_usage_stats(
                    first.queries(&self.key),
                    last.queries(&self.key),
                )),
            }
        }

        if settings.verbose {
            msg.push_str(&report::query_dump(&self.key, runs, settings.truncate_query_size));
        }

        msg
    }
}
