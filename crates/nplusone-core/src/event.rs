//! Synchronous, name-keyed notification bus.
//!
//! Instrumented code publishes an [`Event`] under a name (for example
//! `"sql.query"`); every listener subscribed to that name is invoked
//! synchronously, in subscription order, before [`Notifications::instrument`]
//! returns. Collectors capture events only while they hold a subscription.

use std::fmt;
use std::sync::{Arc, LazyLock, Mutex, PoisonError};

use serde::Serialize;

/// Category marking an event served from the query cache.
pub const CACHE_CATEGORY: &str = "CACHE";

/// Category marking schema introspection.
pub const SCHEMA_CATEGORY: &str = "SCHEMA";

/// Categories that never count as real queries.
pub const RESERVED_CATEGORIES: [&str; 2] = [CACHE_CATEGORY, SCHEMA_CATEGORY];

static GLOBAL: LazyLock<Notifications> = LazyLock::new(Notifications::new);

/// A published event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Event {
    /// Raw payload, usually the statement text.
    pub payload: String,
    /// Category label, e.g. `"User Load"`, `"CACHE"` or `"SCHEMA"`.
    pub category: Option<String>,
    /// True if the result was served from a cache.
    pub cached: bool,
    /// Call-site locations supplied by the emitter, innermost first.
    pub call_site: Option<Vec<String>>,
}

impl Event {
    pub fn new(payload: impl Into<String>) -> Self {
        Self {
            payload: payload.into(),
            category: None,
            cached: false,
            call_site: None,
        }
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn cached(mut self, cached: bool) -> Self {
        self.cached = cached;
        self
    }

    pub fn with_call_site(mut self, call_site: Vec<String>) -> Self {
        self.call_site = Some(call_site);
        self
    }

    /// Returns true for cache-hit and schema-introspection markers.
    pub fn is_reserved(&self) -> bool {
        self.category
            .as_deref()
            .is_some_and(|c| RESERVED_CATEGORIES.contains(&c))
    }
}

/// An event captured by a collector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EventRecord {
    pub payload: String,
    pub category: Option<String>,
    pub cached: bool,
    /// Cleaned call-site lines; only populated when tracing is enabled.
    pub source: Vec<String>,
}

impl EventRecord {
    pub fn new(payload: impl Into<String>) -> Self {
        Self {
            payload: payload.into(),
            category: None,
            cached: false,
            source: Vec::new(),
        }
    }

    pub(crate) fn capture(event: &Event, source: Vec<String>) -> Self {
        Self {
            payload: event.payload.clone(),
            category: event.category.clone(),
            cached: event.cached,
            source,
        }
    }

    /// Formats the attached call-site trace, if any.
    ///
    /// ```text
    ///     ↳ src/posts.rs:12:5
    /// src/handlers.rs:40:9
    /// ```
    pub fn trace(&self) -> Option<String> {
        if self.source.is_empty() {
            return None;
        }
        Some(format!("\n    ↳ {}", self.source.join("\n")))
    }
}

impl fmt::Display for EventRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.payload)?;
        if let Some(trace) = self.trace() {
            f.write_str(&trace)?;
        }
        Ok(())
    }
}

/// Callback invoked for each published event.
pub type Listener = Arc<dyn Fn(&Event) + Send + Sync>;

/// Handle returned by [`Notifications::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Default)]
struct Subscribers {
    next_id: u64,
    entries: Vec<(SubscriptionId, String, Listener)>,
}

/// Publish/subscribe bus keyed by event name.
///
/// Cloning is cheap; clones share subscribers.
#[derive(Clone, Default)]
pub struct Notifications {
    inner: Arc<Mutex<Subscribers>>,
}

impl fmt::Debug for Notifications {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let subscribers = self.lock();
        f.debug_struct("Notifications")
            .field("subscribers", &subscribers.entries.len())
            .finish()
    }
}

impl Notifications {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the process-wide bus.
    pub fn global() -> &'static Notifications {
        &GLOBAL
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Subscribers> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Attaches `listener` to events published under `name`.
    pub fn subscribe(&self, name: impl Into<String>, listener: Listener) -> SubscriptionId {
        let mut subscribers = self.lock();
        subscribers.next_id += 1;
        let id = SubscriptionId(subscribers.next_id);
        subscribers.entries.push((id, name.into(), listener));
        id
    }

    /// Detaches a listener. Returns false if it was not subscribed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.lock();
        let before = subscribers.entries.len();
        subscribers.entries.retain(|(sid, _, _)| *sid != id);
        subscribers.entries.len() != before
    }

    /// Publishes `event` to every listener of `name`.
    ///
    /// Listeners run after the bus lock is released, so they may publish or
    /// unsubscribe themselves.
    pub fn instrument(&self, name: &str, event: Event) {
        let listeners: Vec<Listener> = self
            .lock()
            .entries
            .iter()
            .filter(|(_, n, _)| n == name)
            .map(|(_, _, l)| l.clone())
            .collect();

        for listener in listeners {
            listener(&event);
        }
    }

    /// Number of listeners subscribed to `name`.
    pub fn subscriber_count(&self, name: &str) -> usize {
        self.lock()
            .entries
            .iter()
            .filter(|(_, n, _)| n == name)
            .count()
    }
}
