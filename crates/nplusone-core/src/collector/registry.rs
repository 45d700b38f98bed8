//! Collector registry: key → descriptor.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, LazyLock, PoisonError, RwLock};

use crate::collector::{CollectorDescriptor, DbCollector};

static GLOBAL: LazyLock<RwLock<CollectorRegistry>> =
    LazyLock::new(|| RwLock::new(CollectorRegistry::with_defaults()));

/// Error returned by registry lookups.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// Single-key lookup failed.
    NotFound { key: String, registered: Vec<String> },
    /// Some of the requested keys are not registered.
    UnknownCollectors {
        missing: Vec<String>,
        registered: Vec<String>,
    },
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryError::NotFound { key, registered } => write!(
                f,
                "No collector registered for key: {}, existing collectors are: {}",
                key,
                registered.join(", ")
            ),
            RegistryError::UnknownCollectors {
                missing,
                registered,
            } => write!(
                f,
                "No collectors for keys: {}, existing collectors are: {}",
                missing.join(", "),
                registered.join(", ")
            ),
        }
    }
}

impl std::error::Error for RegistryError {}

/// Mapping from collector key to descriptor.
///
/// Registering a key twice replaces the earlier descriptor.
#[derive(Clone, Default)]
pub struct CollectorRegistry {
    collectors: BTreeMap<String, Arc<dyn CollectorDescriptor>>,
}

impl fmt::Debug for CollectorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CollectorRegistry")
            .field("keys", &self.keys())
            .finish()
    }
}

impl CollectorRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry holding the built-in `db` collector.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(DbCollector::new()));
        registry
    }

    /// Snapshot of the process-wide registry.
    pub fn global() -> CollectorRegistry {
        GLOBAL.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Registers a descriptor in the process-wide registry.
    pub fn register_global(
        descriptor: Arc<dyn CollectorDescriptor>,
    ) -> Option<Arc<dyn CollectorDescriptor>> {
        GLOBAL
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .register(descriptor)
    }

    /// Removes keys from the process-wide registry.
    pub fn unregister_global<S: AsRef<str>>(keys: &[S]) {
        GLOBAL
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .unregister(keys);
    }

    /// Inserts or replaces the entry for `descriptor.key()`.
    ///
    /// Returns the replaced descriptor, if any.
    pub fn register(
        &mut self,
        descriptor: Arc<dyn CollectorDescriptor>,
    ) -> Option<Arc<dyn CollectorDescriptor>> {
        self.collectors
            .insert(descriptor.key().to_string(), descriptor)
    }

    pub fn get(&self, key: &str) -> Result<Arc<dyn CollectorDescriptor>, RegistryError> {
        self.collectors
            .get(key)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound {
                key: key.to_string(),
                registered: self.keys(),
            })
    }

    /// Returns descriptors for `keys`, in the requested order.
    pub fn slice<S: AsRef<str>>(
        &self,
        keys: &[S],
    ) -> Result<Vec<Arc<dyn CollectorDescriptor>>, RegistryError> {
        let missing: Vec<String> = keys
            .iter()
            .map(|k| k.as_ref())
            .filter(|k| !self.collectors.contains_key(*k))
            .map(str::to_string)
            .collect();

        if !missing.is_empty() {
            return Err(RegistryError::UnknownCollectors {
                missing,
                registered: self.keys(),
            });
        }

        Ok(keys
            .iter()
            .filter_map(|k| self.collectors.get(k.as_ref()).cloned())
            .collect())
    }

    /// Removes entries; absent keys are ignored.
    pub fn unregister<S: AsRef<str>>(&mut self, keys: &[S]) {
        for key in keys {
            self.collectors.remove(key.as_ref());
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.collectors.contains_key(key)
    }

    /// Registered keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        self.collectors.keys().cloned().collect()
    }
}
