//! Instrumented PostgreSQL client.
//!
//! [`InstrumentedClient`] wraps a blocking [`postgres::Client`] and publishes
//! one event per statement on a [`Notifications`] bus before running it, so
//! collectors can count real database round trips. It also implements
//! [`TransactionProvider`]: the outermost `begin` issues `BEGIN`, nested ones
//! issue `SAVEPOINT`s, and each `rollback` undoes exactly one level. Code that
//! opens its own transaction inside a cycle therefore cannot commit the
//! cycle's changes.
//!
//! Connection parameters come from the standard libpq environment variables:
//! - PGHOST (default: localhost)
//! - PGPORT (default: 5432)
//! - PGUSER (default: $USER)
//! - PGPASSWORD (default: empty)
//! - PGDATABASE (default: same as PGUSER)

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use postgres::types::ToSql;
use postgres::{Client, NoTls, Row, SimpleQueryMessage};
use tracing::{debug, trace};

use crate::event::{Event, Notifications};
use crate::executor::{BoxError, TransactionProvider};
use crate::settings::DEFAULT_EVENT;

/// Category attached to published statements.
pub const SQL_CATEGORY: &str = "SQL";

/// Error type for the PostgreSQL adapter.
#[derive(Debug)]
pub enum PgError {
    /// Environment variable not set.
    EnvNotSet(String),
    /// Connection failed.
    Connection(String),
    /// Statement execution failed.
    Query(String),
}

impl fmt::Display for PgError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PgError::EnvNotSet(var) => write!(f, "PostgreSQL: {} not set", var),
            PgError::Connection(msg) => write!(f, "PostgreSQL: {}", msg),
            PgError::Query(msg) => write!(f, "PostgreSQL query error: {}", msg),
        }
    }
}

impl std::error::Error for PgError {}

/// Short, user-facing rendering of a driver error.
pub fn format_postgres_error(e: &postgres::Error) -> String {
    if let Some(db_error) = e.as_db_error() {
        return format!("{}: {}", db_error.severity(), db_error.message());
    }
    let msg = e.to_string();
    if msg.contains("Connection refused") {
        "connection refused".to_string()
    } else if msg.contains("password authentication failed") {
        "password authentication failed".to_string()
    } else {
        msg
    }
}

/// libpq-style connection parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    pub host: String,
    pub port: String,
    pub user: String,
    pub password: String,
    pub database: String,
}

impl ConnectionConfig {
    pub fn from_env() -> Result<Self, PgError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds the config from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, PgError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let user = lookup("PGUSER")
            .or_else(|| lookup("USER"))
            .ok_or_else(|| PgError::EnvNotSet("PGUSER or USER".to_string()))?;

        Ok(Self {
            host: lookup("PGHOST").unwrap_or_else(|| "localhost".to_string()),
            port: lookup("PGPORT").unwrap_or_else(|| "5432".to_string()),
            password: lookup("PGPASSWORD").unwrap_or_default(),
            database: lookup("PGDATABASE").unwrap_or_else(|| user.clone()),
            user,
        })
    }

    pub fn connection_string(&self) -> String {
        if self.password.is_empty() {
            format!(
                "host={} port={} user={} dbname={}",
                self.host, self.port, self.user, self.database
            )
        } else {
            format!(
                "host={} port={} user={} password={} dbname={}",
                self.host, self.port, self.user, self.password, self.database
            )
        }
    }
}

struct Inner {
    client: Client,
    /// Open transaction levels.
    depth: usize,
}

/// Shared, instrumented PostgreSQL connection.
///
/// Clones share one connection; hand a clone to the executor as the
/// transaction provider and keep another for the population and observed
/// blocks.
#[derive(Clone)]
pub struct InstrumentedClient {
    inner: Arc<Mutex<Inner>>,
    notifications: Notifications,
    event: String,
}

impl fmt::Debug for InstrumentedClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstrumentedClient")
            .field("event", &self.event)
            .field("depth", &self.lock().depth)
            .finish()
    }
}

impl InstrumentedClient {
    /// Connects with a libpq connection string.
    pub fn connect(params: &str, notifications: Notifications) -> Result<Self, PgError> {
        let client = Client::connect(params, NoTls)
            .map_err(|e| PgError::Connection(format_postgres_error(&e)))?;
        debug!("connected to PostgreSQL");
        Ok(Self::from_client(client, notifications))
    }

    /// Connects using the `PG*` environment variables.
    pub fn from_env(notifications: Notifications) -> Result<Self, PgError> {
        let config = ConnectionConfig::from_env()?;
        Self::connect(&config.connection_string(), notifications)
    }

    /// Wraps an already connected client.
    pub fn from_client(client: Client, notifications: Notifications) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner { client, depth: 0 })),
            notifications,
            event: DEFAULT_EVENT.to_string(),
        }
    }

    /// Publishes under `event` instead of `sql.query`.
    pub fn on_event(mut self, event: impl Into<String>) -> Self {
        self.event = event.into();
        self
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn instrument(&self, sql: &str) {
        trace!(sql, "statement");
        self.notifications
            .instrument(&self.event, Event::new(sql).with_category(SQL_CATEGORY));
    }

    pub fn query(&self, sql: &str, params: &[&(dyn ToSql + Sync)]) -> Result<Vec<Row>, PgError> {
        self.instrument(sql);
        self.lock()
            .client
            .query(sql, params)
            .map_err(|e| PgError::Query(format_postgres_error(&e)))
    }

    /// Runs a statement and returns the number of rows modified.
    pub fn execute(&self, sql: &str, params: &[&(dyn ToSql + Sync)]) -> Result<u64, PgError> {
        self.instrument(sql);
        self.lock()
            .client
            .execute(sql, params)
            .map_err(|e| PgError::Query(format_postgres_error(&e)))
    }

    /// Runs one or more `;`-separated statements, published as one event.
    pub fn batch_execute(&self, sql: &str) -> Result<(), PgError> {
        self.instrument(sql);
        self.lock()
            .client
            .batch_execute(sql)
            .map_err(|e| PgError::Query(format_postgres_error(&e)))
    }

    pub fn simple_query(&self, sql: &str) -> Result<Vec<SimpleQueryMessage>, PgError> {
        self.instrument(sql);
        self.lock()
            .client
            .simple_query(sql)
            .map_err(|e| PgError::Query(format_postgres_error(&e)))
    }

    /// Number of open transaction levels.
    pub fn depth(&self) -> usize {
        self.lock().depth
    }
}

fn savepoint_name(level: usize) -> String {
    format!("nplusone_{}", level)
}

impl TransactionProvider for InstrumentedClient {
    fn begin(&mut self) -> Result<(), BoxError> {
        let level = self.lock().depth;
        let sql = if level == 0 {
            "BEGIN".to_string()
        } else {
            format!("SAVEPOINT {}", savepoint_name(level))
        };
        self.batch_execute(&sql)?;
        self.lock().depth += 1;
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), BoxError> {
        let level = self.lock().depth;
        let sql = match level {
            0 => return Err("rollback without an open transaction".into()),
            1 => "ROLLBACK".to_string(),
            n => format!("ROLLBACK TO SAVEPOINT {}", savepoint_name(n - 1)),
        };
        // The level is closed even if the statement fails.
        self.lock().depth -= 1;
        self.batch_execute(&sql)?;
        Ok(())
    }
}
