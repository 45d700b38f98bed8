use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::event::{Event, Notifications, SCHEMA_CATEGORY};
use crate::executor::{BoxError, TransactionProvider};
use crate::settings::DEFAULT_EVENT;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub id: u64,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Post {
    pub id: u64,
    pub user_id: u64,
    pub title: String,
}

#[derive(Debug, Clone, Default)]
struct Tables {
    users: BTreeMap<u64, User>,
    posts: BTreeMap<u64, Post>,
    next_id: u64,
}

#[derive(Debug, Default)]
struct State {
    tables: Tables,
    /// One snapshot per open transaction, innermost last.
    snapshots: Vec<Tables>,
    /// Statements already answered while the query cache is on.
    query_cache: Option<HashSet<String>>,
}

/// Shared handle to an in-memory users/posts store.
///
/// Clones share the same data. Reads and writes publish events on the
/// configured bus; [`MockDatabase::post_count`] and
/// [`MockDatabase::user_count`] inspect the data silently.
#[derive(Debug, Clone)]
pub struct MockDatabase {
    state: Arc<Mutex<State>>,
    notifications: Notifications,
    event: String,
}

impl MockDatabase {
    /// Creates an empty database publishing `sql.query` events on `notifications`.
    pub fn new(notifications: Notifications) -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            notifications,
            event: DEFAULT_EVENT.to_string(),
        }
    }

    /// Publishes under `event` instead of `sql.query`.
    pub fn on_event(mut self, event: impl Into<String>) -> Self {
        self.event = event.into();
        self
    }

    pub fn notifications(&self) -> &Notifications {
        &self.notifications
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: Event) {
        self.notifications.instrument(&self.event, event);
    }

    /// Publishes a read; while the query cache is on, a repeated statement is
    /// published as a cache hit.
    fn emit_read(&self, sql: String, category: &str) {
        let cached = match self.state().query_cache.as_mut() {
            Some(cache) => !cache.insert(sql.clone()),
            None => false,
        };
        self.emit(Event::new(sql).with_category(category).cached(cached));
    }

    /// Starts answering repeated reads from the query cache.
    pub fn enable_query_cache(&self) {
        self.state().query_cache.get_or_insert_with(HashSet::new);
    }

    pub fn disable_query_cache(&self) {
        self.state().query_cache = None;
    }

    pub fn create_user(&self, name: impl Into<String>) -> User {
        let user = {
            let mut state = self.state();
            state.tables.next_id += 1;
            let user = User {
                id: state.tables.next_id,
                name: name.into(),
            };
            state.tables.users.insert(user.id, user.clone());
            user
        };
        self.emit(
            Event::new(r#"INSERT INTO "users" ("name") VALUES ($1) RETURNING "id""#)
                .with_category("User Create"),
        );
        user
    }

    pub fn create_post(&self, user_id: u64, title: impl Into<String>) -> Post {
        let post = {
            let mut state = self.state();
            state.tables.next_id += 1;
            let post = Post {
                id: state.tables.next_id,
                user_id,
                title: title.into(),
            };
            state.tables.posts.insert(post.id, post.clone());
            post
        };
        self.emit(
            Event::new(
                r#"INSERT INTO "posts" ("user_id", "title") VALUES ($1, $2) RETURNING "id""#,
            )
            .with_category("Post Create"),
        );
        post
    }

    /// Creates `n` posts, each written by its own user.
    pub fn create_posts(&self, n: u32) -> Vec<Post> {
        (0..n)
            .map(|i| {
                let user = self.create_user(format!("user-{i}"));
                self.create_post(user.id, format!("post-{i}"))
            })
            .collect()
    }

    pub fn posts(&self) -> Vec<Post> {
        self.emit_read(r#"SELECT "posts".* FROM "posts""#.to_string(), "Post Load");
        self.state().tables.posts.values().cloned().collect()
    }

    pub fn user(&self, id: u64) -> Option<User> {
        self.emit_read(
            format!(r#"SELECT "users".* FROM "users" WHERE "users"."id" = {id} LIMIT 1"#),
            "User Load",
        );
        self.state().tables.users.get(&id).cloned()
    }

    /// Loads users with a single `IN` query.
    pub fn users_by_ids(&self, ids: &[u64]) -> Vec<User> {
        let list: Vec<String> = ids.iter().map(u64::to_string).collect();
        self.emit_read(
            format!(
                r#"SELECT "users".* FROM "users" WHERE "users"."id" IN ({})"#,
                list.join(", ")
            ),
            "User Load",
        );
        let state = self.state();
        ids.iter()
            .filter_map(|id| state.tables.users.get(id).cloned())
            .collect()
    }

    /// Posts with their authors preloaded: two queries for any number of posts.
    pub fn posts_with_users(&self) -> Vec<(Post, Option<User>)> {
        let posts = self.posts();
        let mut ids: Vec<u64> = posts.iter().map(|p| p.user_id).collect();
        ids.sort_unstable();
        ids.dedup();

        let users: BTreeMap<u64, User> = self
            .users_by_ids(&ids)
            .into_iter()
            .map(|u| (u.id, u))
            .collect();

        posts
            .into_iter()
            .map(|post| {
                let user = users.get(&post.user_id).cloned();
                (post, user)
            })
            .collect()
    }

    /// Publishes the column lookup a driver runs on first use of a table.
    pub fn load_schema(&self, table: &str) {
        self.emit(
            Event::new(format!(
                "SELECT a.attname, format_type(a.atttypid, a.atttypmod) \
                 FROM pg_attribute a WHERE a.attrelid = '\"{table}\"'::regclass"
            ))
            .with_category(SCHEMA_CATEGORY),
        );
    }

    pub fn post_count(&self) -> usize {
        self.state().tables.posts.len()
    }

    pub fn user_count(&self) -> usize {
        self.state().tables.users.len()
    }

    /// Number of open transactions.
    pub fn depth(&self) -> usize {
        self.state().snapshots.len()
    }
}

impl TransactionProvider for MockDatabase {
    fn begin(&mut self) -> Result<(), BoxError> {
        let depth = {
            let mut state = self.state();
            let snapshot = state.tables.clone();
            state.snapshots.push(snapshot);
            state.snapshots.len()
        };
        let sql = if depth == 1 {
            "BEGIN".to_string()
        } else {
            format!("SAVEPOINT active_record_{}", depth - 1)
        };
        self.emit(Event::new(sql).with_category("TRANSACTION"));
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), BoxError> {
        let depth = {
            let mut state = self.state();
            let depth = state.snapshots.len();
            let snapshot = state
                .snapshots
                .pop()
                .ok_or("rollback without an open transaction")?;
            state.tables = snapshot;
            if let Some(cache) = state.query_cache.as_mut() {
                cache.clear();
            }
            depth
        };
        let sql = if depth == 1 {
            "ROLLBACK".to_string()
        } else {
            format!("ROLLBACK TO SAVEPOINT active_record_{}", depth - 1)
        };
        self.emit(Event::new(sql).with_category("TRANSACTION"));
        Ok(())
    }
}
