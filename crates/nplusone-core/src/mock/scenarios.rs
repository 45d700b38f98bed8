//! Pre-built mock database states and access patterns.

use super::database::MockDatabase;
use crate::event::Notifications;

impl MockDatabase {
    /// A blog with `posts` posts, each by a distinct author.
    pub fn blog(notifications: Notifications, posts: u32) -> Self {
        let db = Self::new(notifications);
        db.create_posts(posts);
        db
    }

    /// An empty database with the query cache turned on.
    pub fn with_query_cache(notifications: Notifications) -> Self {
        let db = Self::new(notifications);
        db.enable_query_cache();
        db
    }

    /// Renders a feed by loading each author separately: `1 + N` reads.
    pub fn feed_lazy(&self) -> Vec<String> {
        self.posts()
            .into_iter()
            .map(|post| {
                let author = self
                    .user(post.user_id)
                    .map(|u| u.name)
                    .unwrap_or_default();
                format!("{} by {}", post.title, author)
            })
            .collect()
    }

    /// Renders the same feed with authors preloaded: two reads.
    pub fn feed_preloaded(&self) -> Vec<String> {
        self.posts_with_users()
            .into_iter()
            .map(|(post, user)| {
                let author = user.map(|u| u.name).unwrap_or_default();
                format!("{} by {}", post.title, author)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_feeds_render_the_same() {
        let db = MockDatabase::blog(Notifications::new(), 3);
        assert_eq!(db.feed_lazy(), db.feed_preloaded());
        assert_eq!(db.feed_lazy()[0], "post-0 by user-0");
    }

    #[test]
    fn test_with_query_cache_starts_empty() {
        let db = MockDatabase::with_query_cache(Notifications::new());
        assert_eq!(db.post_count(), 0);
        assert!(db.feed_lazy().is_empty());
    }
}
