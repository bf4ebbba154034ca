use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use std::time::Duration;
use tracing::debug;

/// A polled feed, as selected by the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct Feed {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub name: String,
    pub url: String,
    pub user_id: i64,
    pub last_fetched_at: Option<DateTime<Utc>>,
    /// `None` until the first fetch; such feeds are due immediately.
    pub next_fetch_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct Post {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub title: String,
    pub description: Option<String>,
    pub published_at: DateTime<Utc>,
    pub url: String,
    pub feed_id: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewPost {
    pub feed_id: i64,
    pub title: String,
    pub description: Option<String>,
    pub published_at: DateTime<Utc>,
    pub url: String,
}

/// Result of a post insert. A post is unique per (feed, url).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    AlreadyExists,
}

/// The persistence operations the poll scheduler and ingestor rely on.
#[async_trait::async_trait]
pub trait Store: Send + Sync {
    /// Up to `limit` feeds whose cursor has elapsed, most overdue first.
    async fn select_feeds_due_for_fetch(&self, limit: usize) -> Result<Vec<Feed>>;

    /// Advance the feed's cursor to now (plus the refresh interval).
    async fn mark_feed_fetched(&self, feed_id: i64) -> Result<()>;

    async fn insert_post(&self, post: &NewPost) -> Result<InsertOutcome>;
}

/// SQLite-backed store.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
    refresh_interval: chrono::Duration,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            refresh_interval: chrono::Duration::zero(),
        }
    }

    /// Minimum time between two fetches of the same feed.
    pub fn with_refresh_interval(mut self, refresh_interval: Duration) -> Result<Self> {
        self.refresh_interval =
            chrono::Duration::from_std(refresh_interval).context("refresh interval out of range")?;
        Ok(self)
    }

    /// Newest posts across the feeds owned by `user_name`.
    pub async fn latest_posts_for_user(&self, user_name: &str, limit: i64) -> Result<Vec<Post>> {
        let posts = sqlx::query_as::<_, Post>(
            r#"
            SELECT p.id, p.created_at, p.updated_at, p.title, p.description,
                   p.published_at, p.url, p.feed_id
            FROM posts p
            JOIN feeds f ON f.id = p.feed_id
            JOIN users u ON u.id = f.user_id
            WHERE u.name = ?
            ORDER BY p.published_at DESC, p.id DESC
            LIMIT ?
            "#,
        )
        .bind(user_name)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("failed to load posts for user {}", user_name))?;

        Ok(posts)
    }
}

#[async_trait::async_trait]
impl Store for SqliteStore {
    async fn select_feeds_due_for_fetch(&self, limit: usize) -> Result<Vec<Feed>> {
        let limit = i64::try_from(limit).context("feed limit out of range")?;

        // NULL cursors sort first in SQLite, so never-fetched feeds lead the batch.
        let feeds = sqlx::query_as::<_, Feed>(
            r#"
            SELECT id, created_at, updated_at, name, url, user_id, last_fetched_at, next_fetch_at
            FROM feeds
            WHERE next_fetch_at IS NULL OR next_fetch_at <= ?
            ORDER BY next_fetch_at ASC, id ASC
            LIMIT ?
            "#,
        )
        .bind(Utc::now())
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("failed to query feeds due for fetch")?;

        debug!("{} feeds due for fetch", feeds.len());
        Ok(feeds)
    }

    async fn mark_feed_fetched(&self, feed_id: i64) -> Result<()> {
        let now = Utc::now();
        let next_fetch_at = now
            .checked_add_signed(self.refresh_interval)
            .context("next fetch time out of range")?;

        let result = sqlx::query(
            "UPDATE feeds SET last_fetched_at = ?, next_fetch_at = ?, updated_at = ? WHERE id = ?",
        )
        .bind(now)
        .bind(next_fetch_at)
        .bind(now)
        .bind(feed_id)
        .execute(&self.pool)
        .await
        .context("failed to update feed cursor")?;

        if result.rows_affected() == 0 {
            bail!("feed {} no longer exists", feed_id);
        }
        Ok(())
    }

    async fn insert_post(&self, post: &NewPost) -> Result<InsertOutcome> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            INSERT INTO posts (created_at, updated_at, title, description, published_at, url, feed_id)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (feed_id, url) DO NOTHING
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(&post.title)
        .bind(&post.description)
        .bind(post.published_at)
        .bind(&post.url)
        .bind(post.feed_id)
        .execute(&self.pool)
        .await
        .context("failed to insert post")?;

        if result.rows_affected() == 0 {
            Ok(InsertOutcome::AlreadyExists)
        } else {
            Ok(InsertOutcome::Inserted)
        }
    }
}
