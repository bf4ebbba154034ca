use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use common::init_memory_pool;
use rssagg::ingestion::{parse_rss, FeedFetcher, FetchedItem, HttpFeedFetcher};
use rssagg::storage::{Feed, SqliteStore, Store};
use rssagg::worker::{ingest_feed, IngestOutcome, IngestSummary, Scheduler};
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;

const EXAMPLE_FEED: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0">
  <channel>
    <title>Example</title>
    <link>https://example.com/</link>
    <description>Example feed</description>
    <item>
      <title>Post A</title>
      <link>https://example.com/a</link>
      <description>About A</description>
      <pubDate>Mon, 02 Jan 2006 15:04:05 -0700</pubDate>
    </item>
    <item>
      <title>Post B</title>
      <link>https://example.com/b</link>
      <pubDate>Tue, 03 Jan 2006 15:04:05 -0700</pubDate>
    </item>
  </channel>
</rss>"#;

/// Serves one fixed document for one URL, parsed like a real response.
struct StaticFetcher {
    url: String,
    body: &'static str,
}

#[async_trait::async_trait]
impl FeedFetcher for StaticFetcher {
    async fn fetch_and_parse(&self, url: &str) -> Result<Vec<FetchedItem>> {
        if url != self.url {
            bail!("unexpected url {}", url);
        }
        parse_rss(self.body.as_bytes())
    }
}

async fn setup_test_db(feed_url: &str) -> (SqlitePool, i64) {
    let pool = init_memory_pool().await.expect("memory pool");
    let now = Utc::now();

    sqlx::query("INSERT INTO users (created_at, updated_at, name) VALUES (?, ?, ?)")
        .bind(now)
        .bind(now)
        .bind("alice")
        .execute(&pool)
        .await
        .expect("create user");

    let feed_id: i64 = sqlx::query_scalar(
        "INSERT INTO feeds (created_at, updated_at, name, url, user_id) VALUES (?, ?, ?, ?, 1) RETURNING id",
    )
    .bind(now)
    .bind(now)
    .bind("Example")
    .bind(feed_url)
    .fetch_one(&pool)
    .await
    .expect("insert feed");

    (pool, feed_id)
}

async fn post_count(pool: &SqlitePool, feed_id: i64) -> i64 {
    sqlx::query_scalar("SELECT COUNT(*) FROM posts WHERE feed_id = ?")
        .bind(feed_id)
        .fetch_one(pool)
        .await
        .expect("count posts")
}

async fn last_fetched_at(pool: &SqlitePool, feed_id: i64) -> Option<DateTime<Utc>> {
    sqlx::query_scalar("SELECT last_fetched_at FROM feeds WHERE id = ?")
        .bind(feed_id)
        .fetch_one(pool)
        .await
        .expect("read cursor")
}

async fn load_feed(store: &SqliteStore, feed_id: i64) -> Feed {
    store
        .select_feeds_due_for_fetch(10)
        .await
        .expect("select feeds")
        .into_iter()
        .find(|f| f.id == feed_id)
        .expect("feed is due")
}

#[tokio::test]
async fn example_feed_is_ingested_once() {
    let url = "https://example.com/rss";
    let (pool, feed_id) = setup_test_db(url).await;
    let store = Arc::new(SqliteStore::new(pool.clone()));
    let fetcher = Arc::new(StaticFetcher {
        url: url.to_string(),
        body: EXAMPLE_FEED,
    });
    let scheduler = Scheduler::new(store.clone(), fetcher, 10, Duration::from_secs(60));

    let before = Utc::now();
    assert_eq!(scheduler.run_tick().await, 1);

    assert_eq!(post_count(&pool, feed_id).await, 2);
    let cursor = last_fetched_at(&pool, feed_id).await.expect("cursor advanced");
    assert!(cursor >= before);

    // a second pass over the identical document stores nothing new
    assert_eq!(scheduler.run_tick().await, 1);
    assert_eq!(post_count(&pool, feed_id).await, 2);

    let posts = store.latest_posts_for_user("alice", 10).await.expect("posts");
    let titles: Vec<&str> = posts.iter().map(|p| p.title.as_str()).collect();
    assert_eq!(titles, vec!["Post B", "Post A"]);
    assert_eq!(posts[1].description.as_deref(), Some("About A"));
    assert_eq!(posts[0].description, None);
}

#[tokio::test]
async fn latest_posts_respect_owner_and_limit() {
    let url = "https://example.com/rss";
    let (pool, feed_id) = setup_test_db(url).await;
    let store = SqliteStore::new(pool);
    let fetcher = StaticFetcher {
        url: url.to_string(),
        body: EXAMPLE_FEED,
    };

    let feed = load_feed(&store, feed_id).await;
    ingest_feed(&store, &fetcher, &feed).await;

    let newest = store.latest_posts_for_user("alice", 1).await.expect("posts");
    assert_eq!(newest.len(), 1);
    assert_eq!(newest[0].url, "https://example.com/b");

    let nobody = store.latest_posts_for_user("bob", 10).await.expect("posts");
    assert!(nobody.is_empty());
}

#[tokio::test]
async fn http_feed_is_fetched_and_stored() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("GET", "/rss")
        .with_status(200)
        .with_header("content-type", "application/rss+xml")
        .with_body(EXAMPLE_FEED)
        .create_async()
        .await;

    let url = format!("{}/rss", server.url());
    let (pool, feed_id) = setup_test_db(&url).await;
    let store = SqliteStore::new(pool.clone());
    let fetcher = HttpFeedFetcher::new(Duration::from_secs(5), "rssagg-test").expect("client");

    let feed = load_feed(&store, feed_id).await;
    let outcome = ingest_feed(&store, &fetcher, &feed).await;

    assert_eq!(
        outcome,
        IngestOutcome::Completed(IngestSummary {
            inserted: 2,
            already_present: 0,
            skipped: 0,
        })
    );
    assert_eq!(post_count(&pool, feed_id).await, 2);
    mock.assert_async().await;
}

#[tokio::test]
async fn http_error_still_advances_the_cursor() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("GET", "/gone")
        .with_status(404)
        .create_async()
        .await;

    let url = format!("{}/gone", server.url());
    let (pool, feed_id) = setup_test_db(&url).await;
    let store = SqliteStore::new(pool.clone());
    let fetcher = HttpFeedFetcher::new(Duration::from_secs(5), "rssagg-test").expect("client");

    let feed = load_feed(&store, feed_id).await;
    let outcome = ingest_feed(&store, &fetcher, &feed).await;

    assert_eq!(outcome, IngestOutcome::FetchFailed);
    assert!(last_fetched_at(&pool, feed_id).await.is_some());
    assert_eq!(post_count(&pool, feed_id).await, 0);
    mock.assert_async().await;
}

#[tokio::test]
async fn non_rss_body_aborts_the_feed() {
    let mut server = mockito::Server::new_async().await;
    let _mock = server
        .mock("GET", "/page")
        .with_status(200)
        .with_header("content-type", "text/html")
        .with_body("<html><head><title>Not a feed</title></head></html>")
        .create_async()
        .await;

    let url = format!("{}/page", server.url());
    let (pool, feed_id) = setup_test_db(&url).await;
    let store = SqliteStore::new(pool.clone());
    let fetcher = HttpFeedFetcher::new(Duration::from_secs(5), "rssagg-test").expect("client");

    let feed = load_feed(&store, feed_id).await;

    assert_eq!(ingest_feed(&store, &fetcher, &feed).await, IngestOutcome::FetchFailed);
    assert!(last_fetched_at(&pool, feed_id).await.is_some());
}

#[tokio::test]
async fn slow_feed_hits_the_fetch_timeout() {
    let mut server = mockito::Server::new_async().await;
    let _mock = server
        .mock("GET", "/slow")
        .with_status(200)
        .with_chunked_body(|w| {
            std::thread::sleep(std::time::Duration::from_secs(3));
            w.write_all(EXAMPLE_FEED.as_bytes())
        })
        .create_async()
        .await;

    let fetcher = HttpFeedFetcher::new(Duration::from_secs(1), "rssagg-test").expect("client");
    let result = fetcher.fetch_and_parse(&format!("{}/slow", server.url())).await;

    assert!(result.is_err());
}
