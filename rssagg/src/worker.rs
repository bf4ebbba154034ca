//! Poll scheduler and per-feed ingestion.
//!
//! Every tick the scheduler selects up to `concurrency` overdue feeds, ingests them
//! in parallel and waits for all of them before the next tick. Failures stay local
//! to the item, feed or tick they happen in.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::ingestion::{parse_pub_date, FeedFetcher};
use crate::storage::{Feed, InsertOutcome, NewPost, Store};

/// Per-item counts for one completed feed ingestion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestSummary {
    pub inserted: usize,
    pub already_present: usize,
    pub skipped: usize,
}

/// How a single feed's ingestion ended for this tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// The cursor could not be advanced; nothing was fetched.
    MarkFailed,
    /// The document could not be fetched or parsed.
    FetchFailed,
    Completed(IngestSummary),
}

/// Fetch one feed and persist its new items.
///
/// The cursor is advanced before the fetch so that a feed that keeps failing still
/// moves back in the queue.
pub async fn ingest_feed(store: &dyn Store, fetcher: &dyn FeedFetcher, feed: &Feed) -> IngestOutcome {
    info!("scraping feed {} ({})", feed.id, feed.url);

    if let Err(e) = store.mark_feed_fetched(feed.id).await {
        error!("failed to mark feed {} as fetched: {:#}", feed.id, e);
        return IngestOutcome::MarkFailed;
    }

    let items = match fetcher.fetch_and_parse(&feed.url).await {
        Ok(items) => items,
        Err(e) => {
            error!("failed to fetch feed {} ({}): {:#}", feed.id, feed.url, e);
            return IngestOutcome::FetchFailed;
        }
    };

    let mut summary = IngestSummary::default();

    for item in &items {
        let published_at = match parse_pub_date(&item.pub_date) {
            Ok(date) => date,
            Err(e) => {
                warn!("skipping item {:?} of feed {}: {:#}", item.title, feed.id, e);
                summary.skipped += 1;
                continue;
            }
        };

        let post = NewPost {
            feed_id: feed.id,
            title: item.title.clone(),
            description: item.description.clone(),
            published_at,
            url: item.link.clone(),
        };

        match store.insert_post(&post).await {
            Ok(InsertOutcome::Inserted) => summary.inserted += 1,
            Ok(InsertOutcome::AlreadyExists) => summary.already_present += 1,
            Err(e) => {
                warn!(
                    "couldn't create post {:?} for feed {}: {:#}",
                    item.title, feed.id, e
                );
                summary.skipped += 1;
            }
        }
    }

    info!(
        "feed {} has {} posts ({} new, {} already stored, {} skipped)",
        feed.id,
        items.len(),
        summary.inserted,
        summary.already_present,
        summary.skipped
    );
    IngestOutcome::Completed(summary)
}

/// Fixed-interval driver for [`ingest_feed`].
pub struct Scheduler {
    store: Arc<dyn Store>,
    fetcher: Arc<dyn FeedFetcher>,
    concurrency: usize,
    interval: Duration,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn Store>,
        fetcher: Arc<dyn FeedFetcher>,
        concurrency: usize,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            fetcher,
            concurrency,
            interval,
        }
    }

    /// Tick until `shutdown` is notified. The first tick runs immediately; a tick in
    /// progress always runs to completion before shutdown is observed.
    pub async fn run(&self, shutdown: Arc<Notify>) {
        info!(
            "scraping on {} tasks every {:?}",
            self.concurrency, self.interval
        );

        let mut timer = tokio::time::interval(self.interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.notified() => {
                    info!("scheduler: shutdown requested, exiting loop");
                    break;
                }
                _ = timer.tick() => {
                    self.run_tick().await;
                }
            }
        }
    }

    /// Run one scheduling cycle and return how many feeds were dispatched.
    pub async fn run_tick(&self) -> usize {
        let feeds = match self.store.select_feeds_due_for_fetch(self.concurrency).await {
            Ok(feeds) => feeds,
            Err(e) => {
                error!("scheduler: failed to query feeds due for fetch: {:#}", e);
                return 0;
            }
        };

        if feeds.is_empty() {
            debug!("scheduler: no feeds due for fetch");
            return 0;
        }

        let mut tasks = JoinSet::new();
        for feed in feeds.into_iter().take(self.concurrency) {
            let store = Arc::clone(&self.store);
            let fetcher = Arc::clone(&self.fetcher);
            tasks.spawn(async move { ingest_feed(store.as_ref(), fetcher.as_ref(), &feed).await });
        }

        let dispatched = tasks.len();
        debug!("scheduler: dispatched {} feeds", dispatched);

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => debug!("scheduler: feed finished: {:?}", outcome),
                Err(e) => error!("scheduler: ingestion task failed: {}", e),
            }
        }

        dispatched
    }
}
