use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use reqwest::Client;
use rss::Channel;
use std::time::Duration;

/// RFC 1123 with a numeric zone, e.g. `Mon, 02 Jan 2006 15:04:05 -0700`.
pub const PUB_DATE_FORMAT: &str = "%a, %d %b %Y %H:%M:%S %z";

/// One `<item>` of a fetched channel. The publication date is kept as the raw
/// string so each item can be validated on its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedItem {
    pub title: String,
    pub link: String,
    pub description: Option<String>,
    pub pub_date: String,
}

/// Retrieves and parses the document behind a feed URL.
#[async_trait::async_trait]
pub trait FeedFetcher: Send + Sync {
    async fn fetch_and_parse(&self, url: &str) -> Result<Vec<FetchedItem>>;
}

/// Fetcher backed by a shared reqwest client with a per-request timeout.
pub struct HttpFeedFetcher {
    client: Client,
}

impl HttpFeedFetcher {
    pub fn new(timeout: Duration, user_agent: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(user_agent)
            .build()
            .context("failed to build reqwest client")?;

        Ok(Self { client })
    }
}

#[async_trait::async_trait]
impl FeedFetcher for HttpFeedFetcher {
    async fn fetch_and_parse(&self, url: &str) -> Result<Vec<FetchedItem>> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .context("failed to fetch feed")?;

        let status = response.status();
        if !status.is_success() {
            bail!("feed fetch failed with status: {}", status);
        }

        let bytes = response
            .bytes()
            .await
            .context("failed to read response body")?;

        parse_rss(bytes.as_ref())
    }
}

impl From<&rss::Item> for FetchedItem {
    fn from(item: &rss::Item) -> Self {
        FetchedItem {
            title: item.title().unwrap_or_default().trim().to_string(),
            link: item.link().unwrap_or_default().trim().to_string(),
            description: item
                .description()
                .filter(|d| !d.is_empty())
                .map(|d| d.to_string()),
            pub_date: item.pub_date().unwrap_or_default().trim().to_string(),
        }
    }
}

/// Parse an RSS 2.0 document into its items, in document order.
///
/// Documents that are not UTF-8 are rejected rather than decoded lossily.
pub fn parse_rss(bytes: &[u8]) -> Result<Vec<FetchedItem>> {
    let text = std::str::from_utf8(bytes).context("feed document is not valid UTF-8")?;
    let channel = Channel::read_from(text.as_bytes()).context("failed to parse feed")?;

    Ok(channel.items().iter().map(FetchedItem::from).collect())
}

/// Parse an item's publication date in [`PUB_DATE_FORMAT`].
pub fn parse_pub_date(raw: &str) -> Result<DateTime<Utc>> {
    let parsed = DateTime::parse_from_str(raw, PUB_DATE_FORMAT)
        .with_context(|| format!("couldn't parse date {:?}", raw))?;

    Ok(parsed.with_timezone(&Utc))
}
