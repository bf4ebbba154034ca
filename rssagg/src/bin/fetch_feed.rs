//! Fetch feeds with the production fetcher and report what ingestion would see.
//! Nothing is written to the database.

use clap::Parser;
use rssagg::ingestion::{parse_pub_date, FeedFetcher, HttpFeedFetcher};
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "fetch_feed", about = "Fetch and parse RSS feeds without storing them")]
struct Args {
    /// Feed URLs to fetch
    #[arg(required = true)]
    urls: Vec<String>,

    #[arg(long, default_value_t = 10)]
    timeout_seconds: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let args = Args::parse();
    let fetcher = HttpFeedFetcher::new(
        Duration::from_secs(args.timeout_seconds),
        concat!("rssagg/", env!("CARGO_PKG_VERSION")),
    )?;

    for url in &args.urls {
        println!("\n{}", "=".repeat(60));
        println!("Testing: {}", url);
        println!("{}", "=".repeat(60));

        match fetcher.fetch_and_parse(url).await {
            Ok(items) => {
                println!("Items: {}", items.len());
                for (i, item) in items.iter().enumerate() {
                    let date = match parse_pub_date(&item.pub_date) {
                        Ok(d) => d.to_rfc3339(),
                        Err(_) => format!("unparsable ({:?}), would be skipped", item.pub_date),
                    };
                    println!("  {}. {}", i + 1, item.title);
                    println!("     URL: {}", item.link);
                    println!("     Published: {}", date);
                }
            }
            Err(e) => {
                println!("Failed: {:#}", e);
            }
        }
    }

    Ok(())
}
