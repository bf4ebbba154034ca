/*
rssagg - main.rs
Loads the configuration, prepares the database and runs the poll scheduler until CTRL-C.
*/

use anyhow::Result;
use clap::Parser;
use common::{init_db_pool, run_migrations, sync_users, Config};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use rssagg::ingestion::HttpFeedFetcher;
use rssagg::storage::SqliteStore;
use rssagg::worker::Scheduler;

#[derive(Parser, Debug)]
#[command(name = "rssagg", about = "Periodic RSS ingestion worker")]
struct Args {
    /// Path to config.toml
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Run a single scheduling tick and exit
    #[arg(long)]
    once: bool,

    /// Print the latest posts of the feeds owned by USER and exit
    #[arg(long, value_name = "USER")]
    latest: Option<String>,

    /// Number of posts printed by --latest
    #[arg(long, default_value_t = 10)]
    limit: i64,

    /// Override log level (info, debug, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).init();

    // Resolve config paths
    let default_path = PathBuf::from("config.default.toml");

    let override_path = if let Some(p) = args.config {
        if !p.exists() {
            error!(path = ?p, "specified config file not found");
            return Err(anyhow::anyhow!("Config file not found: {}", p.display()));
        }
        Some(p)
    } else {
        let p = PathBuf::from("config.toml");
        if p.exists() {
            Some(p)
        } else {
            None
        }
    };

    let config = match Config::load_with_defaults(
        if default_path.exists() { Some(&default_path) } else { None },
        override_path.as_deref(),
    )
    .await
    {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(%e, "failed to load configuration");
            return Err(e);
        }
    };
    if let Err(e) = config.validate() {
        error!("invalid configuration: {:#}", e);
        return Err(e);
    }
    info!(default = ?default_path, override = ?override_path, "configuration loaded");

    let db_path = config.database.path.clone();
    let pool = match init_db_pool(&db_path).await {
        Ok(p) => p,
        Err(e) => {
            error!(%e, db_path = %db_path, "failed to initialize database pool");
            return Err(e);
        }
    };

    if config.database.auto_migrate.unwrap_or(true) {
        info!("running DB migrations");
        run_migrations(&pool).await?;
    }
    sync_users(&config, &pool).await?;

    let store = SqliteStore::new(pool).with_refresh_interval(config.scraper.refresh_interval())?;

    if let Some(user) = args.latest {
        let posts = store.latest_posts_for_user(&user, args.limit).await?;
        if posts.is_empty() {
            println!("No posts for {}", user);
        }
        for post in posts {
            println!("{}  {}\n    {}", post.published_at.to_rfc2822(), post.title, post.url);
        }
        return Ok(());
    }

    let fetcher = HttpFeedFetcher::new(
        config.scraper.fetch_timeout(),
        &config.scraper.user_agent(),
    )?;

    let scheduler = Scheduler::new(
        Arc::new(store),
        Arc::new(fetcher),
        config.scraper.concurrency(),
        config.scraper.interval(),
    );

    if args.once {
        let dispatched = scheduler.run_tick().await;
        info!("single tick finished, {} feeds processed", dispatched);
        return Ok(());
    }

    let shutdown_notify = Arc::new(Notify::new());
    let signal_notify = shutdown_notify.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(%e, "failed to listen for ctrl-c");
            return;
        }
        info!("ctrl-c received, finishing current tick");
        // notify_one keeps the permit if the scheduler is mid-tick
        signal_notify.notify_one();
    });

    scheduler.run(shutdown_notify).await;

    info!("Shutdown complete");
    Ok(())
}
