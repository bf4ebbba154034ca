/*!
common/src/lib.rs

Shared configuration types and DB helper functions for rssagg.

This file provides:
- Config data structures (deserialized from TOML)
- An async loader that merges a default config file with an override
- Helpers to initialize and migrate an SQLite database
- Seeding of users and their feeds from the configuration
*/

use anyhow::{bail, Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

const DEFAULT_CONCURRENCY: usize = 10;
const DEFAULT_INTERVAL_SECONDS: u64 = 60;
const DEFAULT_FETCH_TIMEOUT_SECONDS: u64 = 10;

/// Database configuration section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the sqlite database file (e.g. "data/rssagg.db")
    pub path: String,
    /// Run embedded migrations at start-up (default: true)
    pub auto_migrate: Option<bool>,
}

/// Poll scheduler / fetching configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScraperConfig {
    /// Max feeds fetched per tick, and max fetches in flight
    pub concurrency: Option<usize>,
    /// Seconds between two scheduler ticks
    pub interval_seconds: Option<u64>,
    /// Minimum seconds between two fetches of the same feed
    pub refresh_interval_seconds: Option<u64>,
    pub fetch_timeout_seconds: Option<u64>,
    pub user_agent: Option<String>,
}

impl ScraperConfig {
    pub fn concurrency(&self) -> usize {
        self.concurrency.unwrap_or(DEFAULT_CONCURRENCY)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds.unwrap_or(DEFAULT_INTERVAL_SECONDS))
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_seconds.unwrap_or(0))
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(
            self.fetch_timeout_seconds
                .unwrap_or(DEFAULT_FETCH_TIMEOUT_SECONDS),
        )
    }

    pub fn user_agent(&self) -> String {
        self.user_agent
            .clone()
            .unwrap_or_else(|| concat!("rssagg/", env!("CARGO_PKG_VERSION")).to_string())
    }
}

/// Simple feed descriptor used in per-user feed lists
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedConfig {
    pub url: String,
    pub name: Option<String>,
}

/// Per-user configuration (users are defined in the global config file)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserConfig {
    pub name: String,
    #[serde(default)]
    pub feeds: Vec<FeedConfig>,
}

/// Top-level application configuration (deserialized from config.toml)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    #[serde(default)]
    pub scraper: ScraperConfig,
    #[serde(default)]
    pub users: Vec<UserConfig>,
}

impl Config {
    /// Load configuration with an optional default file and an optional override file.
    /// If both are present, they are merged (override takes precedence).
    pub async fn load_with_defaults(
        default_path: Option<&Path>,
        override_path: Option<&Path>,
    ) -> Result<Self> {
        let mut config_value = toml::Value::Table(toml::map::Map::new());

        for path in [default_path, override_path].into_iter().flatten() {
            if !path.exists() {
                continue;
            }
            let data = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("Failed to read config: {}", path.display()))?;
            let val: toml::Value = toml::from_str(&data)
                .with_context(|| format!("Failed to parse configuration: {}", path.display()))?;
            merge_toml(&mut config_value, val);
        }

        let cfg: Config = config_value
            .try_into()
            .context("Failed to parse merged configuration")?;
        Ok(cfg)
    }

    /// Reject settings the scheduler cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.scraper.concurrency() == 0 {
            bail!("scraper.concurrency must be a positive integer");
        }
        if self.scraper.interval().is_zero() {
            bail!("scraper.interval_seconds must be greater than zero");
        }
        if self.scraper.fetch_timeout().is_zero() {
            bail!("scraper.fetch_timeout_seconds must be greater than zero");
        }
        for user in &self.users {
            for feed in &user.feeds {
                url::Url::parse(&feed.url).with_context(|| {
                    format!("invalid feed url {:?} for user {}", feed.url, user.name)
                })?;
            }
        }
        Ok(())
    }
}

fn merge_toml(a: &mut toml::Value, b: toml::Value) {
    match (a, b) {
        (toml::Value::Table(a_map), toml::Value::Table(b_map)) => {
            for (k, v) in b_map {
                if let Some(a_val) = a_map.get_mut(&k) {
                    merge_toml(a_val, v);
                } else {
                    a_map.insert(k, v);
                }
            }
        }
        (a_val, b_val) => *a_val = b_val,
    }
}

/// Run the SQL migrations embedded from the workspace `migrations` directory.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::migrate!("../migrations")
        .run(pool)
        .await
        .context("Failed to run sqlx migrations")?;

    Ok(())
}

/// Initialize an SQLite connection pool.
///
/// Creates the parent directory and the DB file if necessary, so that filesystem
/// problems surface here with a clear message instead of at the first query.
/// Defaults are conservative:
/// - max_connections: 5
/// - WAL journal mode, foreign keys on
///
/// Example:
///   let pool = init_db_pool("data/rssagg.db").await?;
pub async fn init_db_pool(path: &str) -> Result<SqlitePool> {
    if let Some(parent) = Path::new(path).parent() {
        tokio::fs::create_dir_all(parent).await.with_context(|| {
            format!("Failed to create DB parent directory: {}", parent.display())
        })?;
    }

    tokio::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .open(path)
        .await
        .with_context(|| format!("Failed to create or open DB file: {}", path))?;

    let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", path))?
        .create_if_missing(true)
        .foreign_keys(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
        .with_context(|| format!("Failed to connect to sqlite database at path: {}", path))?;

    Ok(pool)
}

/// In-memory database with the schema applied (kept public for tests and tools).
///
/// A single connection is used because every `:memory:` connection is its own database.
pub async fn init_memory_pool() -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await
        .context("Failed to open in-memory sqlite database")?;
    run_migrations(&pool).await?;
    Ok(pool)
}

/// Ensure that users defined in the configuration, and the feeds they list, are
/// present in the database.
///
/// Uses INSERT OR IGNORE throughout so it is safe to call on every start-up: existing
/// feeds keep their fetch cursor. A feed URL already owned by another user is left
/// with its current owner.
pub async fn sync_users(config: &Config, pool: &SqlitePool) -> Result<()> {
    let mut feed_count = 0;

    for u in &config.users {
        let now = Utc::now();
        sqlx::query("INSERT OR IGNORE INTO users (created_at, updated_at, name) VALUES (?, ?, ?)")
            .bind(now)
            .bind(now)
            .bind(&u.name)
            .execute(pool)
            .await
            .with_context(|| format!("failed to insert or ignore user {}", u.name))?;

        let user_id: i64 = sqlx::query_scalar("SELECT id FROM users WHERE name = ?")
            .bind(&u.name)
            .fetch_one(pool)
            .await
            .with_context(|| format!("failed to look up user {}", u.name))?;

        for feed in &u.feeds {
            let name = feed.name.clone().unwrap_or_else(|| feed.url.clone());
            let result = sqlx::query(
                "INSERT OR IGNORE INTO feeds (created_at, updated_at, name, url, user_id) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(now)
            .bind(now)
            .bind(&name)
            .bind(&feed.url)
            .bind(user_id)
            .execute(pool)
            .await
            .with_context(|| format!("failed to insert or ignore feed {}", feed.url))?;

            if result.rows_affected() == 0 {
                debug!(url = %feed.url, user = %u.name, "feed already registered");
            } else {
                feed_count += 1;
            }
        }
    }

    info!(
        users = config.users.len(),
        new_feeds = feed_count,
        "configuration users synchronized into database"
    );
    Ok(())
}
