use std::{env, net::SocketAddr, str::FromStr, time::Duration};

use anyhow::{ensure, Context, Result};

pub const MIN_READING_INTERVAL: i32 = 10; // s
pub const MAX_READING_INTERVAL: i32 = 24 * 60 * 60; // s

#[derive(Debug, Clone)]
pub struct Settings {
    pub database_url: String,
    pub bind_addr: SocketAddr,
    pub db_pool_size: u32,
    pub rate_limit_capacity: u32,
    pub rate_limit_refill: Duration, // per token
    pub default_reading_interval: i32, // s
    pub admin_token: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database_url: ":memory:".into(),
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8081)),
            db_pool_size: 8,
            rate_limit_capacity: 10,
            rate_limit_refill: Duration::from_secs(6),
            default_reading_interval: 60,
            admin_token: None,
        }
    }
}

impl Settings {
    /// Reads the process environment, after loading `.env` if present.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        let defaults = Self::default();

        let admin_token = env::var("ADMIN_TOKEN").ok().filter(|t| !t.trim().is_empty());
        if admin_token.is_none() {
            log::warn!("ADMIN_TOKEN not set, admin endpoints are disabled");
        }

        Ok(Self {
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            bind_addr: var_or("BIND_ADDR", defaults.bind_addr)?,
            db_pool_size: var_or("DB_POOL_SIZE", defaults.db_pool_size)?,
            rate_limit_capacity: var_or("RATE_LIMIT_CAPACITY", defaults.rate_limit_capacity)?,
            rate_limit_refill: Duration::from_secs(var_or(
                "RATE_LIMIT_REFILL_SECS",
                defaults.rate_limit_refill.as_secs(),
            )?),
            default_reading_interval: checked_interval(var_or(
                "DEFAULT_READING_INTERVAL",
                defaults.default_reading_interval,
            )?)?,
            admin_token,
        })
    }
}

fn checked_interval(secs: i32) -> Result<i32> {
    ensure!(
        (MIN_READING_INTERVAL..=MAX_READING_INTERVAL).contains(&secs),
        "DEFAULT_READING_INTERVAL must be within {MIN_READING_INTERVAL}..={MAX_READING_INTERVAL} s, got {secs}"
    );
    Ok(secs)
}

fn var_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(value) => value
            .trim()
            .parse()
            .with_context(|| format!("invalid value for {key}: '{value}'")),
        Err(_) => Ok(default),
    }
}
