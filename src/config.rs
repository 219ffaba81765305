// src/config.rs
use rust_decimal::Decimal;
use std::net::SocketAddr;
use std::str::FromStr;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} not set")]
    Missing(&'static str),
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// e.g. `sqlite://finance.db` or `sqlite::memory:`
    pub url: String,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://finance.db".to_string(),
            max_connections: 5,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub api_key: String,
    pub secret_key: String,
    pub database: DatabaseConfig,
    pub bind_addr: SocketAddr,
    pub session_ttl_secs: u64,
    pub starting_cash: Decimal,
    pub quote_base_url: String,
}

impl Config {
    /// Loads `.env` if present, then reads the process environment.
    pub fn from_env() -> Result<Config, ConfigError> {
        if let Err(e) = dotenvy::dotenv() {
            log::debug!("No .env file loaded: {}", e);
        }
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Config, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |key: &'static str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .ok_or(ConfigError::Missing(key))
        };

        let defaults = DatabaseConfig::default();
        Ok(Config {
            api_key: required("API_KEY")?,
            secret_key: required("SECRET_KEY")?,
            database: DatabaseConfig {
                url: lookup("DATABASE_URL").unwrap_or(defaults.url),
                max_connections: parse_or(
                    &lookup,
                    "DATABASE_MAX_CONNECTIONS",
                    defaults.max_connections,
                )?,
            },
            bind_addr: parse_or(&lookup, "BIND_ADDR", SocketAddr::from(([127, 0, 0, 1], 3030)))?,
            session_ttl_secs: parse_or(&lookup, "SESSION_TTL_SECS", 86_400)?,
            starting_cash: parse_or(&lookup, "STARTING_CASH", Decimal::new(10_000_00, 2))?,
            quote_base_url: lookup("QUOTE_BASE_URL")
                .unwrap_or_else(|| "https://www.alphavantage.co".to_string()),
        })
    }
}

fn parse_or<F, T>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { key, value: raw }),
    }
}
