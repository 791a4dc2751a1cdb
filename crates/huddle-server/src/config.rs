use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use huddle_gateway::hub::DEFAULT_QUEUE_CAPACITY;
use huddle_gateway::session::DEFAULT_HEARTBEAT_INTERVAL;

/// Secrets that ship in sample `.env` files and must never reach production.
const PLACEHOLDER_SECRETS: &[&str] = &["dev-secret-change-me", "change-me", "changeme", "secret"];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("{name} is not valid: {value:?}")]
    Invalid { name: &'static str, value: String },

    #[error("HUDDLE_JWT_SECRET is a placeholder; set a real secret")]
    PlaceholderSecret,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub addr: SocketAddr,
    pub db_path: PathBuf,
    pub jwt_secret: String,
    pub queue_capacity: usize,
    pub heartbeat_interval: Duration,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let host = lookup("HUDDLE_HOST").unwrap_or_else(|| "0.0.0.0".into());
        let port = lookup("HUDDLE_PORT").unwrap_or_else(|| "3000".into());
        let addr = format!("{}:{}", host, port)
            .parse()
            .map_err(|_| ConfigError::Invalid {
                name: "HUDDLE_HOST/HUDDLE_PORT",
                value: format!("{}:{}", host, port),
            })?;

        let db_path = lookup("HUDDLE_DB_PATH").unwrap_or_else(|| "huddle.db".into());

        let jwt_secret = lookup("HUDDLE_JWT_SECRET")
            .filter(|s| !s.trim().is_empty())
            .ok_or(ConfigError::Missing("HUDDLE_JWT_SECRET"))?;
        if PLACEHOLDER_SECRETS.contains(&jwt_secret.as_str()) {
            return Err(ConfigError::PlaceholderSecret);
        }

        let queue_capacity = parse_or(&lookup, "HUDDLE_QUEUE_CAPACITY", DEFAULT_QUEUE_CAPACITY)?;
        let heartbeat_secs = parse_or(
            &lookup,
            "HUDDLE_HEARTBEAT_SECS",
            DEFAULT_HEARTBEAT_INTERVAL.as_secs(),
        )?;

        Ok(Self {
            addr,
            db_path: PathBuf::from(db_path),
            jwt_secret,
            queue_capacity,
            heartbeat_interval: Duration::from_secs(heartbeat_secs),
        })
    }
}

/// Positive integer from the environment, or `default` when unset.
fn parse_or<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T: std::str::FromStr + PartialOrd + Default,
{
    let Some(raw) = lookup(name) else {
        return Ok(default);
    };
    match raw.trim().parse::<T>() {
        Ok(value) if value > T::default() => Ok(value),
        _ => Err(ConfigError::Invalid { name, value: raw }),
    }
}
