//! Runtime configuration.
//!
//! Values come from the process environment (optionally seeded from a `.env`
//! file) and fall back to the bundled `assets/config.env`.

use crate::repository::ResourceFamily;
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Bundled defaults, used for any key the environment does not set.
const BUNDLED_CONFIG: &str = include_str!("../assets/config.env");

static BUNDLED: Lazy<HashMap<String, String>> = Lazy::new(|| parse_env_lines(BUNDLED_CONFIG));

const DEFAULT_API_URL: &str = "http://localhost:8000";
const DEFAULT_LOGOUT_GRACE_MS: u64 = 300;
const DEFAULT_HISTORY_PAGE_SIZE: usize = 6;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{key} has an invalid value '{value}': {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Clone, Debug, PartialEq)]
pub struct Config {
    pub api_url: String,
    pub resource_family: ResourceFamily,
    /// Upper bound on the flush that runs before a logout completes.
    pub logout_grace: Duration,
    pub history_page_size: usize,
    /// Where the credential is kept between runs. `None` keeps it in memory.
    pub session_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            resource_family: ResourceFamily::default(),
            logout_grace: Duration::from_millis(DEFAULT_LOGOUT_GRACE_MS),
            history_page_size: DEFAULT_HISTORY_PAGE_SIZE,
            session_file: default_session_file(),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from an arbitrary key lookup, falling back to the
    /// bundled defaults for missing keys.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .filter(|v| !v.trim().is_empty())
                .or_else(|| BUNDLED.get(key).cloned())
        };
        let defaults = Config::default();

        let api_url = get("BOTANIK_API_URL")
            .map(|url| url.trim().trim_end_matches('/').to_string())
            .unwrap_or(defaults.api_url);

        let resource_family = match get("BOTANIK_RESOURCE_FAMILY") {
            Some(raw) => raw.parse().map_err(|reason| ConfigError::Invalid {
                key: "BOTANIK_RESOURCE_FAMILY",
                value: raw.clone(),
                reason,
            })?,
            None => defaults.resource_family,
        };

        let logout_grace = match get("BOTANIK_LOGOUT_GRACE_MS") {
            Some(raw) => Duration::from_millis(parse_number("BOTANIK_LOGOUT_GRACE_MS", &raw)?),
            None => defaults.logout_grace,
        };

        let history_page_size = match get("BOTANIK_HISTORY_PAGE_SIZE") {
            Some(raw) => {
                let size: usize = parse_number("BOTANIK_HISTORY_PAGE_SIZE", &raw)?;
                if size == 0 {
                    return Err(ConfigError::Invalid {
                        key: "BOTANIK_HISTORY_PAGE_SIZE",
                        value: raw,
                        reason: "must be at least 1".to_string(),
                    });
                }
                size
            }
            None => defaults.history_page_size,
        };

        let session_file = match get("BOTANIK_SESSION_FILE") {
            Some(path) if path.trim() == "none" => None,
            Some(path) => Some(PathBuf::from(path.trim())),
            None => defaults.session_file,
        };

        Ok(Self {
            api_url,
            resource_family,
            logout_grace,
            history_page_size,
            session_file,
        })
    }
}

fn parse_number<T>(key: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
        key,
        value: raw.to_string(),
        reason: e.to_string(),
    })
}

fn default_session_file() -> Option<PathBuf> {
    dirs::data_local_dir().map(|dir| dir.join("botanik").join("auth_token"))
}

fn parse_env_lines(source: &str) -> HashMap<String, String> {
    source
        .lines()
        .map(str::trim)
        // Skip comments and empty lines
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.split_once('='))
        .map(|(key, value)| (key.trim().to_string(), value.trim().to_string()))
        .collect()
}

/// Loads a `.env` file into the environment if one is present.
pub fn load_dotenv() {
    match dotenvy::dotenv() {
        Ok(path) => tracing::debug!(path = %path.display(), "loaded .env"),
        Err(_) => tracing::debug!("no .env file, using environment and bundled defaults"),
    }
}
