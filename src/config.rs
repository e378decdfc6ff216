use std::time::Duration;
use std::{env, io};

use secrecy::SecretString;
use serde::Serialize;
use tracing::debug;

const DEFAULT_DATABASE_FILE: &str = "parcelapp.db";
const DEFAULT_FALLBACK_FILE: &str = "complaints_fallback.json";
const DEFAULT_REMOTE_TABLE: &str = "complaints";

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database_file_name: String,
    pub fallback_file_name: String,
    pub remote_url: Option<String>,
    pub remote_api_key: Option<SecretString>,
    pub remote_table: String,
    pub remote_timeout_secs: u64,
    pub retry_interval_secs: u64,
    pub neighbor_limit: usize,
    pub seed_batch_size: usize,
    pub seed_batch_delay_ms: u64,
    pub fallback_gc_days: i64,
}

#[derive(Clone, Debug, Serialize)]
pub struct PublicAppConfig {
    pub database_file_name: String,
    pub fallback_file_name: String,
    pub remote_url: Option<String>,
    pub remote_table: String,
    pub remote_timeout_secs: u64,
    pub retry_interval_secs: u64,
    pub neighbor_limit: usize,
    pub seed_batch_size: usize,
    pub has_remote_api_key: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_file_name: DEFAULT_DATABASE_FILE.to_string(),
            fallback_file_name: DEFAULT_FALLBACK_FILE.to_string(),
            remote_url: None,
            remote_api_key: None,
            remote_table: DEFAULT_REMOTE_TABLE.to_string(),
            remote_timeout_secs: 15,
            retry_interval_secs: 60,
            neighbor_limit: 6,
            seed_batch_size: 200,
            seed_batch_delay_ms: 8,
            fallback_gc_days: 30,
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        load_dotenv_if_applicable();
        let defaults = Self::default();
        Self {
            database_file_name: env::var("DATABASE_FILE_NAME")
                .unwrap_or(defaults.database_file_name),
            fallback_file_name: env::var("FALLBACK_FILE_NAME")
                .unwrap_or(defaults.fallback_file_name),
            remote_url: env::var("REMOTE_URL")
                .ok()
                .map(|v| v.trim().trim_end_matches('/').to_string())
                .filter(|v| !v.is_empty()),
            remote_api_key: env::var("REMOTE_API_KEY")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(SecretString::from),
            remote_table: env::var("REMOTE_TABLE")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .unwrap_or(defaults.remote_table),
            remote_timeout_secs: parse_u64("REMOTE_TIMEOUT_SECS", defaults.remote_timeout_secs)
                .max(1),
            retry_interval_secs: parse_u64("RETRY_INTERVAL_SECS", defaults.retry_interval_secs)
                .max(1),
            neighbor_limit: parse_usize("NEIGHBOR_LIMIT", defaults.neighbor_limit).max(1),
            seed_batch_size: parse_usize("SEED_BATCH_SIZE", defaults.seed_batch_size).max(1),
            seed_batch_delay_ms: parse_u64("SEED_BATCH_DELAY_MS", defaults.seed_batch_delay_ms),
            fallback_gc_days: parse_i64("FALLBACK_GC_DAYS", defaults.fallback_gc_days),
        }
    }

    pub fn remote_configured(&self) -> bool {
        self.remote_url.is_some()
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_secs)
    }

    pub fn public_profile(&self) -> PublicAppConfig {
        PublicAppConfig {
            database_file_name: self.database_file_name.clone(),
            fallback_file_name: self.fallback_file_name.clone(),
            remote_url: self.remote_url.clone(),
            remote_table: self.remote_table.clone(),
            remote_timeout_secs: self.remote_timeout_secs,
            retry_interval_secs: self.retry_interval_secs,
            neighbor_limit: self.neighbor_limit,
            seed_batch_size: self.seed_batch_size,
            has_remote_api_key: self.remote_api_key.is_some(),
        }
    }
}

fn load_dotenv_if_applicable() {
    if !should_load_dotenv() {
        debug!("skipping .env load outside dev mode");
        return;
    }

    if let Err(err) = dotenvy::dotenv() {
        match &err {
            dotenvy::Error::Io(io_err) if io_err.kind() == io::ErrorKind::NotFound => {}
            _ => debug!(?err, "unable to load .env file"),
        }
    }
}

fn should_load_dotenv() -> bool {
    cfg!(debug_assertions) || parse_bool("ALLOW_DOTENV", false)
}

fn parse_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(default)
}

fn parse_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn parse_i64(key: &str, default: i64) -> i64 {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<i64>().ok())
        .unwrap_or(default)
}

fn parse_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(default)
}
