use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Postgres,
    Memory,
}

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub store_backend: StoreBackend,
    pub database_url: Option<String>,
    pub blob_root: PathBuf,
    /// `key:tenant:role[:expires]` entries, comma separated.
    pub api_keys: Option<String>,
    pub ocr_endpoint: Option<String>,
    pub ocr_api_key: Option<String>,
    pub worker_slots: usize,
    pub rate_burst: f64,
    pub rate_refill_per_sec: f64,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        let store_backend = match env::var("STORE_BACKEND").as_deref() {
            Ok("memory") => StoreBackend::Memory,
            Ok("postgres") | Err(_) => StoreBackend::Postgres,
            Ok(other) => anyhow::bail!("STORE_BACKEND must be postgres or memory, got {other:?}"),
        };

        let database_url = env::var("DATABASE_URL").ok();
        if store_backend == StoreBackend::Postgres && database_url.is_none() {
            anyhow::bail!("DATABASE_URL must be set when STORE_BACKEND=postgres");
        }

        Ok(Self {
            port: env::var("PORT")
                .unwrap_or_else(|_| "8080".to_string())
                .parse()
                .context("PORT must be a valid number")?,
            store_backend,
            database_url,
            blob_root: env::var("BLOB_ROOT")
                .unwrap_or_else(|_| "./data/blobs".to_string())
                .into(),
            api_keys: env::var("API_KEYS").ok(),
            ocr_endpoint: env::var("OCR_ENDPOINT").ok(),
            ocr_api_key: env::var("OCR_API_KEY").ok(),
            worker_slots: env::var("WORKER_SLOTS")
                .unwrap_or_else(|_| "4".to_string())
                .parse()
                .context("WORKER_SLOTS must be a valid number")?,
            rate_burst: env::var("RATE_BURST")
                .unwrap_or_else(|_| "20".to_string())
                .parse()
                .context("RATE_BURST must be a valid number")?,
            rate_refill_per_sec: env::var("RATE_REFILL_PER_SEC")
                .unwrap_or_else(|_| "10".to_string())
                .parse()
                .context("RATE_REFILL_PER_SEC must be a valid number")?,
        })
    }
}
