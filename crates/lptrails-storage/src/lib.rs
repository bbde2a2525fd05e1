//! Shared caches + HTTP fetch utilities for the trail scraper.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use lptrails_core::ScraperResult;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "lptrails-storage";

pub const DEFAULT_LOOKUP_FILE: &str = "urlLookupTable.txt";

/// Persistent Spanish -> English detail page map.
///
/// Safe to share between concurrent scrapes; the lock is never held across an await.
#[derive(Debug)]
pub struct UrlLookupCache {
    path: PathBuf,
    map: RwLock<HashMap<String, String>>,
}

impl UrlLookupCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            map: RwLock::new(HashMap::new()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn try_get(&self, spanish_url: &str) -> Option<String> {
        self.map
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(spanish_url)
            .cloned()
    }

    /// Inserts only when the key is absent; a repeated add is a no-op.
    pub fn try_add(&self, spanish_url: impl Into<String>, english_url: impl Into<String>) -> bool {
        let mut map = self.map.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        match map.entry(spanish_url.into()) {
            std::collections::hash_map::Entry::Occupied(_) => false,
            std::collections::hash_map::Entry::Vacant(slot) => {
                slot.insert(english_url.into());
                true
            }
        }
    }

    pub fn clear(&self) {
        self.map
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
    }

    pub fn len(&self) -> usize {
        self.map
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn snapshot(&self) -> BTreeMap<String, String> {
        self.map
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Replaces the in-memory map with the persisted one.
    ///
    /// Returns false, leaving the current contents untouched, when the file is missing,
    /// unreadable, not a JSON object of strings, or empty.
    pub async fn load_from_file(&self) -> bool {
        let text = match fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(err) => {
                debug!(path = %self.path.display(), %err, "no url lookup file to load");
                return false;
            }
        };
        let loaded: HashMap<String, String> = match serde_json::from_str(&text) {
            Ok(map) => map,
            Err(err) => {
                warn!(path = %self.path.display(), %err, "ignoring malformed url lookup file");
                return false;
            }
        };
        if loaded.is_empty() {
            return false;
        }

        let count = loaded.len();
        *self.map.write().unwrap_or_else(|poisoned| poisoned.into_inner()) = loaded;
        debug!(path = %self.path.display(), count, "loaded url lookup file");
        true
    }

    /// Writes the full map, replacing any existing file via temp-file rename.
    pub async fn save_to_file(&self) -> anyhow::Result<()> {
        let bytes = serde_json::to_vec_pretty(&self.snapshot()).context("serializing url lookup table")?;

        let parent = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf);
        if let Some(parent) = &parent {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating lookup directory {}", parent.display()))?;
        }

        let temp_name = format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len());
        let temp_path = match &parent {
            Some(parent) => parent.join(temp_name),
            None => PathBuf::from(temp_name),
        };

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp lookup file {}", temp_path.display()))?;
        file.write_all(&bytes)
            .await
            .with_context(|| format!("writing temp lookup file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp lookup file {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &self.path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "renaming temp lookup file {} -> {}",
                    temp_path.display(),
                    self.path.display()
                )
            });
        }
        Ok(())
    }
}

/// Holds the last successful scrape for up to `max_age`.
#[derive(Debug)]
pub struct ResultCache {
    max_age: TimeDelta,
    value: Mutex<Option<Arc<ScraperResult>>>,
}

impl Default for ResultCache {
    fn default() -> Self {
        Self::new(TimeDelta::days(1))
    }
}

impl ResultCache {
    pub fn new(max_age: TimeDelta) -> Self {
        Self {
            max_age,
            value: Mutex::new(None),
        }
    }

    pub fn get(&self) -> Option<Arc<ScraperResult>> {
        self.value
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn set(&self, result: Arc<ScraperResult>) {
        *self.value.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(result);
    }

    /// The cached result if it is a success younger than `max_age` at `now`.
    pub fn fresh_at(&self, now: DateTime<Utc>) -> Option<Arc<ScraperResult>> {
        let cached = self.get()?;
        if !cached.is_success() {
            return None;
        }
        let scraped = cached.last_scraped?;
        (now.signed_duration_since(scraped) < self.max_age).then_some(cached)
    }

    pub fn fresh(&self) -> Option<Arc<ScraperResult>> {
        self.fresh_at(Utc::now())
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} timed out after {} ms", timeout.as_millis())]
    Timeout { url: String, timeout: Duration },
    #[error("{0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("{0}")]
    Other(String),
}

impl FetchError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, FetchError::Timeout { .. })
    }
}

/// Text fetch capability the scrape engine depends on.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch_text(&self, url: &str, timeout: Duration) -> Result<String, FetchError>;
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub connect_timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            user_agent: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .connect_timeout(config.connect_timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    async fn fetch_text(&self, url: &str, timeout: Duration) -> Result<String, FetchError> {
        let span = info_span!("http_fetch", url, timeout_ms = timeout.as_millis() as u64);
        async move {
            let as_fetch_error = |err: reqwest::Error| {
                if err.is_timeout() {
                    FetchError::Timeout {
                        url: url.to_string(),
                        timeout,
                    }
                } else {
                    FetchError::Request(err)
                }
            };

            let resp = self
                .client
                .get(url)
                .timeout(timeout)
                .send()
                .await
                .map_err(as_fetch_error)?;

            let status = resp.status();
            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: resp.url().to_string(),
                });
            }

            let body = resp.text().await.map_err(as_fetch_error)?;
            debug!(bytes = body.len(), "fetched page");
            Ok(body)
        }
        .instrument(span)
        .await
    }
}
