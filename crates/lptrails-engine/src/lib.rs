//! Scrape orchestration: status page -> rows -> English links -> cached result.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use futures::stream::{self, StreamExt};
use lptrails_adapters::{
    find_english_link, parse_status_table, RouteLink, StatusRow, TrailIdMatch, UNRECOGNISED_TRAIL,
};
use lptrails_core::{EventType, ScraperResult, TrailState};
use lptrails_storage::{
    HttpClientConfig, HttpFetcher, PageFetcher, ResultCache, UrlLookupCache, DEFAULT_LOOKUP_FILE,
};
use serde::de::{Error as _, Unexpected};
use serde::{Deserialize, Deserializer};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "lptrails-engine";

pub const DEFAULT_STATUS_PAGE: &str =
    "https://www.senderosdelapalma.es/en/footpaths/situation-of-the-footpaths/";
pub const DEFAULT_PAGE_TIMEOUT_MS: u64 = 5000;
pub const DEFAULT_DETAIL_CONCURRENCY: usize = 8;

/// Per-request scrape settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScrapeOptions {
    pub status_page: String,
    pub status_page_timeout: Duration,
    pub detail_page_timeout: Duration,
    /// Serve a fresh cached result instead of scraping.
    pub use_cache: bool,
    /// Rebuild the Spanish -> English lookup table from scratch.
    pub clear_lookups: bool,
}

impl Default for ScrapeOptions {
    fn default() -> Self {
        Self {
            status_page: DEFAULT_STATUS_PAGE.to_string(),
            status_page_timeout: Duration::from_millis(DEFAULT_PAGE_TIMEOUT_MS),
            detail_page_timeout: Duration::from_millis(DEFAULT_PAGE_TIMEOUT_MS),
            use_cache: true,
            clear_lookups: false,
        }
    }
}

/// Optional caller-supplied values layered over [`ScrapeOptions`]; timeouts in ms.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScrapeOverrides {
    pub status_page: Option<String>,
    pub status_page_timeout: Option<u64>,
    pub detail_page_timeout: Option<u64>,
    #[serde(default, deserialize_with = "flag")]
    pub use_cache: Option<bool>,
    #[serde(default, deserialize_with = "flag")]
    pub clear_lookups: Option<bool>,
}

/// `true`/`false` in any letter case.
fn flag<'de, D>(deserializer: D) -> Result<Option<bool>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    if raw.eq_ignore_ascii_case("true") {
        Ok(Some(true))
    } else if raw.eq_ignore_ascii_case("false") {
        Ok(Some(false))
    } else {
        Err(D::Error::invalid_value(Unexpected::Str(&raw), &"true or false"))
    }
}

impl ScrapeOptions {
    pub fn with_overrides(mut self, overrides: &ScrapeOverrides) -> Self {
        if let Some(page) = &overrides.status_page {
            self.status_page = page.clone();
        }
        if let Some(ms) = overrides.status_page_timeout {
            self.status_page_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = overrides.detail_page_timeout {
            self.detail_page_timeout = Duration::from_millis(ms);
        }
        if let Some(use_cache) = overrides.use_cache {
            self.use_cache = use_cache;
        }
        if let Some(clear_lookups) = overrides.clear_lookups {
            self.clear_lookups = clear_lookups;
        }
        self
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub options: ScrapeOptions,
    pub detail_concurrency: usize,
    pub lookup_file: PathBuf,
    pub user_agent: String,
    pub scheduler_enabled: bool,
    pub refresh_cron: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            options: ScrapeOptions::default(),
            detail_concurrency: DEFAULT_DETAIL_CONCURRENCY,
            lookup_file: PathBuf::from(DEFAULT_LOOKUP_FILE),
            user_agent: "lptrails-bot/0.1".to_string(),
            scheduler_enabled: false,
            refresh_cron: "0 0 6 * * *".to_string(),
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let millis = |key: &str, fallback: Duration| {
            std::env::var(key)
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(fallback)
        };

        Self {
            options: ScrapeOptions {
                status_page: std::env::var("LPTRAILS_STATUS_PAGE")
                    .unwrap_or(defaults.options.status_page),
                status_page_timeout: millis(
                    "LPTRAILS_STATUS_PAGE_TIMEOUT_MS",
                    defaults.options.status_page_timeout,
                ),
                detail_page_timeout: millis(
                    "LPTRAILS_DETAIL_PAGE_TIMEOUT_MS",
                    defaults.options.detail_page_timeout,
                ),
                ..defaults.options
            },
            detail_concurrency: std::env::var("LPTRAILS_DETAIL_CONCURRENCY")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.detail_concurrency),
            lookup_file: std::env::var("LPTRAILS_LOOKUP_FILE")
                .map(PathBuf::from)
                .unwrap_or(defaults.lookup_file),
            user_agent: std::env::var("LPTRAILS_USER_AGENT").unwrap_or(defaults.user_agent),
            scheduler_enabled: std::env::var("LPTRAILS_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(defaults.scheduler_enabled),
            refresh_cron: std::env::var("LPTRAILS_REFRESH_CRON").unwrap_or(defaults.refresh_cron),
        }
    }
}

/// Result of looking up the English version of one Spanish detail page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkResolution {
    Resolved(String),
    NotFound,
    Timeout(String),
    Failed(String),
}

pub struct ScrapeEngine {
    fetcher: Arc<dyn PageFetcher>,
    lookups: Arc<UrlLookupCache>,
    results: Arc<ResultCache>,
    detail_concurrency: usize,
}

impl ScrapeEngine {
    pub fn new(
        fetcher: Arc<dyn PageFetcher>,
        lookups: Arc<UrlLookupCache>,
        results: Arc<ResultCache>,
    ) -> Self {
        Self {
            fetcher,
            lookups,
            results,
            detail_concurrency: DEFAULT_DETAIL_CONCURRENCY,
        }
    }

    pub fn with_detail_concurrency(mut self, detail_concurrency: usize) -> Self {
        self.detail_concurrency = detail_concurrency.max(1);
        self
    }

    /// Builds an engine with a live HTTP client and fresh caches.
    pub fn from_config(config: &EngineConfig) -> Result<Self> {
        let fetcher = HttpFetcher::new(HttpClientConfig {
            user_agent: Some(config.user_agent.clone()),
            ..Default::default()
        })?;
        Ok(Self::new(
            Arc::new(fetcher),
            Arc::new(UrlLookupCache::new(config.lookup_file.clone())),
            Arc::new(ResultCache::default()),
        )
        .with_detail_concurrency(config.detail_concurrency))
    }

    pub fn lookups(&self) -> &Arc<UrlLookupCache> {
        &self.lookups
    }

    pub fn results(&self) -> &Arc<ResultCache> {
        &self.results
    }

    /// Scrapes the status page, or serves the cached result when allowed.
    ///
    /// Never fails: page-level problems end up in `result`, row-level ones in
    /// `anomalies`. Only successful scrapes are cached.
    pub async fn get_trail_statuses(&self, options: &ScrapeOptions) -> Arc<ScraperResult> {
        let run_id = Uuid::new_v4();
        let span = info_span!("scrape", %run_id, status_page = %options.status_page);
        self.scrape(options).instrument(span).await
    }

    async fn scrape(&self, options: &ScrapeOptions) -> Arc<ScraperResult> {
        if options.clear_lookups {
            self.lookups.clear();
        }
        let baseline = self.lookups.len();

        if options.use_cache {
            if let Some(cached) = self.results.fresh() {
                debug!("serving cached result");
                return cached;
            }
        }

        let mut result = ScraperResult::new();

        let html = match self
            .fetcher
            .fetch_text(&options.status_page, options.status_page_timeout)
            .await
        {
            Ok(html) => html,
            Err(err) if err.is_timeout() => {
                warn!(%err, "status page timed out");
                result.timeout(err.to_string(), options.status_page.as_str());
                return Arc::new(result);
            }
            Err(err) => {
                warn!(%err, "status page could not be read");
                result.exception("Cannot read data", err.to_string());
                return Arc::new(result);
            }
        };

        let rows = match parse_status_table(&html) {
            Ok(rows) => rows,
            Err(err) => {
                warn!(%err, "status table missing");
                result.data_error("Trail network probably closed", err.to_string());
                return Arc::new(result);
            }
        };

        let resolutions = self.resolve_row_links(&rows, options.detail_page_timeout).await;
        for row in &rows {
            apply_row(row, &resolutions, &options.status_page, &mut result);
        }

        let additional_lookups = self.lookups.len().saturating_sub(baseline);
        if additional_lookups > 0 {
            if let Err(err) = self.lookups.save_to_file().await {
                warn!(error = %format!("{err:#}"), "could not persist url lookup table");
            }
        }

        let anomalies = result.anomalies.len();
        result.success(
            format!("{additional_lookups} additional page lookups"),
            format!("{anomalies} anomalies found"),
            Utc::now(),
        );
        info!(
            trails = result.trails.len(),
            anomalies,
            additional_lookups,
            "status page scraped"
        );

        let result = Arc::new(result);
        self.results.set(result.clone());
        result
    }

    /// Looks up each distinct detail link once, `detail_concurrency` at a time.
    async fn resolve_row_links(
        &self,
        rows: &[StatusRow],
        timeout: Duration,
    ) -> HashMap<String, LinkResolution> {
        let mut seen = HashSet::new();
        let links: Vec<String> = rows
            .iter()
            .filter_map(|row| match row.route_link() {
                RouteLink::Detail(link) => Some(link),
                _ => None,
            })
            .filter(|link| seen.insert(link.clone()))
            .collect();

        stream::iter(links)
            .map(|link| async move {
                let resolution = self.resolve_english_url(&link, timeout).await;
                (link, resolution)
            })
            .buffered(self.detail_concurrency)
            .collect()
            .await
    }

    /// English equivalent of a Spanish detail page, from the lookup table or the page itself.
    pub async fn resolve_english_url(&self, spanish_url: &str, timeout: Duration) -> LinkResolution {
        if let Some(english) = self.lookups.try_get(spanish_url) {
            return LinkResolution::Resolved(english);
        }

        match self.fetcher.fetch_text(spanish_url, timeout).await {
            Ok(html) => match find_english_link(&html) {
                Some(english) => {
                    self.lookups.try_add(spanish_url, english.clone());
                    LinkResolution::Resolved(english)
                }
                None => LinkResolution::NotFound,
            },
            Err(err) if err.is_timeout() => LinkResolution::Timeout(err.to_string()),
            Err(err) => LinkResolution::Failed(err.to_string()),
        }
    }
}

fn apply_row(
    row: &StatusRow,
    resolutions: &HashMap<String, LinkResolution>,
    status_page: &str,
    result: &mut ScraperResult,
) {
    let trail_id = row.trail_id();
    if let TrailIdMatch::Unrecognized(raw) = &trail_id {
        result.add_anomaly(EventType::UnrecognisedTrailId, UNRECOGNISED_TRAIL, raw.as_str());
    }
    let name = trail_id.display_name();

    let mut url = match row.route_link() {
        RouteLink::Missing => {
            result.add_anomaly(EventType::BadRouteLink, name, "No link to route detail");
            status_page.to_string()
        }
        RouteLink::Unsuitable(link) => {
            result.add_anomaly(EventType::BadRouteLink, name, link);
            status_page.to_string()
        }
        RouteLink::Detail(spanish) => match resolutions.get(&spanish) {
            Some(LinkResolution::Resolved(english)) => english.clone(),
            Some(LinkResolution::Timeout(message)) => {
                result.add_anomaly(EventType::Timeout, message.as_str(), spanish);
                status_page.to_string()
            }
            Some(LinkResolution::Failed(message)) => {
                result.add_anomaly(EventType::Exception, message.as_str(), spanish);
                status_page.to_string()
            }
            Some(LinkResolution::NotFound) | None => {
                result.add_anomaly(EventType::BadRouteLink, "English URL not found", spanish);
                status_page.to_string()
            }
        },
    };

    let status = row.status();
    if status == TrailState::Unknown {
        result.add_anomaly(EventType::UnreadableStatus, name, row.status_text.as_str());
    }
    if status.links_to_status_page() {
        url = status_page.to_string();
    }

    if let TrailIdMatch::Recognized(id) = trail_id {
        result.add_trail_status(id, status, url);
    }
}

/// Cron job that keeps the result cache warm with fresh scrapes.
pub async fn maybe_build_scheduler(
    engine: Arc<ScrapeEngine>,
    config: &EngineConfig,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let options = ScrapeOptions {
        use_cache: false,
        ..config.options.clone()
    };
    let cron = config.refresh_cron.as_str();
    let job = Job::new_async(cron, move |_uuid, _l| {
        let engine = engine.clone();
        let options = options.clone();
        Box::pin(async move {
            let result = engine.get_trail_statuses(&options).await;
            if result.is_success() {
                info!(detail = %result.result.detail, "scheduled refresh complete");
            } else {
                warn!(
                    kind = ?result.result.event_type,
                    message = %result.result.message,
                    "scheduled refresh failed"
                );
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}
