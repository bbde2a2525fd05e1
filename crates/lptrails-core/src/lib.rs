//! Core domain model for the La Palma trail status scraper.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "lptrails-core";

/// Open/closed state of a single trail as published on the status page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrailState {
    Open,
    #[serde(rename = "Part open")]
    PartOpen,
    Closed,
    Unknown,
}

impl TrailState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrailState::Open => "Open",
            TrailState::PartOpen => "Part open",
            TrailState::Closed => "Closed",
            TrailState::Unknown => "Unknown",
        }
    }

    /// Ambiguous states send the reader to the status page instead of a detail page.
    pub fn links_to_status_page(&self) -> bool {
        matches!(self, TrailState::PartOpen | TrailState::Unknown)
    }
}

impl std::fmt::Display for TrailState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One recognised trail with its state and the best English link available.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrailStatus {
    pub name: String,
    pub status: TrailState,
    pub url: String,
}

impl TrailStatus {
    pub fn new(name: impl Into<String>, status: TrailState, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status,
            url: url.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    Success,

    // whole-scrape failures
    Exception,
    Timeout,
    DataError,

    // row-level anomalies
    BadRouteLink,
    UnrecognisedTrailId,
    UnreadableStatus,
}

/// Either the overall outcome of a scrape or a single anomaly found while scraping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScraperEvent {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub message: String,
    pub detail: String,
}

impl Default for ScraperEvent {
    fn default() -> Self {
        Self {
            event_type: EventType::Success,
            message: String::new(),
            detail: String::new(),
        }
    }
}

impl ScraperEvent {
    pub fn new(event_type: EventType, message: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            event_type,
            message: message.into(),
            detail: detail.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.event_type == EventType::Success
    }
}

/// Aggregate of a single scrape attempt.
///
/// `result` carries the overall outcome; `anomalies` may be non-empty even when the
/// outcome is a success since they only describe individual rows.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScraperResult {
    pub last_scraped: Option<DateTime<Utc>>,
    pub result: ScraperEvent,
    pub trails: Vec<TrailStatus>,
    pub anomalies: Vec<ScraperEvent>,
}

impl ScraperResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_success(&self) -> bool {
        self.result.is_success()
    }

    /// Marks the scrape as complete and stamps `last_scraped`.
    pub fn success(&mut self, message: impl Into<String>, detail: impl Into<String>, at: DateTime<Utc>) {
        self.result = ScraperEvent::new(EventType::Success, message, detail);
        self.last_scraped = Some(at);
    }

    pub fn exception(&mut self, message: impl Into<String>, detail: impl Into<String>) {
        self.result = ScraperEvent::new(EventType::Exception, message, detail);
    }

    pub fn timeout(&mut self, message: impl Into<String>, detail: impl Into<String>) {
        self.result = ScraperEvent::new(EventType::Timeout, message, detail);
    }

    pub fn data_error(&mut self, message: impl Into<String>, detail: impl Into<String>) {
        self.result = ScraperEvent::new(EventType::DataError, message, detail);
    }

    pub fn add_anomaly(&mut self, event_type: EventType, message: impl Into<String>, detail: impl Into<String>) {
        self.anomalies.push(ScraperEvent::new(event_type, message, detail));
    }

    pub fn add_trail_status(&mut self, name: impl Into<String>, status: TrailState, url: impl Into<String>) {
        self.trails.push(TrailStatus::new(name, status, url));
    }
}
