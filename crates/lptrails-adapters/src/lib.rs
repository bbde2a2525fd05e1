//! Status-page adapter: trail ID normalisation, status classification and HTML parsing.
//!
//! Everything here is synchronous and free of I/O. `scraper::Html` is not `Send`, so
//! pages are reduced to owned values before the engine awaits anything.

use std::sync::LazyLock;

use lptrails_core::TrailState;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use thiserror::Error;

pub const CRATE_NAME: &str = "lptrails-adapters";

/// Element id of the trail table on the status page.
pub const STATUS_TABLE_ID: &str = "tablepress-14";

pub const UNRECOGNISED_TRAIL: &str = "Unrecognised trail";

pub const OPEN_MARKER: &str = "Abierto / Open / Geöffnet";
pub const CLOSED_MARKER: &str = "Cerrado / Closed / Gesperrt";

// GR 130 Etapa <digit> | GR 131 Etapa <digit>
// <PR|SL> <2 upper case letters> <2 or 3 digits>[.<digit> | .0<digit>]
static TRAIL_ID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(GR 13[01] Etapa \d)|((PR|SL) [A-Z]{2} \d{2,3}(\.0\d|\.\d)?)")
        .expect("trail id pattern is valid")
});

static TWO_DIGIT_DECIMAL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\.\d(\d)$").expect("decimal pattern is valid"));

static COMPLETELY_OPEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^Abierto / Open / Geöffnet(<br />)?\n?$").expect("open pattern is valid")
});

static STATUS_ROWS: LazyLock<Selector> = LazyLock::new(|| {
    Selector::parse(&format!("table#{STATUS_TABLE_ID} tr")).expect("row selector is valid")
});
static HEADER_CELL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("th").expect("header selector is valid"));
static LINK: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("a[href]").expect("link selector is valid"));
static ENGLISH_ALTERNATE: LazyLock<Selector> = LazyLock::new(|| {
    Selector::parse(r#"link[rel="alternate"][hreflang="en-us"]"#).expect("alternate selector is valid")
});

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdapterError {
    #[error("Missing table with id {0}")]
    MissingTable(&'static str),
}

/// Outcome of matching the first cell of a row against the known trail ID grammars.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrailIdMatch {
    Recognized(String),
    /// Carries the trimmed cell text for the anomaly report.
    Unrecognized(String),
}

impl TrailIdMatch {
    /// Name used when reporting anomalies for this row.
    pub fn display_name(&self) -> &str {
        match self {
            TrailIdMatch::Recognized(id) => id,
            TrailIdMatch::Unrecognized(_) => UNRECOGNISED_TRAIL,
        }
    }
}

pub fn match_trail_id(raw: &str) -> TrailIdMatch {
    match TRAIL_ID.find(raw) {
        Some(found) => TrailIdMatch::Recognized(correct_trail_id(found.as_str())),
        None => TrailIdMatch::Unrecognized(raw.trim().to_string()),
    }
}

/// The publisher sometimes writes `PR LP 03.01` for `PR LP 03.1`.
pub fn correct_trail_id(id: &str) -> String {
    TWO_DIGIT_DECIMAL.replace(id, ".$1").into_owned()
}


pub fn is_open(status: &str) -> bool {
    status.contains(OPEN_MARKER)
}

pub fn is_completely_open(status: &str) -> bool {
    COMPLETELY_OPEN.is_match(status)
}

pub fn is_closed(status: &str) -> bool {
    status.contains(CLOSED_MARKER)
}

pub fn classify_status(status: &str) -> TrailState {
    if is_open(status) {
        if is_completely_open(status) {
            TrailState::Open
        } else {
            TrailState::PartOpen
        }
    } else if is_closed(status) {
        TrailState::Closed
    } else {
        TrailState::Unknown
    }
}

/// What the first cell links to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteLink {
    Missing,
    /// PDFs and zipped GPX files are not useful as a detail page.
    Unsuitable(String),
    Detail(String),
}

pub fn classify_route_link(href: Option<&str>) -> RouteLink {
    match href.map(str::trim).filter(|h| !h.is_empty()) {
        None => RouteLink::Missing,
        Some(h) if h.ends_with(".pdf") || h.ends_with(".zip") => RouteLink::Unsuitable(h.to_string()),
        Some(h) => RouteLink::Detail(h.to_string()),
    }
}

/// Raw cell contents of one non-header row of the status table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusRow {
    pub name_text: String,
    pub href: Option<String>,
    pub status_text: String,
}

impl StatusRow {
    pub fn trail_id(&self) -> TrailIdMatch {
        match_trail_id(&self.name_text)
    }

    pub fn route_link(&self) -> RouteLink {
        classify_route_link(self.href.as_deref())
    }

    pub fn status(&self) -> TrailState {
        classify_status(&self.status_text)
    }
}

fn cell_text(cell: Option<&ElementRef<'_>>) -> String {
    cell.map(|c| c.text().collect::<String>()).unwrap_or_default()
}

/// Extracts the trail rows from the status page.
///
/// A missing table, or one holding nothing but headers, is how the site signals a
/// network-wide closure (fire alerts and the like), so it is reported as an error rather
/// than as an empty list.
pub fn parse_status_table(html: &str) -> Result<Vec<StatusRow>, AdapterError> {
    let document = Html::parse_document(html);
    let rows: Vec<StatusRow> = document
        .select(&STATUS_ROWS)
        .filter(|row| row.select(&HEADER_CELL).next().is_none())
        .map(|row| {
            let cells: Vec<ElementRef<'_>> = row
                .children()
                .filter_map(ElementRef::wrap)
                .filter(|el| el.value().name() == "td")
                .collect();
            let first = cells.first();
            StatusRow {
                name_text: cell_text(first),
                href: first
                    .and_then(|c| c.select(&LINK).next())
                    .and_then(|a| a.value().attr("href"))
                    .map(ToString::to_string),
                status_text: cell_text(cells.get(2)),
            }
        })
        .collect();

    if rows.is_empty() {
        return Err(AdapterError::MissingTable(STATUS_TABLE_ID));
    }
    Ok(rows)
}

/// The `hreflang="en-us"` alternate link of a Spanish detail page, if it has one.
pub fn find_english_link(html: &str) -> Option<String> {
    let document = Html::parse_document(html);
    document
        .select(&ENGLISH_ALTERNATE)
        .next()
        .and_then(|link| link.value().attr("href"))
        .map(str::trim)
        .filter(|href| !href.is_empty())
        .map(ToString::to_string)
}
