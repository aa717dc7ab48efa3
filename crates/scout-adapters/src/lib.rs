//! Listing source contract + HTML listing sources for the tracked retailers.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use scout_core::ScrapedRecord;
use scout_storage::{absolute_url, FetchError, HttpFetcher};
use scraper::{ElementRef, Selector};
use thiserror::Error;
use tracing::{debug, warn};

pub mod metagames;
pub mod tcgbolt;
pub mod varazslatos;

pub use metagames::MetagamesSource;
pub use tcgbolt::TcgBoltSource;
pub use varazslatos::VarazslatosSource;

pub const CRATE_NAME: &str = "scout-adapters";

pub const DEFAULT_PAGE_DELAY: Duration = Duration::from_millis(750);

/// Built-in retailers: slug, display name, base URL.
pub const BUILTIN_SOURCES: [(&str, &str, &str); 3] = [
    (metagames::SLUG, metagames::DISPLAY_NAME, metagames::BASE_URL),
    (
        varazslatos::SLUG,
        varazslatos::DISPLAY_NAME,
        varazslatos::BASE_URL,
    ),
    (tcgbolt::SLUG, tcgbolt::DISPLAY_NAME, tcgbolt::BASE_URL),
];

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("invalid selector {selector}: {message}")]
    Selector { selector: String, message: String },
    #[error("{0}")]
    Message(String),
}

/// A retailer whose whole inventory can be fetched as normalized records.
#[async_trait]
pub trait ListingSource: Send + Sync {
    fn slug(&self) -> &str;
    fn display_name(&self) -> &str;
    fn base_url(&self) -> &str;

    async fn scrape_all(&self) -> Result<Vec<ScrapedRecord>, AdapterError>;
}

/// Per-source knobs coming from configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceSettings {
    pub slug: String,
    pub display_name: String,
    pub base_url: String,
    /// Overrides the source's default listing entry point.
    pub listing_url: Option<String>,
    pub page_limit: usize,
    pub page_delay: Duration,
}

impl SourceSettings {
    pub fn builtin(slug: &str) -> Option<Self> {
        let (slug, display_name, base_url) =
            BUILTIN_SOURCES.iter().find(|(s, _, _)| *s == slug)?;
        Some(Self {
            slug: slug.to_string(),
            display_name: display_name.to_string(),
            base_url: base_url.to_string(),
            listing_url: None,
            page_limit: default_page_limit(slug),
            page_delay: DEFAULT_PAGE_DELAY,
        })
    }
}

fn default_page_limit(slug: &str) -> usize {
    match slug {
        metagames::SLUG => 50,
        varazslatos::SLUG => 20,
        _ => 15,
    }
}

/// Build the listing source for `settings.slug`, or `None` when no parser
/// exists for that retailer.
pub fn source_for_slug(
    settings: SourceSettings,
    http: Arc<HttpFetcher>,
) -> Option<Box<dyn ListingSource>> {
    match settings.slug.as_str() {
        metagames::SLUG => Some(Box::new(MetagamesSource::new(settings, http))),
        varazslatos::SLUG => Some(Box::new(VarazslatosSource::new(settings, http))),
        tcgbolt::SLUG => Some(Box::new(TcgBoltSource::new(settings, http))),
        _ => None,
    }
}

/// One parsed listing page.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListingPage {
    pub records: Vec<ScrapedRecord>,
    pub has_next: bool,
}

/// Follow a paged listing until the parser reports no next page, a page
/// comes back empty, or `page_limit` pages were read.
pub(crate) async fn crawl_pages<U, P>(
    http: &HttpFetcher,
    settings: &SourceSettings,
    first_page: usize,
    page_url: U,
    parse: P,
) -> Result<Vec<ScrapedRecord>, AdapterError>
where
    U: Fn(usize) -> String + Send + Sync,
    P: Fn(&str, usize) -> Result<ListingPage, AdapterError> + Send + Sync,
{
    let mut records = Vec::new();
    let last_page = first_page + settings.page_limit.max(1);
    let mut page = first_page;
    while page < last_page {
        let url = page_url(page);
        let body = http.fetch_text(&settings.slug, &url).await?;
        let parsed = parse(&body, page)?;
        debug!(source = %settings.slug, page, items = parsed.records.len(), "listing page parsed");

        let done = !parsed.has_next || parsed.records.is_empty();
        records.extend(parsed.records);
        if done {
            break;
        }
        page += 1;
        if !settings.page_delay.is_zero() {
            tokio::time::sleep(settings.page_delay).await;
        }
    }
    Ok(records)
}

/// A labelled category entry point of a retailer.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Category {
    pub path: &'static str,
    pub label: &'static str,
}

/// Crawl each category in turn. A failing category is logged and skipped
/// so one broken page does not lose the rest of the inventory.
pub(crate) async fn crawl_categories<U, P>(
    http: &HttpFetcher,
    settings: &SourceSettings,
    categories: &[Category],
    page_url: U,
    parse: P,
) -> Vec<ScrapedRecord>
where
    U: Fn(&Category, usize) -> String + Send + Sync,
    P: Fn(&str, &Category, usize) -> Result<ListingPage, AdapterError> + Send + Sync,
{
    let mut records = Vec::new();
    for category in categories {
        let result = crawl_pages(
            http,
            settings,
            1,
            |page| page_url(category, page),
            |body, page| parse(body, category, page),
        )
        .await;
        match result {
            Ok(items) => records.extend(items),
            Err(err) => warn!(
                source = %settings.slug,
                category = category.path,
                error = %err,
                "category crawl failed; skipping"
            ),
        }
    }
    records
}

pub(crate) fn selector(css: &str) -> Result<Selector, AdapterError> {
    Selector::parse(css).map_err(|e| AdapterError::Selector {
        selector: css.to_string(),
        message: e.to_string(),
    })
}

/// Element text with whitespace runs collapsed.
pub(crate) fn element_text(element: ElementRef<'_>) -> String {
    element
        .text()
        .flat_map(str::split_whitespace)
        .collect::<Vec<_>>()
        .join(" ")
}

pub(crate) fn first_text(scope: ElementRef<'_>, sel: &Selector) -> Option<String> {
    scope
        .select(sel)
        .map(element_text)
        .find(|text| !text.is_empty())
}

pub(crate) fn first_attr(scope: ElementRef<'_>, sel: &Selector, attr: &str) -> Option<String> {
    scope
        .select(sel)
        .next()
        .and_then(|n| n.value().attr(attr))
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
}

/// First anchor with visible text, else the first anchor at all.
pub(crate) fn name_link(scope: ElementRef<'_>, anchors: &Selector) -> (Option<String>, Option<String>) {
    let named = scope
        .select(anchors)
        .find(|a| !element_text(*a).is_empty());
    let href = named
        .or_else(|| scope.select(anchors).next())
        .and_then(|a| a.value().attr("href"))
        .map(ToString::to_string);
    let name = named.map(element_text);
    (name, href)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedPrice {
    pub amount: Option<i64>,
    pub raw: Option<String>,
}

/// Price text to whole currency units by keeping the digits: "12 990 Ft" → 12990.
pub fn parse_price(text: &str) -> ParsedPrice {
    let cleaned = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if cleaned.is_empty() {
        return ParsedPrice {
            amount: None,
            raw: None,
        };
    }
    let digits: String = cleaned.chars().filter(char::is_ascii_digit).collect();
    ParsedPrice {
        amount: digits.parse().ok(),
        raw: Some(cleaned),
    }
}

/// Last non-empty path segment of a URL.
pub fn slug_from_url(url: &str) -> Option<String> {
    let path = reqwest::Url::parse(url)
        .map(|u| u.path().to_string())
        .unwrap_or_else(|_| url.to_string());
    path.split('/')
        .filter(|s| !s.is_empty())
        .last()
        .map(ToString::to_string)
}

pub(crate) fn resolve(base: &str, href: Option<&str>) -> Option<String> {
    href.and_then(|h| absolute_url(base, h))
}

/// Lower-case stock text and also match it with Hungarian accents folded.
pub(crate) fn mentions_any(text: &str, needles: &[&str]) -> bool {
    let lower = text.to_lowercase();
    let folded: String = lower.chars().map(fold_accent).collect();
    needles
        .iter()
        .any(|n| lower.contains(n) || folded.contains(n))
}

fn fold_accent(c: char) -> char {
    match c {
        'á' => 'a',
        'é' => 'e',
        'í' => 'i',
        'ó' | 'ö' | 'ő' => 'o',
        'ú' | 'ü' | 'ű' => 'u',
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn price_text_keeps_only_digits() {
        assert_eq!(
            parse_price(" 12 990\u{a0}Ft "),
            ParsedPrice {
                amount: Some(12_990),
                raw: Some("12 990 Ft".into())
            }
        );
        assert_eq!(parse_price("Ár: érdeklődjön").amount, None);
        assert_eq!(parse_price("Ár: érdeklődjön").raw.as_deref(), Some("Ár: érdeklődjön"));
        assert_eq!(parse_price("   ").raw, None);
    }

    #[test]
    fn slug_is_last_path_segment() {
        assert_eq!(
            slug_from_url("https://tcgbolt.hu/termek/prismatic-etb/").as_deref(),
            Some("prismatic-etb")
        );
        assert_eq!(slug_from_url("https://tcgbolt.hu/"), None);
    }

    #[test]
    fn stock_phrases_match_with_or_without_accents() {
        assert!(mentions_any("Nincs készleten", &["nincs keszleten"]));
        assert!(mentions_any("NINCS KESZLETEN", &["nincs keszleten"]));
        assert!(!mentions_any("Készleten", &["nincs keszleten", "elfogyott"]));
    }

    #[test]
    fn builtin_settings_cover_every_parser() {
        for (slug, _, _) in BUILTIN_SOURCES {
            let settings = SourceSettings::builtin(slug).unwrap();
            assert_eq!(settings.page_delay, DEFAULT_PAGE_DELAY);
            let http = Arc::new(HttpFetcher::new(Default::default()).unwrap());
            let source = source_for_slug(settings, http).unwrap();
            assert_eq!(source.slug(), slug);
        }
        assert!(SourceSettings::builtin("acme").is_none());
    }
}
