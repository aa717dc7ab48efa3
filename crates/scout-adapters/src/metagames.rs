use std::sync::Arc;

use async_trait::async_trait;
use scout_core::ScrapedRecord;
use scout_storage::HttpFetcher;
use scraper::Html;
use tracing::info;

use crate::{
    crawl_pages, element_text, first_attr, first_text, mentions_any, parse_price, resolve,
    selector, slug_from_url, AdapterError, ListingPage, ListingSource, SourceSettings,
};

pub(crate) const SLUG: &str = "metagames";
pub(crate) const DISPLAY_NAME: &str = "Metagames";
pub(crate) const BASE_URL: &str = "https://www.metagames.hu";
const LISTING_ROOT: &str = "https://www.metagames.hu/gyujtogetos-kartyajatekok/pokemon-tcg/termekek";

const OUT_OF_STOCK: [&str; 3] = ["nincs keszleten", "hamarosan", "elfogyott"];

/// Single paged product list; page 0 is the bare listing URL, later pages
/// add `page=N`.
pub struct MetagamesSource {
    settings: SourceSettings,
    http: Arc<HttpFetcher>,
}

impl MetagamesSource {
    pub fn new(settings: SourceSettings, http: Arc<HttpFetcher>) -> Self {
        Self { settings, http }
    }

    fn listing_root(&self) -> &str {
        self.settings.listing_url.as_deref().unwrap_or(LISTING_ROOT)
    }
}

pub(crate) fn page_url(root: &str, page: usize) -> String {
    if page == 0 {
        return root.to_string();
    }
    let separator = if root.contains('?') { '&' } else { '?' };
    format!("{root}{separator}page={page}")
}

fn remote_id(href: &str) -> Option<String> {
    let lower = href.to_ascii_lowercase();
    let start = lower.find("pid")? + 3;
    let digits: String = lower[start..]
        .chars()
        .take_while(char::is_ascii_digit)
        .collect();
    (!digits.is_empty()).then_some(digits)
}

pub fn parse_listing_page(body: &str, base_url: &str) -> Result<ListingPage, AdapterError> {
    let document = Html::parse_document(body);
    let card_sel = selector(".webshop-list-item")?;
    let link_sel = selector(".webshop-list-item-name a")?;
    let image_sel = selector(".product-list-image img")?;
    let any_image_sel = selector("img")?;
    let price_sel = selector("h5")?;
    let status_sel = selector(".badge, .text-success, .text-danger, .label, .product-state")?;
    let restock_sel = selector(r#"button[id^="subscribeItemRestock"]"#)?;
    let pager_sel = selector(".pagination a, .page-link")?;

    let mut records = Vec::new();
    for card in document.select(&card_sel) {
        let Some(link) = card.select(&link_sel).next() else {
            continue;
        };
        let name = element_text(link);
        let Some(href) = link.value().attr("href").map(str::trim).filter(|h| !h.is_empty()) else {
            continue;
        };
        if name.is_empty() {
            continue;
        }
        let Some(url) = resolve(base_url, Some(href)) else {
            continue;
        };

        let image = first_attr(card, &image_sel, "src").or_else(|| first_attr(card, &any_image_sel, "src"));
        let price = parse_price(&first_text(card, &price_sel).unwrap_or_default());
        let status_text = first_text(card, &status_sel);
        let restock_button = card.select(&restock_sel).next().is_some();
        let explicit_out = status_text
            .as_deref()
            .is_some_and(|s| mentions_any(s, &OUT_OF_STOCK));
        let in_stock = !(restock_button || explicit_out);

        let currency = match (&price.raw, price.amount) {
            (Some(raw), _) if raw.contains("Ft") => Some("HUF".to_string()),
            (_, Some(_)) => Some("HUF".to_string()),
            _ => None,
        };

        records.push(ScrapedRecord {
            name,
            url,
            image_url: resolve(base_url, image.as_deref()),
            remote_id: remote_id(href),
            slug: slug_from_url(href),
            category: None,
            price: price.amount,
            currency,
            raw_price: price.raw,
            status_text,
            in_stock,
        });
    }

    let has_next = !records.is_empty()
        && document
            .select(&pager_sel)
            .map(element_text)
            .any(|t| matches!(t.as_str(), ">" | ">>" | "Kovetkezo" | "Következő"));

    Ok(ListingPage { records, has_next })
}

#[async_trait]
impl ListingSource for MetagamesSource {
    fn slug(&self) -> &str {
        &self.settings.slug
    }

    fn display_name(&self) -> &str {
        &self.settings.display_name
    }

    fn base_url(&self) -> &str {
        &self.settings.base_url
    }

    async fn scrape_all(&self) -> Result<Vec<ScrapedRecord>, AdapterError> {
        let root = self.listing_root().to_string();
        let base = self.settings.base_url.clone();
        let records = crawl_pages(
            &self.http,
            &self.settings,
            0,
            |page| page_url(&root, page),
            |body, _| parse_listing_page(body, &base),
        )
        .await?;
        info!(source = SLUG, items = records.len(), "inventory fetched");
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"
        <div class="webshop-list">
          <div class="webshop-list-item">
            <div class="product-list-image"><img src="/img/etb.jpg"></div>
            <div class="webshop-list-item-name">
              <a href="/pokemon-tcg/prismatic-evolutions-etb-pid12345">  Prismatic Evolutions ETB </a>
            </div>
            <h5>29 990 Ft</h5>
            <span class="badge">Készleten</span>
          </div>
          <div class="webshop-list-item">
            <div class="webshop-list-item-name"><a href="/pokemon-tcg/surging-sparks-booster-pid777">Surging Sparks Booster</a></div>
            <h5>1 990 Ft</h5>
            <button id="subscribeItemRestock777">Értesítést kérek</button>
          </div>
          <div class="webshop-list-item">
            <div class="webshop-list-item-name"><a href="/pokemon-tcg/destined-rivals-pid9">Destined Rivals Display</a></div>
            <h5>Hamarosan</h5>
            <span class="label">Hamarosan érkezik</span>
          </div>
          <div class="webshop-list-item">
            <div class="webshop-list-item-name"><a href="">Nameless</a></div>
          </div>
        </div>
        <ul class="pagination"><li><a href="?page=1">&gt;</a></li></ul>
    "#;

    #[test]
    fn parses_cards_prices_and_stock_signals() {
        let page = parse_listing_page(PAGE, BASE_URL).unwrap();
        assert!(page.has_next);
        assert_eq!(page.records.len(), 3);

        let etb = &page.records[0];
        assert_eq!(etb.name, "Prismatic Evolutions ETB");
        assert_eq!(
            etb.url,
            "https://www.metagames.hu/pokemon-tcg/prismatic-evolutions-etb-pid12345"
        );
        assert_eq!(etb.image_url.as_deref(), Some("https://www.metagames.hu/img/etb.jpg"));
        assert_eq!(etb.remote_id.as_deref(), Some("12345"));
        assert_eq!(etb.slug.as_deref(), Some("prismatic-evolutions-etb-pid12345"));
        assert_eq!(etb.price, Some(29_990));
        assert_eq!(etb.currency.as_deref(), Some("HUF"));
        assert!(etb.in_stock);

        let booster = &page.records[1];
        assert!(!booster.in_stock, "restock button means sold out");

        let upcoming = &page.records[2];
        assert_eq!(upcoming.price, None);
        assert_eq!(upcoming.currency, None);
        assert!(!upcoming.in_stock);
    }

    #[test]
    fn empty_page_has_no_next() {
        let page = parse_listing_page(
            r#"<ul class="pagination"><li><a>&gt;</a></li></ul>"#,
            BASE_URL,
        )
        .unwrap();
        assert!(page.records.is_empty());
        assert!(!page.has_next);
    }

    #[test]
    fn page_urls_follow_query_convention() {
        assert_eq!(page_url(LISTING_ROOT, 0), LISTING_ROOT);
        assert_eq!(page_url(LISTING_ROOT, 2), format!("{LISTING_ROOT}?page=2"));
        assert_eq!(page_url("https://x.test/list?sort=new", 1), "https://x.test/list?sort=new&page=1");
    }
}
