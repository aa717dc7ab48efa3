use std::sync::Arc;

use async_trait::async_trait;
use scout_core::ScrapedRecord;
use scout_storage::HttpFetcher;
use scraper::{ElementRef, Html, Selector};
use tracing::info;

use crate::{
    crawl_categories, first_attr, first_text, mentions_any, name_link, parse_price, resolve,
    selector, slug_from_url, AdapterError, Category, ListingPage, ListingSource, SourceSettings,
};

pub(crate) const SLUG: &str = "varazslatosjatekok";
pub(crate) const DISPLAY_NAME: &str = "Varázslatos Játékok";
pub(crate) const BASE_URL: &str = "https://www.varazslatosjatekok.hu";

const CATEGORIES: [Category; 8] = [
    Category { path: "/pokemon-boosterek/", label: "Boosterek" },
    Category { path: "/pokemon-elite-trainer-boxok/", label: "Elite Trainer Boxok" },
    Category { path: "/pokemon-booster-boxok/", label: "Booster Boxok" },
    Category { path: "/pokemon-ajandek-v-boxok/", label: "Ajándék Boxok" },
    Category { path: "/pokemon-kis-ajandekok/", label: "Kis Ajándékok" },
    Category { path: "/pokemon-kellekek/", label: "Kellékek" },
    Category { path: "/pokemon-kartya-boritok/", label: "Kártyavédők" },
    Category { path: "/pokemon-albumok/", label: "Albumok" },
];

/// Shoptet category pages; page N>1 lives at `<category>/oldal-N/`.
pub struct VarazslatosSource {
    settings: SourceSettings,
    http: Arc<HttpFetcher>,
}

impl VarazslatosSource {
    pub fn new(settings: SourceSettings, http: Arc<HttpFetcher>) -> Self {
        Self { settings, http }
    }
}

pub(crate) fn category_page_url(base_url: &str, path: &str, page: usize) -> String {
    let base = base_url.trim_end_matches('/');
    if page <= 1 {
        return format!("{base}{path}");
    }
    let path = path.trim_end_matches('/');
    format!("{base}{path}/oldal-{page}/")
}

struct CardSelectors {
    anchors: Selector,
    prices: [Selector; 3],
    image: Selector,
    availability: Selector,
    disabled: Selector,
    micro_id: Selector,
}

fn in_stock(card: ElementRef<'_>, sel: &CardSelectors) -> bool {
    let classes = card.value().attr("class").unwrap_or_default();
    if classes.contains("inactive") || classes.contains("out-of-stock") {
        return false;
    }
    if card.select(&sel.disabled).next().is_some() {
        return false;
    }
    let stock_text: String = card
        .select(&sel.availability)
        .map(crate::element_text)
        .collect::<Vec<_>>()
        .join(" ");
    !mentions_any(&stock_text, &["nincs keszleten", "elfogyott"])
}

pub fn parse_category_page(
    body: &str,
    base_url: &str,
    label: &str,
    page: usize,
) -> Result<ListingPage, AdapterError> {
    let document = Html::parse_document(body);
    let card_sel = selector(".products .product")?;
    let pager_sel = selector(".paginator a, .pagination a")?;
    let sel = CardSelectors {
        anchors: selector("a")?,
        prices: [
            selector("[data-testid='productCardPrice']")?,
            selector(".price-final strong")?,
            selector(".price")?,
        ],
        image: selector("img")?,
        availability: selector(".p-availability, .availability, .label")?,
        disabled: selector("button[disabled], a.disabled")?,
        micro_id: selector("[data-micro-product-id]")?,
    };

    let mut records = Vec::new();
    for card in document.select(&card_sel) {
        let (Some(name), Some(href)) = name_link(card, &sel.anchors) else {
            continue;
        };
        let Some(url) = resolve(base_url, Some(&href)) else {
            continue;
        };

        let price_text = sel
            .prices
            .iter()
            .find_map(|s| first_text(card, s))
            .unwrap_or_default();
        let price = parse_price(&price_text);
        let image = first_attr(card, &sel.image, "data-src").or_else(|| first_attr(card, &sel.image, "src"));

        records.push(ScrapedRecord {
            name,
            image_url: resolve(base_url, image.as_deref()),
            category: Some(label.to_string()),
            remote_id: first_attr(card, &sel.micro_id, "data-micro-product-id"),
            slug: slug_from_url(&url),
            price: price.amount,
            currency: price.amount.map(|_| "HUF".to_string()),
            raw_price: price.raw,
            status_text: first_text(card, &sel.availability),
            in_stock: in_stock(card, &sel),
            url,
        });
    }

    let next_marker = format!("oldal-{}", page + 1);
    let has_next = document
        .select(&pager_sel)
        .filter_map(|a| a.value().attr("href"))
        .any(|href| href.contains(&next_marker));

    Ok(ListingPage { records, has_next })
}

#[async_trait]
impl ListingSource for VarazslatosSource {
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
        let base = self.settings.base_url.clone();
        let records = crawl_categories(
            &self.http,
            &self.settings,
            &CATEGORIES,
            |category, page| category_page_url(&base, category.path, page),
            |body, category, page| parse_category_page(body, &base, category.label, page),
        )
        .await;
        info!(source = SLUG, items = records.len(), "inventory fetched");
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"
        <div class="products">
          <div class="product">
            <a href="/prismatic-evolutions-booster/"><img data-src="/img/pe.jpg" src="/img/placeholder.gif"></a>
            <a href="/prismatic-evolutions-booster/">Prismatic Evolutions Booster</a>
            <div data-micro-product-id="4411"></div>
            <div class="price-final"><strong>2 490 Ft</strong></div>
            <span class="p-availability">Raktáron</span>
          </div>
          <div class="product out-of-stock">
            <a href="/surging-sparks-etb/">Surging Sparks ETB</a>
            <span data-testid="productCardPrice">24 990 Ft</span>
          </div>
          <div class="product">
            <a href="https://www.varazslatosjatekok.hu/stellar-crown-tin/">Stellar Crown Tin</a>
            <span class="price">6 990 Ft</span>
            <span class="availability">Nincs készleten</span>
          </div>
        </div>
        <div class="paginator"><a href="/pokemon-boosterek/oldal-2/">2</a></div>
    "#;

    #[test]
    fn parses_shoptet_cards() {
        let page = parse_category_page(PAGE, BASE_URL, "Boosterek", 1).unwrap();
        assert!(page.has_next);
        assert_eq!(page.records.len(), 3);

        let booster = &page.records[0];
        assert_eq!(booster.name, "Prismatic Evolutions Booster");
        assert_eq!(
            booster.url,
            "https://www.varazslatosjatekok.hu/prismatic-evolutions-booster/"
        );
        assert_eq!(
            booster.image_url.as_deref(),
            Some("https://www.varazslatosjatekok.hu/img/pe.jpg")
        );
        assert_eq!(booster.remote_id.as_deref(), Some("4411"));
        assert_eq!(booster.slug.as_deref(), Some("prismatic-evolutions-booster"));
        assert_eq!(booster.category.as_deref(), Some("Boosterek"));
        assert_eq!(booster.price, Some(2_490));
        assert_eq!(booster.status_text.as_deref(), Some("Raktáron"));
        assert!(booster.in_stock);

        assert_eq!(page.records[1].price, Some(24_990));
        assert!(!page.records[1].in_stock);
        assert!(!page.records[2].in_stock);
    }

    #[test]
    fn next_page_is_detected_by_page_number() {
        let page = parse_category_page(PAGE, BASE_URL, "Boosterek", 2).unwrap();
        assert!(!page.has_next);
    }

    #[test]
    fn category_urls() {
        assert_eq!(
            category_page_url(BASE_URL, "/pokemon-boosterek/", 1),
            "https://www.varazslatosjatekok.hu/pokemon-boosterek/"
        );
        assert_eq!(
            category_page_url(BASE_URL, "/pokemon-boosterek/", 3),
            "https://www.varazslatosjatekok.hu/pokemon-boosterek/oldal-3/"
        );
    }
}
