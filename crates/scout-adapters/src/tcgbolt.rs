use std::sync::Arc;

use async_trait::async_trait;
use scout_core::ScrapedRecord;
use scout_storage::HttpFetcher;
use scraper::Html;
use tracing::info;

use crate::{
    crawl_categories, element_text, first_attr, mentions_any, name_link, parse_price, resolve,
    selector, slug_from_url, AdapterError, Category, ListingPage, ListingSource, SourceSettings,
};

pub(crate) const SLUG: &str = "tcgbolt";
pub(crate) const DISPLAY_NAME: &str = "TCGBolt";
pub(crate) const BASE_URL: &str = "https://tcgbolt.hu";

const CATEGORIES: [Category; 8] = [
    Category { path: "/termekkategoria/pokemon/", label: "Pokemon" },
    Category { path: "/termekkategoria/pokemon/booster-pokemon/", label: "Booster" },
    Category { path: "/termekkategoria/pokemon/booster-display/", label: "Display" },
    Category { path: "/termekkategoria/pokemon/ex-box/", label: "EX Box" },
    Category { path: "/termekkategoria/pokemon/premium-collection/", label: "Premium" },
    Category { path: "/termekkategoria/pokemon/elite-trainer-box/", label: "Elite Trainer Box" },
    Category { path: "/termekkategoria/pokemon/tin/", label: "Tin" },
    Category { path: "/termekkategoria/pokemon/kiegeszitok/", label: "Kiegészítők" },
];

/// WooCommerce shop; page N>1 is `?paged=N`.
pub struct TcgBoltSource {
    settings: SourceSettings,
    http: Arc<HttpFetcher>,
}

impl TcgBoltSource {
    pub fn new(settings: SourceSettings, http: Arc<HttpFetcher>) -> Self {
        Self { settings, http }
    }
}

pub(crate) fn category_page_url(base_url: &str, path: &str, page: usize) -> String {
    let base = base_url.trim_end_matches('/');
    if page <= 1 {
        format!("{base}{path}")
    } else {
        format!("{base}{path}?paged={page}")
    }
}

pub fn parse_category_page(
    body: &str,
    base_url: &str,
    label: &str,
) -> Result<ListingPage, AdapterError> {
    let document = Html::parse_document(body);
    let card_sel = selector("li.product")?;
    let anchor_sel = selector("a")?;
    let price_sel = selector(".price")?;
    let image_sel = selector("img")?;
    let stock_sel = selector(".stock, .availability")?;
    let sold_out_sel = selector(".out-of-stock, .sold-out")?;
    let cart_button_sel = selector("a.button")?;
    let next_sel = selector(".woocommerce-pagination .next")?;

    let mut records = Vec::new();
    for card in document.select(&card_sel) {
        let (Some(name), Some(href)) = name_link(card, &anchor_sel) else {
            continue;
        };
        let Some(url) = resolve(base_url, Some(&href)) else {
            continue;
        };

        let price = parse_price(
            &card
                .select(&price_sel)
                .next()
                .map(element_text)
                .unwrap_or_default(),
        );
        let image = first_attr(card, &image_sel, "data-src")
            .or_else(|| first_attr(card, &image_sel, "data-lazy-src"))
            .or_else(|| first_attr(card, &image_sel, "src"));
        let stock_text = card
            .select(&stock_sel)
            .map(element_text)
            .collect::<Vec<_>>()
            .join(" ");

        let sold_out_class = card
            .value()
            .classes()
            .any(|c| c == "outofstock");
        let in_stock = !(sold_out_class
            || card.select(&sold_out_sel).next().is_some()
            || mentions_any(&stock_text, &["elfogyott", "nincs"]));

        let status_text = if stock_text.is_empty() {
            Some(if in_stock { "Készleten" } else { "Nincs készleten" }.to_string())
        } else {
            Some(stock_text)
        };
        let remote_id = card
            .value()
            .attr("data-product-id")
            .map(ToString::to_string)
            .or_else(|| first_attr(card, &cart_button_sel, "data-product_id"));

        records.push(ScrapedRecord {
            name,
            image_url: resolve(base_url, image.as_deref()),
            category: Some(label.to_string()),
            remote_id,
            slug: slug_from_url(&url),
            price: price.amount,
            currency: price.amount.map(|_| "HUF".to_string()),
            raw_price: price.raw,
            status_text,
            in_stock,
            url,
        });
    }

    let has_next = document.select(&next_sel).next().is_some();
    Ok(ListingPage { records, has_next })
}

#[async_trait]
impl ListingSource for TcgBoltSource {
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
            |body, category, _| parse_category_page(body, &base, category.label),
        )
        .await;
        info!(source = SLUG, items = records.len(), "inventory fetched");
        Ok(records)
    }
}
