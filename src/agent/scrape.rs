use super::items::{
    absolute_url, detect_currency, element_text, extract_numeric_id, image_source,
    normalize_image_url, parse_price, parse_selector, query_param,
};
use super::roles::{FieldKind, FieldSelector, SiteDefinition};
use crate::core::types::DetailFields;
use scraper::{Html, Selector};
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ScrapeError {
    #[error("no product fields found on {0}")]
    Empty(String),
}

/// Rendered detail page handed to a scraper.
#[derive(Debug, Clone)]
pub struct RenderedPage<'a> {
    pub url: &'a str,
    pub html: &'a str,
}

/// Extracts detail fields from a rendered product page.
pub trait DetailScraper: Send + Sync {
    fn scrape(
        &self,
        site: &SiteDefinition,
        page: &RenderedPage<'_>,
    ) -> Result<DetailFields, ScrapeError>;
}

/// Default scraper: the site's field selectors, with schema.org `Product`
/// JSON-LD filling whatever the selectors miss.
#[derive(Debug, Default, Clone)]
pub struct SelectorScraper;

impl SelectorScraper {
    pub fn new() -> Self {
        Self
    }

    fn field_value(
        &self,
        document: &Html,
        field: &FieldSelector,
        site: &SiteDefinition,
        url: &str,
        out: &mut DetailFields,
    ) -> Option<Value> {
        let selectors: Vec<Selector> = field
            .selectors
            .iter()
            .filter_map(|s| parse_selector(s))
            .collect();

        match field.kind {
            FieldKind::Text => selectors.iter().find_map(|sel| {
                document
                    .select(sel)
                    .map(|el| element_text(&el))
                    .find(|t| !t.is_empty())
                    .map(Value::String)
            }),
            FieldKind::Attr => {
                let attr = field.attribute.as_deref()?;
                selectors.iter().find_map(|sel| {
                    document
                        .select(sel)
                        .filter_map(|el| el.value().attr(attr))
                        .map(str::trim)
                        .find(|v| !v.is_empty())
                        .map(|v| Value::String(v.to_string()))
                })
            }
            FieldKind::Price => {
                let text = selectors.iter().find_map(|sel| {
                    document
                        .select(sel)
                        .map(|el| element_text(&el))
                        .find(|t| parse_price(t).is_some())
                })?;
                if !out.contains_key("currency") {
                    if let Some(code) = detect_currency(&text, Some(&site.default_currency)) {
                        out.insert("currency".into(), Value::String(code));
                    }
                }
                parse_price(&text).and_then(|p| serde_json::Number::from_f64(p).map(Value::Number))
            }
            FieldKind::Images => {
                let mut seen = Vec::<String>::new();
                for sel in &selectors {
                    for el in document.select(sel) {
                        let Some(raw) = image_source(&el) else {
                            continue;
                        };
                        if let Some(img) = normalize_image_url(raw, url, &site.id) {
                            if !seen.contains(&img) {
                                seen.push(img);
                            }
                        }
                    }
                }
                (!seen.is_empty()).then(|| Value::Array(seen.into_iter().map(Value::String).collect()))
            }
            FieldKind::KeyValues => {
                let mut pairs = Map::new();
                for sel in &selectors {
                    for el in document.select(sel) {
                        let text = element_text(&el);
                        let Some((key, value)) = text.split_once(|c| c == ':' || c == '：') else {
                            continue;
                        };
                        let (key, value) = (key.trim(), value.trim());
                        if !key.is_empty() && !pairs.contains_key(key) {
                            pairs.insert(key.to_string(), Value::String(value.to_string()));
                        }
                    }
                }
                (!pairs.is_empty()).then_some(Value::Object(pairs))
            }
        }
    }

    /// First schema.org `Product` object found in the page's JSON-LD blocks.
    fn json_ld_product(&self, document: &Html) -> Option<Map<String, Value>> {
        let selector = Selector::parse("script[type='application/ld+json']").ok()?;
        document.select(&selector).find_map(|script| {
            let text = script.inner_html();
            let value: Value = serde_json::from_str(text.trim()).ok()?;
            find_product(&value)
        })
    }
}

fn find_product(value: &Value) -> Option<Map<String, Value>> {
    match value {
        Value::Array(items) => items.iter().find_map(find_product),
        Value::Object(map) => {
            if map.get("@type").and_then(Value::as_str) == Some("Product") {
                return Some(map.clone());
            }
            map.get("@graph").and_then(find_product)
        }
        _ => None,
    }
}

fn json_ld_price(offers: Option<&Value>) -> Option<(f64, Option<String>)> {
    let offer = match offers? {
        Value::Array(list) => list.first()?,
        other => other,
    };
    let price = match offer.get("price").or_else(|| offer.get("lowPrice"))? {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => parse_price(s)?,
        _ => return None,
    };
    let currency = offer
        .get("priceCurrency")
        .and_then(Value::as_str)
        .map(str::to_string);
    Some((price, currency))
}

impl DetailScraper for SelectorScraper {
    fn scrape(
        &self,
        site: &SiteDefinition,
        page: &RenderedPage<'_>,
    ) -> Result<DetailFields, ScrapeError> {
        let document = Html::parse_document(page.html);
        let mut out = DetailFields::new();

        for field in &site.detail_fields {
            if let Some(value) = self.field_value(&document, field, site, page.url, &mut out) {
                out.insert(field.name.clone(), value);
            }
        }

        if let Some(product) = self.json_ld_product(&document) {
            if !out.contains_key("title") {
                if let Some(name) = product.get("name").and_then(Value::as_str) {
                    out.insert("title".into(), Value::String(name.trim().to_string()));
                }
            }
            if !out.contains_key("price") {
                if let Some((price, currency)) = json_ld_price(product.get("offers")) {
                    if let Some(n) = serde_json::Number::from_f64(price) {
                        out.insert("price".into(), Value::Number(n));
                    }
                    if let Some(currency) = currency {
                        out.insert("currency".into(), Value::String(currency));
                    }
                }
            }
            if !out.contains_key("images") {
                let images: Vec<Value> = match product.get("image") {
                    Some(Value::String(s)) => vec![s.clone()],
                    Some(Value::Array(list)) => list
                        .iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect(),
                    _ => Vec::new(),
                }
                .into_iter()
                .filter_map(|raw| absolute_url(&raw, page.url))
                .map(Value::String)
                .collect();
                if !images.is_empty() {
                    out.insert("images".into(), Value::Array(images));
                }
            }
        }

        if !out.contains_key("title") && !out.contains_key("price") {
            return Err(ScrapeError::Empty(page.url.to_string()));
        }

        let item_id = site
            .item_id_param
            .as_deref()
            .and_then(|p| query_param(page.url, p))
            .or_else(|| extract_numeric_id(page.url));
        if let Some(id) = item_id {
            out.insert("itemId".into(), Value::String(id));
        }
        out.insert("sourceUrl".into(), Value::String(page.url.to_string()));
        out.insert("site".into(), Value::String(site.id.clone()));
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::roles::SiteRegistry;
    use serde_json::json;

    fn tmall() -> std::sync::Arc<SiteDefinition> {
        SiteRegistry::default().site("TMALL").unwrap()
    }

    #[test]
    fn tmall_detail_fields_are_extracted() {
        let html = r#"
            <div id="J_DetailMeta"><div class="tb-detail-hd"><h1> Blue  Mug </h1><p>350ml</p></div></div>
            <div id="J_PromoPrice"><span class="tm-price">¥39.90</span></div>
            <ul id="J_TSaleProp"><li><img src="//img.alicdn.com/s1.jpg_60x60q90.jpg"></li>
                                 <li><img src="//img.alicdn.com/s1.jpg_60x60q90.jpg"></li></ul>
            <ul id="J_AttrUL"><li>材质: 陶瓷</li><li>容量：350ml</li><li>no separator</li></ul>"#;
        let url = "https://detail.tmall.com/item.htm?id=600000001";
        let detail = SelectorScraper::new()
            .scrape(&tmall(), &RenderedPage { url, html })
            .unwrap();

        assert_eq!(detail["title"], json!("Blue Mug"));
        assert_eq!(detail["subtitle"], json!("350ml"));
        assert_eq!(detail["price"], json!(39.9));
        assert_eq!(detail["currency"], json!("CNY"));
        assert_eq!(detail["images"], json!(["https://img.alicdn.com/s1.jpg"]));
        assert_eq!(detail["attrs"], json!({"材质": "陶瓷", "容量": "350ml"}));
        assert_eq!(detail["itemId"], json!("600000001"));
        assert_eq!(detail["sourceUrl"], json!(url));
    }

    #[test]
    fn json_ld_fills_missing_fields() {
        let html = r#"<script type="application/ld+json">
            {"@graph": [{"@type": "Product", "name": "Teapot",
                         "offers": {"price": "88.00", "priceCurrency": "CNY"},
                         "image": "https://img.alicdn.com/teapot.jpg"}]}
            </script>"#;
        let detail = SelectorScraper::new()
            .scrape(
                &tmall(),
                &RenderedPage {
                    url: "https://detail.tmall.com/item.htm?id=700000001",
                    html,
                },
            )
            .unwrap();
        assert_eq!(detail["title"], json!("Teapot"));
        assert_eq!(detail["price"], json!(88.0));
        assert_eq!(detail["images"], json!(["https://img.alicdn.com/teapot.jpg"]));
    }

    #[test]
    fn blank_page_is_an_error() {
        let err = SelectorScraper::new()
            .scrape(
                &tmall(),
                &RenderedPage {
                    url: "https://detail.tmall.com/item.htm?id=1",
                    html: "<html><body></body></html>",
                },
            )
            .unwrap_err();
        assert!(matches!(err, ScrapeError::Empty(_)));
    }
}
