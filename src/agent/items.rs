//! List-page pre-scrape: turns item cards into `ItemStub`s before the
//! session starts, plus the small text helpers shared with detail scraping.

use super::roles::SiteDefinition;
use crate::core::types::ItemStub;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use std::sync::OnceLock;
use tracing::{debug, warn};
use url::Url;

/// Lazy-loading attributes checked before `src`, in order.
pub const IMAGE_ATTRS: &[&str] = &["data-src", "data-lazy-load", "data-original", "src"];

/// Parses the first number out of a price label (`¥1,299.00` → `1299.0`).
pub fn parse_price(text: &str) -> Option<f64> {
    let numeric: String = text
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    if numeric.is_empty() {
        return None;
    }
    numeric.parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Currency code from the symbol in a price label, else `fallback`.
pub fn detect_currency(text: &str, fallback: Option<&str>) -> Option<String> {
    let code = if text.contains('¥') || text.contains('￥') {
        Some("CNY")
    } else if text.contains("NT$") {
        Some("TWD")
    } else if text.contains("HK$") {
        Some("HKD")
    } else if text.contains('$') {
        Some("USD")
    } else {
        fallback
    };
    code.map(str::to_string)
}

fn numeric_id_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"([0-9]{6,})").expect("valid numeric id pattern"))
}

/// First run of six or more digits, the shape of every storefront item id.
pub fn extract_numeric_id(text: &str) -> Option<String> {
    numeric_id_re()
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

pub fn query_param(url: &str, name: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    parsed
        .query_pairs()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Item id of a detail URL: the site's id parameter, else the first long
/// digit run in the path (`/offer/623456789.html`).
pub fn item_id_from_url(url: &str, site: &SiteDefinition) -> Option<String> {
    if let Some(id) = site
        .item_id_param
        .as_deref()
        .and_then(|param| query_param(url, param))
    {
        return Some(id);
    }
    let parsed = Url::parse(url).ok()?;
    extract_numeric_id(parsed.path())
}

/// Resolves `href` against `base`, accepting protocol-relative links.
pub fn absolute_url(href: &str, base: &str) -> Option<String> {
    let href = href.trim();
    if href.is_empty() || href.starts_with("javascript:") || href.starts_with("data:") {
        return None;
    }
    match Url::parse(base) {
        Ok(base) => base.join(href).ok().map(|u| u.to_string()),
        Err(_) => Url::parse(href).ok().map(|u| u.to_string()),
    }
}

fn thumb_suffix_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)_(\d+x\d+q\d+|\d+x\d+|sum)\.(jpg|png|jpeg|webp)$")
            .expect("valid thumbnail pattern")
    })
}

/// CDN variants appended after the real extension (`a.jpg_360x360q90.jpg`, `a.jpg_!!0-item_pic`).
fn alicdn_tail_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\.(jpg|jpeg|png|webp)_[^/]*$").expect("valid alicdn pattern")
    })
}

/// Absolute image URL with storefront thumbnail suffixes stripped.
pub fn normalize_image_url(raw: &str, base: &str, site_id: &str) -> Option<String> {
    let url = absolute_url(raw, base)?;
    let url = match site_id {
        "TMALL" | "TAOBAO" => {
            let url = alicdn_tail_re().replace(&url, ".$1").into_owned();
            thumb_suffix_re().replace(&url, ".$2").into_owned()
        }
        "ALI1688" => thumb_suffix_re().replace(&url, ".$2").into_owned(),
        _ => url,
    };
    Some(url)
}

pub fn element_text(el: &ElementRef<'_>) -> String {
    el.text()
        .collect::<Vec<_>>()
        .join(" ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn image_source<'a>(el: &ElementRef<'a>) -> Option<&'a str> {
    IMAGE_ATTRS
        .iter()
        .filter_map(|attr| el.value().attr(attr))
        .map(str::trim)
        .find(|v| !v.is_empty())
}

pub fn parse_selector(selector: &str) -> Option<Selector> {
    match Selector::parse(selector) {
        Ok(s) => Some(s),
        Err(e) => {
            warn!("items: invalid selector {:?}: {:?}", selector, e);
            None
        }
    }
}

fn first_text(card: &ElementRef<'_>, selectors: &[String]) -> Option<String> {
    selectors.iter().find_map(|s| {
        let sel = parse_selector(s)?;
        card.select(&sel)
            .map(|el| element_text(&el))
            .find(|t| !t.is_empty())
    })
}

fn card_image(card: &ElementRef<'_>) -> Option<String> {
    // Same priority as the attribute list: any lazy attribute beats a bare src.
    for attr in IMAGE_ATTRS {
        let Some(sel) = parse_selector(&format!("img[{}]", attr)) else {
            continue;
        };
        if let Some(v) = card
            .select(&sel)
            .filter_map(|img| img.value().attr(attr))
            .map(str::trim)
            .find(|v| !v.is_empty())
        {
            return Some(v.to_string());
        }
    }
    None
}

fn card_stub(card: &ElementRef<'_>, index: usize, page_url: &str, site: &SiteDefinition) -> ItemStub {
    let anchor = site
        .link_selector
        .as_deref()
        .and_then(parse_selector)
        .and_then(|sel| card.select(&sel).next())
        .or_else(|| {
            // The card itself may be the link.
            (card.value().name() == "a").then_some(*card)
        });
    let href = anchor.and_then(|a| a.value().attr("href"));

    let item_id = href
        .and_then(|h| {
            let abs = absolute_url(h, page_url)?;
            site.item_id_param
                .as_deref()
                .and_then(|p| query_param(&abs, p))
        })
        .or_else(|| {
            anchor
                .and_then(|a| a.value().attr("data-itemid"))
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
        })
        .or_else(|| href.and_then(extract_numeric_id));

    let source_url = item_id
        .as_deref()
        .and_then(|id| site.item_url(id))
        .or_else(|| href.and_then(|h| absolute_url(h, page_url)));

    let title = first_text(card, &site.card_title_selectors)
        .or_else(|| {
            anchor
                .and_then(|a| a.value().attr("title"))
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
        })
        .or_else(|| anchor.map(|a| element_text(&a)).filter(|t| !t.is_empty()));

    let price_text = first_text(card, &site.card_price_selectors).unwrap_or_default();

    ItemStub {
        index,
        image: card_image(card).and_then(|raw| normalize_image_url(&raw, page_url, &site.id)),
        price: parse_price(&price_text),
        currency: if source_url.is_some() {
            detect_currency(&price_text, Some(&site.default_currency))
        } else {
            None
        },
        source_url,
        title,
    }
}

/// One stub per card, in document order, aligned with the card index the
/// agent later clicks. Cards without a detail link still get a stub.
pub fn collect_list_items(html: &str, page_url: &str, site: &SiteDefinition) -> Vec<ItemStub> {
    let Some(group) = site.card_selector_group() else {
        return Vec::new();
    };
    let Some(selector) = parse_selector(&group) else {
        return Vec::new();
    };
    let document = Html::parse_document(html);
    let items: Vec<ItemStub> = document
        .select(&selector)
        .enumerate()
        .map(|(index, card)| card_stub(&card, index, page_url, site))
        .collect();
    debug!(
        "items: {} card(s) on {} ({} with a detail url)",
        items.len(),
        page_url,
        items.iter().filter(|i| i.source_url.is_some()).count()
    );
    items
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::roles::SiteRegistry;

    #[test]
    fn price_labels_parse() {
        assert_eq!(parse_price("¥1,299.00"), Some(1299.0));
        assert_eq!(parse_price(" 12.5 起"), Some(12.5));
        assert_eq!(parse_price("面议"), None);
        assert_eq!(parse_price("1.2.3"), None);
    }

    #[test]
    fn currency_symbols_are_recognised() {
        assert_eq!(detect_currency("￥88", None).as_deref(), Some("CNY"));
        assert_eq!(detect_currency("NT$300", None).as_deref(), Some("TWD"));
        assert_eq!(detect_currency("HK$120", None).as_deref(), Some("HKD"));
        assert_eq!(detect_currency("$9.99", None).as_deref(), Some("USD"));
        assert_eq!(detect_currency("88", Some("CNY")).as_deref(), Some("CNY"));
        assert_eq!(detect_currency("88", None), None);
    }

    #[test]
    fn numeric_ids_need_six_digits() {
        assert_eq!(
            extract_numeric_id("https://detail.1688.com/offer/6543210987.html").as_deref(),
            Some("6543210987")
        );
        assert_eq!(extract_numeric_id("/item/12345"), None);
    }

    #[test]
    fn item_ids_come_from_the_id_param_or_the_path() {
        let registry = SiteRegistry::default();
        let tmall = registry.site("TMALL").unwrap();
        assert_eq!(
            item_id_from_url(
                "https://detail.tmall.com/item.htm?spm=a1z10.1234567&id=600000001",
                &tmall
            )
            .as_deref(),
            Some("600000001")
        );
        let ali = registry.site("ALI1688").unwrap();
        assert_eq!(
            item_id_from_url("https://detail.1688.com/offer/6543210987.html?spm=1234567", &ali)
                .as_deref(),
            Some("6543210987")
        );
        assert_eq!(item_id_from_url("not a url", &ali), None);
    }

    #[test]
    fn thumbnails_are_normalised() {
        assert_eq!(
            normalize_image_url(
                "//img.alicdn.com/bao/uploaded/i1/abc.jpg_360x360q90.jpg",
                "https://list.tmall.com/",
                "TMALL"
            )
            .as_deref(),
            Some("https://img.alicdn.com/bao/uploaded/i1/abc.jpg")
        );
        assert_eq!(
            normalize_image_url("/img/p_400x400.png", "https://detail.1688.com/", "ALI1688")
                .as_deref(),
            Some("https://detail.1688.com/img/p.png")
        );
    }

    #[test]
    fn tmall_cards_become_stubs() {
        let html = r#"
            <div id="J_ItemList">
              <div class="product">
                <a href="//detail.tmall.com/item.htm?id=600000001&spm=a" title="Blue Mug">x</a>
                <img data-src="//img.alicdn.com/a_200x200.jpg" src="//img.alicdn.com/placeholder.gif">
                <p class="productPrice">¥39.90</p>
              </div>
              <div class="product">
                <a href="https://detail.tmall.com/item.htm?spm=b" data-itemid="600000002">
                  <span class="productTitle">Red   Mug</span>
                </a>
              </div>
              <div class="product"><span class="title">No link</span></div>
            </div>"#;
        let registry = SiteRegistry::default();
        let site = registry.site("TMALL").unwrap();
        let items = collect_list_items(html, "https://list.tmall.com/search_product.htm", &site);

        assert_eq!(items.len(), 3);
        assert_eq!(
            items[0].source_url.as_deref(),
            Some("https://detail.tmall.com/item.htm?id=600000001")
        );
        assert_eq!(items[0].title.as_deref(), Some("Blue Mug"));
        assert_eq!(items[0].image.as_deref(), Some("https://img.alicdn.com/a.jpg"));
        assert_eq!(items[0].price, Some(39.9));
        assert_eq!(items[0].currency.as_deref(), Some("CNY"));

        assert_eq!(
            items[1].source_url.as_deref(),
            Some("https://detail.tmall.com/item.htm?id=600000002")
        );
        assert_eq!(items[1].title.as_deref(), Some("Red Mug"));

        assert_eq!(items[2].index, 2);
        assert!(items[2].source_url.is_none());
        assert_eq!(items[2].title.as_deref(), Some("No link"));
    }
}
