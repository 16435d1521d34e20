use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;

/// Page role derived from the URL alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PageType {
    List,
    Product,
}

/// How a detail field selector turns matched elements into a JSON value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FieldKind {
    /// Trimmed text of the first match.
    #[default]
    Text,
    /// First match parsed as a number; also fills `currency`.
    Price,
    /// Every match's image source, deduplicated.
    Images,
    /// `key: value` pairs from every match, as an object.
    KeyValues,
    /// Value of `attribute` on the first match.
    Attr,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldSelector {
    pub name: String,
    /// Tried in order; the first selector producing a value wins.
    pub selectors: Vec<String>,
    #[serde(default)]
    pub kind: FieldKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attribute: Option<String>,
}

impl FieldSelector {
    fn new(name: &str, kind: FieldKind, selectors: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            selectors: selectors.iter().map(|s| s.to_string()).collect(),
            kind,
            attribute: None,
        }
    }
}

/// Everything the agent needs to know about one storefront.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SiteDefinition {
    pub id: String,
    #[serde(default)]
    pub label: String,
    /// Regexes matched against the full URL. Product patterns are checked first.
    pub product_patterns: Vec<String>,
    pub list_patterns: Vec<String>,
    /// Selectors for list cards, joined as one selector group.
    #[serde(default)]
    pub card_selectors: Vec<String>,
    /// Anchor inside a card pointing at the detail page.
    #[serde(default)]
    pub link_selector: Option<String>,
    #[serde(default)]
    pub card_title_selectors: Vec<String>,
    #[serde(default)]
    pub card_price_selectors: Vec<String>,
    /// Query parameter carrying the item id in detail links.
    #[serde(default)]
    pub item_id_param: Option<String>,
    /// Canonical detail URL with an `{id}` placeholder.
    #[serde(default)]
    pub item_url_template: Option<String>,
    /// Every selector must match before the detail page counts as rendered.
    #[serde(default)]
    pub ready_selectors: Vec<String>,
    #[serde(default)]
    pub detail_fields: Vec<FieldSelector>,
    /// Containers whose form controls are captured in the resume snapshot.
    #[serde(default)]
    pub filter_containers: Vec<String>,
    #[serde(default = "default_currency")]
    pub default_currency: String,
}

fn default_currency() -> String {
    "CNY".to_string()
}

impl SiteDefinition {
    /// Built-in storefronts, in detection order.
    pub fn builtin() -> Vec<SiteDefinition> {
        vec![temu(), tmall(), taobao(), ali1688()]
    }

    /// Card selectors as a single comma-joined selector group.
    pub fn card_selector_group(&self) -> Option<String> {
        (!self.card_selectors.is_empty()).then(|| self.card_selectors.join(", "))
    }

    /// Builds the canonical detail URL for an item id, if a template is configured.
    pub fn item_url(&self, id: &str) -> Option<String> {
        let template = self.item_url_template.as_deref()?;
        let id = id.trim();
        (!id.is_empty()).then(|| template.replace("{id}", id))
    }
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn tmall() -> SiteDefinition {
    SiteDefinition {
        id: "TMALL".into(),
        label: "Tmall".into(),
        product_patterns: strings(&[r"(?i)^https://detail\.tmall\.com/"]),
        list_patterns: strings(&[r"(?i)^https://.*\.tmall\.com/"]),
        card_selectors: strings(&[
            "#J_ItemList .product",
            "#J_ItemList .item",
            "#J_ItemList .product-item",
            ".product-list .product",
            r#"[class*="product_shelf"] [class*="cardContainer"]"#,
            r#"[class*="productShelf"] [class*="cardContainer"]"#,
            r#"[class*="cardContainer--"]"#,
            r#"[data-spm-anchor-id*="product_shelf"] [class*="cardContainer"]"#,
        ]),
        link_selector: Some(
            r#"a[href*="tmall.com/item.htm"], a[href*="detail.tmall.com"], a[href*="item.htm"]"#
                .into(),
        ),
        card_title_selectors: strings(&[
            ".productTitle, .product-title, .title",
            r#"[class*="title--"]"#,
            r#"[class*="title"]"#,
        ]),
        card_price_selectors: strings(&[
            r#".productPrice, .product-price, .c-price, .s-price, [class*="price--"], [class*="text-price"]"#,
            r#"[class*="price"]"#,
        ]),
        item_id_param: Some("id".into()),
        item_url_template: Some("https://detail.tmall.com/item.htm?id={id}".into()),
        ready_selectors: strings(&[
            r#"#mainPicImageEl[src], [class*="mainPicWrap"] img[src]"#,
            "#J_DetailMeta .tb-detail-hd h1, #J_Title h3",
        ]),
        detail_fields: vec![
            FieldSelector::new(
                "title",
                FieldKind::Text,
                &["#J_DetailMeta .tb-detail-hd h1", "#J_Title h3"],
            ),
            FieldSelector::new("subtitle", FieldKind::Text, &[".tb-detail-hd p"]),
            FieldSelector::new(
                "price",
                FieldKind::Price,
                &["#J_PromoPrice .tm-price", "#J_StrPriceModBox .tm-price"],
            ),
            FieldSelector::new(
                "images",
                FieldKind::Images,
                &[
                    r#"[class*="valueItemImgWrap"] img"#,
                    "#J_TSaleProp li img",
                    "#mainPicImageEl",
                ],
            ),
            FieldSelector::new(
                "attrs",
                FieldKind::KeyValues,
                &["#J_AttrUL li", ".attributes-list li"],
            ),
            FieldSelector::new("shopName", FieldKind::Text, &["#J_ShopInfo .tb-shop-name a"]),
        ],
        filter_containers: strings(&[
            "#J_Nav",
            "#J_Filter",
            "#J_SearchForm",
            ".tm-facet",
            ".tm-nav",
        ]),
        default_currency: default_currency(),
    }
}

fn taobao() -> SiteDefinition {
    SiteDefinition {
        id: "TAOBAO".into(),
        label: "Taobao".into(),
        product_patterns: strings(&[r"(?i)^https://item\.taobao\.com/"]),
        list_patterns: strings(&[r"(?i)^https://.*\.taobao\.com/"]),
        card_selectors: strings(&[
            ".items .item",
            r#"[class*="doubleCardWrapper"]"#,
            r#"[class*="Card--doubleCard"]"#,
        ]),
        link_selector: Some(r#"a[href*="item.taobao.com"], a[href*="item.htm"]"#.into()),
        card_title_selectors: strings(&[".title", r#"[class*="title--"]"#]),
        card_price_selectors: strings(&[".price", r#"[class*="price"]"#]),
        item_id_param: Some("id".into()),
        item_url_template: Some("https://item.taobao.com/item.htm?id={id}".into()),
        ready_selectors: strings(&["#J_Title h3, .tb-main-title, h1"]),
        detail_fields: vec![
            FieldSelector::new(
                "title",
                FieldKind::Text,
                &["#J_Title h3", ".tb-main-title", "h1"],
            ),
            FieldSelector::new(
                "price",
                FieldKind::Price,
                &["#J_PromoPriceNum", "#J_StrPrice .tb-rmb-num", r#"[class*="price"]"#],
            ),
            FieldSelector::new("images", FieldKind::Images, &["#J_UlThumb img"]),
            FieldSelector::new("attrs", FieldKind::KeyValues, &["#attributes li", ".attributes-list li"]),
        ],
        filter_containers: strings(&[".m-sortbar", ".m-filter", "#J_SearchForm"]),
        default_currency: default_currency(),
    }
}

fn ali1688() -> SiteDefinition {
    SiteDefinition {
        id: "ALI1688".into(),
        label: "1688".into(),
        product_patterns: strings(&[r"(?i)^https://detail\.1688\.com/offer/"]),
        list_patterns: strings(&[r"(?i)^https://.*\.1688\.com/(page|offer)"]),
        card_selectors: strings(&[".sm-offer-item", ".offer-list-row .offer-item", ".card-container"]),
        link_selector: Some(r#"a[href*="detail.1688.com"]"#.into()),
        card_title_selectors: strings(&[".title", ".offer-title"]),
        card_price_selectors: strings(&[".price", r#"[class*="price"]"#]),
        item_id_param: None,
        item_url_template: Some("https://detail.1688.com/offer/{id}.html".into()),
        ready_selectors: strings(&[".title-text, .d-title, h1"]),
        detail_fields: vec![
            FieldSelector::new("title", FieldKind::Text, &[".title-text", ".d-title", "h1"]),
            FieldSelector::new("price", FieldKind::Price, &[".price-text", ".price"]),
            FieldSelector::new("images", FieldKind::Images, &[".detail-gallery-img", ".tab-trigger img"]),
            FieldSelector::new("attrs", FieldKind::KeyValues, &[".offer-attr-item"]),
        ],
        filter_containers: strings(&[".sm-filter", ".sort-bar"]),
        default_currency: default_currency(),
    }
}

fn temu() -> SiteDefinition {
    SiteDefinition {
        id: "TEMU".into(),
        label: "Temu".into(),
        product_patterns: strings(&[r"(?i)^https://((www|m)\.)?temu\.com/.*(goods|product)"]),
        list_patterns: strings(&[r"(?i)^https://((www|m)\.)?temu\.com/.*(list|catalog|search)"]),
        card_selectors: strings(&[r#"[data-tooltip-title]"#, r#"[class*="goodsCard"]"#]),
        link_selector: Some(r#"a[href*="goods"], a[href*="product"]"#.into()),
        card_title_selectors: strings(&[r#"[class*="title"]"#]),
        card_price_selectors: strings(&[r#"[class*="price"]"#]),
        item_id_param: Some("goods_id".into()),
        item_url_template: None,
        ready_selectors: strings(&["h1"]),
        detail_fields: vec![
            FieldSelector::new("title", FieldKind::Text, &["h1"]),
            FieldSelector::new("price", FieldKind::Price, &[r#"[class*="price"]"#]),
            FieldSelector::new("images", FieldKind::Images, &[r#"[class*="gallery"] img"#]),
        ],
        filter_containers: Vec::new(),
        default_currency: "USD".into(),
    }
}

// ─── Registry ───────────────────────────────────────────────────────────────

/// Result of matching a URL against the site table.
#[derive(Debug, Clone)]
pub struct Detection {
    pub site: Arc<SiteDefinition>,
    pub page_type: PageType,
}

struct CompiledSite {
    def: Arc<SiteDefinition>,
    product: Vec<Regex>,
    list: Vec<Regex>,
}

fn compile(site_id: &str, patterns: &[String]) -> Vec<Regex> {
    patterns
        .iter()
        .filter_map(|p| match Regex::new(p) {
            Ok(re) => Some(re),
            Err(e) => {
                warn!("site registry: {} pattern {:?} ignored: {}", site_id, p, e);
                None
            }
        })
        .collect()
}

/// Maps URLs to `(site, page type)`. Sites are tried in table order; within a
/// site, product patterns win over list patterns.
pub struct SiteRegistry {
    sites: Vec<CompiledSite>,
}

impl std::fmt::Debug for SiteRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SiteRegistry")
            .field(
                "sites",
                &self.sites.iter().map(|s| s.def.id.as_str()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl Default for SiteRegistry {
    fn default() -> Self {
        Self::new(SiteDefinition::builtin())
    }
}

impl SiteRegistry {
    pub fn new(definitions: Vec<SiteDefinition>) -> Self {
        let sites = definitions
            .into_iter()
            .map(|def| CompiledSite {
                product: compile(&def.id, &def.product_patterns),
                list: compile(&def.id, &def.list_patterns),
                def: Arc::new(def),
            })
            .collect();
        Self { sites }
    }

    pub fn detect(&self, url: &str) -> Option<Detection> {
        self.sites.iter().find_map(|site| {
            let page_type = if site.product.iter().any(|re| re.is_match(url)) {
                PageType::Product
            } else if site.list.iter().any(|re| re.is_match(url)) {
                PageType::List
            } else {
                return None;
            };
            Some(Detection {
                site: site.def.clone(),
                page_type,
            })
        })
    }

    pub fn site(&self, id: &str) -> Option<Arc<SiteDefinition>> {
        self.sites
            .iter()
            .find(|s| s.def.id.eq_ignore_ascii_case(id))
            .map(|s| s.def.clone())
    }

    /// True when `url` is recognised as any page of the site `site_id`.
    pub fn belongs_to(&self, site_id: &str, url: &str) -> bool {
        self.detect(url)
            .map(|d| d.site.id == site_id)
            .unwrap_or(false)
    }
}
