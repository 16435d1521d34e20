use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HostError {
    #[error("page script failed: {0}")]
    Script(String),

    #[error("navigation failed: {0}")]
    Navigation(String),

    #[error("page context is gone: {0}")]
    Detached(String),
}

/// A form control inside one of the site's filter containers, as reported by
/// the page. Which controls are worth keeping is decided by the resume bridge.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterControlSnapshot {
    /// Lower-case tag name (`input`, `select`, `textarea`).
    pub tag_name: String,
    /// Lower-case `type` attribute for inputs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checked: Option<bool>,
}

impl FilterControlSnapshot {
    pub fn is_checkable(&self) -> bool {
        self.tag_name == "input"
            && matches!(self.control_type.as_deref(), Some("checkbox") | Some("radio"))
    }

    /// Password and file inputs are never captured, nor are controls that
    /// cannot be found again (no name and no id).
    pub fn is_capturable(&self) -> bool {
        if matches!(self.control_type.as_deref(), Some("password") | Some("file")) {
            return false;
        }
        let named = |v: &Option<String>| v.as_deref().is_some_and(|s| !s.is_empty());
        named(&self.name) || named(&self.id)
    }
}

/// The browsing context a page agent runs in.
///
/// Everything here is scoped to one page load except `context_id` and the
/// `context_*` store, which belong to the tab and survive navigations. The
/// `page_*` store is the page's own session storage (per tab, per origin).
#[async_trait]
pub trait PageHost: Send + Sync {
    /// Stable identity of the tab.
    fn context_id(&self) -> &str;

    async fn current_url(&self) -> Result<String, HostError>;
    async fn referrer(&self) -> Result<Option<String>, HostError>;
    async fn history_length(&self) -> Result<usize, HostError>;
    async fn go_back(&self) -> Result<(), HostError>;
    async fn navigate(&self, url: &str) -> Result<(), HostError>;

    /// Serialized DOM of the current document.
    async fn html(&self) -> Result<String, HostError>;
    /// Number of elements matching a CSS selector group.
    async fn query_count(&self, selector: &str) -> Result<usize, HostError>;
    /// Clicks the `index`-th element matching `card_selector`, or the first
    /// `link_selector` match inside it. `false` when there is no such card.
    async fn click_card(
        &self,
        card_selector: &str,
        link_selector: Option<&str>,
        index: usize,
    ) -> Result<bool, HostError>;

    async fn scroll_top(&self) -> Result<f64, HostError>;
    async fn scroll_to(&self, top: f64) -> Result<(), HostError>;
    /// Every form control inside the given containers.
    async fn filter_controls(
        &self,
        containers: &[String],
    ) -> Result<Vec<FilterControlSnapshot>, HostError>;
    /// Restores values by name or id and fires `input`/`change`. Returns how
    /// many controls were updated.
    async fn apply_filter_controls(
        &self,
        containers: &[String],
        controls: &[FilterControlSnapshot],
    ) -> Result<usize, HostError>;

    async fn page_get(&self, key: &str) -> Result<Option<String>, HostError>;
    async fn page_set(&self, key: &str, value: &str) -> Result<(), HostError>;
    async fn page_remove(&self, key: &str) -> Result<(), HostError>;

    async fn context_get(&self, key: &str) -> Result<Option<String>, HostError>;
    async fn context_set(&self, key: &str, value: &str) -> Result<(), HostError>;
    async fn context_remove(&self, key: &str) -> Result<(), HostError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn control(tag: &str, ty: Option<&str>, name: Option<&str>, id: Option<&str>) -> FilterControlSnapshot {
        FilterControlSnapshot {
            tag_name: tag.into(),
            control_type: ty.map(Into::into),
            name: name.map(Into::into),
            id: id.map(Into::into),
            ..Default::default()
        }
    }

    #[test]
    fn sensitive_and_anonymous_controls_are_not_capturable() {
        assert!(!control("input", Some("password"), Some("pw"), None).is_capturable());
        assert!(!control("input", Some("file"), None, Some("upload")).is_capturable());
        assert!(!control("input", Some("text"), None, None).is_capturable());
        assert!(!control("input", Some("text"), Some(""), None).is_capturable());
        assert!(control("select", None, None, Some("sort")).is_capturable());
        assert!(control("input", Some("checkbox"), Some("tmall"), None).is_checkable());
    }
}
