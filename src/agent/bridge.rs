//! Page-local state that survives the trip to a detail page and back.
//!
//! The resume snapshot lives in the list page's session storage and is
//! written immediately before navigating away. The next list-page load
//! consumes it (it is deleted whether or not it applies) before asking the
//! authority anything. The context record lives in the tab-scoped store and
//! caches the session id and list URL for pages that cannot see the list
//! page's storage.

use super::host::{FilterControlSnapshot, HostError, PageHost};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use url::Url;

pub const LIST_STATE_KEY: &str = "inline.listState";
pub const CONTEXT_KEY: &str = "inline.context";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeSnapshot {
    pub session_id: String,
    pub list_url: String,
    #[serde(default)]
    pub scroll_top: f64,
    #[serde(default)]
    pub filters: Vec<FilterControlSnapshot>,
    #[serde(default)]
    pub awaiting_resume: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dispatch_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<usize>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextRecord {
    pub session_id: String,
    pub list_url: String,
    /// Index this tab is working on; `-1` between items.
    pub active_index: i64,
    pub total: usize,
}

/// Origin + path equality; query and fragment are ignored.
pub fn same_list_url(a: &str, b: &str) -> bool {
    match (Url::parse(a), Url::parse(b)) {
        (Ok(a), Ok(b)) => {
            a.origin() == b.origin()
                && a.path().trim_end_matches('/') == b.path().trim_end_matches('/')
        }
        _ => false,
    }
}

pub struct ResumeBridge<'a> {
    host: &'a dyn PageHost,
}

impl<'a> ResumeBridge<'a> {
    pub fn new(host: &'a dyn PageHost) -> Self {
        Self { host }
    }

    /// Captures scroll offset and filter controls for the current list page.
    pub async fn capture(
        &self,
        session_id: &str,
        list_url: &str,
        filter_containers: &[String],
    ) -> ResumeSnapshot {
        let scroll_top = self.host.scroll_top().await.unwrap_or_else(|e| {
            debug!("resume bridge: scroll offset unavailable: {}", e);
            0.0
        });
        let filters = if filter_containers.is_empty() {
            Vec::new()
        } else {
            match self.host.filter_controls(filter_containers).await {
                Ok(controls) => controls.into_iter().filter(|c| c.is_capturable()).collect(),
                Err(e) => {
                    debug!("resume bridge: filter controls unavailable: {}", e);
                    Vec::new()
                }
            }
        };
        ResumeSnapshot {
            session_id: session_id.to_string(),
            list_url: list_url.to_string(),
            scroll_top,
            filters,
            awaiting_resume: false,
            dispatch_token: None,
            index: None,
            timestamp: Utc::now(),
        }
    }

    pub async fn save(&self, snapshot: &ResumeSnapshot) -> Result<(), HostError> {
        let raw = serde_json::to_string(snapshot).map_err(|e| HostError::Script(e.to_string()))?;
        self.host.page_set(LIST_STATE_KEY, &raw).await
    }

    /// Reads the snapshot without consuming it.
    pub async fn peek(&self) -> Option<ResumeSnapshot> {
        let raw = self.host.page_get(LIST_STATE_KEY).await.ok().flatten()?;
        serde_json::from_str(&raw).ok()
    }

    /// Reads and deletes the snapshot. A malformed snapshot is deleted too.
    pub async fn take(&self) -> Result<Option<ResumeSnapshot>, HostError> {
        let raw = self.host.page_get(LIST_STATE_KEY).await?;
        if raw.is_none() {
            return Ok(None);
        }
        self.host.page_remove(LIST_STATE_KEY).await?;
        Ok(raw.and_then(|r| match serde_json::from_str(&r) {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                warn!("resume bridge: discarding malformed snapshot: {}", e);
                None
            }
        }))
    }

    /// Consumes the snapshot and returns it only if it was taken on the page
    /// at `current_url`.
    pub async fn take_matching(
        &self,
        current_url: &str,
    ) -> Result<Option<ResumeSnapshot>, HostError> {
        let Some(snapshot) = self.take().await? else {
            return Ok(None);
        };
        if same_list_url(&snapshot.list_url, current_url) {
            Ok(Some(snapshot))
        } else {
            debug!(
                "resume bridge: snapshot for {} does not match {}, discarded",
                snapshot.list_url, current_url
            );
            Ok(None)
        }
    }

    /// Restores filters first (they may re-render the list), then scroll.
    pub async fn apply(&self, snapshot: &ResumeSnapshot, filter_containers: &[String]) {
        if !snapshot.filters.is_empty() && !filter_containers.is_empty() {
            match self
                .host
                .apply_filter_controls(filter_containers, &snapshot.filters)
                .await
            {
                Ok(n) => debug!("resume bridge: restored {} filter control(s)", n),
                Err(e) => warn!("resume bridge: could not restore filters: {}", e),
            }
        }
        if snapshot.scroll_top > 0.0 {
            if let Err(e) = self.host.scroll_to(snapshot.scroll_top).await {
                warn!("resume bridge: could not restore scroll: {}", e);
            }
        }
    }

    pub async fn clear(&self) -> Result<(), HostError> {
        self.host.page_remove(LIST_STATE_KEY).await
    }

    pub async fn load_context(&self) -> Option<ContextRecord> {
        let raw = self.host.context_get(CONTEXT_KEY).await.ok().flatten()?;
        serde_json::from_str(&raw).ok()
    }

    pub async fn save_context(&self, record: &ContextRecord) -> Result<(), HostError> {
        let raw = serde_json::to_string(record).map_err(|e| HostError::Script(e.to_string()))?;
        self.host.context_set(CONTEXT_KEY, &raw).await
    }

    pub async fn clear_context(&self) -> Result<(), HostError> {
        self.host.context_remove(CONTEXT_KEY).await
    }
}
