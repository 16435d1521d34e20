use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Scraped detail fields, kept as an open JSON object so per-site scrapers
/// can add whatever they extract.
pub type DetailFields = Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionStatus {
    PendingList,
    NavigatingDetail,
    Completed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::PendingList => "pending-list",
            SessionStatus::NavigatingDetail => "navigating-detail",
            SessionStatus::Completed => "completed",
        }
    }
}

/// Pre-scrape record for one list card, before its detail page is visited.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemStub {
    #[serde(default)]
    pub index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub currency: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemResult {
    pub index: usize,
    #[serde(flatten)]
    pub detail: DetailFields,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemFailure {
    pub index: usize,
    pub reason: String,
    #[serde(default)]
    pub message: String,
}

/// Failure payload as sent by an agent; the authority adds the index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureReport {
    pub reason: String,
    #[serde(default)]
    pub message: String,
}

impl FailureReport {
    pub fn new(reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            message: message.into(),
        }
    }
}

/// The item currently handed out by `advance` and not yet reported.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Dispatch {
    pub index: usize,
    pub token: String,
    pub issued_at: DateTime<Utc>,
}

/// One batch run over a fixed list of items. Mutated only by the authority.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub owner_context_id: String,
    #[serde(default)]
    pub site: Option<String>,
    pub list_url: String,
    pub total: usize,
    pub items: Vec<ItemStub>,
    pub current_index: i64,
    pub status: SessionStatus,
    #[serde(default)]
    pub results: Vec<ItemResult>,
    #[serde(default)]
    pub failures: Vec<ItemFailure>,
    #[serde(default)]
    pub in_flight: Option<Dispatch>,
    pub started_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

/// Read-only view returned by `get`, `find` and terminal responses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub id: String,
    pub owner_context_id: String,
    pub site: Option<String>,
    pub list_url: String,
    pub total: usize,
    pub current_index: i64,
    pub status: SessionStatus,
    pub results: Vec<ItemResult>,
    pub failures: Vec<ItemFailure>,
    /// Item behind the cursor while a detail fetch is outstanding.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_item: Option<ItemStub>,
    pub started_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

impl SessionSummary {
    pub fn resolved(&self) -> usize {
        self.results.len() + self.failures.len()
    }

    pub fn is_completed(&self) -> bool {
        self.status == SessionStatus::Completed
    }
}

// ---------------------------------------------------------------------------
// RPC payloads (inline/*)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartRequest {
    pub total: usize,
    #[serde(default)]
    pub items: Vec<ItemStub>,
    pub owner_context_id: String,
    pub list_url: String,
    #[serde(default)]
    pub site: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartResponse {
    pub session_id: String,
    pub total: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NextRequest {
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_context_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dispatch_token: Option<String>,
}

/// Outcome of `advance`.
#[derive(Debug, Clone, PartialEq)]
pub enum Advance {
    Dispatched {
        index: usize,
        total: usize,
        item: ItemStub,
        dispatch_token: String,
    },
    Done {
        summary: SessionSummary,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NextResponse {
    pub done: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item: Option<ItemStub>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dispatch_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<SessionSummary>,
}

impl From<Advance> for NextResponse {
    fn from(advance: Advance) -> Self {
        match advance {
            Advance::Dispatched {
                index,
                total,
                item,
                dispatch_token,
            } => NextResponse {
                done: false,
                index: Some(index),
                total: Some(total),
                item: Some(item),
                dispatch_token: Some(dispatch_token),
                summary: None,
            },
            Advance::Done { summary } => NextResponse {
                done: true,
                index: None,
                total: Some(summary.total),
                item: None,
                dispatch_token: None,
                summary: Some(summary),
            },
        }
    }
}

impl NextResponse {
    /// Rebuilds the typed outcome; `None` when a non-terminal response lacks
    /// its index or token.
    pub fn into_advance(self) -> Option<Advance> {
        if self.done {
            return self.summary.map(|summary| Advance::Done { summary });
        }
        let index = self.index?;
        Some(Advance::Dispatched {
            index,
            total: self.total.unwrap_or_default(),
            item: self.item.unwrap_or(ItemStub {
                index,
                ..Default::default()
            }),
            dispatch_token: self.dispatch_token?,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportDetailRequest {
    pub session_id: String,
    pub index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<DetailFields>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureReport>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportAction {
    Return,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportDetailResponse {
    pub done: bool,
    pub action: ReportAction,
    #[serde(default)]
    pub summary: Option<SessionSummary>,
    pub list_url: String,
    /// The index had already been resolved; nothing changed.
    #[serde(default)]
    pub duplicate: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetRequest {
    pub session_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetResponse {
    pub session: SessionSummary,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FindRequest {
    pub owner_context_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FindResponse {
    #[serde(default)]
    pub session: Option<SessionSummary>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AbortRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_context_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AbortResponse {
    pub ok: bool,
    #[serde(default)]
    pub removed: usize,
}

/// Push notification sent to the owning list context after each report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemResultEvent {
    pub session_id: String,
    pub owner_context_id: String,
    pub index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<DetailFields>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureReport>,
    pub done: bool,
    pub total: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<SessionSummary>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(default)]
    pub kind: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn status_uses_kebab_case_on_the_wire() {
        assert_eq!(
            serde_json::to_value(SessionStatus::NavigatingDetail).unwrap(),
            json!("navigating-detail")
        );
        assert_eq!(SessionStatus::PendingList.as_str(), "pending-list");
    }

    #[test]
    fn item_result_flattens_detail_fields() {
        let mut detail = DetailFields::new();
        detail.insert("title".into(), json!("Mug"));
        let value = serde_json::to_value(ItemResult { index: 2, detail }).unwrap();
        assert_eq!(value, json!({"index": 2, "title": "Mug"}));
    }

    #[test]
    fn incomplete_next_response_is_rejected() {
        let response = NextResponse {
            done: false,
            index: Some(1),
            total: Some(3),
            item: None,
            dispatch_token: None,
            summary: None,
        };
        assert!(response.into_advance().is_none());
    }
}
