use crate::core::error::{AuthorityError, ErrorKind};
use crate::core::types::*;
use crate::AppState;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        Json,
    },
    routing::{get, post},
    Router,
};
use futures::stream::{self, Stream};
use serde::Deserialize;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

pub const ITEM_RESULT_EVENT: &str = "inline/itemResult";

type Rejection = (StatusCode, Json<ErrorResponse>);

/// Builds the authority router: `/inline/*`, the event stream and health.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(health_check))
        .route("/health", get(health_check))
        .route("/inline/start", post(start_handler))
        .route("/inline/next", post(next_handler))
        .route("/inline/reportDetail", post(report_detail_handler))
        .route("/inline/get", post(get_handler))
        .route("/inline/find", post(find_handler))
        .route("/inline/abort", post(abort_handler))
        .route("/inline/events", get(events_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Protocol => StatusCode::BAD_REQUEST,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Conflict => StatusCode::CONFLICT,
        ErrorKind::Storage => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn reject(e: AuthorityError) -> Rejection {
    let kind = e.kind();
    if kind == ErrorKind::Storage {
        warn!("inline rpc: {}", e);
    } else {
        debug!("inline rpc rejected ({}): {}", kind.as_str(), e);
    }
    (
        status_for(kind),
        Json(ErrorResponse {
            error: e.to_string(),
            kind: Some(kind.as_str().to_string()),
        }),
    )
}

async fn health_check(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "inline-collector",
        "version": env!("CARGO_PKG_VERSION"),
        "sessions": state.authority.session_count().await
    }))
}

async fn start_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<StartRequest>,
) -> Result<Json<StartResponse>, Rejection> {
    state.authority.start(request).await.map(Json).map_err(reject)
}

async fn next_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<NextRequest>,
) -> Result<Json<NextResponse>, Rejection> {
    state
        .authority
        .advance(request)
        .await
        .map(|advance| Json(NextResponse::from(advance)))
        .map_err(reject)
}

async fn report_detail_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ReportDetailRequest>,
) -> Result<Json<ReportDetailResponse>, Rejection> {
    state
        .authority
        .report_detail(request)
        .await
        .map(Json)
        .map_err(reject)
}

async fn get_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<GetRequest>,
) -> Result<Json<GetResponse>, Rejection> {
    state
        .authority
        .get_summary(&request.session_id)
        .await
        .map(|session| Json(GetResponse { session }))
        .map_err(reject)
}

async fn find_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<FindRequest>,
) -> Json<FindResponse> {
    let session = state
        .authority
        .find_by_owner(&request.owner_context_id)
        .await;
    Json(FindResponse { session })
}

async fn abort_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<AbortRequest>,
) -> Result<Json<AbortResponse>, Rejection> {
    state.authority.abort(request).await.map(Json).map_err(reject)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EventsQuery {
    #[serde(default)]
    owner_context_id: Option<String>,
}

/// SSE stream of item results, optionally filtered to one owning context.
async fn events_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<EventsQuery>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = state.authority.notifier().subscribe();
    let owner = query.owner_context_id;

    let events = stream::unfold((rx, owner), |(mut rx, owner)| async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if owner
                        .as_deref()
                        .is_some_and(|o| o != event.owner_context_id)
                    {
                        continue;
                    }
                    let sse = Event::default()
                        .event(ITEM_RESULT_EVENT)
                        .json_data(&event)
                        .unwrap_or_else(|_| Event::default().event(ITEM_RESULT_EVENT));
                    return Some((Ok(sse), (rx, owner)));
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!("inline events: subscriber lagged, {} event(s) dropped", skipped);
                }
                Err(RecvError::Closed) => return None,
            }
        }
    });

    Sse::new(events).keep_alive(KeepAlive::default())
}
