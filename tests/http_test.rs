/// The `/inline/*` surface served over real HTTP and driven through
/// `HttpAuthorityClient`.
use inline_collector::authority::{MemoryStore, SessionAuthority};
use inline_collector::core::config::RpcSettings;
use inline_collector::rpc::{self, AuthorityClient, ClientError, HttpAuthorityClient};
use inline_collector::types::*;
use inline_collector::{AppState, ErrorKind};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

async fn serve() -> (String, Arc<SessionAuthority>) {
    let authority = Arc::new(
        SessionAuthority::open(Arc::new(MemoryStore::new()), None)
            .await
            .unwrap(),
    );
    let app = rpc::router(Arc::new(AppState::new(authority.clone())));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{}", addr), authority)
}

fn client(base: &str) -> HttpAuthorityClient {
    HttpAuthorityClient::new(base, RpcSettings::default()).unwrap()
}

fn start_request(owner: &str, total: usize) -> StartRequest {
    StartRequest {
        total,
        items: (0..total)
            .map(|index| ItemStub {
                index,
                source_url: Some(format!("https://detail.tmall.com/item.htm?id={}", 600000000 + index)),
                ..Default::default()
            })
            .collect(),
        owner_context_id: owner.into(),
        list_url: "https://list.tmall.com/search_product.htm?q=mug".into(),
        site: Some("TMALL".into()),
    }
}

fn detail(title: &str) -> DetailFields {
    json!({ "title": title }).as_object().cloned().unwrap()
}

fn dispatched(advance: Advance) -> (usize, String) {
    match advance {
        Advance::Dispatched {
            index,
            dispatch_token,
            ..
        } => (index, dispatch_token),
        Advance::Done { .. } => panic!("expected a dispatch"),
    }
}

fn kind_of(err: ClientError) -> ErrorKind {
    err.authority().map(|e| e.kind()).expect("authority rejection")
}

#[tokio::test]
async fn session_lifecycle_over_http() {
    let (base, _authority) = serve().await;
    let client = client(&base);

    let started = client.start(start_request("tab-1", 2)).await.unwrap();
    assert_eq!(started.total, 2);
    assert!(started.session_id.starts_with("inline_"));

    let (index, token) = dispatched(
        client
            .next(NextRequest {
                session_id: started.session_id.clone(),
                owner_context_id: Some("tab-1".into()),
                dispatch_token: None,
            })
            .await
            .unwrap(),
    );
    assert_eq!(index, 0);

    // Presenting the token again gets the same dispatch back.
    let (again, same_token) = dispatched(
        client
            .next(NextRequest {
                session_id: started.session_id.clone(),
                owner_context_id: Some("tab-1".into()),
                dispatch_token: Some(token.clone()),
            })
            .await
            .unwrap(),
    );
    assert_eq!((again, same_token), (0, token));

    let found = client.find("tab-1").await.unwrap().expect("owned session");
    assert_eq!(found.status, SessionStatus::NavigatingDetail);
    assert!(client.find("tab-2").await.unwrap().is_none());

    let report = client
        .report_detail(ReportDetailRequest {
            session_id: started.session_id.clone(),
            index: 0,
            detail: Some(detail("Blue Mug")),
            failure: None,
        })
        .await
        .unwrap();
    assert!(!report.done);
    assert_eq!(report.action, ReportAction::Return);
    assert_eq!(report.list_url, "https://list.tmall.com/search_product.htm?q=mug");

    let duplicate = client
        .report_detail(ReportDetailRequest {
            session_id: started.session_id.clone(),
            index: 0,
            detail: Some(detail("Blue Mug")),
            failure: None,
        })
        .await
        .unwrap();
    assert!(duplicate.duplicate);

    let (index, _) = dispatched(
        client
            .next(NextRequest {
                session_id: started.session_id.clone(),
                owner_context_id: Some("tab-1".into()),
                dispatch_token: None,
            })
            .await
            .unwrap(),
    );
    assert_eq!(index, 1);
    let last = client
        .report_detail(ReportDetailRequest {
            session_id: started.session_id.clone(),
            index: 1,
            detail: None,
            failure: Some(FailureReport::new("detail-timeout", "never rendered")),
        })
        .await
        .unwrap();
    assert!(last.done);
    let summary = last.summary.expect("summary on completion");
    assert_eq!(summary.results.len(), 1);
    assert_eq!(summary.failures[0].reason, "detail-timeout");

    let fetched = client.get(&started.session_id).await.unwrap();
    assert!(fetched.is_completed());

    let aborted = client
        .abort(AbortRequest {
            session_id: Some(started.session_id.clone()),
            owner_context_id: None,
        })
        .await
        .unwrap();
    assert!(aborted.ok);
    assert_eq!(aborted.removed, 1);
}

#[tokio::test]
async fn rejections_keep_their_kind_across_the_wire() {
    let (base, _authority) = serve().await;
    let client = client(&base);

    let missing = client.get("inline_nope").await.unwrap_err();
    assert_eq!(kind_of(missing), ErrorKind::NotFound);

    let empty = client.start(start_request("tab-1", 0)).await.unwrap_err();
    assert_eq!(kind_of(empty), ErrorKind::Protocol);

    let started = client.start(start_request("tab-1", 3)).await.unwrap();
    let next = |token: Option<String>| NextRequest {
        session_id: started.session_id.clone(),
        owner_context_id: Some("tab-1".into()),
        dispatch_token: token,
    };
    client.next(next(None)).await.unwrap();

    let in_flight = client.next(next(None)).await.unwrap_err();
    assert_eq!(kind_of(in_flight), ErrorKind::Conflict);

    let stranger = client
        .next(NextRequest {
            owner_context_id: Some("tab-2".into()),
            ..next(None)
        })
        .await
        .unwrap_err();
    assert_eq!(kind_of(stranger), ErrorKind::Protocol);

    let mismatch = client
        .report_detail(ReportDetailRequest {
            session_id: started.session_id.clone(),
            index: 2,
            detail: Some(detail("Wrong")),
            failure: None,
        })
        .await
        .unwrap_err();
    assert_eq!(kind_of(mismatch), ErrorKind::Protocol);

    let malformed = client
        .report_detail(ReportDetailRequest {
            session_id: started.session_id.clone(),
            index: 0,
            detail: None,
            failure: None,
        })
        .await
        .unwrap_err();
    assert_eq!(kind_of(malformed), ErrorKind::Protocol);
}

#[tokio::test]
async fn health_reports_live_sessions() {
    let (base, _authority) = serve().await;
    client(&base).start(start_request("tab-1", 1)).await.unwrap();

    let health: serde_json::Value = reqwest::get(format!("{}/health", base))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "healthy");
    assert_eq!(health["sessions"], 1);
}

#[tokio::test]
async fn item_results_are_streamed_to_the_owner() {
    let (base, _authority) = serve().await;
    let client = client(&base);
    let started = client.start(start_request("tab-1", 1)).await.unwrap();
    client
        .next(NextRequest {
            session_id: started.session_id.clone(),
            owner_context_id: Some("tab-1".into()),
            dispatch_token: None,
        })
        .await
        .unwrap();

    let mut stream = reqwest::get(format!("{}/inline/events?ownerContextId=tab-1", base))
        .await
        .unwrap();
    assert!(stream.status().is_success());

    client
        .report_detail(ReportDetailRequest {
            session_id: started.session_id.clone(),
            index: 0,
            detail: Some(detail("Blue Mug")),
            failure: None,
        })
        .await
        .unwrap();

    let mut received = String::new();
    let read = tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(chunk) = stream.chunk().await.unwrap() {
            received.push_str(&String::from_utf8_lossy(&chunk));
            if received.contains("\"done\":true") {
                break;
            }
        }
    })
    .await;
    assert!(read.is_ok(), "no event within 5s: {:?}", received);
    assert!(received.contains("event: inline/itemResult"));
    assert!(received.contains("Blue Mug"));
}
