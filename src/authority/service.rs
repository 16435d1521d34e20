use super::notify::ItemResultNotifier;
use super::session::new_session_id;
use super::store::KeyValueStore;
use crate::core::error::AuthorityError;
use crate::core::types::{
    AbortRequest, AbortResponse, Advance, ItemResultEvent, NextRequest, ReportAction,
    ReportDetailRequest, ReportDetailResponse, Session, SessionStatus, SessionSummary,
    StartRequest, StartResponse,
};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub const SESSION_PREFIX: &str = "inline/session/";
pub const OWNER_PREFIX: &str = "inline/owner/";

pub fn session_key(id: &str) -> String {
    format!("{}{}", SESSION_PREFIX, id)
}

pub fn owner_key(owner_context_id: &str) -> String {
    format!("{}{}", OWNER_PREFIX, owner_context_id)
}

#[derive(Debug, Default)]
struct Sessions {
    by_id: HashMap<String, Session>,
    /// owner context id → session id
    owners: HashMap<String, String>,
}

/// Single writer for every session record.
///
/// Each operation holds one async mutex for its whole duration, applies its
/// change to a copy of the session, writes the copy through to the store and
/// only then commits it to the working set. A failed write leaves both the
/// working set and the caller's view unchanged.
pub struct SessionAuthority {
    store: Arc<dyn KeyValueStore>,
    sessions: Mutex<Sessions>,
    notifier: ItemResultNotifier,
    ttl: Option<Duration>,
}

impl std::fmt::Debug for SessionAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionAuthority")
            .field("ttl", &self.ttl)
            .finish()
    }
}

impl SessionAuthority {
    /// Loads every persisted session, repairs owner pointers and evicts
    /// sessions idle for longer than `ttl`.
    pub async fn open(
        store: Arc<dyn KeyValueStore>,
        ttl: Option<Duration>,
    ) -> Result<Self, AuthorityError> {
        let authority = Self {
            store,
            sessions: Mutex::new(Sessions::default()),
            notifier: ItemResultNotifier::new(),
            ttl,
        };
        authority.reload().await?;
        authority.evict_stale(Utc::now()).await?;
        Ok(authority)
    }

    pub fn notifier(&self) -> &ItemResultNotifier {
        &self.notifier
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.lock().await.by_id.len()
    }

    async fn reload(&self) -> Result<(), AuthorityError> {
        let mut state = self.sessions.lock().await;

        for key in self.store.keys(SESSION_PREFIX).await? {
            let raw = match self.store.get(&key).await {
                Ok(Some(raw)) => raw,
                Ok(None) => continue,
                Err(e) => {
                    warn!("authority: dropping unreadable record {}: {}", key, e);
                    self.store.remove(&key).await?;
                    continue;
                }
            };
            match serde_json::from_value::<Session>(raw) {
                Ok(session) => {
                    state.by_id.insert(session.id.clone(), session);
                }
                Err(e) => {
                    warn!("authority: dropping malformed session {}: {}", key, e);
                    self.store.remove(&key).await?;
                }
            }
        }

        for key in self.store.keys(OWNER_PREFIX).await? {
            let owner = key.trim_start_matches(OWNER_PREFIX).to_string();
            let target = self
                .store
                .get(&key)
                .await
                .ok()
                .flatten()
                .and_then(|v| v.as_str().map(str::to_string));
            let valid = target
                .as_ref()
                .and_then(|id| state.by_id.get(id))
                .map(|s| s.owner_context_id == owner)
                .unwrap_or(false);
            match (valid, target) {
                (true, Some(id)) => {
                    state.owners.insert(owner, id);
                }
                _ => {
                    warn!("authority: removing dangling owner pointer {}", key);
                    self.store.remove(&key).await?;
                }
            }
        }

        // At most one session per owner: the pointer decides, anything else
        // claiming the same owner is a leftover from an interrupted start.
        let mut leftovers = Vec::new();
        let mut unpointed = Vec::new();
        for session in state.by_id.values() {
            match state.owners.get(&session.owner_context_id) {
                Some(id) if id == &session.id => {}
                Some(_) => leftovers.push(session.id.clone()),
                None => unpointed.push(session.id.clone()),
            }
        }
        // Newest unpointed session wins its owner.
        unpointed.sort_by_key(|id| std::cmp::Reverse(state.by_id[id].started_at));
        for id in unpointed {
            let owner = state.by_id[&id].owner_context_id.clone();
            if state.owners.contains_key(&owner) {
                leftovers.push(id);
                continue;
            }
            self.store
                .set(&owner_key(&owner), &serde_json::Value::String(id.clone()))
                .await?;
            state.owners.insert(owner, id);
        }
        for id in leftovers {
            warn!("authority: removing superseded session {}", id);
            self.store.remove(&session_key(&id)).await?;
            state.by_id.remove(&id);
        }

        info!(
            "authority: loaded {} session(s) from store",
            state.by_id.len()
        );
        Ok(())
    }

    async fn write_session(&self, session: &Session) -> Result<(), AuthorityError> {
        let value = serde_json::to_value(session)
            .map_err(|e| AuthorityError::Storage(e.to_string()))?;
        self.store.set(&session_key(&session.id), &value).await?;
        Ok(())
    }

    /// Removes a session and, if it still points at it, its owner pointer.
    async fn delete_locked(&self, state: &mut Sessions, id: &str) -> Result<bool, AuthorityError> {
        let Some(session) = state.by_id.get(id) else {
            return Ok(false);
        };
        let owner = session.owner_context_id.clone();
        let owns_pointer = state.owners.get(&owner).map(|s| s == id).unwrap_or(false);

        if owns_pointer {
            self.store.remove(&owner_key(&owner)).await?;
        }
        self.store.remove(&session_key(id)).await?;

        if owns_pointer {
            state.owners.remove(&owner);
        }
        state.by_id.remove(id);
        Ok(true)
    }

    /// Creates a session owned by `req.owner_context_id`, replacing any
    /// session that context already owned.
    pub async fn start(&self, req: StartRequest) -> Result<StartResponse, AuthorityError> {
        let now = Utc::now();
        let session = Session::create(new_session_id(), req, now)?;
        let owner = session.owner_context_id.clone();

        let mut state = self.sessions.lock().await;
        let prior = state.owners.get(&owner).cloned();

        self.write_session(&session).await?;
        if let Err(e) = self
            .store
            .set(
                &owner_key(&owner),
                &serde_json::Value::String(session.id.clone()),
            )
            .await
        {
            if let Err(rollback) = self.store.remove(&session_key(&session.id)).await {
                warn!(
                    "authority: could not roll back session {} after owner write failed: {}",
                    session.id, rollback
                );
            }
            return Err(e.into());
        }
        if let Some(prior_id) = &prior {
            // The pointer already moved; only the old record is left.
            if let Err(e) = self.store.remove(&session_key(prior_id)).await {
                warn!(
                    "authority: could not remove replaced session {}: {}",
                    prior_id, e
                );
            }
            state.by_id.remove(prior_id);
            info!("authority: session {} replaced for {}", prior_id, owner);
        }

        let response = StartResponse {
            session_id: session.id.clone(),
            total: session.total,
        };
        info!(
            "authority: session {} started by {} with {} item(s)",
            session.id, owner, session.total
        );
        state.owners.insert(owner, session.id.clone());
        state.by_id.insert(session.id.clone(), session);
        Ok(response)
    }

    /// `inline/next`: dispatch the next item or complete the session.
    pub async fn advance(&self, req: NextRequest) -> Result<Advance, AuthorityError> {
        let mut state = self.sessions.lock().await;
        let current = state
            .by_id
            .get(&req.session_id)
            .ok_or_else(|| AuthorityError::SessionNotFound(req.session_id.clone()))?;

        let mut next = current.clone();
        let advance = next.advance(
            req.owner_context_id.as_deref(),
            req.dispatch_token.as_deref(),
            Utc::now(),
        )?;

        if next != *current {
            self.write_session(&next).await?;
            state.by_id.insert(next.id.clone(), next);
        }

        match &advance {
            Advance::Dispatched { index, total, .. } => {
                debug!("authority: {} dispatched {}/{}", req.session_id, index + 1, total)
            }
            Advance::Done { summary } => info!(
                "authority: {} completed ({} result(s), {} failure(s))",
                req.session_id,
                summary.results.len(),
                summary.failures.len()
            ),
        }
        Ok(advance)
    }

    /// `inline/reportDetail`: record the outcome of the in-flight item.
    pub async fn report_detail(
        &self,
        req: ReportDetailRequest,
    ) -> Result<ReportDetailResponse, AuthorityError> {
        let mut state = self.sessions.lock().await;
        let current = state
            .by_id
            .get(&req.session_id)
            .ok_or_else(|| AuthorityError::SessionNotFound(req.session_id.clone()))?;

        let mut next = current.clone();
        let recorded = next.record(
            req.index,
            req.detail.clone(),
            req.failure.clone(),
            Utc::now(),
        )?;

        let done = next.status == SessionStatus::Completed;
        let summary = next.summary();
        let response = ReportDetailResponse {
            done,
            action: ReportAction::Return,
            summary: done.then(|| summary.clone()),
            list_url: next.list_url.clone(),
            duplicate: recorded.duplicate,
        };

        if recorded.duplicate {
            debug!(
                "authority: duplicate report for {}#{} ignored",
                req.session_id, req.index
            );
            return Ok(response);
        }

        self.write_session(&next).await?;
        let event = ItemResultEvent {
            session_id: next.id.clone(),
            owner_context_id: next.owner_context_id.clone(),
            index: req.index,
            detail: req.detail,
            failure: req.failure,
            done,
            total: next.total,
            summary: done.then_some(summary),
        };
        debug!(
            "authority: {} recorded #{} ({}/{})",
            next.id,
            req.index,
            next.resolved(),
            next.total
        );
        state.by_id.insert(next.id.clone(), next);
        drop(state);

        self.notifier.publish(event);
        Ok(response)
    }

    /// `inline/get`
    pub async fn get_summary(&self, session_id: &str) -> Result<SessionSummary, AuthorityError> {
        let state = self.sessions.lock().await;
        state
            .by_id
            .get(session_id)
            .map(Session::summary)
            .ok_or_else(|| AuthorityError::SessionNotFound(session_id.to_string()))
    }

    /// `inline/find`: the session owned by a browsing context, if any.
    pub async fn find_by_owner(&self, owner_context_id: &str) -> Option<SessionSummary> {
        let state = self.sessions.lock().await;
        state
            .owners
            .get(owner_context_id)
            .and_then(|id| state.by_id.get(id))
            .map(Session::summary)
    }

    /// `inline/abort`: deletes the session named by id and/or the one owned by
    /// the given context. Unknown ids are not an error.
    pub async fn abort(&self, req: AbortRequest) -> Result<AbortResponse, AuthorityError> {
        let mut state = self.sessions.lock().await;
        let mut targets = Vec::new();
        if let Some(id) = req.session_id {
            targets.push(id);
        }
        if let Some(owner) = req.owner_context_id.as_deref() {
            if let Some(id) = state.owners.get(owner) {
                if !targets.contains(id) {
                    targets.push(id.clone());
                }
            }
        }

        let mut removed = 0;
        for id in targets {
            if self.delete_locked(&mut state, &id).await? {
                info!("authority: session {} aborted", id);
                removed += 1;
            }
        }
        Ok(AbortResponse { ok: true, removed })
    }

    /// Deletes sessions whose last activity is older than the TTL.
    pub async fn evict_stale(&self, now: DateTime<Utc>) -> Result<usize, AuthorityError> {
        let Some(ttl) = self.ttl.and_then(|t| chrono::Duration::from_std(t).ok()) else {
            return Ok(0);
        };
        let mut state = self.sessions.lock().await;
        let stale: Vec<String> = state
            .by_id
            .values()
            .filter(|s| now - s.last_activity > ttl)
            .map(|s| s.id.clone())
            .collect();

        let mut evicted = 0;
        for id in stale {
            if self.delete_locked(&mut state, &id).await? {
                info!("authority: evicted stale session {}", id);
                evicted += 1;
            }
        }
        Ok(evicted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authority::store::{JsonDirStore, MemoryStore};
    use crate::core::error::StoreError;
    use crate::core::types::{DetailFields, FailureReport, ItemStub};
    use serde_json::json;
    use tempfile::TempDir;

    fn items(titles: &[&str]) -> Vec<ItemStub> {
        titles
            .iter()
            .map(|t| ItemStub {
                title: Some(t.to_string()),
                source_url: Some(format!("https://detail.tmall.com/item.htm?id={}", t)),
                ..Default::default()
            })
            .collect()
    }

    fn start_req(owner: &str, titles: &[&str]) -> StartRequest {
        StartRequest {
            total: titles.len(),
            items: items(titles),
            owner_context_id: owner.into(),
            list_url: "https://list.tmall.com/search_product.htm?q=mug".into(),
            site: Some("TMALL".into()),
        }
    }

    fn detail(title: &str) -> DetailFields {
        json!({ "title": title }).as_object().cloned().unwrap()
    }

    fn next(id: &str) -> NextRequest {
        NextRequest {
            session_id: id.into(),
            ..Default::default()
        }
    }

    fn report(id: &str, index: usize, title: &str) -> ReportDetailRequest {
        ReportDetailRequest {
            session_id: id.into(),
            index,
            detail: Some(detail(title)),
            failure: None,
        }
    }

    fn dispatched_index(advance: Advance) -> usize {
        match advance {
            Advance::Dispatched { index, .. } => index,
            Advance::Done { .. } => panic!("expected a dispatch"),
        }
    }

    async fn memory_authority() -> (Arc<MemoryStore>, SessionAuthority) {
        let store = Arc::new(MemoryStore::new());
        let authority = SessionAuthority::open(store.clone(), None).await.unwrap();
        (store, authority)
    }

    #[tokio::test]
    async fn resumed_session_never_reissues_a_visited_index() {
        let tmp = TempDir::new().unwrap();
        let session_id = {
            let store = Arc::new(JsonDirStore::open(tmp.path()).unwrap());
            let authority = SessionAuthority::open(store, None).await.unwrap();
            let started = authority
                .start(start_req("tab-1", &["A", "B", "C"]))
                .await
                .unwrap();
            let id = started.session_id;
            assert_eq!(dispatched_index(authority.advance(next(&id)).await.unwrap()), 0);
            authority.report_detail(report(&id, 0, "D0")).await.unwrap();
            assert_eq!(dispatched_index(authority.advance(next(&id)).await.unwrap()), 1);
            id
        };

        // Process restart over the same directory.
        let store = Arc::new(JsonDirStore::open(tmp.path()).unwrap());
        let authority = SessionAuthority::open(store, None).await.unwrap();
        let found = authority.find_by_owner("tab-1").await.unwrap();
        assert_eq!(found.id, session_id);
        assert_eq!(found.current_index, 1);
        assert_eq!(found.status, SessionStatus::NavigatingDetail);
        assert_eq!(found.pending_item.unwrap().title.as_deref(), Some("B"));

        let duplicate = authority
            .report_detail(report(&session_id, 0, "again"))
            .await
            .unwrap();
        assert!(duplicate.duplicate);

        authority
            .report_detail(ReportDetailRequest {
                session_id: session_id.clone(),
                index: 1,
                detail: None,
                failure: Some(FailureReport::new("timeout", "detail never rendered")),
            })
            .await
            .unwrap();
        assert_eq!(
            dispatched_index(authority.advance(next(&session_id)).await.unwrap()),
            2
        );
        let last = authority
            .report_detail(report(&session_id, 2, "D2"))
            .await
            .unwrap();
        assert!(last.done);
        assert_eq!(last.action, ReportAction::Return);

        let summary = last.summary.unwrap();
        let result_indices: Vec<_> = summary.results.iter().map(|r| r.index).collect();
        assert_eq!(result_indices, vec![0, 2]);
        assert_eq!(summary.failures.len(), 1);
        assert_eq!(summary.failures[0].index, 1);
        assert_eq!(summary.status, SessionStatus::Completed);
    }

    #[tokio::test]
    async fn result_indices_survive_a_restart_whatever_the_detail_holds() {
        let tmp = TempDir::new().unwrap();
        let id = {
            let store = Arc::new(JsonDirStore::open(tmp.path()).unwrap());
            let authority = SessionAuthority::open(store, None).await.unwrap();
            let id = authority
                .start(start_req("tab-1", &["A", "B"]))
                .await
                .unwrap()
                .session_id;
            authority.advance(next(&id)).await.unwrap();
            authority
                .report_detail(ReportDetailRequest {
                    session_id: id.clone(),
                    index: 0,
                    detail: json!({ "title": "Mug", "index": 7 }).as_object().cloned(),
                    failure: None,
                })
                .await
                .unwrap();
            id
        };

        let store = Arc::new(JsonDirStore::open(tmp.path()).unwrap());
        let authority = SessionAuthority::open(store, None).await.unwrap();
        let summary = authority.get_summary(&id).await.unwrap();
        assert_eq!(summary.results.len(), 1);
        assert_eq!(summary.results[0].index, 0);
        assert_eq!(summary.results[0].detail["title"], json!("Mug"));
        assert!(!summary.results[0].detail.contains_key("index"));
    }

    #[tokio::test]
    async fn advance_after_completion_returns_done() {
        let (_, authority) = memory_authority().await;
        let id = authority
            .start(start_req("tab-1", &["A"]))
            .await
            .unwrap()
            .session_id;
        authority.advance(next(&id)).await.unwrap();
        authority.report_detail(report(&id, 0, "A")).await.unwrap();

        let before = authority.get_summary(&id).await.unwrap();
        let advance = authority.advance(next(&id)).await.unwrap();
        assert!(matches!(advance, Advance::Done { .. }));
        assert_eq!(authority.get_summary(&id).await.unwrap(), before);
    }

    #[tokio::test]
    async fn restarting_for_an_owner_leaves_no_orphans() {
        let (store, authority) = memory_authority().await;
        let first = authority
            .start(start_req("tab-1", &["A", "B"]))
            .await
            .unwrap()
            .session_id;
        authority.advance(next(&first)).await.unwrap();
        let second = authority
            .start(start_req("tab-1", &["C"]))
            .await
            .unwrap()
            .session_id;

        let keys: Vec<_> = store.dump().into_keys().collect();
        assert_eq!(
            keys,
            vec![owner_key("tab-1"), session_key(&second)],
            "unexpected keys {:?}",
            keys
        );
        assert!(matches!(
            authority.get_summary(&first).await,
            Err(AuthorityError::SessionNotFound(_))
        ));
        assert_eq!(store.dump()[&owner_key("tab-1")], json!(second));
    }

    #[tokio::test]
    async fn in_flight_dispatch_requires_its_token() {
        let (_, authority) = memory_authority().await;
        let id = authority
            .start(start_req("tab-1", &["A", "B"]))
            .await
            .unwrap()
            .session_id;

        let first = authority.advance(next(&id)).await.unwrap();
        let Advance::Dispatched { dispatch_token, .. } = first.clone() else {
            panic!("expected a dispatch");
        };

        let err = authority.advance(next(&id)).await.unwrap_err();
        assert_eq!(err.kind(), crate::core::error::ErrorKind::Conflict);

        let redelivered = authority
            .advance(NextRequest {
                session_id: id.clone(),
                owner_context_id: Some("tab-1".into()),
                dispatch_token: Some(dispatch_token),
            })
            .await
            .unwrap();
        assert_eq!(redelivered, first);
    }

    #[tokio::test]
    async fn mismatched_report_is_rejected() {
        let (_, authority) = memory_authority().await;
        let id = authority
            .start(start_req("tab-1", &["A", "B", "C"]))
            .await
            .unwrap()
            .session_id;
        authority.advance(next(&id)).await.unwrap();

        let err = authority
            .report_detail(report(&id, 1, "B"))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            AuthorityError::IndexMismatch {
                index: 1,
                expected: Some(0)
            }
        );
        assert!(authority.get_summary(&id).await.unwrap().results.is_empty());
    }

    #[tokio::test]
    async fn failed_write_leaves_state_untouched() {
        let (store, authority) = memory_authority().await;
        let id = authority
            .start(start_req("tab-1", &["A", "B"]))
            .await
            .unwrap()
            .session_id;

        store.fail_writes(true);
        let err = authority.advance(next(&id)).await.unwrap_err();
        assert_eq!(err.kind(), crate::core::error::ErrorKind::Storage);
        assert_eq!(authority.get_summary(&id).await.unwrap().current_index, -1);

        store.fail_writes(false);
        assert_eq!(dispatched_index(authority.advance(next(&id)).await.unwrap()), 0);
    }

    /// Refuses owner-pointer writes, and every removal when `fail_removes`.
    struct PointerWritesFail {
        inner: MemoryStore,
        fail_removes: bool,
    }

    #[async_trait::async_trait]
    impl KeyValueStore for PointerWritesFail {
        async fn get(&self, key: &str) -> Result<Option<serde_json::Value>, StoreError> {
            self.inner.get(key).await
        }
        async fn set(&self, key: &str, value: &serde_json::Value) -> Result<(), StoreError> {
            if key.starts_with(OWNER_PREFIX) {
                return Err(StoreError::Io {
                    path: key.to_string(),
                    source: std::io::Error::other("owner writes disabled"),
                });
            }
            self.inner.set(key, value).await
        }
        async fn remove(&self, key: &str) -> Result<(), StoreError> {
            if self.fail_removes {
                return Err(StoreError::Io {
                    path: key.to_string(),
                    source: std::io::Error::other("removes disabled"),
                });
            }
            self.inner.remove(key).await
        }
        async fn keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
            self.inner.keys(prefix).await
        }
    }

    #[tokio::test]
    async fn failed_owner_write_rolls_the_session_back() {
        let store = Arc::new(PointerWritesFail {
            inner: MemoryStore::new(),
            fail_removes: false,
        });
        let authority = SessionAuthority::open(store.clone(), None).await.unwrap();
        let err = authority.start(start_req("tab-1", &["A"])).await.unwrap_err();
        assert_eq!(err.kind(), crate::core::error::ErrorKind::Storage);
        assert_eq!(authority.session_count().await, 0);
        assert!(store.inner.dump().is_empty());

        // A failed rollback still surfaces the original error and leaves only
        // the orphaned record behind.
        let store = Arc::new(PointerWritesFail {
            inner: MemoryStore::new(),
            fail_removes: true,
        });
        let authority = SessionAuthority::open(store.clone(), None).await.unwrap();
        let err = authority.start(start_req("tab-1", &["A"])).await.unwrap_err();
        assert_eq!(err.kind(), crate::core::error::ErrorKind::Storage);
        assert_eq!(authority.session_count().await, 0);
        let dump = store.inner.dump();
        assert_eq!(dump.len(), 1);
        assert!(dump.keys().all(|k| k.starts_with(SESSION_PREFIX)));
    }

    #[tokio::test]
    async fn report_publishes_item_result() {
        let (_, authority) = memory_authority().await;
        let mut rx = authority.notifier().subscribe();
        let id = authority
            .start(start_req("tab-9", &["A"]))
            .await
            .unwrap()
            .session_id;
        authority.advance(next(&id)).await.unwrap();
        authority.report_detail(report(&id, 0, "A")).await.unwrap();

        let event = rx.recv().await.unwrap();
        assert_eq!(event.owner_context_id, "tab-9");
        assert_eq!(event.index, 0);
        assert!(event.done);
        assert!(event.summary.is_some());
    }

    #[tokio::test]
    async fn abort_is_idempotent_and_accepts_owner() {
        let (store, authority) = memory_authority().await;
        authority.start(start_req("tab-1", &["A"])).await.unwrap();

        let removed = authority
            .abort(AbortRequest {
                session_id: None,
                owner_context_id: Some("tab-1".into()),
            })
            .await
            .unwrap();
        assert_eq!(removed.removed, 1);
        assert!(store.dump().is_empty());

        let again = authority
            .abort(AbortRequest {
                session_id: Some("inline_missing".into()),
                owner_context_id: Some("tab-1".into()),
            })
            .await
            .unwrap();
        assert!(again.ok);
        assert_eq!(again.removed, 0);
    }

    #[tokio::test]
    async fn stale_sessions_are_evicted() {
        let store = Arc::new(MemoryStore::new());
        let authority = SessionAuthority::open(store.clone(), Some(Duration::from_secs(60)))
            .await
            .unwrap();
        let id = authority
            .start(start_req("tab-1", &["A"]))
            .await
            .unwrap()
            .session_id;

        assert_eq!(authority.evict_stale(Utc::now()).await.unwrap(), 0);
        let later = Utc::now() + chrono::Duration::seconds(120);
        assert_eq!(authority.evict_stale(later).await.unwrap(), 1);
        assert!(authority.get_summary(&id).await.is_err());
        assert!(store.dump().is_empty());
    }

    #[tokio::test]
    async fn reload_repairs_owner_pointers() {
        let store = Arc::new(MemoryStore::new());
        let id = {
            let authority = SessionAuthority::open(store.clone(), None).await.unwrap();
            authority
                .start(start_req("tab-1", &["A"]))
                .await
                .unwrap()
                .session_id
        };
        store
            .set(&owner_key("tab-ghost"), &json!("inline_gone"))
            .await
            .unwrap();
        store.remove(&owner_key("tab-1")).await.unwrap();

        let authority = SessionAuthority::open(store.clone(), None).await.unwrap();
        assert_eq!(authority.find_by_owner("tab-1").await.unwrap().id, id);
        let dump = store.dump();
        assert!(!dump.contains_key(&owner_key("tab-ghost")));
        assert_eq!(dump[&owner_key("tab-1")], json!(id));
    }
}
