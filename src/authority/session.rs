//! Session state machine.
//!
//! Pure transitions over [`Session`]; persistence and locking live in
//! [`super::service`]. Every transition either returns an error and leaves
//! the session untouched, or applies the whole change.

use crate::core::error::AuthorityError;
use crate::core::types::{
    Advance, DetailFields, Dispatch, FailureReport, ItemFailure, ItemResult, ItemStub, Session,
    SessionStatus, SessionSummary, StartRequest,
};
use chrono::{DateTime, Utc};

/// What a report did to the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Recorded {
    /// The index had already been resolved; nothing changed.
    pub duplicate: bool,
}

pub fn new_session_id() -> String {
    format!("inline_{}", uuid::Uuid::new_v4().simple())
}

pub fn new_dispatch_token() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

impl Session {
    /// Builds a fresh session. `items` is padded with empty stubs or truncated
    /// so it is exactly `total` long, and every stub carries its position.
    pub fn create(
        id: String,
        req: StartRequest,
        now: DateTime<Utc>,
    ) -> Result<Session, AuthorityError> {
        if req.total == 0 {
            return Err(AuthorityError::EmptySession);
        }
        let mut items = req.items;
        items.truncate(req.total);
        items.resize_with(req.total, ItemStub::default);
        for (index, item) in items.iter_mut().enumerate() {
            item.index = index;
        }

        Ok(Session {
            id,
            owner_context_id: req.owner_context_id,
            site: req.site,
            list_url: req.list_url,
            total: req.total,
            items,
            current_index: -1,
            status: SessionStatus::PendingList,
            results: Vec::new(),
            failures: Vec::new(),
            in_flight: None,
            started_at: now,
            last_activity: now,
        })
    }

    pub fn resolved(&self) -> usize {
        self.results.len() + self.failures.len()
    }

    pub fn is_resolved(&self, index: usize) -> bool {
        self.results.iter().any(|r| r.index == index)
            || self.failures.iter().any(|f| f.index == index)
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.id.clone(),
            owner_context_id: self.owner_context_id.clone(),
            site: self.site.clone(),
            list_url: self.list_url.clone(),
            total: self.total,
            current_index: self.current_index,
            status: self.status,
            results: self.results.clone(),
            failures: self.failures.clone(),
            pending_item: self
                .in_flight
                .as_ref()
                .and_then(|d| self.items.get(d.index))
                .cloned(),
            started_at: self.started_at,
            last_activity: self.last_activity,
        }
    }

    fn dispatched(&self, dispatch: &Dispatch) -> Advance {
        Advance::Dispatched {
            index: dispatch.index,
            total: self.total,
            item: self.items.get(dispatch.index).cloned().unwrap_or(ItemStub {
                index: dispatch.index,
                ..Default::default()
            }),
            dispatch_token: dispatch.token.clone(),
        }
    }

    /// Moves the cursor to the next item, or completes the session.
    ///
    /// While an item is in flight, only a caller presenting its dispatch token
    /// gets it again; everyone else is told the dispatch is taken.
    pub fn advance(
        &mut self,
        owner_context_id: Option<&str>,
        dispatch_token: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Advance, AuthorityError> {
        if let Some(owner) = owner_context_id {
            if owner != self.owner_context_id {
                return Err(AuthorityError::NotOwner {
                    session_id: self.id.clone(),
                });
            }
        }

        if self.status == SessionStatus::Completed {
            return Ok(Advance::Done {
                summary: self.summary(),
            });
        }

        if let Some(dispatch) = &self.in_flight {
            if dispatch_token == Some(dispatch.token.as_str()) {
                return Ok(self.dispatched(dispatch));
            }
            return Err(AuthorityError::DispatchInFlight {
                index: dispatch.index,
            });
        }

        let next = self.current_index + 1;
        if next < 0 || next as usize >= self.total {
            self.status = SessionStatus::Completed;
            self.last_activity = now;
            return Ok(Advance::Done {
                summary: self.summary(),
            });
        }

        let dispatch = Dispatch {
            index: next as usize,
            token: new_dispatch_token(),
            issued_at: now,
        };
        let advance = self.dispatched(&dispatch);
        self.current_index = next;
        self.status = SessionStatus::NavigatingDetail;
        self.in_flight = Some(dispatch);
        self.last_activity = now;
        Ok(advance)
    }

    /// Records the outcome of the in-flight item.
    pub fn record(
        &mut self,
        index: usize,
        detail: Option<DetailFields>,
        failure: Option<FailureReport>,
        now: DateTime<Utc>,
    ) -> Result<Recorded, AuthorityError> {
        let outcome = match (detail, failure) {
            (Some(detail), None) => Ok(detail),
            (None, Some(failure)) => Err(failure),
            _ => return Err(AuthorityError::MalformedReport),
        };
        if index >= self.total {
            return Err(AuthorityError::IndexOutOfRange {
                index,
                total: self.total,
            });
        }
        if self.is_resolved(index) {
            return Ok(Recorded { duplicate: true });
        }

        let expected = self.in_flight.as_ref().map(|d| d.index);
        if expected != Some(index) {
            return Err(AuthorityError::IndexMismatch { index, expected });
        }

        match outcome {
            Ok(mut detail) => {
                // Flattened next to the result's own index; a scraped `index`
                // would shadow it once persisted.
                detail.remove("index");
                self.results.push(ItemResult { index, detail })
            }
            Err(failure) => self.failures.push(ItemFailure {
                index,
                reason: failure.reason,
                message: failure.message,
            }),
        }
        self.in_flight = None;
        self.last_activity = now;
        self.status = if self.resolved() >= self.total {
            SessionStatus::Completed
        } else {
            SessionStatus::PendingList
        };
        Ok(Recorded { duplicate: false })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn start(total: usize, items: Vec<ItemStub>) -> Session {
        Session::create(
            "inline_test".into(),
            StartRequest {
                total,
                items,
                owner_context_id: "tab-1".into(),
                list_url: "https://list.tmall.com/search".into(),
                site: Some("TMALL".into()),
            },
            Utc::now(),
        )
        .unwrap()
    }

    fn detail(title: &str) -> DetailFields {
        json!({ "title": title }).as_object().cloned().unwrap()
    }

    fn token_of(advance: &Advance) -> String {
        match advance {
            Advance::Dispatched { dispatch_token, .. } => dispatch_token.clone(),
            Advance::Done { .. } => panic!("expected a dispatch"),
        }
    }

    #[test]
    fn empty_session_is_rejected() {
        let err = Session::create(
            "x".into(),
            StartRequest {
                total: 0,
                items: vec![],
                owner_context_id: "tab".into(),
                list_url: "https://a/".into(),
                site: None,
            },
            Utc::now(),
        )
        .unwrap_err();
        assert_eq!(err, AuthorityError::EmptySession);
    }

    #[test]
    fn items_are_padded_and_reindexed() {
        let session = start(
            3,
            vec![ItemStub {
                index: 9,
                title: Some("A".into()),
                ..Default::default()
            }],
        );
        assert_eq!(session.items.len(), 3);
        assert_eq!(session.items[0].index, 0);
        assert_eq!(session.items[0].title.as_deref(), Some("A"));
        assert_eq!(session.items[2].index, 2);

        let truncated = start(1, vec![ItemStub::default(), ItemStub::default()]);
        assert_eq!(truncated.items.len(), 1);
    }

    #[test]
    fn full_run_visits_every_index_once() {
        let mut session = start(3, vec![]);
        for expected in 0..3 {
            let advance = session.advance(Some("tab-1"), None, Utc::now()).unwrap();
            match advance {
                Advance::Dispatched { index, .. } => assert_eq!(index, expected),
                Advance::Done { .. } => panic!("finished early"),
            }
            assert_eq!(session.status, SessionStatus::NavigatingDetail);
            session
                .record(expected, Some(detail("x")), None, Utc::now())
                .unwrap();
        }
        assert_eq!(session.status, SessionStatus::Completed);
        let indices: Vec<_> = session.results.iter().map(|r| r.index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
    }

    #[test]
    fn advance_after_completion_does_not_mutate() {
        let mut session = start(1, vec![]);
        session.advance(None, None, Utc::now()).unwrap();
        session.record(0, Some(detail("a")), None, Utc::now()).unwrap();
        let before = session.clone();

        let advance = session.advance(None, None, Utc::now()).unwrap();
        assert!(matches!(advance, Advance::Done { .. }));
        assert_eq!(session, before);
    }

    #[test]
    fn in_flight_dispatch_is_redelivered_only_with_its_token() {
        let mut session = start(2, vec![]);
        let first = session.advance(None, None, Utc::now()).unwrap();
        let token = token_of(&first);

        let err = session.advance(None, None, Utc::now()).unwrap_err();
        assert_eq!(err, AuthorityError::DispatchInFlight { index: 0 });

        let again = session.advance(None, Some(&token), Utc::now()).unwrap();
        assert_eq!(again, first);
        assert_eq!(session.current_index, 0);
    }

    #[test]
    fn advance_from_another_context_is_rejected() {
        let mut session = start(2, vec![]);
        let err = session.advance(Some("tab-2"), None, Utc::now()).unwrap_err();
        assert!(matches!(err, AuthorityError::NotOwner { .. }));
        assert_eq!(session.current_index, -1);
    }

    #[test]
    fn reports_are_validated() {
        let mut session = start(3, vec![]);
        session.advance(None, None, Utc::now()).unwrap();

        assert_eq!(
            session.record(0, None, None, Utc::now()).unwrap_err(),
            AuthorityError::MalformedReport
        );
        assert_eq!(
            session
                .record(
                    0,
                    Some(detail("a")),
                    Some(FailureReport::new("x", "")),
                    Utc::now()
                )
                .unwrap_err(),
            AuthorityError::MalformedReport
        );
        assert_eq!(
            session
                .record(3, Some(detail("a")), None, Utc::now())
                .unwrap_err(),
            AuthorityError::IndexOutOfRange { index: 3, total: 3 }
        );
        assert_eq!(
            session
                .record(2, Some(detail("a")), None, Utc::now())
                .unwrap_err(),
            AuthorityError::IndexMismatch {
                index: 2,
                expected: Some(0)
            }
        );
        assert!(session.results.is_empty());
    }

    #[test]
    fn duplicate_report_is_a_no_op() {
        let mut session = start(2, vec![]);
        session.advance(None, None, Utc::now()).unwrap();
        session.record(0, Some(detail("a")), None, Utc::now()).unwrap();
        let before = session.clone();

        let recorded = session
            .record(0, None, Some(FailureReport::new("timeout", "")), Utc::now())
            .unwrap();
        assert!(recorded.duplicate);
        assert_eq!(session, before);
    }

    #[test]
    fn scraped_index_field_cannot_shadow_the_result_index() {
        let mut session = start(2, vec![]);
        session.advance(None, None, Utc::now()).unwrap();
        let scraped = json!({ "title": "Mug", "index": 7 }).as_object().cloned().unwrap();
        session.record(0, Some(scraped), None, Utc::now()).unwrap();

        let stored = serde_json::to_value(&session.results[0]).unwrap();
        assert_eq!(stored, json!({ "index": 0, "title": "Mug" }));
    }

    #[test]
    fn failures_count_toward_completion() {
        let mut session = start(2, vec![]);
        session.advance(None, None, Utc::now()).unwrap();
        session
            .record(0, None, Some(FailureReport::new("timeout", "slow")), Utc::now())
            .unwrap();
        session.advance(None, None, Utc::now()).unwrap();
        session.record(1, Some(detail("b")), None, Utc::now()).unwrap();

        assert_eq!(session.status, SessionStatus::Completed);
        assert_eq!(session.failures[0].reason, "timeout");
        assert_eq!(session.summary().resolved(), 2);
    }

    #[test]
    fn summary_exposes_the_pending_item() {
        let mut session = start(
            2,
            vec![
                ItemStub {
                    title: Some("A".into()),
                    ..Default::default()
                },
                ItemStub {
                    title: Some("B".into()),
                    ..Default::default()
                },
            ],
        );
        assert!(session.summary().pending_item.is_none());
        session.advance(None, None, Utc::now()).unwrap();
        let pending = session.summary().pending_item.unwrap();
        assert_eq!(pending.title.as_deref(), Some("A"));
    }
}
