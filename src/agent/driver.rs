//! Per-page-load automation.
//!
//! A `PageAgent` is built fresh for every document load and keeps nothing
//! across navigations. It works out what to do purely from the URL, the
//! authority's view of the session owned by its tab, and the local resume
//! bridge.

use super::bridge::{same_list_url, ContextRecord, ResumeBridge};
use super::host::{HostError, PageHost};
use super::items::{collect_list_items, item_id_from_url};
use super::roles::{PageType, SiteDefinition, SiteRegistry};
use super::scrape::{DetailScraper, RenderedPage, SelectorScraper};
use super::wait::{at_least, poll_until, selectors_present};
use crate::core::config::AgentSettings;
use crate::core::error::{AuthorityError, ErrorKind};
use crate::core::types::*;
use crate::rpc::client::{AuthorityClient, ClientError};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

pub const REASON_DETAIL_TIMEOUT: &str = "detail-timeout";
pub const REASON_SCRAPE_ERROR: &str = "scrape-error";
pub const REASON_ITEM_NOT_FOUND: &str = "item-not-found";

/// Why a page load did nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InertReason {
    UnknownPage,
    NoSession,
    /// The tab's session belongs to another storefront.
    OtherSite,
    /// A list page other than the one the session started from.
    OtherList,
    /// Detail page opened while the session is not waiting for one.
    StaleNavigation,
    /// Another `next` request from this agent is still outstanding.
    Busy,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AgentOutcome {
    Inert(InertReason),
    /// A card was clicked (or its URL opened) for this index.
    NavigatingToDetail { index: usize },
    /// The item was reported and the tab is heading back to the list.
    ReturningToList { index: usize },
    /// Someone else holds the in-flight dispatch; nothing was changed.
    Parked { index: usize },
    Finished(SessionSummary),
    Aborted { reason: String },
}

#[derive(Debug, Error)]
pub enum AgentError {
    /// The authority could not be reached; the session stays parked.
    #[error("session authority unreachable: {0}")]
    Transport(String),

    #[error(transparent)]
    Host(#[from] HostError),

    #[error(transparent)]
    Authority(AuthorityError),

    #[error("collection must start on a list page, not {0}")]
    NotListPage(String),

    #[error("no item cards found on {0}")]
    NoCards(String),
}

impl From<ClientError> for AgentError {
    fn from(e: ClientError) -> Self {
        match e {
            ClientError::Authority(e) => AgentError::Authority(e),
            other => AgentError::Transport(other.to_string()),
        }
    }
}

pub struct PageAgent {
    host: Arc<dyn PageHost>,
    client: Arc<dyn AuthorityClient>,
    sites: Arc<SiteRegistry>,
    scraper: Arc<dyn DetailScraper>,
    settings: AgentSettings,
    requesting: AtomicBool,
    active_index: AtomicI64,
}

impl std::fmt::Debug for PageAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageAgent")
            .field("context_id", &self.host.context_id())
            .field("active_index", &self.active_index())
            .finish()
    }
}

impl PageAgent {
    pub fn new(
        host: Arc<dyn PageHost>,
        client: Arc<dyn AuthorityClient>,
        sites: Arc<SiteRegistry>,
    ) -> Self {
        Self {
            host,
            client,
            sites,
            scraper: Arc::new(SelectorScraper::new()),
            settings: AgentSettings::default(),
            requesting: AtomicBool::new(false),
            active_index: AtomicI64::new(-1),
        }
    }

    pub fn with_scraper(mut self, scraper: Arc<dyn DetailScraper>) -> Self {
        self.scraper = scraper;
        self
    }

    pub fn with_settings(mut self, settings: AgentSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Index this agent is currently working on, `-1` when idle.
    pub fn active_index(&self) -> i64 {
        self.active_index.load(Ordering::SeqCst)
    }

    fn bridge(&self) -> ResumeBridge<'_> {
        ResumeBridge::new(self.host.as_ref())
    }

    fn context_id(&self) -> String {
        self.host.context_id().to_string()
    }

    // ─── Entry points ───────────────────────────────────────────────────────

    /// Runs once per page load: detect the role, find the tab's session and
    /// act on it.
    pub async fn run(&self) -> Result<AgentOutcome, AgentError> {
        let url = self.host.current_url().await?;
        let Some(detection) = self.sites.detect(&url) else {
            debug!("agent: {} is not a known storefront page", url);
            return Ok(AgentOutcome::Inert(InertReason::UnknownPage));
        };

        let Some(summary) = self.client.find(self.host.context_id()).await? else {
            if detection.page_type == PageType::List {
                // Leftover from an acknowledged session.
                if let Err(e) = self.bridge().take().await {
                    debug!("agent: could not clear resume snapshot: {}", e);
                }
            }
            return Ok(AgentOutcome::Inert(InertReason::NoSession));
        };

        if summary
            .site
            .as_deref()
            .is_some_and(|id| id != detection.site.id)
        {
            debug!(
                "agent: session {} belongs to {:?}, page is {}",
                summary.id, summary.site, detection.site.id
            );
            return Ok(AgentOutcome::Inert(InertReason::OtherSite));
        }

        match detection.page_type {
            PageType::Product => self.run_detail(&detection.site, &url, summary).await,
            PageType::List => self.run_list(&detection.site, &url, summary).await,
        }
    }

    /// Pre-scrapes the list page, starts a session owned by this tab and
    /// dispatches the first item.
    pub async fn start_collection(&self) -> Result<AgentOutcome, AgentError> {
        let url = self.host.current_url().await?;
        let site = self
            .sites
            .detect(&url)
            .filter(|d| d.page_type == PageType::List)
            .map(|d| d.site)
            .ok_or_else(|| AgentError::NotListPage(url.clone()))?;

        let html = self.host.html().await?;
        let mut items = collect_list_items(&html, &url, &site);
        if items.is_empty() {
            return Err(AgentError::NoCards(url));
        }
        let total = self
            .settings
            .collect_limit
            .map_or(items.len(), |limit| items.len().min(limit));
        items.truncate(total);

        self.clear_local().await;
        let started = self
            .client
            .start(StartRequest {
                total,
                items,
                owner_context_id: self.context_id(),
                list_url: url.clone(),
                site: Some(site.id.clone()),
            })
            .await?;
        info!(
            "agent: started session {} on {} with {} item(s)",
            started.session_id, site.id, started.total
        );

        self.active_index.store(-1, Ordering::SeqCst);
        let record = ContextRecord {
            session_id: started.session_id.clone(),
            list_url: url.clone(),
            active_index: -1,
            total: started.total,
        };
        if let Err(e) = self.bridge().save_context(&record).await {
            warn!("agent: could not cache session context: {}", e);
        }

        let summary = self.client.get(&started.session_id).await?;
        self.dispatch_loop(&site, &url, summary, None).await
    }

    /// Deletes this tab's session and all local resume state.
    pub async fn abort_collection(&self) -> Result<usize, AgentError> {
        let response = self
            .client
            .abort(AbortRequest {
                session_id: None,
                owner_context_id: Some(self.context_id()),
            })
            .await?;
        self.clear_local().await;
        self.active_index.store(-1, Ordering::SeqCst);
        Ok(response.removed)
    }

    // ─── Detail role ────────────────────────────────────────────────────────

    async fn run_detail(
        &self,
        site: &SiteDefinition,
        url: &str,
        summary: SessionSummary,
    ) -> Result<AgentOutcome, AgentError> {
        if summary.status != SessionStatus::NavigatingDetail || summary.current_index < 0 {
            debug!(
                "agent: detail page while session {} is {}",
                summary.id,
                summary.status.as_str()
            );
            return Ok(AgentOutcome::Inert(InertReason::StaleNavigation));
        }
        let expected_id = summary
            .pending_item
            .as_ref()
            .and_then(|item| item.source_url.as_deref())
            .and_then(|source| item_id_from_url(source, site));
        if let (Some(expected), Some(found)) = (expected_id, item_id_from_url(url, site)) {
            if expected != found {
                debug!(
                    "agent: detail page {} is not pending item {} of session {}",
                    found, expected, summary.id
                );
                return Ok(AgentOutcome::Inert(InertReason::StaleNavigation));
            }
        }
        let index = summary.current_index as usize;
        self.active_index.store(index as i64, Ordering::SeqCst);

        let host = self.host.as_ref();
        let ready_selectors = &site.ready_selectors;
        let ready = ready_selectors.is_empty()
            || poll_until(
                self.settings.detail_ready_timeout,
                self.settings.poll_interval,
                move || selectors_present(host, ready_selectors),
            )
            .await;
        if !ready {
            warn!(
                "agent: detail page for item {} not ready after {:?}, scraping anyway",
                index, self.settings.detail_ready_timeout
            );
        }

        let (detail, failure) = match self.scrape_current(site, url).await {
            Ok(detail) => (Some(detail), None),
            Err(message) => {
                let reason = if ready {
                    REASON_SCRAPE_ERROR
                } else {
                    REASON_DETAIL_TIMEOUT
                };
                warn!("agent: item {} failed ({}): {}", index, reason, message);
                (None, Some(FailureReport::new(reason, message)))
            }
        };

        let response = match self
            .client
            .report_detail(ReportDetailRequest {
                session_id: summary.id.clone(),
                index,
                detail,
                failure,
            })
            .await
        {
            Ok(response) => response,
            Err(ClientError::Authority(e)) => return self.reject(&summary, e).await,
            Err(e) => return Err(e.into()),
        };
        if response.duplicate {
            debug!("agent: item {} was already recorded", index);
        }

        self.active_index.store(-1, Ordering::SeqCst);
        let list_url = if response.list_url.is_empty() {
            summary.list_url.clone()
        } else {
            response.list_url.clone()
        };
        let record = ContextRecord {
            session_id: summary.id.clone(),
            list_url: list_url.clone(),
            active_index: -1,
            total: summary.total,
        };
        if let Err(e) = self.bridge().save_context(&record).await {
            warn!("agent: could not cache session context: {}", e);
        }

        if self.navigate_back(site, &list_url).await {
            Ok(AgentOutcome::ReturningToList { index })
        } else {
            self.abort_session(&summary.id, "no way back to the list page")
                .await
        }
    }

    async fn scrape_current(&self, site: &SiteDefinition, url: &str) -> Result<DetailFields, String> {
        let html = self.host.html().await.map_err(|e| e.to_string())?;
        self.scraper
            .scrape(site, &RenderedPage { url, html: &html })
            .map_err(|e| e.to_string())
    }

    /// History back, then every cached list URL, then a same-site referrer.
    async fn navigate_back(&self, site: &SiteDefinition, report_list_url: &str) -> bool {
        match self.host.history_length().await {
            Ok(n) if n > 1 => match self.host.go_back().await {
                Ok(()) => {
                    debug!("agent: returning to list via history");
                    return true;
                }
                Err(e) => warn!("agent: history back failed: {}", e),
            },
            Ok(_) => {}
            Err(e) => debug!("agent: history length unavailable: {}", e),
        }

        let bridge = self.bridge();
        let mut candidates: Vec<(&str, String)> = vec![("report", report_list_url.to_string())];
        if let Some(record) = bridge.load_context().await {
            candidates.push(("context record", record.list_url));
        }
        if let Some(snapshot) = bridge.peek().await {
            candidates.push(("resume snapshot", snapshot.list_url));
        }
        if let Ok(Some(referrer)) = self.host.referrer().await {
            if self.sites.belongs_to(&site.id, &referrer) {
                candidates.push(("referrer", referrer));
            }
        }

        for (source, url) in candidates {
            if url.trim().is_empty() {
                continue;
            }
            match self.host.navigate(&url).await {
                Ok(()) => {
                    debug!("agent: returning to list via {} ({})", source, url);
                    return true;
                }
                Err(e) => warn!("agent: could not open {} list url {}: {}", source, url, e),
            }
        }
        false
    }

    // ─── List role ──────────────────────────────────────────────────────────

    async fn run_list(
        &self,
        site: &SiteDefinition,
        url: &str,
        summary: SessionSummary,
    ) -> Result<AgentOutcome, AgentError> {
        let bridge = self.bridge();
        let snapshot = match bridge.take_matching(url).await {
            Ok(snapshot) => snapshot.filter(|s| s.session_id == summary.id),
            Err(e) => {
                warn!("agent: could not read resume snapshot: {}", e);
                None
            }
        };
        if let Some(snapshot) = &snapshot {
            bridge.apply(snapshot, &site.filter_containers).await;
        }

        if summary.status == SessionStatus::Completed {
            return self.finalize(summary).await;
        }
        if !same_list_url(url, &summary.list_url) {
            debug!(
                "agent: {} is not the list page of session {}",
                url, summary.id
            );
            return Ok(AgentOutcome::Inert(InertReason::OtherList));
        }

        // Resuming after a reload mid-dispatch: present the token to get the
        // same item again.
        let token = snapshot
            .filter(|s| s.awaiting_resume && s.index.map(|i| i as i64) == Some(summary.current_index))
            .and_then(|s| s.dispatch_token);
        self.dispatch_loop(site, url, summary, token).await
    }

    async fn dispatch_loop(
        &self,
        site: &SiteDefinition,
        url: &str,
        summary: SessionSummary,
        mut token: Option<String>,
    ) -> Result<AgentOutcome, AgentError> {
        let bridge = self.bridge();
        loop {
            if self.requesting.swap(true, Ordering::SeqCst) {
                return Ok(AgentOutcome::Inert(InertReason::Busy));
            }
            let result = self
                .client
                .next(NextRequest {
                    session_id: summary.id.clone(),
                    owner_context_id: Some(self.context_id()),
                    dispatch_token: token.take(),
                })
                .await;
            self.requesting.store(false, Ordering::SeqCst);

            let (index, total, item, dispatch_token) = match result {
                Ok(Advance::Done { summary }) => return self.finalize(summary).await,
                Ok(Advance::Dispatched {
                    index,
                    total,
                    item,
                    dispatch_token,
                }) => (index, total, item, Some(dispatch_token)),
                Err(ClientError::Authority(e)) if e.kind() == ErrorKind::Conflict => {
                    match self.reclaim(&summary.id).await? {
                        Some((index, total, item)) => (index, total, item, None),
                        None => return self.reject(&summary, e).await,
                    }
                }
                Err(ClientError::Authority(e)) => return self.reject(&summary, e).await,
                Err(e) => return Err(e.into()),
            };

            info!(
                "agent: session {} item {}/{} {}",
                summary.id,
                index + 1,
                total,
                item.title.as_deref().unwrap_or("")
            );
            self.active_index.store(index as i64, Ordering::SeqCst);
            let record = ContextRecord {
                session_id: summary.id.clone(),
                list_url: summary.list_url.clone(),
                active_index: index as i64,
                total,
            };
            if let Err(e) = bridge.save_context(&record).await {
                warn!("agent: could not cache session context: {}", e);
            }
            let mut snapshot = bridge
                .capture(&summary.id, url, &site.filter_containers)
                .await;
            snapshot.awaiting_resume = true;
            snapshot.dispatch_token = dispatch_token;
            snapshot.index = Some(index);
            if let Err(e) = bridge.save(&snapshot).await {
                warn!("agent: could not save resume snapshot: {}", e);
            }

            if self.open_item(site, index, &item).await {
                return Ok(AgentOutcome::NavigatingToDetail { index });
            }

            warn!(
                "agent: item {} has no clickable card and no detail url, skipping",
                index
            );
            if let Err(e) = bridge.clear().await {
                debug!("agent: could not clear resume snapshot: {}", e);
            }
            let report = self
                .client
                .report_detail(ReportDetailRequest {
                    session_id: summary.id.clone(),
                    index,
                    detail: None,
                    failure: Some(FailureReport::new(
                        REASON_ITEM_NOT_FOUND,
                        format!("card {} not found on {}", index, url),
                    )),
                })
                .await;
            self.active_index.store(-1, Ordering::SeqCst);
            match report {
                Ok(response) if response.done => {
                    let finished = match response.summary {
                        Some(finished) => finished,
                        None => self.client.get(&summary.id).await?,
                    };
                    return self.finalize(finished).await;
                }
                Ok(_) => {}
                Err(ClientError::Authority(e)) => return self.reject(&summary, e).await,
                Err(e) => return Err(e.into()),
            }
            tokio::time::sleep(self.settings.skip_delay).await;
        }
    }

    /// Waits for the card and clicks it, falling back to opening the item's
    /// URL. `false` when neither worked.
    async fn open_item(&self, site: &SiteDefinition, index: usize, item: &ItemStub) -> bool {
        if let Some(group) = site.card_selector_group() {
            let host = self.host.as_ref();
            let selector = group.as_str();
            let present = poll_until(
                self.settings.card_wait_timeout,
                self.settings.poll_interval,
                move || at_least(host, selector, index + 1),
            )
            .await;
            if present {
                self.human_pause().await;
                match host
                    .click_card(selector, site.link_selector.as_deref(), index)
                    .await
                {
                    Ok(true) => return true,
                    Ok(false) => debug!("agent: card {} vanished before the click", index),
                    Err(e) => warn!("agent: clicking card {} failed: {}", index, e),
                }
            } else {
                debug!("agent: card {} did not appear", index);
            }
        }

        if let Some(url) = item.source_url.as_deref() {
            match self.host.navigate(url).await {
                Ok(()) => return true,
                Err(e) => warn!("agent: opening {} failed: {}", url, e),
            }
        }
        false
    }

    /// The item in flight when this tab, its owner, is refused a new
    /// dispatch. The tab is showing the list, so no detail page is working on
    /// it: the `next` response or the resume token was lost, and the item is
    /// opened again without moving the cursor.
    async fn reclaim(
        &self,
        session_id: &str,
    ) -> Result<Option<(usize, usize, ItemStub)>, AgentError> {
        let current = match self.client.get(session_id).await {
            Ok(current) => current,
            Err(ClientError::Authority(e)) => {
                debug!("agent: could not re-read session {}: {}", session_id, e);
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };
        if current.owner_context_id != self.context_id()
            || current.status != SessionStatus::NavigatingDetail
            || current.current_index < 0
        {
            return Ok(None);
        }
        let index = current.current_index as usize;
        let item = current.pending_item.unwrap_or_else(|| ItemStub {
            index,
            ..Default::default()
        });
        info!(
            "agent: item {} of session {} was dispatched to this tab but never opened, reopening",
            index, session_id
        );
        Ok(Some((index, current.total, item)))
    }

    async fn human_pause(&self) {
        use rand::distr::{Distribution, Uniform};

        let [min, max] = self.settings.human_delay_ms;
        if max == 0 {
            return;
        }
        let delay = {
            let mut rng = rand::rng();
            Uniform::new_inclusive(min, max)
                .map(|dist| dist.sample(&mut rng))
                .unwrap_or(min)
        };
        tokio::time::sleep(Duration::from_millis(delay)).await;
    }

    // ─── Terminal paths ─────────────────────────────────────────────────────

    async fn finalize(&self, summary: SessionSummary) -> Result<AgentOutcome, AgentError> {
        info!(
            "agent: session {} completed: {} result(s), {} failure(s) of {}",
            summary.id,
            summary.results.len(),
            summary.failures.len(),
            summary.total
        );
        for line in summary_table(&summary) {
            info!("agent:   {}", line);
        }

        if let Err(e) = self
            .client
            .abort(AbortRequest {
                session_id: Some(summary.id.clone()),
                owner_context_id: None,
            })
            .await
        {
            warn!(
                "agent: could not acknowledge session {}: {}",
                summary.id, e
            );
        }
        self.clear_local().await;
        self.active_index.store(-1, Ordering::SeqCst);
        Ok(AgentOutcome::Finished(summary))
    }

    /// Maps an authority rejection onto the agent's response to it.
    async fn reject(
        &self,
        summary: &SessionSummary,
        e: AuthorityError,
    ) -> Result<AgentOutcome, AgentError> {
        match e.kind() {
            ErrorKind::NotFound => {
                debug!("agent: session {} is gone: {}", summary.id, e);
                self.clear_local().await;
                Ok(AgentOutcome::Inert(InertReason::NoSession))
            }
            ErrorKind::Conflict => {
                let index = match &e {
                    AuthorityError::DispatchInFlight { index } => *index,
                    _ => summary.current_index.max(0) as usize,
                };
                info!(
                    "agent: item {} of session {} is in flight elsewhere, parking",
                    index, summary.id
                );
                Ok(AgentOutcome::Parked { index })
            }
            ErrorKind::Storage => Err(AgentError::Authority(e)),
            ErrorKind::Protocol => self.abort_session(&summary.id, &e.to_string()).await,
        }
    }

    async fn abort_session(
        &self,
        session_id: &str,
        reason: &str,
    ) -> Result<AgentOutcome, AgentError> {
        error!("agent: aborting session {}: {}", session_id, reason);
        if let Err(e) = self
            .client
            .abort(AbortRequest {
                session_id: Some(session_id.to_string()),
                owner_context_id: None,
            })
            .await
        {
            warn!("agent: abort of {} failed: {}", session_id, e);
        }
        self.clear_local().await;
        self.active_index.store(-1, Ordering::SeqCst);
        Ok(AgentOutcome::Aborted {
            reason: reason.to_string(),
        })
    }

    async fn clear_local(&self) {
        let bridge = self.bridge();
        if let Err(e) = bridge.clear().await {
            debug!("agent: could not clear resume snapshot: {}", e);
        }
        if let Err(e) = bridge.clear_context().await {
            debug!("agent: could not clear session context: {}", e);
        }
    }
}

/// One line per item, in index order: `#0 ok Blue Mug` / `#1 failed timeout`.
pub fn summary_table(summary: &SessionSummary) -> Vec<String> {
    let mut rows: Vec<(usize, String)> = summary
        .results
        .iter()
        .map(|r| {
            let title = r
                .detail
                .get("title")
                .and_then(|v| v.as_str())
                .unwrap_or("");
            (r.index, format!("#{:<3} ok     {}", r.index, title))
        })
        .chain(summary.failures.iter().map(|f| {
            (
                f.index,
                format!("#{:<3} failed {} {}", f.index, f.reason, f.message)
                    .trim_end()
                    .to_string(),
            )
        }))
        .collect();
    rows.sort_by_key(|(index, _)| *index);
    rows.into_iter().map(|(_, row)| row).collect()
}
