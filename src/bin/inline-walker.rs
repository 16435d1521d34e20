//! Drives a real browser tab through an inline collection.
//!
//! Usage: inline-walker <list-url> [--authority URL] [--limit N] [--headless] [--profile DIR]
//!
//! The walker opens the list page, starts a session against a running
//! `inline-collector` authority and then builds a fresh page agent for every
//! document the tab lands on, until the session finishes. The final session
//! summary is printed to stdout as JSON.

use anyhow::{anyhow, bail, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use inline_collector::agent::{AgentError, AgentOutcome, PageAgent, PageHost, SiteRegistry};
use inline_collector::core::config::{load_collector_config, AgentSettings};
use inline_collector::rpc::{AuthorityClient, HttpAuthorityClient};
use inline_collector::scraping::browser_manager::{self, LaunchOptions};
use inline_collector::scraping::CdpPageHost;

const NAVIGATION_TIMEOUT: Duration = Duration::from_secs(30);
const PARK_RETRY_DELAY: Duration = Duration::from_secs(2);
const MAX_PARKED_RETRIES: usize = 15;
const MAX_TRANSPORT_RETRIES: usize = 5;

#[derive(Debug, Default)]
struct WalkerArgs {
    list_url: Option<String>,
    authority: Option<String>,
    limit: Option<usize>,
    headless: bool,
    profile: Option<PathBuf>,
}

fn parse_args() -> Result<WalkerArgs> {
    let mut out = WalkerArgs::default();
    let mut args = std::env::args().skip(1);
    while let Some(a) = args.next() {
        let mut value = |flag: &str| {
            args.next()
                .ok_or_else(|| anyhow!("{} needs a value", flag))
        };
        match a.as_str() {
            "--authority" => out.authority = Some(value("--authority")?),
            "--limit" => {
                let raw = value("--limit")?;
                out.limit = Some(
                    raw.parse()
                        .map_err(|_| anyhow!("--limit expects a number, got {}", raw))?,
                );
            }
            "--profile" => out.profile = Some(PathBuf::from(value("--profile")?)),
            "--headless" => out.headless = true,
            _ if a.starts_with("--") => bail!("unknown flag {}", a),
            _ => out.list_url = Some(a.clone()),
        }
    }
    Ok(out)
}

/// Waits until the tab has left `previous` and the new document settled.
async fn wait_for_new_document(host: &CdpPageHost, previous: &str) -> Result<String> {
    let deadline = tokio::time::Instant::now() + NAVIGATION_TIMEOUT;
    loop {
        if let Ok(url) = host.current_url().await {
            if url != previous && url != "about:blank" {
                browser_manager::wait_until_settled(
                    host.page(),
                    Duration::from_millis(800),
                    Duration::from_secs(10),
                )
                .await;
                return Ok(url);
            }
        }
        if tokio::time::Instant::now() >= deadline {
            bail!("tab did not leave {} within {:?}", previous, NAVIGATION_TIMEOUT);
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}

struct Walker {
    host: Arc<CdpPageHost>,
    client: Arc<dyn AuthorityClient>,
    sites: Arc<SiteRegistry>,
    settings: AgentSettings,
}

impl Walker {
    fn agent(&self) -> PageAgent {
        PageAgent::new(self.host.clone(), self.client.clone(), self.sites.clone())
            .with_settings(self.settings.clone())
    }

    async fn walk(&self) -> Result<AgentOutcome> {
        let mut outcome = self.agent().start_collection().await;
        let mut parked = 0;
        let mut transport_failures = 0;

        loop {
            let current = self.host.current_url().await.unwrap_or_default();
            match outcome {
                Ok(AgentOutcome::NavigatingToDetail { index }) => {
                    info!("walker: opening item {}", index);
                    wait_for_new_document(&self.host, &current).await?;
                    parked = 0;
                }
                Ok(AgentOutcome::ReturningToList { index }) => {
                    info!("walker: item {} recorded, back to the list", index);
                    wait_for_new_document(&self.host, &current).await?;
                    parked = 0;
                }
                Ok(AgentOutcome::Parked { index }) => {
                    parked += 1;
                    if parked > MAX_PARKED_RETRIES {
                        bail!("item {} stayed in flight elsewhere, giving up", index);
                    }
                    tokio::time::sleep(PARK_RETRY_DELAY).await;
                }
                Ok(AgentOutcome::Inert(reason)) => {
                    bail!("page agent went inert on {}: {:?}", current, reason);
                }
                Ok(done @ (AgentOutcome::Finished(_) | AgentOutcome::Aborted { .. })) => {
                    return Ok(done);
                }
                Err(AgentError::Transport(e)) => {
                    transport_failures += 1;
                    if transport_failures > MAX_TRANSPORT_RETRIES {
                        bail!("authority unreachable: {}", e);
                    }
                    warn!("walker: {} (retry {})", e, transport_failures);
                    tokio::time::sleep(PARK_RETRY_DELAY).await;
                }
                Err(e) => return Err(e.into()),
            }
            outcome = self.agent().run().await;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    let args = parse_args()?;
    let Some(list_url) = args.list_url.clone() else {
        bail!("usage: inline-walker <list-url> [--authority URL] [--limit N] [--headless] [--profile DIR]");
    };

    let config = load_collector_config();
    let authority_url = args
        .authority
        .clone()
        .unwrap_or_else(|| config.agent.resolve_authority_url());
    let client = HttpAuthorityClient::new(&authority_url, config.agent.resolve_rpc())?;
    let mut settings = config.agent.resolve_settings();
    if args.limit.is_some() {
        settings.collect_limit = args.limit;
    }

    let (mut browser, handler) = browser_manager::launch(&LaunchOptions {
        headless: args.headless,
        user_data_dir: args.profile.clone(),
        ..LaunchOptions::default()
    })
    .await?;
    let page = browser_manager::open_tab(&browser, &list_url).await?;
    browser_manager::wait_until_settled(&page, Duration::from_millis(800), Duration::from_secs(15))
        .await;

    let walker = Walker {
        host: Arc::new(CdpPageHost::new(page)),
        client: Arc::new(client),
        sites: Arc::new(SiteRegistry::new(config.resolve_sites())),
        settings,
    };
    info!(
        "walker: tab {} collecting {} via {}",
        walker.host.context_id(),
        list_url,
        authority_url
    );

    let result = tokio::select! {
        r = walker.walk() => r,
        _ = tokio::signal::ctrl_c() => {
            warn!("walker: interrupted, aborting the session");
            if let Err(e) = walker.agent().abort_collection().await {
                warn!("walker: abort failed: {}", e);
            }
            Err(anyhow!("interrupted"))
        }
    };

    if let Err(e) = browser.close().await {
        warn!("walker: browser close error (non-fatal): {}", e);
    }
    handler.abort();

    match result? {
        AgentOutcome::Finished(summary) => {
            println!("{}", serde_json::to_string_pretty(&summary)?);
            Ok(())
        }
        AgentOutcome::Aborted { reason } => bail!("session aborted: {}", reason),
        other => bail!("walker stopped unexpectedly: {:?}", other),
    }
}
