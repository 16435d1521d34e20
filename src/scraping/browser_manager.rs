//! Browser discovery and launch for the walker.
//!
//! The walker drives one visible (or headless) Chromium-family browser with
//! a single tab. Page agents never touch `chromiumoxide` directly; they go
//! through `CdpPageHost`.

use anyhow::{anyhow, Result};
use chromiumoxide::browser::BrowserConfig;
use chromiumoxide::cdp::browser_protocol::page::AddScriptToEvaluateOnNewDocumentParams;
use chromiumoxide::handler::viewport::Viewport;
use chromiumoxide::{Browser, Page};
use futures::StreamExt;
use rand::seq::IndexedRandom;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const DESKTOP_USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/132.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/132.0.0.0 Safari/537.36",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/132.0.0.0 Safari/537.36 Edg/132.0.0.0",
];

/// Injected before any page script so storefront bot checks see a regular
/// browser.
const AUTOMATION_MASK_SCRIPT: &str = r#"
Object.defineProperty(navigator, 'webdriver', { get: () => undefined });
Object.defineProperty(navigator, 'languages', { get: () => ['zh-CN', 'zh', 'en'] });
"#;

pub fn random_user_agent() -> &'static str {
    let mut rng = rand::rng();
    DESKTOP_USER_AGENTS
        .choose(&mut rng)
        .copied()
        .unwrap_or(DESKTOP_USER_AGENTS[0])
}

/// Finds a Chromium-family executable: `CHROME_EXECUTABLE`, then `PATH`,
/// then the usual install locations.
pub fn find_chrome_executable() -> Option<String> {
    if let Ok(p) = std::env::var("CHROME_EXECUTABLE") {
        if Path::new(&p).exists() {
            return Some(p);
        }
    }

    if let Ok(path_var) = std::env::var("PATH") {
        let names = [
            "google-chrome",
            "chromium",
            "chromium-browser",
            "brave-browser",
            "chrome",
        ];
        for dir in std::env::split_paths(&path_var) {
            for name in names {
                let full = dir.join(name);
                if full.exists() {
                    return Some(full.to_string_lossy().to_string());
                }
            }
        }
    }

    #[cfg(target_os = "macos")]
    let known: &[&str] = &[
        "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
        "/Applications/Chromium.app/Contents/MacOS/Chromium",
        "/Applications/Brave Browser.app/Contents/MacOS/Brave Browser",
    ];
    #[cfg(target_os = "windows")]
    let known: &[&str] = &[
        r"C:\Program Files\Google\Chrome\Application\chrome.exe",
        r"C:\Program Files (x86)\Google\Chrome\Application\chrome.exe",
        r"C:\Program Files (x86)\Microsoft\Edge\Application\msedge.exe",
    ];
    #[cfg(not(any(target_os = "macos", target_os = "windows")))]
    let known: &[&str] = &[
        "/usr/bin/google-chrome",
        "/usr/bin/chromium",
        "/usr/bin/chromium-browser",
        "/usr/local/bin/chromium",
    ];

    known
        .iter()
        .find(|p| Path::new(p).exists())
        .map(|p| p.to_string())
}

#[derive(Debug, Clone)]
pub struct LaunchOptions {
    /// Storefronts log in through the visible window, so headful is the default.
    pub headless: bool,
    pub width: u32,
    pub height: u32,
    /// Reusing a profile keeps storefront logins between runs.
    pub user_data_dir: Option<PathBuf>,
}

impl Default for LaunchOptions {
    fn default() -> Self {
        Self {
            headless: false,
            width: 1366,
            height: 900,
            user_data_dir: None,
        }
    }
}

pub fn build_launch_config(exe: &str, opts: &LaunchOptions) -> Result<BrowserConfig> {
    let mut builder = BrowserConfig::builder()
        .chrome_executable(exe)
        .viewport(Viewport {
            width: opts.width,
            height: opts.height,
            device_scale_factor: Some(1.0),
            emulating_mobile: false,
            is_landscape: true,
            has_touch: false,
        })
        .window_size(opts.width, opts.height)
        .arg("--no-first-run")
        .arg("--no-default-browser-check")
        .arg("--disable-dev-shm-usage")
        .arg("--disable-blink-features=AutomationControlled")
        .arg(format!("--user-agent={}", random_user_agent()));

    if !opts.headless {
        builder = builder.with_head();
    }
    if let Some(dir) = &opts.user_data_dir {
        builder = builder.user_data_dir(dir);
    }

    builder
        .build()
        .map_err(|e| anyhow!("Failed to build browser config: {}", e))
}

/// Launches the browser and spawns its CDP event handler.
pub async fn launch(opts: &LaunchOptions) -> Result<(Browser, JoinHandle<()>)> {
    let exe = find_chrome_executable().ok_or_else(|| {
        anyhow!("No browser found. Install Chrome or Chromium, or set CHROME_EXECUTABLE.")
    })?;
    info!(
        "browser: launching {} ({})",
        exe,
        if opts.headless { "headless" } else { "headful" }
    );

    let config = build_launch_config(&exe, opts)?;
    let (browser, mut handler) = Browser::launch(config)
        .await
        .map_err(|e| anyhow!("Failed to launch browser ({}): {}", exe, e))?;

    let handle = tokio::spawn(async move {
        while let Some(event) = handler.next().await {
            if let Err(e) = event {
                warn!("browser: CDP handler error: {}", e);
            }
        }
    });
    Ok((browser, handle))
}

/// Opens the walker's tab with the automation mask installed, then loads `url`.
pub async fn open_tab(browser: &Browser, url: &str) -> Result<Page> {
    let page = browser
        .new_page("about:blank")
        .await
        .map_err(|e| anyhow!("Failed to create page: {}", e))?;
    page.execute(AddScriptToEvaluateOnNewDocumentParams::new(
        AUTOMATION_MASK_SCRIPT,
    ))
    .await
    .map_err(|e| anyhow!("Failed to install automation mask: {}", e))?;
    page.goto(url)
        .await
        .map_err(|e| anyhow!("Failed to open {}: {}", url, e))?;
    Ok(page)
}

/// Waits for `document.readyState == "complete"` and a quiet resource
/// timeline, or gives up after `timeout`.
pub async fn wait_until_settled(page: &Page, quiet: Duration, timeout: Duration) {
    let poll = Duration::from_millis(250);
    let started = tokio::time::Instant::now();
    let mut last_count = 0u64;
    let mut stable_since = tokio::time::Instant::now();

    while started.elapsed() < timeout {
        let state = page
            .evaluate("[document.readyState, performance.getEntriesByType('resource').length]")
            .await
            .ok()
            .and_then(|v| v.into_value::<serde_json::Value>().ok());
        let complete = state
            .as_ref()
            .and_then(|s| s.get(0))
            .and_then(|s| s.as_str())
            == Some("complete");
        let count = state
            .as_ref()
            .and_then(|s| s.get(1))
            .and_then(|c| c.as_u64())
            .unwrap_or(0);

        if !complete || count != last_count {
            last_count = count;
            stable_since = tokio::time::Instant::now();
        } else if stable_since.elapsed() >= quiet {
            debug!(
                "browser: settled after {:?} ({} resources)",
                started.elapsed(),
                count
            );
            return;
        }
        tokio::time::sleep(poll).await;
    }
    debug!("browser: page still busy after {:?}", timeout);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_agents_come_from_the_pool() {
        assert!(DESKTOP_USER_AGENTS.contains(&random_user_agent()));
    }

    #[test]
    fn headful_by_default() {
        assert!(!LaunchOptions::default().headless);
    }
}
