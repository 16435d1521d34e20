//! Live browser plumbing for the walker: launching Chromium and exposing a
//! tab as a `PageHost`.

pub mod browser_manager;
pub mod cdp_host;

pub use cdp_host::CdpPageHost;
