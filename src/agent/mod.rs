//! Page-side half of inline collection: role detection, list pre-scrape,
//! detail scraping and the per-page-load driver.

pub mod bridge;
pub mod driver;
pub mod host;
pub mod items;
pub mod roles;
pub mod scrape;
pub mod wait;

pub use bridge::{same_list_url, ContextRecord, ResumeBridge, ResumeSnapshot};
pub use driver::{AgentError, AgentOutcome, InertReason, PageAgent};
pub use host::{FilterControlSnapshot, HostError, PageHost};
pub use roles::{Detection, PageType, SiteDefinition, SiteRegistry};
pub use scrape::{DetailScraper, RenderedPage, SelectorScraper};
