pub mod agent;
pub mod authority;
pub mod core;
pub mod rpc;
pub mod scraping;

// --- Primary core exports ---
pub use core::types;
pub use core::types::*;
pub use core::AppState;
pub use core::{AuthorityError, ErrorKind, StoreError};

pub use agent::{AgentOutcome, PageAgent};
pub use authority::SessionAuthority;
