pub mod notify;
pub mod service;
pub mod session;
pub mod store;

pub use notify::ItemResultNotifier;
pub use service::SessionAuthority;
pub use store::{JsonDirStore, KeyValueStore, MemoryStore};
