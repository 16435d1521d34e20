pub mod client;
pub mod http;

pub use client::{AuthorityClient, ClientError, HttpAuthorityClient, LocalAuthorityClient};
pub use http::router;
