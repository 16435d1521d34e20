use crate::authority::SessionAuthority;
use crate::core::config::RpcSettings;
use crate::core::error::AuthorityError;
use crate::core::types::*;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum ClientError {
    /// Nobody answered; the only error that is retried.
    #[error("session authority did not respond: {0}")]
    NoResponder(String),

    #[error("authority transport failed: {0}")]
    Transport(String),

    #[error(transparent)]
    Authority(#[from] AuthorityError),
}

impl ClientError {
    pub fn authority(&self) -> Option<&AuthorityError> {
        match self {
            ClientError::Authority(e) => Some(e),
            _ => None,
        }
    }
}

/// Request/response channel from a page agent to the session authority.
#[async_trait]
pub trait AuthorityClient: Send + Sync {
    async fn start(&self, req: StartRequest) -> Result<StartResponse, ClientError>;
    async fn next(&self, req: NextRequest) -> Result<Advance, ClientError>;
    async fn report_detail(
        &self,
        req: ReportDetailRequest,
    ) -> Result<ReportDetailResponse, ClientError>;
    async fn get(&self, session_id: &str) -> Result<SessionSummary, ClientError>;
    async fn find(&self, owner_context_id: &str) -> Result<Option<SessionSummary>, ClientError>;
    async fn abort(&self, req: AbortRequest) -> Result<AbortResponse, ClientError>;
}

// ─── HTTP transport ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct HttpAuthorityClient {
    http: reqwest::Client,
    base_url: String,
    rpc: RpcSettings,
}

impl HttpAuthorityClient {
    pub fn new(base_url: impl Into<String>, rpc: RpcSettings) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .timeout(rpc.timeout)
            .connect_timeout(rpc.timeout)
            .build()
            .map_err(|e| ClientError::Transport(e.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            rpc,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn post_once<Req, Resp>(&self, url: &str, body: &Req) -> Result<Resp, ClientError>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        let response = self.http.post(url).json(body).send().await.map_err(|e| {
            if e.is_connect() {
                ClientError::NoResponder(e.to_string())
            } else {
                ClientError::Transport(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(match serde_json::from_str::<ErrorResponse>(&text) {
                Ok(err) => ClientError::Authority(AuthorityError::from_wire(
                    err.kind.as_deref(),
                    err.error,
                )),
                Err(_) => ClientError::Transport(format!("HTTP {}: {}", status, text)),
            });
        }

        response
            .json::<Resp>()
            .await
            .map_err(|e| ClientError::Transport(format!("invalid response body: {}", e)))
    }

    /// POSTs `body` to `path`, retrying only when nobody answered.
    async fn post<Req, Resp>(&self, path: &str, body: &Req) -> Result<Resp, ClientError>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        let url = format!("{}{}", self.base_url, path);
        let mut attempt = 0;
        loop {
            match self.post_once(&url, body).await {
                Err(ClientError::NoResponder(msg)) if attempt < self.rpc.retries => {
                    attempt += 1;
                    warn!(
                        "authority client: {} had no responder ({}), retry {}/{}",
                        path, msg, attempt, self.rpc.retries
                    );
                    tokio::time::sleep(self.rpc.retry_delay).await;
                }
                other => {
                    if let Err(e) = &other {
                        debug!("authority client: {} failed: {}", path, e);
                    }
                    return other;
                }
            }
        }
    }
}

#[async_trait]
impl AuthorityClient for HttpAuthorityClient {
    async fn start(&self, req: StartRequest) -> Result<StartResponse, ClientError> {
        self.post("/inline/start", &req).await
    }

    async fn next(&self, req: NextRequest) -> Result<Advance, ClientError> {
        let response: NextResponse = self.post("/inline/next", &req).await?;
        response
            .into_advance()
            .ok_or_else(|| ClientError::Transport("incomplete inline/next response".into()))
    }

    async fn report_detail(
        &self,
        req: ReportDetailRequest,
    ) -> Result<ReportDetailResponse, ClientError> {
        self.post("/inline/reportDetail", &req).await
    }

    async fn get(&self, session_id: &str) -> Result<SessionSummary, ClientError> {
        let response: GetResponse = self
            .post(
                "/inline/get",
                &GetRequest {
                    session_id: session_id.to_string(),
                },
            )
            .await?;
        Ok(response.session)
    }

    async fn find(&self, owner_context_id: &str) -> Result<Option<SessionSummary>, ClientError> {
        let response: FindResponse = self
            .post(
                "/inline/find",
                &FindRequest {
                    owner_context_id: owner_context_id.to_string(),
                },
            )
            .await?;
        Ok(response.session)
    }

    async fn abort(&self, req: AbortRequest) -> Result<AbortResponse, ClientError> {
        self.post("/inline/abort", &req).await
    }
}

// ─── In-process transport ───────────────────────────────────────────────────

/// Calls a `SessionAuthority` living in the same process.
#[derive(Debug, Clone)]
pub struct LocalAuthorityClient {
    authority: Arc<SessionAuthority>,
}

impl LocalAuthorityClient {
    pub fn new(authority: Arc<SessionAuthority>) -> Self {
        Self { authority }
    }
}

#[async_trait]
impl AuthorityClient for LocalAuthorityClient {
    async fn start(&self, req: StartRequest) -> Result<StartResponse, ClientError> {
        Ok(self.authority.start(req).await?)
    }

    async fn next(&self, req: NextRequest) -> Result<Advance, ClientError> {
        Ok(self.authority.advance(req).await?)
    }

    async fn report_detail(
        &self,
        req: ReportDetailRequest,
    ) -> Result<ReportDetailResponse, ClientError> {
        Ok(self.authority.report_detail(req).await?)
    }

    async fn get(&self, session_id: &str) -> Result<SessionSummary, ClientError> {
        Ok(self.authority.get_summary(session_id).await?)
    }

    async fn find(&self, owner_context_id: &str) -> Result<Option<SessionSummary>, ClientError> {
        Ok(self.authority.find_by_owner(owner_context_id).await)
    }

    async fn abort(&self, req: AbortRequest) -> Result<AbortResponse, ClientError> {
        Ok(self.authority.abort(req).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    #[tokio::test]
    async fn unreachable_authority_is_retried_once_then_reported() {
        // Bind and drop to get a port nobody listens on.
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let client = HttpAuthorityClient::new(
            format!("http://127.0.0.1:{}", port),
            RpcSettings {
                retries: 1,
                retry_delay: Duration::from_millis(50),
                timeout: Duration::from_secs(2),
            },
        )
        .unwrap();

        let started = Instant::now();
        let err = client.find("tab-1").await.unwrap_err();
        assert!(matches!(err, ClientError::NoResponder(_)), "got {:?}", err);
        assert!(started.elapsed() >= Duration::from_millis(50));
    }
}
