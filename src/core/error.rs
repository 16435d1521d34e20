use thiserror::Error;

/// Coarse error class carried on the wire so clients can rebuild the error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Invalid index, malformed report, wrong owner: state corruption, never retried.
    Protocol,
    NotFound,
    /// Another agent holds the in-flight dispatch.
    Conflict,
    Storage,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Protocol => "protocol",
            ErrorKind::NotFound => "not-found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Storage => "storage",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum AuthorityError {
    #[error("item list is empty")]
    EmptySession,

    #[error("session {0} does not exist or has already finished")]
    SessionNotFound(String),

    #[error("session {session_id} belongs to another browsing context")]
    NotOwner { session_id: String },

    #[error("report index {index} is outside 0..{total}")]
    IndexOutOfRange { index: usize, total: usize },

    #[error("report for index {index} does not match the dispatched index {expected:?}")]
    IndexMismatch { index: usize, expected: Option<usize> },

    #[error("report must carry exactly one of detail or failure")]
    MalformedReport,

    #[error("item {index} is already dispatched to another agent")]
    DispatchInFlight { index: usize },

    #[error("session storage failed: {0}")]
    Storage(String),

    /// Error reported by a remote authority, rebuilt from its wire kind.
    #[error("{message}")]
    Rejected { kind: ErrorKind, message: String },
}

impl AuthorityError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AuthorityError::SessionNotFound(_) => ErrorKind::NotFound,
            AuthorityError::DispatchInFlight { .. } => ErrorKind::Conflict,
            AuthorityError::Storage(_) => ErrorKind::Storage,
            AuthorityError::Rejected { kind, .. } => *kind,
            AuthorityError::EmptySession
            | AuthorityError::NotOwner { .. }
            | AuthorityError::IndexOutOfRange { .. }
            | AuthorityError::IndexMismatch { .. }
            | AuthorityError::MalformedReport => ErrorKind::Protocol,
        }
    }

    /// Rebuilds an error received over the wire. Unknown kinds are treated
    /// as protocol errors.
    pub fn from_wire(kind: Option<&str>, message: String) -> Self {
        let kind = match kind {
            Some("not-found") => ErrorKind::NotFound,
            Some("conflict") => ErrorKind::Conflict,
            Some("storage") => ErrorKind::Storage,
            _ => ErrorKind::Protocol,
        };
        AuthorityError::Rejected { kind, message }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("store record {key} is not valid json: {source}")]
    Corrupt {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("store directory {0} is locked by another process")]
    Locked(String),
}

impl From<StoreError> for AuthorityError {
    fn from(e: StoreError) -> Self {
        AuthorityError::Storage(e.to_string())
    }
}
