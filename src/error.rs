use thiserror::Error;

#[derive(Error, Debug)]
pub enum PogoError {
    #[error("Invalid job spec: {0}")]
    InvalidSpec(String),

    #[error("Unknown namespace: {0}")]
    UnknownNamespace(String),

    #[error("Unknown tag: {0}")]
    UnknownTag(String),

    #[error("Coordination store unavailable: {0}")]
    CoordinationStoreUnavailable(String),

    #[error("Compare-and-set conflict at {path}")]
    CasConflict { path: String },

    #[error("Worker lost: {0}")]
    WorkerLost(String),

    #[error("Dispatch rejected: {0}")]
    DispatchRejected(String),

    #[error("Timed out")]
    Timeout,

    #[error("Cancelled")]
    Cancelled,

    #[error("Deadlock detected for host {hostname}")]
    DeadlockDetected { hostname: String },

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Not implemented: {0}")]
    NotImplemented(&'static str),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl PogoError {
    /// Stable machine-readable kind carried in API error payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            PogoError::InvalidSpec(_) => "InvalidSpec",
            PogoError::UnknownNamespace(_) => "UnknownNamespace",
            PogoError::UnknownTag(_) => "UnknownTag",
            PogoError::CoordinationStoreUnavailable(_) => "CoordinationStoreUnavailable",
            PogoError::CasConflict { .. } => "CASConflict",
            PogoError::WorkerLost(_) => "WorkerLost",
            PogoError::DispatchRejected(_) => "DispatchRejected",
            PogoError::Timeout => "Timeout",
            PogoError::Cancelled => "Cancelled",
            PogoError::DeadlockDetected { .. } => "DeadlockDetected",
            PogoError::JobNotFound(_) => "JobNotFound",
            PogoError::NotImplemented(_) => "NotImplemented",
            PogoError::Internal(_) => "Internal",
        }
    }
}

impl From<serde_json::Error> for PogoError {
    fn from(e: serde_json::Error) -> Self {
        PogoError::Internal(format!("JSON error: {}", e))
    }
}

pub type Result<T> = std::result::Result<T, PogoError>;
