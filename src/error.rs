use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Malformed input: {0}")]
    MalformedInput(String),

    #[error("External system unavailable: {0}")]
    ExternalUnavailable(String),

    #[error("Git command failed: {0}")]
    Git(String),

    /// A half-created or half-removed workspace that needs manual remediation.
    #[error("Workspace at {path} left in partial state: {reason}")]
    PartialWorkspace { path: PathBuf, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Errors a batch recovers from locally by skipping to the next candidate.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
