use std::path::PathBuf;
use thiserror::Error;

/// Failure of a single item. Never aborts the batch: the orchestrator converts
/// every variant into a quarantine move with a reason sidecar.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ItemError {
    #[error("could not classify file: {0}")]
    ParseFailure(String),

    #[error("no metadata match: {0}")]
    ResolutionNotFound(String),

    #[error("ambiguous metadata match: {0}")]
    ResolutionAmbiguous(String),

    #[error("destination already exists with different content: {}", .0.display())]
    DestinationCollision(PathBuf),

    #[error("filesystem operation failed: {0}")]
    FilesystemFailure(String),

    #[error("encode failed: {0}")]
    EncodeFailure(String),

    /// Still sitting in Queue or Staged when cleanup ran
    #[error("left over after processing: {0}")]
    Leftover(String),
}

impl ItemError {
    /// Stable name of the error kind, written into reason sidecars
    pub fn kind(&self) -> &'static str {
        match self {
            ItemError::ParseFailure(_) => "ParseFailure",
            ItemError::ResolutionNotFound(_) => "ResolutionNotFound",
            ItemError::ResolutionAmbiguous(_) => "ResolutionAmbiguous",
            ItemError::DestinationCollision(_) => "DestinationCollision",
            ItemError::FilesystemFailure(_) => "FilesystemFailure",
            ItemError::EncodeFailure(_) => "EncodeFailure",
            ItemError::Leftover(_) => "Leftover",
        }
    }
}

/// Conditions that abort the whole run before any file is touched
#[derive(Debug, Error)]
pub enum FatalError {
    #[error("encoder unavailable: {0}")]
    EncoderUnavailable(String),

    #[error("missing credential: environment variable {0} is not set")]
    CredentialMissing(&'static str),

    #[error("invalid media root {}: {reason}", .path.display())]
    InvalidRoot { path: PathBuf, reason: String },
}
