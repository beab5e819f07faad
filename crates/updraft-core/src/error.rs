use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Kind tag stored with every recorded session error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    DownloadFailed,
    MergeFailed,
    ExtractionFailed,
    ReplacementFailed,
    MigrationFailed,
    SessionCorrupt,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DownloadFailed => "download_failed",
            Self::MergeFailed => "merge_failed",
            Self::ExtractionFailed => "extraction_failed",
            Self::ReplacementFailed => "replacement_failed",
            Self::MigrationFailed => "migration_failed",
            Self::SessionCorrupt => "session_corrupt",
        }
    }
}

#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("network error: {0}")]
    Network(String),

    #[error("integrity check failed for {subject}: expected {expected}, got {actual}")]
    Integrity {
        subject: String,
        expected: String,
        actual: String,
    },

    #[error("missing chunks: {}", join_indices(.0))]
    MissingChunks(Vec<u32>),

    #[error("archive is corrupt: {0}")]
    ArchiveCorrupt(String),

    #[error("migration failed: {0}")]
    Migration(String),

    #[error("invalid session state: {0}")]
    SessionState(String),

    #[error("session is corrupt: {0}")]
    SessionCorrupt(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type UpdateResult<T> = Result<T, UpdateError>;

impl UpdateError {
    pub fn session_state(message: impl Into<String>) -> Self {
        Self::SessionState(message.into())
    }

    /// Whether the caller may retry the same operation without operator help.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Network(_) | Self::Integrity { .. } | Self::MissingChunks(_) => true,
            Self::ArchiveCorrupt(_) => true,
            Self::Migration(_) | Self::SessionState(_) | Self::SessionCorrupt(_) => false,
            Self::Other(_) => true,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Network(_) => "network",
            Self::Integrity { .. } => "integrity",
            Self::MissingChunks(_) => "missing-chunks",
            Self::ArchiveCorrupt(_) => "archive-corrupt",
            Self::Migration(_) => "migration",
            Self::SessionState(_) => "session-state",
            Self::SessionCorrupt(_) => "session-corrupt",
            Self::Other(_) => "io",
        }
    }
}

fn join_indices(indices: &[u32]) -> String {
    indices
        .iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// A single archive entry or staged file that could not be processed.
///
/// Batch operations collect these instead of aborting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryFailure {
    pub path: String,
    pub message: String,
}

impl EntryFailure {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}
