use std::path::PathBuf;
use thiserror::Error;

/// Everything that can stop a decomposition.
///
/// Per-pattern non-convergence is not represented here: a pattern that runs
/// out of iterations simply stabilizes and is accepted or rejected on its
/// merits.
#[derive(Debug, Error)]
pub enum SubtypeError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Dimension mismatch: {0}")]
    DimensionMismatch(String),

    #[error("Malformed input in {} at line {line}: {reason}", .path.display())]
    MalformedInput {
        path: PathBuf,
        line: usize,
        reason: String,
    },

    #[error(
        "Resource budget exhausted in restart {restart} after {completed_slots} of {total_slots} pattern slots: {reason}"
    )]
    ResourceExhaustion {
        restart: usize,
        completed_slots: usize,
        total_slots: usize,
        reason: String,
    },

    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to build worker pool: {0}")]
    WorkerPool(#[from] rayon::ThreadPoolBuildError),
}

impl SubtypeError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        SubtypeError::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn malformed(path: impl Into<PathBuf>, line: usize, reason: impl Into<String>) -> Self {
        SubtypeError::MalformedInput {
            path: path.into(),
            line,
            reason: reason.into(),
        }
    }
}

pub type Result<T, E = SubtypeError> = std::result::Result<T, E>;
