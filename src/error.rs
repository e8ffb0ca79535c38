//! Job-scoped error taxonomy.
//!
//! Candidate-scoped problems (timeouts, access walls, empty extractions,
//! relevance misses) never reach this type; they are absorbed by the
//! collector and extractor and surface as a skipped candidate.

use thiserror::Error;

use crate::session::SessionError;

#[derive(Debug, Error)]
pub enum JobError {
    /// The browsing session could not be resolved; fails before any navigation.
    #[error(transparent)]
    Session(#[from] SessionError),

    /// The operator asked the job to stop.
    #[error("job cancelled by request")]
    Cancelled,

    #[error("job {0} not found")]
    NotFound(i64),

    /// The job record cannot be executed as stored.
    #[error("job {id} cannot run: {reason}")]
    InvalidState { id: i64, reason: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl JobError {
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

pub type JobResult<T> = std::result::Result<T, JobError>;
