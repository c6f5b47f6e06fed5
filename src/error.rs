use serde::Serialize;
use uuid::Uuid;

/// Failure reported by the outbound SMS provider. Surfaced verbatim to the job's caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[error("{message}")]
pub struct SendError {
    pub message: String,
}

impl SendError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Internal faults of a limiter. These are not caused by any single job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
pub enum LimiterError {
    #[error("state lock of limiter '{0}' is poisoned")]
    Poisoned(String),
    #[error("parent of limiter '{0}' is no longer alive")]
    ParentGone(String),
    #[error("job {job_id} panicked while running on limiter '{limiter}'")]
    JobPanicked { limiter: String, job_id: Uuid },
    #[error("job {0} was abandoned before it produced a result")]
    Abandoned(Uuid),
}

#[derive(Debug, thiserror::Error)]
pub enum ThrottlerError {
    #[error("send failed: {0}")]
    Send(#[from] SendError),

    #[error("job {job_id} dropped by limiter '{limiter}': backlog ceiling of {ceiling} reached")]
    Dropped {
        job_id: Uuid,
        limiter: String,
        ceiling: usize,
    },

    #[error("limiter error: {0}")]
    Limiter(#[from] LimiterError),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("runtime error: {0}")]
    Runtime(String),
}

impl ThrottlerError {
    pub fn is_dropped(&self) -> bool {
        matches!(self, ThrottlerError::Dropped { .. })
    }
}

impl From<validator::ValidationErrors> for ThrottlerError {
    fn from(err: validator::ValidationErrors) -> Self {
        ThrottlerError::Validation(err.to_string())
    }
}

pub type ThrottlerResult<T> = Result<T, ThrottlerError>;
