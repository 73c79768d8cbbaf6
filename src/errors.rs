use thiserror::Error;

/// Errors raised by a [`JobStore`](crate::JobStore) operation.
///
/// The operation's own transaction has been rolled back by the time one of
/// these is returned.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The database reported an error.
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    /// The configured table name cannot be used as an identifier.
    #[error("invalid table name {0:?}")]
    InvalidTableName(String),
    /// The row addressed by an update no longer exists.
    #[error("job {0} not found")]
    NotFound(i64),
}

/// Errors raised while encoding or decoding job payloads and results.
#[derive(Debug, Error)]
#[error(transparent)]
pub struct CodecError(#[from] pub serde_json::Error);

/// Errors that can occur while enqueueing a job.
#[derive(Debug, Error)]
pub enum EnqueueError {
    /// No processor is registered for the requested job type.
    #[error("No processor defined for a job of type '{0}'")]
    NoProcessor(String),
    /// The payload could not be serialized.
    #[error("failed to serialize job payload: {0}")]
    Serialization(#[from] CodecError),
    /// The job row could not be written.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<serde_json::Error> for EnqueueError {
    fn from(error: serde_json::Error) -> Self {
        Self::Serialization(CodecError(error))
    }
}

/// The outcome of a failed processor run.
///
/// [`JobError::Failed`] marks the job as failed for good, even when it has a
/// retry interval. Anything else is retried if the job allows it.
#[derive(Debug, Error)]
pub enum JobError {
    /// Permanent failure, see [`fail_job`].
    #[error("{0}")]
    Failed(String),
    /// Any other failure.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl JobError {
    /// Whether this error ends the job regardless of its retry policy.
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::Failed(_))
    }

    /// The value stored in the `result` column of a failed job.
    pub fn to_value(&self) -> serde_json::Value {
        serde_json::json!({
            "name": if self.is_permanent() { "JobFailedError" } else { "Error" },
            "message": self.to_string(),
        })
    }
}

/// Build the permanent-failure signal from inside a processor.
///
/// ```
/// # use job_queue::{fail_job, JobError};
/// # fn check(amount: i64) -> Result<(), JobError> {
/// if amount < 0 {
///     return Err(fail_job("negative amounts are never valid"));
/// }
/// # Ok(())
/// # }
/// ```
pub fn fail_job(message: impl Into<String>) -> JobError {
    JobError::Failed(message.into())
}
