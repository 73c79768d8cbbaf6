use crate::errors::{EnqueueError, JobError};
use crate::runner::{JobOptions, Queue};
use crate::schema::{Job, PRIORITY_DEFAULT};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::future::Future;
use std::time::Duration;

/// The job type used when none is specified.
pub const DEFAULT_JOB_TYPE: &str = "default";

/// Trait for defining typed jobs.
///
/// The job value itself is the payload: it is serialized when enqueued and
/// deserialized again right before [`BackgroundJob::run`] is called.
/// Register it with [`QueueBuilder::register`](crate::QueueBuilder::register).
pub trait BackgroundJob: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Unique name of the job type.
    ///
    /// This MUST be unique across everything sharing the same queue table.
    const JOB_TYPE: &'static str;

    /// Default priority of the job.
    const PRIORITY: i32 = PRIORITY_DEFAULT;

    /// Delay before a failed run is retried. `None` fails the job on the first error.
    const RETRY_INTERVAL: Option<Duration> = None;

    /// Whether the row is removed once the job is done or failed.
    const DELETE_AFTER_EXECUTION: bool = false;

    /// The application data provided to this job at runtime.
    type Context: Clone + Send + Sync + 'static;

    /// The value stored as the job's result.
    type Output: Serialize + Send;

    /// Execute the job.
    ///
    /// Return [`fail_job`](crate::fail_job) to fail without retrying.
    fn run(
        &self,
        ctx: Self::Context,
    ) -> impl Future<Output = Result<Self::Output, JobError>> + Send;

    /// The enqueue options derived from the associated constants.
    fn options() -> JobOptions {
        let options = JobOptions::new(Self::JOB_TYPE)
            .priority(Self::PRIORITY)
            .delete_after_execution(Self::DELETE_AFTER_EXECUTION);
        match Self::RETRY_INTERVAL {
            Some(interval) => options.retry_interval(interval),
            None => options,
        }
    }

    /// Enqueue this job on `queue`.
    fn enqueue(
        &self,
        queue: &Queue<Self::Context>,
    ) -> impl Future<Output = Result<Job, EnqueueError>> + Send {
        queue.add_job(self, Self::options())
    }
}
