use crate::background_job::BackgroundJob;
use crate::errors::JobError;
use crate::schema::Job;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

pub(crate) type ProcessorFn<Context> =
    Arc<dyn Fn(Context, Value) -> BoxFuture<'static, Result<Value, JobError>> + Send + Sync>;
pub(crate) type SuccessFn =
    Arc<dyn Fn(Value, i64) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;
pub(crate) type ErrorFn =
    Arc<dyn Fn(JobFailure) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// What an error handler is told about a failed run.
#[derive(Debug)]
pub struct JobFailure {
    /// The job as persisted after the failure. For a job deleted after
    /// execution this is the last state before removal.
    pub job: Job,
    /// Why the run failed.
    pub error: JobError,
}

impl JobFailure {
    /// Whether the job will run again.
    pub fn will_retry(&self) -> bool {
        !self.job.is_finished()
    }
}

struct Handlers<Context> {
    processor: Option<ProcessorFn<Context>>,
    on_success: Option<SuccessFn>,
    on_error: Option<ErrorFn>,
}

impl<Context> Default for Handlers<Context> {
    fn default() -> Self {
        Self {
            processor: None,
            on_success: None,
            on_error: None,
        }
    }
}

/// Processor, success handler and error handler per job type.
pub(crate) struct JobRegistry<Context> {
    entries: HashMap<String, Handlers<Context>>,
}

impl<Context> Default for JobRegistry<Context> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

impl<Context: Clone + Send + Sync + 'static> JobRegistry<Context> {
    pub(crate) fn set_processor<F, Fut>(&mut self, job_type: String, processor: F)
    where
        F: Fn(Context, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, JobError>> + Send + 'static,
    {
        let processor: ProcessorFn<Context> =
            Arc::new(move |ctx, data| processor(ctx, data).boxed());
        self.entries.entry(job_type).or_default().processor = Some(processor);
    }

    pub(crate) fn set_success_handler<F, Fut>(&mut self, job_type: String, handler: F)
    where
        F: Fn(Value, i64) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let handler: SuccessFn = Arc::new(move |result, id| handler(result, id).boxed());
        self.entries.entry(job_type).or_default().on_success = Some(handler);
    }

    pub(crate) fn set_error_handler<F, Fut>(&mut self, job_type: String, handler: F)
    where
        F: Fn(JobFailure) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let handler: ErrorFn = Arc::new(move |failure| handler(failure).boxed());
        self.entries.entry(job_type).or_default().on_error = Some(handler);
    }

    /// Register a typed job: the payload is deserialized into `J` and its
    /// output serialized into the result.
    ///
    /// A payload that does not deserialize can never succeed, so it fails the
    /// job permanently.
    pub(crate) fn register<J: BackgroundJob<Context = Context>>(&mut self) {
        self.set_processor(J::JOB_TYPE.to_owned(), |ctx, data| async move {
            let job: J = serde_json::from_value(data).map_err(|error| {
                JobError::Failed(format!("invalid payload for {}: {error}", J::JOB_TYPE))
            })?;
            let output = job.run(ctx).await?;
            Ok(serde_json::to_value(output).map_err(anyhow::Error::from)?)
        });
    }
}

impl<Context> JobRegistry<Context> {
    pub(crate) fn has_processor(&self, job_type: &str) -> bool {
        self.entries
            .get(job_type)
            .is_some_and(|handlers| handlers.processor.is_some())
    }

    pub(crate) fn processor(&self, job_type: &str) -> Option<ProcessorFn<Context>> {
        self.entries.get(job_type)?.processor.clone()
    }

    pub(crate) fn success_handler(&self, job_type: &str) -> Option<SuccessFn> {
        self.entries.get(job_type)?.on_success.clone()
    }

    pub(crate) fn error_handler(&self, job_type: &str) -> Option<ErrorFn> {
        self.entries.get(job_type)?.on_error.clone()
    }

    /// The job types that have a processor, sorted.
    pub(crate) fn job_types(&self) -> Vec<String> {
        let mut job_types: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, handlers)| handlers.processor.is_some())
            .map(|(job_type, _)| job_type.clone())
            .collect();
        job_types.sort_unstable();
        job_types
    }
}
