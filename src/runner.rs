use crate::background_job::{BackgroundJob, DEFAULT_JOB_TYPE};
use crate::cleaner;
use crate::codec::{Codec, JsonCodec};
use crate::errors::{EnqueueError, JobError, StoreError};
use crate::job_registry::{JobFailure, JobRegistry};
use crate::schema::{Job, NewJob, PRIORITY_DEFAULT};
use crate::storage::JobStore;
use crate::worker::{Phase, Worker};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tracing::{Instrument, debug, info, info_span, instrument};

const DEFAULT_TABLE_NAME: &str = "queue";
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

/// Configuration for a [`Queue`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    /// Name of the job table, used for logging and by [`PgStore`](crate::PgStore).
    pub table_name: String,
    /// How long to wait before polling again after finding no eligible job.
    pub poll_interval: Duration,
    /// Maximum random delay added to each poll interval.
    pub jitter: Duration,
    /// Whether jobs already marked as running may be claimed again.
    pub process_running: bool,
    /// Stop the queue as soon as a poll finds no eligible job.
    pub shutdown_when_queue_empty: bool,
    /// Finished jobs older than this are pruned while the queue is started.
    pub retention: Option<Duration>,
    /// How often pruning runs when `retention` is set.
    pub cleanup_interval: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            table_name: DEFAULT_TABLE_NAME.to_owned(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            jitter: Duration::ZERO,
            process_running: false,
            shutdown_when_queue_empty: false,
            retention: None,
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
        }
    }
}

impl QueueConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `JOB_QUEUE_TABLE` | `queue` | Job table name |
    /// | `JOB_QUEUE_POLL_INTERVAL_MS` | `1000` | Poll interval when the queue is empty |
    /// | `JOB_QUEUE_JITTER_MS` | `0` | Maximum jitter added to the poll interval |
    /// | `JOB_QUEUE_PROCESS_RUNNING` | `false` | Claim jobs already marked as running |
    /// | `JOB_QUEUE_RETENTION_SECS` | unset | Prune finished jobs older than this |
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let table_name = std::env::var("JOB_QUEUE_TABLE")
            .ok()
            .filter(|v| !v.is_empty())
            .unwrap_or(defaults.table_name);

        let poll_interval = env_u64("JOB_QUEUE_POLL_INTERVAL_MS")
            .map(Duration::from_millis)
            .unwrap_or(defaults.poll_interval);

        let jitter = env_u64("JOB_QUEUE_JITTER_MS")
            .map(Duration::from_millis)
            .unwrap_or(defaults.jitter);

        let process_running = std::env::var("JOB_QUEUE_PROCESS_RUNNING")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(defaults.process_running);

        let retention = env_u64("JOB_QUEUE_RETENTION_SECS").map(Duration::from_secs);

        Self {
            table_name,
            poll_interval,
            jitter,
            process_running,
            retention,
            ..defaults
        }
    }

    /// Set the job table name.
    pub fn with_table_name(mut self, table_name: impl Into<String>) -> Self {
        self.table_name = table_name.into();
        self
    }

    /// Set how often an empty queue is polled.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Set the poll interval in milliseconds.
    pub fn with_poll_interval_ms(self, ms: u64) -> Self {
        self.with_poll_interval(Duration::from_millis(ms))
    }

    /// Set the maximum random jitter to add to poll intervals.
    ///
    /// Jitter helps reduce thundering herd effects when several queues poll
    /// the same table. The actual jitter applied is a random value between 0
    /// and the specified duration.
    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    /// Allow claiming jobs that are already marked as running.
    ///
    /// Use this to pick up jobs left behind by a queue that died mid-run.
    pub fn with_process_running(mut self, process_running: bool) -> Self {
        self.process_running = process_running;
        self
    }

    /// Stop the queue once a poll finds nothing to do.
    pub fn shutdown_when_queue_empty(mut self) -> Self {
        self.shutdown_when_queue_empty = true;
        self
    }

    /// Prune finished jobs older than `retention` every `interval`.
    pub fn with_retention(mut self, retention: Duration, interval: Duration) -> Self {
        self.retention = Some(retention);
        self.cleanup_interval = interval;
        self
    }
}

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|v| v.parse::<u64>().ok())
}

/// Per-job settings for [`Queue::add_job`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobOptions {
    /// Selects the processor and handlers.
    pub job_type: String,
    /// Higher runs first.
    pub priority: i32,
    /// Retry failed runs after this delay; `None` fails the job on the first error.
    pub retry_interval: Option<Duration>,
    /// Do not run the job before this time.
    pub start_on: Option<DateTime<Utc>>,
    /// Remove the row once the job is done or failed.
    pub delete_after_execution: bool,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self::new(DEFAULT_JOB_TYPE)
    }
}

impl JobOptions {
    /// Options for a job of the given type, everything else default.
    pub fn new(job_type: impl Into<String>) -> Self {
        Self {
            job_type: job_type.into(),
            priority: PRIORITY_DEFAULT,
            retry_interval: None,
            start_on: None,
            delete_after_execution: false,
        }
    }

    /// Set the priority.
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Retry failed runs after `interval`.
    pub fn retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = Some(interval);
        self
    }

    /// Delay the first run until `start_on`.
    pub fn start_on(mut self, start_on: DateTime<Utc>) -> Self {
        self.start_on = Some(start_on);
        self
    }

    /// Remove the row once the job is done or failed.
    pub fn delete_after_execution(mut self, delete: bool) -> Self {
        self.delete_after_execution = delete;
        self
    }

    fn retry_interval_ms(&self) -> Option<i32> {
        self.retry_interval
            .map(|interval| i32::try_from(interval.as_millis()).unwrap_or(i32::MAX))
    }
}

/// Assembles a [`Queue`].
pub struct QueueBuilder<Context> {
    store: Arc<dyn JobStore>,
    context: Context,
    codec: Arc<dyn Codec>,
    config: QueueConfig,
    registry: JobRegistry<Context>,
}

impl<Context: Clone + Send + Sync + 'static> QueueBuilder<Context> {
    /// Use `config` instead of [`QueueConfig::default`].
    pub fn config(mut self, config: QueueConfig) -> Self {
        self.config = config;
        self
    }

    /// Store payloads and results with `codec` instead of [`JsonCodec`].
    pub fn codec(mut self, codec: impl Codec) -> Self {
        self.codec = Arc::new(codec);
        self
    }

    /// Set the processor for jobs of `job_type`.
    pub fn processor<F, Fut>(mut self, job_type: impl Into<String>, processor: F) -> Self
    where
        F: Fn(Context, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, JobError>> + Send + 'static,
    {
        self.registry.set_processor(job_type.into(), processor);
        self
    }

    /// Set the processor for the `"default"` job type.
    pub fn default_processor<F, Fut>(self, processor: F) -> Self
    where
        F: Fn(Context, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, JobError>> + Send + 'static,
    {
        self.processor(DEFAULT_JOB_TYPE, processor)
    }

    /// Call `handler` with the result and job id after a job of `job_type` succeeded.
    ///
    /// If the handler fails, the error handler for the type is called instead.
    /// The job stays done either way.
    pub fn on_success<F, Fut>(mut self, job_type: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Value, i64) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.registry.set_success_handler(job_type.into(), handler);
        self
    }

    /// Call `handler` after a job of `job_type` failed or was scheduled for a retry.
    pub fn on_error<F, Fut>(mut self, job_type: impl Into<String>, handler: F) -> Self
    where
        F: Fn(JobFailure) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.registry.set_error_handler(job_type.into(), handler);
        self
    }

    /// Register a typed job.
    pub fn register<J: BackgroundJob<Context = Context>>(mut self) -> Self {
        self.registry.register::<J>();
        self
    }

    /// Finish building. The queue starts out stopped.
    pub fn build(self) -> Queue<Context> {
        Queue {
            worker: Arc::new(Worker::new(
                self.store,
                self.registry,
                self.context,
                self.codec,
                self.config,
            )),
        }
    }
}

/// A job queue bound to one store.
///
/// At most one job runs at a time per queue. Several queues may share a store;
/// the store guarantees that each job is claimed by only one of them. Clones
/// share the same state.
pub struct Queue<Context> {
    worker: Arc<Worker<Context>>,
}

impl<Context> Clone for Queue<Context> {
    fn clone(&self) -> Self {
        Self {
            worker: self.worker.clone(),
        }
    }
}

impl<Context> Queue<Context> {
    /// Whether [`Queue::start`] was called more recently than [`Queue::stop`].
    pub fn is_started(&self) -> bool {
        self.worker.started.load(Ordering::SeqCst)
    }

    /// Whether a job is being claimed, run or completed right now.
    pub fn is_busy(&self) -> bool {
        *self.worker.phase.borrow() == Phase::Busy
    }
}

impl<Context: std::fmt::Debug> std::fmt::Debug for Queue<Context> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("job_types", &self.worker.registry.job_types())
            .field("context", &self.worker.context)
            .field("config", &self.worker.config)
            .field("started", &self.is_started())
            .finish_non_exhaustive()
    }
}

impl<Context: Clone + Send + Sync + 'static> Queue<Context> {
    /// Start assembling a queue on `store`, handing `context` to every processor.
    pub fn builder(store: impl JobStore, context: Context) -> QueueBuilder<Context> {
        QueueBuilder {
            store: Arc::new(store),
            context,
            codec: Arc::new(JsonCodec),
            config: QueueConfig::default(),
            registry: JobRegistry::default(),
        }
    }

    /// Create the job table if it does not exist. With `force`, drop it first.
    pub async fn init(&self, force: bool) -> Result<(), StoreError> {
        self.worker.store.init(force).await
    }

    /// Start processing jobs.
    ///
    /// Returns immediately; jobs are run by a background task. Calling this
    /// on a started queue only triggers an immediate poll. Must be called
    /// from within a Tokio runtime.
    pub fn start(&self) {
        let worker = &self.worker;
        if worker.request_start() {
            let span = info_span!("queue", queue.table = %worker.config.table_name);
            span.in_scope(|| {
                info!(job_types = ?worker.registry.job_types(), "Starting queue…");
            });
            tokio::spawn(worker.clone().run().instrument(span));
        } else {
            worker.wake.notify_one();
        }
    }

    /// Stop scheduling new jobs.
    ///
    /// A job that is already running is never interrupted: the returned
    /// future resolves once it has been persisted and its handlers have
    /// returned. Resolves immediately if nothing is running.
    pub async fn stop(&self) -> bool {
        let worker = &self.worker;
        worker.started.store(false, Ordering::SeqCst);
        worker.wake.notify_one();

        let mut phase = worker.phase.subscribe();
        info!(
            queue.table = %worker.config.table_name,
            running = *phase.borrow() == Phase::Busy,
            "Stopping queue…"
        );
        // The sender lives in `worker`, so this cannot fail.
        let _ = phase.wait_for(|phase| *phase != Phase::Busy).await;
        debug!(queue.table = %worker.config.table_name, "Queue stopped");
        true
    }

    /// Wait until the background task has exited, e.g. after
    /// [`QueueConfig::shutdown_when_queue_empty`] drained the queue.
    pub async fn wait_for_shutdown(&self) {
        let mut phase = self.worker.phase.subscribe();
        let _ = phase.wait_for(|phase| *phase == Phase::Stopped).await;
    }

    /// Add a job to the queue.
    ///
    /// Fails without touching the store if no processor is registered for
    /// `options.job_type`. On a started queue, this also triggers a poll.
    #[instrument(
        name = "queue.enqueue",
        skip(self, payload, options),
        fields(job.type = %options.job_type)
    )]
    pub async fn add_job<T: Serialize + ?Sized>(
        &self,
        payload: &T,
        options: JobOptions,
    ) -> Result<Job, EnqueueError> {
        let worker = &self.worker;
        if !worker.registry.has_processor(&options.job_type) {
            return Err(EnqueueError::NoProcessor(options.job_type));
        }

        let data = worker.codec.encode(&serde_json::to_value(payload)?)?;
        let retry_interval = options.retry_interval_ms();
        let job = worker
            .store
            .create(NewJob {
                job_type: options.job_type,
                priority: options.priority,
                retry_interval,
                data: Some(data),
                delete_after_execution: options.delete_after_execution,
                date_added: Utc::now(),
                date_next_run: options.start_on,
            })
            .await?;
        debug!(job.id = job.id, "Job added");

        if self.is_started() {
            worker.wake.notify_one();
        }
        Ok(job)
    }

    /// Add a typed job with the options from its associated constants.
    pub async fn enqueue<J: BackgroundJob<Context = Context>>(
        &self,
        job: &J,
    ) -> Result<Job, EnqueueError> {
        self.add_job(job, J::options()).await
    }

    /// Delete finished jobs that finished more than `age` ago.
    pub async fn prune_finished(&self, age: Duration) -> Result<u64, StoreError> {
        cleaner::prune(self.worker.store.as_ref(), age).await
    }

    /// The store this queue reads and writes.
    pub fn store(&self) -> &dyn JobStore {
        self.worker.store.as_ref()
    }

    /// The queue's configuration.
    pub fn config(&self) -> &QueueConfig {
        &self.worker.config
    }
}
