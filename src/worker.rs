use crate::cleaner::Cleaner;
use crate::codec::Codec;
use crate::errors::{JobError, StoreError};
use crate::job_registry::{JobFailure, JobRegistry};
use crate::runner::QueueConfig;
use crate::schema::Job;
use crate::storage::JobStore;
use crate::util::try_to_extract_panic_info;
use anyhow::anyhow;
use chrono::{TimeDelta, Utc};
use futures_util::FutureExt;
use rand::Rng;
use serde_json::Value;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Notify, watch};
use tokio::task::AbortHandle;
use tokio::time::sleep;
use tracing::{Instrument, debug, error, info, info_span, trace, warn};

/// Where the background task is. `Busy` is the in-flight marker: it covers a
/// whole run attempt from claim until the handlers have returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    /// No background task.
    Stopped,
    /// Between attempts, or waiting for the next poll.
    Idle,
    /// Claiming, running or completing a job.
    Busy,
}

/// State shared between a [`Queue`](crate::Queue) and its background task.
pub(crate) struct Worker<Context> {
    pub(crate) store: Arc<dyn JobStore>,
    pub(crate) registry: JobRegistry<Context>,
    pub(crate) context: Context,
    pub(crate) codec: Arc<dyn Codec>,
    pub(crate) config: QueueConfig,
    pub(crate) started: AtomicBool,
    /// Bumped by every `start()`, so a drained loop can tell it was restarted.
    starts: AtomicU64,
    pub(crate) phase: watch::Sender<Phase>,
    /// Cuts the poll delay short.
    pub(crate) wake: Notify,
}

impl<Context: Clone + Send + Sync + 'static> Worker<Context> {
    pub(crate) fn new(
        store: Arc<dyn JobStore>,
        registry: JobRegistry<Context>,
        context: Context,
        codec: Arc<dyn Codec>,
        config: QueueConfig,
    ) -> Self {
        Self {
            store,
            registry,
            context,
            codec,
            config,
            started: AtomicBool::new(false),
            starts: AtomicU64::new(0),
            phase: watch::channel(Phase::Stopped).0,
            wake: Notify::new(),
        }
    }

    /// Calculate the sleep duration with random jitter applied.
    fn sleep_duration_with_jitter(&self) -> Duration {
        let jitter = self.config.jitter;
        if jitter.is_zero() {
            return self.config.poll_interval;
        }

        let jitter_millis = u64::try_from(jitter.as_millis()).unwrap_or(u64::MAX);
        let random_jitter = rand::thread_rng().gen_range(0..=jitter_millis);
        self.config.poll_interval + Duration::from_millis(random_jitter)
    }

    /// Wait for the poll interval, or less if a job is added in the meantime.
    async fn backoff(&self) {
        let delay = self.sleep_duration_with_jitter();
        tokio::select! {
            () = sleep(delay) => debug!("Automatic queue run"),
            () = self.wake.notified() => trace!("Queue run triggered"),
        }
    }

    /// Record a `start()`. Returns true if a new background task must be spawned.
    pub(crate) fn request_start(&self) -> bool {
        let mut spawn = false;
        self.phase.send_if_modified(|phase| {
            self.started.store(true, Ordering::SeqCst);
            self.starts.fetch_add(1, Ordering::SeqCst);
            if *phase == Phase::Stopped {
                *phase = Phase::Idle;
                spawn = true;
            }
            spawn
        });
        spawn
    }

    /// Mark the start of a run attempt, or record that the task is exiting.
    ///
    /// Checked and set under the watch lock so that a concurrent `start()`
    /// either sees `Stopped` and spawns a new task, or is seen here. Returns
    /// the start count the attempt runs under.
    fn begin_attempt(&self) -> Option<u64> {
        let mut starts = None;
        self.phase.send_modify(|phase| {
            if self.started.load(Ordering::SeqCst) {
                starts = Some(self.starts.load(Ordering::SeqCst));
                *phase = Phase::Busy;
            } else {
                *phase = Phase::Stopped;
            }
        });
        starts
    }

    /// Stop after an empty poll, unless `start()` was called since `starts` was read.
    fn drain(&self, starts: u64) {
        self.phase.send_if_modified(|_| {
            if self.starts.load(Ordering::SeqCst) == starts {
                self.started.store(false, Ordering::SeqCst);
            }
            false
        });
    }

    /// Run jobs until the queue is stopped.
    ///
    /// A claimed job is followed by another attempt straight away; only an
    /// empty poll or a store error waits for the poll interval.
    pub(crate) async fn run(self: Arc<Self>) {
        let mut guard = ExitGuard {
            worker: &*self,
            cleaner: Cleaner::for_config(&self.config, self.store.clone()).map(Cleaner::start),
            clean_exit: false,
        };

        while let Some(starts) = self.begin_attempt() {
            let result = self.run_next_job().await;
            self.phase.send_replace(Phase::Idle);

            match result {
                Ok(Some(_)) => tokio::task::yield_now().await,
                Ok(None) if self.config.shutdown_when_queue_empty => {
                    debug!("No pending jobs found. Shutting down the queue…");
                    self.drain(starts);
                }
                Ok(None) => {
                    trace!("No pending jobs found. Polling again later…");
                    self.backoff().await;
                }
                Err(error) => {
                    error!("Failed to run job: {error}");
                    self.backoff().await;
                }
            }
        }

        guard.clean_exit = true;
        info!("Queue stopped");
    }

    /// Run the next job in the queue, if there is one.
    ///
    /// Returns:
    /// - `Ok(Some(job_id))` if a job was run
    /// - `Ok(None)` if no jobs were waiting
    /// - `Err(...)` if the claim or the final write failed
    async fn run_next_job(&self) -> Result<Option<i64>, StoreError> {
        trace!("Looking for next job…");
        let claimed = self
            .store
            .claim_next(Utc::now(), self.config.process_running)
            .await?;

        let Some(job) = claimed else {
            return Ok(None);
        };

        let job_id = job.id;
        let span = info_span!("job", job.id = %job.id, job.type = %job.job_type);
        async move {
            debug!("Running job…");
            let outcome = self.execute(&job).await;
            self.complete(job, outcome).await
        }
        .instrument(span)
        .await?;

        Ok(Some(job_id))
    }

    /// Invoke the processor and encode its value.
    ///
    /// A panicking processor counts as an ordinary failure.
    async fn execute(&self, job: &Job) -> Result<String, JobError> {
        let processor = self
            .registry
            .processor(&job.job_type)
            .ok_or_else(|| anyhow!("Unknown job type {}", job.job_type))?;
        let data = self
            .codec
            .decode_column(job.data.as_deref())
            .map_err(anyhow::Error::from)?;

        let context = self.context.clone();
        let value = AssertUnwindSafe(async move { processor(context, data).await })
            .catch_unwind()
            .await
            .map_err(|e| try_to_extract_panic_info(&*e))??;

        Ok(self.codec.encode(&value).map_err(anyhow::Error::from)?)
    }

    /// Persist the outcome of a run, then call the handlers.
    async fn complete(
        &self,
        mut job: Job,
        outcome: Result<String, JobError>,
    ) -> Result<(), StoreError> {
        let now = Utc::now();
        job.running = false;

        match outcome {
            Ok(result) => {
                job.done = true;
                job.date_finished = Some(now);
                job.result = Some(result);
                self.finish(&job).await?;

                if let Err(error) = self.on_success(&job).await {
                    warn!("Success handler failed: {error}");
                    self.on_error(job, JobError::Other(error)).await;
                }
            }
            Err(error) => {
                warn!("Failed to run job: {error}");
                match job.retry_interval {
                    Some(ms) if !error.is_permanent() => {
                        let next_run = now + TimeDelta::milliseconds(i64::from(ms));
                        job.date_next_run = Some(next_run);
                        info!(%next_run, "Job will be retried");
                        // a pending retry keeps its row even with delete_after_execution
                        self.store.update(&job).await?;
                    }
                    _ => {
                        job.failed = true;
                        job.date_finished = Some(now);
                        job.result = match self.codec.encode(&error.to_value()) {
                            Ok(encoded) => Some(encoded),
                            Err(encode_error) => {
                                warn!("Failed to encode job error: {encode_error}");
                                None
                            }
                        };
                        self.finish(&job).await?;
                    }
                }
                self.on_error(job, error).await;
            }
        }
        Ok(())
    }

    /// Write a finished job, or remove it if it asked for that.
    async fn finish(&self, job: &Job) -> Result<(), StoreError> {
        if job.delete_after_execution {
            debug!("Deleting finished job…");
            self.store.delete(job.id).await
        } else {
            debug!("Saving finished job…");
            self.store.update(job).await
        }
    }

    async fn on_success(&self, job: &Job) -> anyhow::Result<()> {
        let Some(handler) = self.registry.success_handler(&job.job_type) else {
            return Ok(());
        };
        let result = self
            .codec
            .decode_column(job.result.as_deref())
            .unwrap_or(Value::Null);
        let id = job.id;

        AssertUnwindSafe(async move { handler(result, id).await })
            .catch_unwind()
            .await
            .map_err(|e| try_to_extract_panic_info(&*e))?
    }

    /// Call the error handler, if any. Its own failures are only logged.
    async fn on_error(&self, job: Job, error: JobError) {
        let Some(handler) = self.registry.error_handler(&job.job_type) else {
            return;
        };

        let result = AssertUnwindSafe(async move { handler(JobFailure { job, error }).await })
            .catch_unwind()
            .await
            .map_err(|e| try_to_extract_panic_info(&*e))
            .and_then(std::convert::identity);

        if let Err(error) = result {
            warn!("Error handler failed: {error}");
        }
    }
}

/// Releases the queue when its background task ends.
///
/// A panic escaping a store or codec call, or the runtime dropping the task,
/// would otherwise leave the phase at `Busy` forever.
struct ExitGuard<'a, Context> {
    worker: &'a Worker<Context>,
    cleaner: Option<AbortHandle>,
    clean_exit: bool,
}

impl<Context> Drop for ExitGuard<'_, Context> {
    fn drop(&mut self) {
        if let Some(cleaner) = self.cleaner.take() {
            cleaner.abort();
        }
        if !self.clean_exit {
            error!("Queue task exited unexpectedly");
            self.worker.phase.send_modify(|phase| {
                self.worker.started.store(false, Ordering::SeqCst);
                *phase = Phase::Stopped;
            });
        }
    }
}
