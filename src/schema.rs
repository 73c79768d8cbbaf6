//! Row types for the job table.
//!
//! One row per job. The boolean triple `running` / `done` / `failed` encodes
//! the job state: a row is waiting while all three are false, claimed while
//! `running` is set and finished once `done` or `failed` is set (never both).

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::FromRow;
use std::time::Duration;

/// Priority for jobs that should jump the queue.
pub const PRIORITY_HIGH: i32 = 20;
/// Priority used when none is given.
pub const PRIORITY_DEFAULT: i32 = 10;
/// Priority for jobs that can wait.
pub const PRIORITY_LOW: i32 = 0;

/// A job record as stored in the queue table
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize)]
pub struct Job {
    /// Store-assigned identifier
    pub id: i64,
    /// Type identifier for the job (used for dispatch)
    pub job_type: String,
    /// Priority of the job (higher = more important)
    pub priority: i32,
    /// Delay before a failed run is retried, in milliseconds; `None` means never retry
    pub retry_interval: Option<i32>,
    /// Encoded job payload
    pub data: Option<String>,
    /// Encoded outcome, either the processor's value or the error
    pub result: Option<String>,
    /// Set between claim and completion
    pub running: bool,
    /// Set once the processor succeeded
    pub done: bool,
    /// Set once the job failed for good
    pub failed: bool,
    /// Remove the row instead of updating it once the job is finished
    pub delete_after_execution: bool,
    /// Timestamp when the job was created
    pub date_added: DateTime<Utc>,
    /// The job cannot be claimed before this time
    pub date_next_run: Option<DateTime<Utc>>,
    /// Timestamp of the last claim
    pub date_started: Option<DateTime<Utc>>,
    /// Timestamp when the job reached `done` or `failed`
    pub date_finished: Option<DateTime<Utc>>,
}

impl Job {
    /// The retry interval as a [`Duration`], if the job is retryable.
    pub fn retry_interval(&self) -> Option<Duration> {
        self.retry_interval
            .map(|ms| Duration::from_millis(u64::try_from(ms).unwrap_or(0)))
    }

    /// Whether the job reached a terminal state.
    pub fn is_finished(&self) -> bool {
        self.done || self.failed
    }

    /// Whether a claim at `now` may pick this job.
    pub fn is_eligible(&self, now: DateTime<Utc>, include_running: bool) -> bool {
        !self.done
            && !self.failed
            && (include_running || !self.running)
            && self.date_next_run.is_none_or(|next| next < now)
    }
}

/// The columns supplied when inserting a job; everything else takes its default.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewJob {
    /// Type identifier for the job
    pub job_type: String,
    /// Priority of the job
    pub priority: i32,
    /// Retry delay in milliseconds
    pub retry_interval: Option<i32>,
    /// Encoded job payload
    pub data: Option<String>,
    /// Remove the row once the job is finished
    pub delete_after_execution: bool,
    /// Creation timestamp
    pub date_added: DateTime<Utc>,
    /// Earliest time the job may run
    pub date_next_run: Option<DateTime<Utc>>,
}
