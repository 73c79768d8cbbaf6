#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

mod background_job;
mod cleaner;
mod codec;
mod errors;
mod job_registry;
mod memory;
mod runner;
/// Row types and priority constants.
pub mod schema;
mod storage;
mod util;
mod worker;

/// The trait for defining typed jobs.
pub use self::background_job::{BackgroundJob, DEFAULT_JOB_TYPE};
/// Payload and result encoding.
pub use self::codec::{Codec, JsonCodec};
/// Error types.
pub use self::errors::{CodecError, EnqueueError, JobError, StoreError, fail_job};
/// What error handlers receive.
pub use self::job_registry::JobFailure;
/// The in-process store.
pub use self::memory::MemoryStore;
/// The queue controller and its configuration.
pub use self::runner::{JobOptions, Queue, QueueBuilder, QueueConfig};
/// Row types.
pub use self::schema::{Job, NewJob, PRIORITY_DEFAULT, PRIORITY_HIGH, PRIORITY_LOW};
/// The store interface and its PostgreSQL implementation.
pub use self::storage::{JobStore, PgStore};
