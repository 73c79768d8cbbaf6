#![allow(missing_docs)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::indexing_slicing)]

//! Claim protocol tests against a real PostgreSQL server.
//!
//! These start a container and are skipped unless run with `--include-ignored`.

use chrono::{TimeDelta, Utc};
use claims::{assert_none, assert_ok, assert_some};
use job_queue::{Job, JobOptions, JobStore, NewJob, PgStore, Queue, QueueConfig};
use serde_json::{Value, json};
use sqlx::PgPool;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use testcontainers::ContainerAsync;
use testcontainers_modules::postgres::Postgres;

/// Test utilities and common setup
mod test_utils {
    use super::*;
    use testcontainers::runners::AsyncRunner;

    /// Set up a test database with `TestContainers` and return the store and container
    pub(super) async fn setup_test_db() -> anyhow::Result<(PgStore, ContainerAsync<Postgres>)> {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "warn,job_queue=info".into()),
            )
            .with_test_writer()
            .compact()
            .try_init();

        let postgres_image = Postgres::default();
        let container = postgres_image.start().await?;

        // Get the connection parameters from the container
        let host = container.get_host().await?;
        let port = container.get_host_port_ipv4(5432).await?;

        // Use the standard postgres/postgres credentials for testcontainers
        let connection_string = format!("postgresql://postgres:postgres@{host}:{port}/postgres");

        let pool = PgPool::connect(&connection_string).await?;
        let store = PgStore::new(pool, "queue")?;
        store.init(false).await?;

        Ok((store, container))
    }

    pub(super) fn new_job(priority: i32) -> NewJob {
        NewJob {
            job_type: "default".into(),
            priority,
            retry_interval: None,
            data: Some(r#"{"a":1}"#.into()),
            delete_after_execution: false,
            date_added: Utc::now(),
            date_next_run: None,
        }
    }

    /// Start a draining queue and wait until it has stopped itself
    pub(super) async fn drain(queue: &Queue<()>) {
        queue.start();
        let drained =
            tokio::time::timeout(Duration::from_secs(30), queue.wait_for_shutdown()).await;
        assert!(drained.is_ok(), "queue did not drain in time");
    }
}

async fn table_exists(pool: &PgPool, table: &str) -> anyhow::Result<bool> {
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM information_schema.tables
         WHERE table_name = $1 AND table_schema = 'public'",
    )
    .bind(table)
    .fetch_one(pool)
    .await?;
    Ok(count == 1)
}

fn result_of(job: &Job) -> Value {
    serde_json::from_str(job.result.as_deref().unwrap()).unwrap()
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn init_creates_the_table_and_force_recreates_it() -> anyhow::Result<()> {
    let (store, _container) = test_utils::setup_test_db().await?;
    assert!(table_exists(store.pool(), "queue").await?);

    // a second init keeps existing rows
    let job = store.create(test_utils::new_job(10)).await?;
    store.init(false).await?;
    assert_some!(store.find(job.id).await?);

    store.init(true).await?;
    assert!(table_exists(store.pool(), "queue").await?);
    assert!(store.all().await?.is_empty());

    Ok(())
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn created_jobs_take_column_defaults() -> anyhow::Result<()> {
    let (store, _container) = test_utils::setup_test_db().await?;

    let job = store.create(test_utils::new_job(10)).await?;
    assert!(job.id > 0);
    assert!(!job.running && !job.done && !job.failed);
    assert_eq!(assert_some!(store.find(job.id).await?), job);
    assert_none!(&job.result);
    assert_none!(job.date_started);

    Ok(())
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn claims_mark_the_row_running() -> anyhow::Result<()> {
    let (store, _container) = test_utils::setup_test_db().await?;
    let job = store.create(test_utils::new_job(10)).await?;

    let now = Utc::now() + TimeDelta::seconds(1);
    let claimed = assert_some!(store.claim_next(now, false).await?);
    assert_eq!(claimed.id, job.id);
    assert!(claimed.running);
    assert_some!(claimed.date_started);

    // committed before returning, so a fresh lookup sees it
    assert!(assert_some!(store.find(job.id).await?).running);

    assert_none!(store.claim_next(now, false).await?);
    assert_some!(store.claim_next(now, true).await?);

    Ok(())
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn claims_follow_priority_then_insertion() -> anyhow::Result<()> {
    let (store, _container) = test_utils::setup_test_db().await?;

    let low = store.create(test_utils::new_job(0)).await?;
    let first_high = store.create(test_utils::new_job(20)).await?;
    let second_high = store.create(test_utils::new_job(20)).await?;
    let waiting = store
        .create(NewJob {
            date_next_run: Some(Utc::now() + TimeDelta::hours(1)),
            ..test_utils::new_job(30)
        })
        .await?;

    let now = Utc::now() + TimeDelta::seconds(1);
    let mut order = Vec::new();
    while let Some(job) = store.claim_next(now, false).await? {
        order.push(job.id);
    }
    assert_eq!(order, vec![first_high.id, second_high.id, low.id]);
    assert!(!assert_some!(store.find(waiting.id).await?).running);

    Ok(())
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn concurrent_claims_never_share_a_row() -> anyhow::Result<()> {
    let (store, _container) = test_utils::setup_test_db().await?;
    for _ in 0..40 {
        store.create(test_utils::new_job(10)).await?;
    }

    let now = Utc::now() + TimeDelta::seconds(1);
    let claimers: Vec<_> = (0..4)
        .map(|_| {
            let store = store.clone();
            tokio::spawn(async move {
                let mut ids = Vec::new();
                while let Some(job) = store.claim_next(now, false).await.unwrap() {
                    ids.push(job.id);
                }
                ids
            })
        })
        .collect();

    let mut ids = Vec::new();
    for claimer in claimers {
        ids.extend(claimer.await?);
    }
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), 40);

    Ok(())
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn updates_and_deletes_reach_the_table() -> anyhow::Result<()> {
    let (store, _container) = test_utils::setup_test_db().await?;
    let mut job = store.create(test_utils::new_job(10)).await?;

    job.done = true;
    job.result = Some("{}".into());
    job.date_finished = Some(Utc::now());
    store.update(&job).await?;

    let stored = assert_some!(store.find(job.id).await?);
    assert!(stored.done);
    assert_eq!(stored.result.as_deref(), Some("{}"));

    assert_eq!(store.prune_finished(Utc::now() + TimeDelta::seconds(1)).await?, 1);
    assert_none!(store.find(job.id).await?);
    assert!(store.update(&job).await.is_err());

    let other = store.create(test_utils::new_job(10)).await?;
    store.delete(other.id).await?;
    assert!(store.all().await?.is_empty());

    Ok(())
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn queue_processes_and_retries_jobs() -> anyhow::Result<()> {
    let (store, _container) = test_utils::setup_test_db().await?;
    let must_fail = Arc::new(AtomicBool::new(true));

    let queue = Queue::builder(store.clone(), ())
        .config(QueueConfig::default().with_poll_interval_ms(50))
        .default_processor(|_, data| async move { Ok(json!({ "b": data["a"] })) })
        .processor("flaky", {
            let must_fail = must_fail.clone();
            move |_, data| {
                let fail = must_fail.swap(false, Ordering::SeqCst);
                async move {
                    if fail {
                        return Err(job_queue::JobError::Other(anyhow::anyhow!("first try")));
                    }
                    Ok(json!({ "b": data["a"] }))
                }
            }
        })
        .build();

    for a in 1..=3 {
        queue.add_job(&json!({ "a": a }), JobOptions::default()).await?;
    }
    let flaky = queue
        .add_job(
            &json!({ "a": 1 }),
            JobOptions::new("flaky").retry_interval(Duration::from_millis(200)),
        )
        .await?;

    queue.start();
    let finished = tokio::time::timeout(Duration::from_secs(30), async {
        loop {
            let jobs = store.all().await.unwrap();
            if jobs.iter().all(Job::is_finished) {
                return jobs;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await?;
    assert!(queue.stop().await);

    assert_eq!(finished.len(), 4);
    for job in &finished {
        assert!(job.done, "job {} should be done", job.id);
        let data: Value = serde_json::from_str(job.data.as_deref().unwrap())?;
        assert_eq!(result_of(job)["b"], data["a"]);
    }

    let flaky = assert_some!(finished.iter().find(|job| job.id == flaky.id));
    assert_some!(flaky.date_next_run);

    Ok(())
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn running_rows_are_left_alone_unless_requested() -> anyhow::Result<()> {
    let (store, _container) = test_utils::setup_test_db().await?;
    let job = store.create(test_utils::new_job(0)).await?;
    let mut running = job.clone();
    running.running = true;
    store.update(&running).await?;

    let config = QueueConfig::default()
        .with_poll_interval_ms(50)
        .shutdown_when_queue_empty();
    let processor = |_: (), data: Value| async move { Ok(json!({ "b": data["a"] })) };

    let skipping = Queue::builder(store.clone(), ())
        .config(config.clone())
        .default_processor(processor)
        .build();
    test_utils::drain(&skipping).await;
    assert!(!assert_some!(store.find(job.id).await?).done);

    let recovering = Queue::builder(store.clone(), ())
        .config(config.with_process_running(true))
        .default_processor(processor)
        .build();
    test_utils::drain(&recovering).await;

    let recovered = assert_some!(store.find(job.id).await?);
    assert!(recovered.done);
    assert!(!recovered.running);
    assert_eq!(result_of(&recovered)["b"], 1);

    assert_ok!(recovering.prune_finished(Duration::ZERO).await);
    Ok(())
}
