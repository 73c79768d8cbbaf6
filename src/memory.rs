use crate::errors::StoreError;
use crate::schema::{Job, NewJob};
use crate::storage::JobStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Debug, Default)]
struct Table {
    next_id: i64,
    rows: BTreeMap<i64, Job>,
}

/// An in-process [`JobStore`].
///
/// Rows live in a map behind a single lock, so each operation is atomic with
/// respect to every other one. Clones share the same rows, which lets several
/// queues in one process compete for the same jobs.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    table: Arc<Mutex<Table>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a fully specified row, bypassing [`JobStore::create`].
    ///
    /// The row's `id` is replaced with a fresh one, which is returned.
    pub async fn insert_raw(&self, mut job: Job) -> i64 {
        let mut table = self.table.lock().await;
        table.next_id += 1;
        job.id = table.next_id;
        table.rows.insert(job.id, job);
        table.next_id
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn init(&self, force: bool) -> Result<(), StoreError> {
        if force {
            let mut table = self.table.lock().await;
            table.rows.clear();
        }
        Ok(())
    }

    async fn create(&self, job: NewJob) -> Result<Job, StoreError> {
        let mut table = self.table.lock().await;
        table.next_id += 1;
        let job = Job {
            id: table.next_id,
            job_type: job.job_type,
            priority: job.priority,
            retry_interval: job.retry_interval,
            data: job.data,
            result: None,
            running: false,
            done: false,
            failed: false,
            delete_after_execution: job.delete_after_execution,
            date_added: job.date_added,
            date_next_run: job.date_next_run,
            date_started: None,
            date_finished: None,
        };
        table.rows.insert(job.id, job.clone());
        Ok(job)
    }

    async fn claim_next(
        &self,
        now: DateTime<Utc>,
        include_running: bool,
    ) -> Result<Option<Job>, StoreError> {
        let mut table = self.table.lock().await;
        let next = table
            .rows
            .values_mut()
            .filter(|job| job.is_eligible(now, include_running))
            // ids grow with insertion, so the last tie-break matches the SQL store
            .min_by(|a, b| {
                b.priority
                    .cmp(&a.priority)
                    .then(a.date_added.cmp(&b.date_added))
                    .then(a.id.cmp(&b.id))
            });

        Ok(next.map(|job| {
            job.running = true;
            job.date_started = Some(now);
            job.clone()
        }))
    }

    async fn update(&self, job: &Job) -> Result<(), StoreError> {
        let mut table = self.table.lock().await;
        let row = table
            .rows
            .get_mut(&job.id)
            .ok_or(StoreError::NotFound(job.id))?;
        row.running = job.running;
        row.done = job.done;
        row.failed = job.failed;
        row.result.clone_from(&job.result);
        row.date_next_run = job.date_next_run;
        row.date_started = job.date_started;
        row.date_finished = job.date_finished;
        Ok(())
    }

    async fn delete(&self, id: i64) -> Result<(), StoreError> {
        self.table.lock().await.rows.remove(&id);
        Ok(())
    }

    async fn find(&self, id: i64) -> Result<Option<Job>, StoreError> {
        Ok(self.table.lock().await.rows.get(&id).cloned())
    }

    async fn all(&self) -> Result<Vec<Job>, StoreError> {
        Ok(self.table.lock().await.rows.values().cloned().collect())
    }

    async fn prune_finished(&self, before: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut table = self.table.lock().await;
        let len = table.rows.len();
        table.rows.retain(|_, job| {
            !(job.is_finished() && job.date_finished.is_some_and(|finished| finished < before))
        });
        Ok((len - table.rows.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::PRIORITY_DEFAULT;
    use chrono::TimeDelta;
    use claims::{assert_none, assert_ok, assert_some};

    fn new_job(priority: i32, date_added: DateTime<Utc>) -> NewJob {
        NewJob {
            job_type: "default".into(),
            priority,
            retry_interval: None,
            data: None,
            delete_after_execution: false,
            date_added,
            date_next_run: None,
        }
    }

    #[tokio::test]
    async fn claims_by_priority_then_age() {
        let store = MemoryStore::new();
        let t0 = Utc::now();
        let old_low = assert_ok!(store.create(new_job(1, t0)).await);
        let new_high = assert_ok!(store.create(new_job(5, t0 + TimeDelta::seconds(1))).await);
        let old_high = assert_ok!(store.create(new_job(5, t0)).await);

        let now = t0 + TimeDelta::seconds(2);
        let order: Vec<i64> = [
            assert_some!(assert_ok!(store.claim_next(now, false).await)),
            assert_some!(assert_ok!(store.claim_next(now, false).await)),
            assert_some!(assert_ok!(store.claim_next(now, false).await)),
        ]
        .iter()
        .map(|job| job.id)
        .collect();

        assert_eq!(order, vec![old_high.id, new_high.id, old_low.id]);
        assert_none!(assert_ok!(store.claim_next(now, false).await));
    }

    #[tokio::test]
    async fn claiming_marks_the_row_running() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let job = assert_ok!(store.create(new_job(PRIORITY_DEFAULT, now)).await);

        let claimed = assert_some!(assert_ok!(store.claim_next(now, false).await));
        assert!(claimed.running);
        assert_eq!(claimed.date_started, Some(now));

        let stored = assert_some!(assert_ok!(store.find(job.id).await));
        assert!(stored.running);

        // a second claim only sees it when running rows are included
        assert_none!(assert_ok!(store.claim_next(now, false).await));
        assert_some!(assert_ok!(store.claim_next(now, true).await));
    }

    #[tokio::test]
    async fn concurrent_claims_never_share_a_row() {
        let store = MemoryStore::new();
        let now = Utc::now();
        for _ in 0..20 {
            assert_ok!(store.create(new_job(PRIORITY_DEFAULT, now)).await);
        }

        let later = now + TimeDelta::seconds(1);
        let claims = (0..8).map(|_| {
            let store = store.clone();
            tokio::spawn(async move {
                let mut ids = Vec::new();
                while let Ok(Some(job)) = store.claim_next(later, false).await {
                    ids.push(job.id);
                    tokio::task::yield_now().await;
                }
                ids
            })
        });

        let mut ids = Vec::new();
        for claim in claims {
            ids.extend(claim.await.unwrap());
        }
        ids.sort_unstable();
        assert_eq!(ids, (1..=20).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn updating_a_missing_row_fails() {
        let store = MemoryStore::new();
        let job = assert_ok!(store.create(new_job(PRIORITY_DEFAULT, Utc::now())).await);
        assert_ok!(store.delete(job.id).await);

        let error = store.update(&job).await.unwrap_err();
        assert!(matches!(error, StoreError::NotFound(id) if id == job.id));
    }

    #[tokio::test]
    async fn pruning_keeps_unfinished_rows() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let finished = assert_ok!(store.create(new_job(PRIORITY_DEFAULT, now)).await);
        let waiting = assert_ok!(store.create(new_job(PRIORITY_DEFAULT, now)).await);

        let mut done = finished.clone();
        done.done = true;
        done.date_finished = Some(now);
        assert_ok!(store.update(&done).await);

        assert_eq!(assert_ok!(store.prune_finished(now).await), 0);
        assert_eq!(
            assert_ok!(store.prune_finished(now + TimeDelta::seconds(1)).await),
            1
        );
        assert_none!(assert_ok!(store.find(finished.id).await));
        assert_some!(assert_ok!(store.find(waiting.id).await));
    }
}
