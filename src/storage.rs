use crate::errors::StoreError;
use crate::schema::{Job, NewJob};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

/// Transactional persistence for queue rows.
///
/// Every method runs in its own transaction and rolls it back before
/// returning an error. [`JobStore::claim_next`] must never hand the same row
/// to two concurrent callers.
#[async_trait]
pub trait JobStore: Send + Sync + 'static {
    /// Create the job table. With `force`, an existing table is dropped first.
    async fn init(&self, force: bool) -> Result<(), StoreError>;

    /// Insert a new row and return it with its assigned id.
    async fn create(&self, job: NewJob) -> Result<Job, StoreError>;

    /// Atomically select the next eligible job and mark it running.
    ///
    /// Eligible rows are neither done nor failed, not running unless
    /// `include_running` is set, and have no `date_next_run` at or after
    /// `now`. They are taken by `priority DESC, date_added ASC`.
    async fn claim_next(
        &self,
        now: DateTime<Utc>,
        include_running: bool,
    ) -> Result<Option<Job>, StoreError>;

    /// Persist the mutable columns of `job`.
    async fn update(&self, job: &Job) -> Result<(), StoreError>;

    /// Remove a row.
    async fn delete(&self, id: i64) -> Result<(), StoreError>;

    /// Look up a row by id.
    async fn find(&self, id: i64) -> Result<Option<Job>, StoreError>;

    /// All rows, ordered by id.
    async fn all(&self) -> Result<Vec<Job>, StoreError>;

    /// Delete `done` or `failed` rows that finished before `before`.
    ///
    /// Returns the number of removed rows.
    async fn prune_finished(&self, before: DateTime<Utc>) -> Result<u64, StoreError>;
}

const COLUMNS: &str = "id, job_type, priority, retry_interval, data, result, running, done, failed, \
     delete_after_execution, date_added, date_next_run, date_started, date_finished";

/// SQL text for one table, rendered once when the store is created.
#[derive(Debug, Clone)]
struct Statements {
    drop_table: String,
    create_table: String,
    create_index: String,
    insert: String,
    select_next: String,
    mark_running: String,
    update: String,
    delete: String,
    find: String,
    all: String,
    prune: String,
}

impl Statements {
    fn for_table(table: &str) -> Self {
        let t = format!("\"{table}\"");
        Self {
            drop_table: format!("DROP TABLE IF EXISTS {t}"),
            create_table: format!(
                r"
                CREATE TABLE IF NOT EXISTS {t} (
                    id BIGSERIAL PRIMARY KEY,
                    job_type VARCHAR(100) NOT NULL,
                    priority INTEGER NOT NULL DEFAULT 10,
                    retry_interval INTEGER,
                    data TEXT,
                    result TEXT,
                    running BOOLEAN NOT NULL DEFAULT FALSE,
                    done BOOLEAN NOT NULL DEFAULT FALSE,
                    failed BOOLEAN NOT NULL DEFAULT FALSE,
                    delete_after_execution BOOLEAN NOT NULL DEFAULT FALSE,
                    date_added TIMESTAMPTZ NOT NULL,
                    date_next_run TIMESTAMPTZ,
                    date_started TIMESTAMPTZ,
                    date_finished TIMESTAMPTZ
                )
                "
            ),
            create_index: format!(
                "CREATE INDEX IF NOT EXISTS \"{table}_claim_idx\" ON {t} (priority DESC, date_added ASC) \
                 WHERE done = FALSE AND failed = FALSE"
            ),
            insert: format!(
                r"
                INSERT INTO {t} (job_type, priority, retry_interval, data, delete_after_execution, date_added, date_next_run)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                RETURNING {COLUMNS}
                "
            ),
            select_next: format!(
                r"
                SELECT id
                FROM {t}
                WHERE done = FALSE
                  AND failed = FALSE
                  AND ($2 OR running = FALSE)
                  AND (date_next_run IS NULL OR date_next_run < $1)
                ORDER BY priority DESC, date_added ASC, id ASC
                FOR UPDATE SKIP LOCKED
                LIMIT 1
                "
            ),
            mark_running: format!(
                "UPDATE {t} SET running = TRUE, date_started = $2 WHERE id = $1 RETURNING {COLUMNS}"
            ),
            update: format!(
                r"
                UPDATE {t}
                SET running = $2, done = $3, failed = $4, result = $5,
                    date_next_run = $6, date_started = $7, date_finished = $8
                WHERE id = $1
                "
            ),
            delete: format!("DELETE FROM {t} WHERE id = $1"),
            find: format!("SELECT {COLUMNS} FROM {t} WHERE id = $1"),
            all: format!("SELECT {COLUMNS} FROM {t} ORDER BY id ASC"),
            prune: format!(
                "DELETE FROM {t} WHERE (done = TRUE OR failed = TRUE) AND date_finished < $1"
            ),
        }
    }
}

/// A [`JobStore`] backed by a PostgreSQL table.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
    table: String,
    sql: Statements,
}

impl PgStore {
    /// Bind a store to `table` on the given pool.
    ///
    /// The table name must be a plain identifier (ASCII letters, digits and
    /// underscores, not starting with a digit, at most 50 characters).
    pub fn new(pool: PgPool, table: impl Into<String>) -> Result<Self, StoreError> {
        let table = table.into();
        if !is_valid_identifier(&table) {
            return Err(StoreError::InvalidTableName(table));
        }

        let sql = Statements::for_table(&table);
        Ok(Self { pool, table, sql })
    }

    /// The table this store reads and writes.
    pub fn table(&self) -> &str {
        &self.table
    }

    /// The underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn is_valid_identifier(name: &str) -> bool {
    // leaves room for the "_claim_idx" suffix within Postgres' 63 byte limit
    let mut chars = name.chars();
    name.len() <= 50
        && chars
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[async_trait]
impl JobStore for PgStore {
    async fn init(&self, force: bool) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        if force {
            sqlx::query(&self.sql.drop_table).execute(&mut *tx).await?;
        }
        sqlx::query(&self.sql.create_table).execute(&mut *tx).await?;
        sqlx::query(&self.sql.create_index).execute(&mut *tx).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn create(&self, job: NewJob) -> Result<Job, StoreError> {
        let job = sqlx::query_as::<_, Job>(&self.sql.insert)
            .bind(job.job_type)
            .bind(job.priority)
            .bind(job.retry_interval)
            .bind(job.data)
            .bind(job.delete_after_execution)
            .bind(job.date_added)
            .bind(job.date_next_run)
            .fetch_one(&self.pool)
            .await?;
        Ok(job)
    }

    async fn claim_next(
        &self,
        now: DateTime<Utc>,
        include_running: bool,
    ) -> Result<Option<Job>, StoreError> {
        // Dropping `tx` on an early return rolls it back.
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL READ COMMITTED")
            .execute(&mut *tx)
            .await?;

        let id = sqlx::query_scalar::<_, i64>(&self.sql.select_next)
            .bind(now)
            .bind(include_running)
            .fetch_optional(&mut *tx)
            .await?;

        let Some(id) = id else {
            tx.commit().await?;
            return Ok(None);
        };

        let job = sqlx::query_as::<_, Job>(&self.sql.mark_running)
            .bind(id)
            .bind(now)
            .fetch_one(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(Some(job))
    }

    async fn update(&self, job: &Job) -> Result<(), StoreError> {
        let result = sqlx::query(&self.sql.update)
            .bind(job.id)
            .bind(job.running)
            .bind(job.done)
            .bind(job.failed)
            .bind(job.result.as_deref())
            .bind(job.date_next_run)
            .bind(job.date_started)
            .bind(job.date_finished)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(job.id));
        }
        Ok(())
    }

    async fn delete(&self, id: i64) -> Result<(), StoreError> {
        sqlx::query(&self.sql.delete)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn find(&self, id: i64) -> Result<Option<Job>, StoreError> {
        let job = sqlx::query_as::<_, Job>(&self.sql.find)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(job)
    }

    async fn all(&self) -> Result<Vec<Job>, StoreError> {
        let jobs = sqlx::query_as::<_, Job>(&self.sql.all)
            .fetch_all(&self.pool)
            .await?;
        Ok(jobs)
    }

    async fn prune_finished(&self, before: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query(&self.sql.prune)
            .bind(before)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_names_must_be_identifiers() {
        assert!(is_valid_identifier("queue"));
        assert!(is_valid_identifier("_jobs_2"));
        assert!(!is_valid_identifier(""));
        assert!(!is_valid_identifier("2jobs"));
        assert!(!is_valid_identifier("jobs; DROP TABLE users"));
        assert!(!is_valid_identifier("\"quoted\""));
        assert!(!is_valid_identifier(&"x".repeat(51)));
    }

    #[test]
    fn statements_target_the_table() {
        let sql = Statements::for_table("mail_jobs");
        assert!(sql.select_next.contains("FROM \"mail_jobs\""));
        assert!(sql.select_next.contains("ORDER BY priority DESC, date_added ASC"));
        assert!(sql.select_next.contains("FOR UPDATE SKIP LOCKED"));
        assert!(sql.create_index.contains("\"mail_jobs_claim_idx\""));
    }
}
