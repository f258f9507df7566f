//! Postgres staging/promotion store, sync lock, and HTTP fetch utilities.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, NaiveDate, Utc};
use reqwest::StatusCode;
use retx_core::{CanonicalTransaction, ComparisonReport, SourceKind, SyncRun};
use sha2::{Digest, Sha256};
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, Row};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info_span};
use uuid::Uuid;

pub const CRATE_NAME: &str = "retx-storage";

/// Advisory lock key scoping the production transaction table. One writer
/// per database, ever.
pub const SYNC_LOCK_KEY: i64 = 0x7265_7478;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("serializing raw_extras: {0}")]
    Extras(#[from] serde_json::Error),
}

/// Session-scoped mutual exclusion for sync runs. The lock lives on a
/// dedicated pooled connection; if the process dies the connection closes
/// and Postgres frees the lock, so a crashed run cannot wedge the pipeline.
pub struct SyncLock {
    conn: PoolConnection<Postgres>,
    key: i64,
}

impl SyncLock {
    /// Non-blocking acquisition. `None` means another run holds the lock;
    /// callers surface that immediately instead of queueing.
    pub async fn try_acquire(pool: &PgPool, key: i64) -> Result<Option<Self>, StoreError> {
        let mut conn = pool.acquire().await?;
        let locked: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock($1)")
            .bind(key)
            .fetch_one(&mut *conn)
            .await?;
        if locked {
            debug!(key, "sync lock acquired");
            Ok(Some(Self { conn, key }))
        } else {
            Ok(None)
        }
    }

    /// Explicit release; must run on every exit path of a sync run.
    pub async fn release(mut self) -> Result<(), StoreError> {
        sqlx::query_scalar::<_, bool>("SELECT pg_advisory_unlock($1)")
            .bind(self.key)
            .fetch_one(&mut *self.conn)
            .await?;
        debug!(key = self.key, "sync lock released");
        Ok(())
    }
}

const SCHEMA_DDL: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS transactions (
        id BIGSERIAL PRIMARY KEY,
        project TEXT NOT NULL,
        transaction_month DATE NOT NULL,
        price BIGINT NOT NULL,
        area_sqm DOUBLE PRECISION NOT NULL,
        price_per_sqm DOUBLE PRECISION NOT NULL,
        district TEXT NOT NULL,
        bedroom_class SMALLINT NOT NULL,
        property_type TEXT NOT NULL,
        sale_category TEXT NOT NULL,
        tenure TEXT NOT NULL,
        lease_start_year INT,
        remaining_lease_years INT,
        floor_range TEXT NOT NULL,
        unit_count INT NOT NULL,
        is_outlier BOOLEAN NOT NULL DEFAULT FALSE,
        source TEXT NOT NULL,
        row_hash TEXT NOT NULL UNIQUE,
        raw_extras JSONB NOT NULL DEFAULT '{}'::jsonb,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_transactions_source_month
        ON transactions (source, transaction_month)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS staging_transactions (
        run_id UUID NOT NULL,
        project TEXT NOT NULL,
        transaction_month DATE NOT NULL,
        price BIGINT NOT NULL,
        area_sqm DOUBLE PRECISION NOT NULL,
        price_per_sqm DOUBLE PRECISION NOT NULL,
        district TEXT NOT NULL,
        bedroom_class SMALLINT NOT NULL,
        property_type TEXT NOT NULL,
        sale_category TEXT NOT NULL,
        tenure TEXT NOT NULL,
        lease_start_year INT,
        remaining_lease_years INT,
        floor_range TEXT NOT NULL,
        unit_count INT NOT NULL,
        is_outlier BOOLEAN NOT NULL DEFAULT FALSE,
        source TEXT NOT NULL,
        row_hash TEXT NOT NULL,
        raw_extras JSONB NOT NULL DEFAULT '{}'::jsonb,
        PRIMARY KEY (run_id, row_hash)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS sync_runs (
        run_id UUID PRIMARY KEY,
        source TEXT NOT NULL,
        started_at TIMESTAMPTZ NOT NULL,
        finished_at TIMESTAMPTZ,
        cutoff_date DATE,
        rows_fetched BIGINT NOT NULL DEFAULT 0,
        rows_promoted BIGINT NOT NULL DEFAULT 0,
        rows_rejected BIGINT NOT NULL DEFAULT 0,
        status TEXT NOT NULL,
        failure_cause TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS comparison_reports (
        id BIGSERIAL PRIMARY KEY,
        run_id UUID NOT NULL,
        window_start DATE NOT NULL,
        window_end DATE NOT NULL,
        bulk_rows BIGINT NOT NULL,
        feed_rows BIGINT NOT NULL,
        row_count_delta_pct DOUBLE PRECISION NOT NULL,
        bulk_median_psm DOUBLE PRECISION,
        feed_median_psm DOUBLE PRECISION,
        median_delta_pct DOUBLE PRECISION,
        hash_coverage DOUBLE PRECISION NOT NULL,
        passed BOOLEAN NOT NULL,
        created_at TIMESTAMPTZ NOT NULL
    )
    "#,
];

const STAGE_UPSERT: &str = r#"
    INSERT INTO staging_transactions
        (run_id, project, transaction_month, price, area_sqm, price_per_sqm,
         district, bedroom_class, property_type, sale_category, tenure,
         lease_start_year, remaining_lease_years, floor_range, unit_count,
         is_outlier, source, row_hash, raw_extras)
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15,
            $16, $17, $18, $19)
    ON CONFLICT (run_id, row_hash) DO UPDATE SET
        project = EXCLUDED.project,
        transaction_month = EXCLUDED.transaction_month,
        price = EXCLUDED.price,
        area_sqm = EXCLUDED.area_sqm,
        price_per_sqm = EXCLUDED.price_per_sqm,
        district = EXCLUDED.district,
        bedroom_class = EXCLUDED.bedroom_class,
        property_type = EXCLUDED.property_type,
        sale_category = EXCLUDED.sale_category,
        tenure = EXCLUDED.tenure,
        lease_start_year = EXCLUDED.lease_start_year,
        remaining_lease_years = EXCLUDED.remaining_lease_years,
        floor_range = EXCLUDED.floor_range,
        unit_count = EXCLUDED.unit_count,
        is_outlier = EXCLUDED.is_outlier,
        source = EXCLUDED.source,
        raw_extras = EXCLUDED.raw_extras
"#;

const PROMOTE_SQL: &str = r#"
    INSERT INTO transactions
        (project, transaction_month, price, area_sqm, price_per_sqm,
         district, bedroom_class, property_type, sale_category, tenure,
         lease_start_year, remaining_lease_years, floor_range, unit_count,
         is_outlier, source, row_hash, raw_extras)
    SELECT project, transaction_month, price, area_sqm, price_per_sqm,
           district, bedroom_class, property_type, sale_category, tenure,
           lease_start_year, remaining_lease_years, floor_range, unit_count,
           is_outlier, source, row_hash, raw_extras
    FROM staging_transactions
    WHERE run_id = $1
      AND ($2::date IS NULL OR transaction_month >= $2)
      AND ($3::date IS NULL OR transaction_month <= $3)
    ON CONFLICT (row_hash) DO NOTHING
"#;

/// Staging & promotion store over the canonical transaction table.
#[derive(Clone)]
pub struct TransactionStore {
    pool: PgPool,
}

impl TransactionStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Idempotent schema creation; safe to run at every startup.
    pub async fn init_schema(&self) -> Result<(), StoreError> {
        for ddl in SCHEMA_DDL {
            sqlx::query(ddl).execute(&self.pool).await?;
        }
        Ok(())
    }

    pub async fn insert_run(&self, run: &SyncRun) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO sync_runs
                (run_id, source, started_at, finished_at, cutoff_date,
                 rows_fetched, rows_promoted, rows_rejected, status, failure_cause)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(run.run_id)
        .bind(run.source.as_str())
        .bind(run.started_at)
        .bind(run.finished_at)
        .bind(run.cutoff_date)
        .bind(run.rows_fetched)
        .bind(run.rows_promoted)
        .bind(run.rows_rejected)
        .bind(run.status.as_str())
        .bind(run.failure_cause.as_deref())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Records the run's terminal state. Run rows are never deleted; they
    /// are the audit trail.
    pub async fn finalize_run(&self, run: &SyncRun) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE sync_runs
               SET finished_at = $2,
                   rows_fetched = $3,
                   rows_promoted = $4,
                   rows_rejected = $5,
                   status = $6,
                   failure_cause = $7
             WHERE run_id = $1
            "#,
        )
        .bind(run.run_id)
        .bind(run.finished_at)
        .bind(run.rows_fetched)
        .bind(run.rows_promoted)
        .bind(run.rows_rejected)
        .bind(run.status.as_str())
        .bind(run.failure_cause.as_deref())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Opens an isolated staging area for the run, clearing any leftovers
    /// a previous attempt with the same id may have left behind.
    pub async fn begin_batch(&self, run_id: Uuid) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM staging_transactions WHERE run_id = $1")
            .bind(run_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Inserts canonical records into staging, last-write-wins for
    /// same-batch row-hash collisions.
    pub async fn stage_records(
        &self,
        run_id: Uuid,
        records: &[CanonicalTransaction],
    ) -> Result<u64, StoreError> {
        let mut staged = 0u64;
        for rec in records {
            let extras = serde_json::to_value(&rec.raw_extras)?;
            sqlx::query(STAGE_UPSERT)
                .bind(run_id)
                .bind(&rec.project)
                .bind(rec.transaction_month)
                .bind(rec.price)
                .bind(rec.area_sqm)
                .bind(rec.price_per_sqm)
                .bind(&rec.district)
                .bind(rec.bedroom_class)
                .bind(&rec.property_type)
                .bind(rec.sale_category.as_str())
                .bind(&rec.tenure)
                .bind(rec.lease_start_year)
                .bind(rec.remaining_lease_years)
                .bind(&rec.floor_range)
                .bind(rec.unit_count)
                .bind(rec.is_outlier)
                .bind(rec.source.as_str())
                .bind(&rec.row_hash)
                .bind(extras)
                .execute(&self.pool)
                .await?;
            staged += 1;
        }
        Ok(staged)
    }

    /// Atomically moves staged rows into production, optionally restricted
    /// to a time window. Conflicting row hashes are left untouched, so
    /// promotion can never overwrite history. Returns rows inserted.
    pub async fn promote(
        &self,
        run_id: Uuid,
        window: Option<(NaiveDate, NaiveDate)>,
    ) -> Result<u64, StoreError> {
        let (start, end) = match window {
            Some((s, e)) => (Some(s), Some(e)),
            None => (None, None),
        };
        let result = sqlx::query(PROMOTE_SQL)
            .bind(run_id)
            .bind(start)
            .bind(end)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Discards staging without touching production.
    pub async fn rollback(&self, run_id: Uuid) -> Result<(), StoreError> {
        self.begin_batch(run_id).await
    }

    pub async fn production_row_count(
        &self,
        source: SourceKind,
        window: (NaiveDate, NaiveDate),
    ) -> Result<i64, StoreError> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT count(*) FROM transactions
            WHERE source = $1 AND transaction_month BETWEEN $2 AND $3
            "#,
        )
        .bind(source.as_str())
        .bind(window.0)
        .bind(window.1)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    /// Median price-per-sqm over the window. Outliers are filtered, per the
    /// downstream aggregate contract.
    pub async fn production_median_psm(
        &self,
        source: SourceKind,
        window: (NaiveDate, NaiveDate),
    ) -> Result<Option<f64>, StoreError> {
        let median: Option<f64> = sqlx::query_scalar(
            r#"
            SELECT percentile_cont(0.5) WITHIN GROUP (ORDER BY price_per_sqm)
            FROM transactions
            WHERE source = $1
              AND is_outlier = FALSE
              AND transaction_month BETWEEN $2 AND $3
            "#,
        )
        .bind(source.as_str())
        .bind(window.0)
        .bind(window.1)
        .fetch_one(&self.pool)
        .await?;
        Ok(median)
    }

    pub async fn staged_row_count(
        &self,
        run_id: Uuid,
        window: (NaiveDate, NaiveDate),
    ) -> Result<i64, StoreError> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT count(*) FROM staging_transactions
            WHERE run_id = $1 AND transaction_month BETWEEN $2 AND $3
            "#,
        )
        .bind(run_id)
        .bind(window.0)
        .bind(window.1)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    pub async fn staged_median_psm(
        &self,
        run_id: Uuid,
        window: (NaiveDate, NaiveDate),
    ) -> Result<Option<f64>, StoreError> {
        let median: Option<f64> = sqlx::query_scalar(
            r#"
            SELECT percentile_cont(0.5) WITHIN GROUP (ORDER BY price_per_sqm)
            FROM staging_transactions
            WHERE run_id = $1
              AND is_outlier = FALSE
              AND transaction_month BETWEEN $2 AND $3
            "#,
        )
        .bind(run_id)
        .bind(window.0)
        .bind(window.1)
        .fetch_one(&self.pool)
        .await?;
        Ok(median)
    }

    /// Fraction of production bulk-file rows in the window whose row hash
    /// also appears in this run's staging. 1.0 on an empty bulk window:
    /// nothing to cover.
    pub async fn hash_coverage(
        &self,
        run_id: Uuid,
        window: (NaiveDate, NaiveDate),
    ) -> Result<f64, StoreError> {
        let bulk_total = self
            .production_row_count(SourceKind::BulkFile, window)
            .await?;
        if bulk_total == 0 {
            return Ok(1.0);
        }
        let matched: i64 = sqlx::query_scalar(
            r#"
            SELECT count(*) FROM transactions t
            WHERE t.source = 'bulk_file'
              AND t.transaction_month BETWEEN $2 AND $3
              AND EXISTS (
                  SELECT 1 FROM staging_transactions s
                  WHERE s.run_id = $1 AND s.row_hash = t.row_hash
              )
            "#,
        )
        .bind(run_id)
        .bind(window.0)
        .bind(window.1)
        .fetch_one(&self.pool)
        .await?;
        Ok(matched as f64 / bulk_total as f64)
    }

    pub async fn insert_report(&self, report: &ComparisonReport) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO comparison_reports
                (run_id, window_start, window_end, bulk_rows, feed_rows,
                 row_count_delta_pct, bulk_median_psm, feed_median_psm,
                 median_delta_pct, hash_coverage, passed, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(report.run_id)
        .bind(report.window_start)
        .bind(report.window_end)
        .bind(report.bulk_rows)
        .bind(report.feed_rows)
        .bind(report.row_count_delta_pct)
        .bind(report.bulk_median_psm)
        .bind(report.feed_median_psm)
        .bind(report.median_delta_pct)
        .bind(report.hash_coverage)
        .bind(report.passed)
        .bind(report.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn latest_reports(&self, limit: i64) -> Result<Vec<ComparisonReport>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT run_id, window_start, window_end, bulk_rows, feed_rows,
                   row_count_delta_pct, bulk_median_psm, feed_median_psm,
                   median_delta_pct, hash_coverage, passed, created_at
            FROM comparison_reports
            ORDER BY created_at DESC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(report_from_row).collect()
    }
}

fn report_from_row(row: &PgRow) -> Result<ComparisonReport, StoreError> {
    Ok(ComparisonReport {
        run_id: row.try_get("run_id")?,
        window_start: row.try_get("window_start")?,
        window_end: row.try_get("window_end")?,
        bulk_rows: row.try_get("bulk_rows")?,
        feed_rows: row.try_get("feed_rows")?,
        row_count_delta_pct: row.try_get("row_count_delta_pct")?,
        bulk_median_psm: row.try_get("bulk_median_psm")?,
        feed_median_psm: row.try_get("feed_median_psm")?,
        median_delta_pct: row.try_get("median_delta_pct")?,
        hash_coverage: row.try_get("hash_coverage")?,
        passed: row.try_get("passed")?,
        created_at: row.try_get("created_at")?,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Bounded exponential backoff: base delay doubles per attempt, capped.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 4,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug)]
struct BucketState {
    tokens: u32,
    last_refill: Instant,
}

/// Process-wide requests-per-minute ceiling. Sleeps cooperatively while
/// drained; never busy-waits.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    pub fn new(capacity: u32, refill_every: Duration) -> Self {
        Self {
            capacity,
            refill_every,
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    pub fn per_minute(requests_per_minute: u32) -> Self {
        let rpm = requests_per_minute.max(1);
        Self::new(rpm, Duration::from_secs_f64(60.0 / rpm as f64))
    }

    pub async fn take(&self) {
        loop {
            let mut state = self.state.lock().await;
            let elapsed = state.last_refill.elapsed();
            if elapsed >= self.refill_every && self.refill_every.as_millis() > 0 {
                let refills = (elapsed.as_millis() / self.refill_every.as_millis()) as u32;
                state.tokens = state.tokens.saturating_add(refills).min(self.capacity);
                state.last_refill = Instant::now();
            }
            if state.tokens > 0 {
                state.tokens -= 1;
                return;
            }
            let sleep_for = self.refill_every;
            drop(state);
            tokio::time::sleep(sleep_for).await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub concurrency: usize,
    pub backoff: BackoffPolicy,
    pub requests_per_minute: Option<u32>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            concurrency: 4,
            backoff: BackoffPolicy::default(),
            requests_per_minute: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

impl FetchError {
    /// Rate-limit and server-side failures are the transient class; the
    /// retry policy is the only recourse for them.
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Request(err) => classify_reqwest_error(err) == RetryDisposition::Retryable,
            FetchError::HttpStatus { status, .. } => {
                StatusCode::from_u16(*status)
                    .map(|s| classify_status(s) == RetryDisposition::Retryable)
                    .unwrap_or(false)
            }
        }
    }
}

/// Reqwest wrapper applying the backoff policy and rate limiter to every
/// request.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    limit: Arc<Semaphore>,
    bucket: Option<Arc<TokenBucket>>,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building reqwest client")?;
        let bucket = config
            .requests_per_minute
            .map(|rpm| Arc::new(TokenBucket::per_minute(rpm)));
        Ok(Self {
            client,
            limit: Arc::new(Semaphore::new(config.concurrency.max(1))),
            bucket,
            backoff: config.backoff,
        })
    }

    pub async fn get_with_headers(
        &self,
        run_id: Uuid,
        label: &str,
        url: &str,
        headers: &[(&str, String)],
    ) -> Result<FetchedResponse, FetchError> {
        let _permit = self.limit.acquire().await.expect("semaphore not closed");

        let span = info_span!("http_fetch", %run_id, label, url);
        let _guard = span.enter();

        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            if let Some(bucket) = &self.bucket {
                bucket.take().await;
            }

            let mut request = self.client.get(url);
            for (name, value) in headers {
                request = request.header(*name, value);
            }

            match request.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();
                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }
                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        last_request_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }

        Err(FetchError::Request(
            last_request_error.expect("retry loop should capture a request error"),
        ))
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone)]
pub struct StoredPayload {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Hash-addressed archive of raw feed payloads, one file per distinct
/// response body. The debugging companion to the run audit table.
#[derive(Debug, Clone)]
pub struct PayloadArchive {
    root: PathBuf,
}

impl PayloadArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Store bytes immutably. The path is a function of the content hash,
    /// so re-fetching identical payloads deduplicates instead of growing
    /// the archive.
    pub async fn store(
        &self,
        fetched_at: DateTime<Utc>,
        label: &str,
        extension: &str,
        bytes: &[u8],
    ) -> anyhow::Result<StoredPayload> {
        let content_hash = sha256_hex(bytes);
        let ext = extension.trim_start_matches('.').trim();
        let ext = if ext.is_empty() { "bin" } else { ext };
        let relative_path = PathBuf::from(label).join(format!("{content_hash}.{ext}"));
        let absolute_path = self.root.join(&relative_path);

        if let Some(parent) = absolute_path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating archive directory {}", parent.display()))?;
        }

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking archive path {}", absolute_path.display()))?
        {
            return Ok(StoredPayload {
                content_hash,
                relative_path,
                absolute_path,
                byte_size: bytes.len(),
                deduplicated: true,
            });
        }

        let temp_name = format!(".{}.{}.tmp", fetched_at.format("%Y%m%d%H%M%S"), Uuid::new_v4());
        let temp_path = absolute_path
            .parent()
            .expect("archive path always has parent")
            .join(temp_name);

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp payload file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp payload file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp payload file {}", temp_path.display()))?;
        drop(file);

        match fs::rename(&temp_path, &absolute_path).await {
            Ok(()) => Ok(StoredPayload {
                content_hash,
                relative_path,
                absolute_path,
                byte_size: bytes.len(),
                deduplicated: false,
            }),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                let _ = fs::remove_file(&temp_path).await;
                Ok(StoredPayload {
                    content_hash,
                    relative_path,
                    absolute_path,
                    byte_size: bytes.len(),
                    deduplicated: true,
                })
            }
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err).with_context(|| {
                    format!("renaming temp payload into {}", absolute_path.display())
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = BackoffPolicy {
            max_retries: 6,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(4),
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(4));
        assert_eq!(policy.delay_for_attempt(6), Duration::from_secs(4));
    }

    #[test]
    fn rate_limit_statuses_are_retryable() {
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::BAD_GATEWAY),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::UNAUTHORIZED),
            RetryDisposition::NonRetryable
        );
    }

    #[tokio::test(start_paused = true)]
    async fn token_bucket_refills_while_sleeping() {
        let bucket = TokenBucket::new(2, Duration::from_secs(1));
        bucket.take().await;
        bucket.take().await;
        // Third take exhausts the burst and must wait for a refill; paused
        // time advances through the sleep deterministically.
        bucket.take().await;
    }

    #[tokio::test]
    async fn archive_deduplicates_identical_payloads() {
        let dir = tempdir().expect("tempdir");
        let archive = PayloadArchive::new(dir.path());
        let fetched_at = DateTime::parse_from_rfc3339("2026-06-01T02:00:00Z")
            .expect("ts")
            .with_timezone(&Utc);

        let first = archive
            .store(fetched_at, "district-group-1", "json", b"{\"Result\":[]}")
            .await
            .expect("first store");
        let second = archive
            .store(fetched_at, "district-group-1", "json", b"{\"Result\":[]}")
            .await
            .expect("second store");

        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(first.content_hash, second.content_hash);
        assert!(first.absolute_path.exists());
    }

    #[test]
    fn per_minute_bucket_spreads_refills() {
        let bucket = TokenBucket::per_minute(30);
        assert_eq!(bucket.capacity, 30);
        assert_eq!(bucket.refill_every, Duration::from_secs(2));
    }
}
