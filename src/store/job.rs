//! Job CRUD and the claim/release protocol.
//!
//! Every mutation here is either a single-statement compare-and-set (the
//! WHERE clause carries the expected current status) or rides a UNIQUE
//! constraint, so concurrent workers coordinate without locks.

use sha2::{Digest, Sha256};
use sqlx::any::AnyRow;
use sqlx::Row;
use tracing::debug;

use super::{get_ts, now_str, retry_transient, JobStore, StoreError, StoreResult};
use crate::dialect::SqlDialect;
use crate::model::{AnalysisStatus, Job, JobMessage, JobStatus};
use crate::params::ParamSet;

/// Stringified inputs longer than this are offloaded to `analysis_data`;
/// the column itself is VARCHAR(255).
pub const MAX_INPUT_ID_LENGTH: usize = 255;

/// Token prefix referencing an offloaded input payload.
pub const EXT_INPUT_PREFIX: &str = "_ext_input_analysis_data_id ";

const JOB_COLUMNS: &str = "job_id, analysis_id, input_id, prev_job_id, worker_id, status, \
     retry_count, semaphore_count, semaphored_job_id, completed, runtime_msec, query_count";

/// Explicit configuration for job creation.
///
/// When `semaphored_job_id` is set the caller has already incremented the
/// funnel's counter speculatively; on a dedup collision the store cancels
/// that increment. When it is unset the new job inherits its parent's
/// funnel and the store performs the increment itself after a successful
/// insert.
#[derive(Debug, Clone, Default)]
pub struct NewJob {
    pub analysis_id: i64,
    pub input: ParamSet,
    pub prev_job_id: Option<i64>,
    pub blocked: bool,
    pub semaphore_count: i32,
    pub semaphored_job_id: Option<i64>,
}

impl NewJob {
    pub fn new(analysis_id: i64, input: ParamSet) -> Self {
        Self {
            analysis_id,
            input,
            ..Self::default()
        }
    }
}

pub(crate) fn job_from_row(row: &AnyRow) -> StoreResult<Job> {
    let status_text: String = row.try_get("status")?;
    let status = JobStatus::parse(&status_text)
        .ok_or_else(|| StoreError::InvalidRow(format!("unknown job status '{status_text}'")))?;
    Ok(Job {
        job_id: row.try_get("job_id")?,
        analysis_id: row.try_get("analysis_id")?,
        input_id: row.try_get("input_id")?,
        prev_job_id: row.try_get("prev_job_id")?,
        worker_id: row.try_get("worker_id")?,
        status,
        retry_count: row.try_get::<i64, _>("retry_count")? as i32,
        semaphore_count: row.try_get::<i64, _>("semaphore_count")? as i32,
        semaphored_job_id: row.try_get("semaphored_job_id")?,
        completed: get_ts(row, "completed")?,
        runtime_msec: row.try_get("runtime_msec")?,
        query_count: row.try_get("query_count")?,
    })
}

impl JobStore {
    // ========================================================================
    // Creation & deduplication
    // ========================================================================

    /// Insert a job, deduplicating on `(input_id, analysis_id)`.
    ///
    /// The structured input is canonicalized (sorted-keys serialization)
    /// before the length check and the insert, so deduplication is
    /// content-based. Returns `None` when the UNIQUE key discarded the
    /// insert.
    pub async fn create_job(&self, new_job: NewJob) -> StoreResult<Option<i64>> {
        let stringified = new_job.input.stringify();
        let input_id = self.offload_input_if_oversized(&stringified).await?;

        // Fan children join their parent's funnel unless the caller wired
        // one explicitly.
        let explicit_funnel = new_job.semaphored_job_id.is_some();
        let semaphored_job_id = match new_job.semaphored_job_id {
            Some(id) => Some(id),
            None => match new_job.prev_job_id {
                Some(prev) => self.fetch_job(prev).await?.semaphored_job_id,
                None => None,
            },
        };

        let status = if new_job.blocked {
            JobStatus::Blocked
        } else {
            JobStatus::Ready
        };

        let d = self.dialect();
        let sql = format!(
            "{prefix} (analysis_id, input_id, prev_job_id, status, retry_count, \
             semaphore_count, semaphored_job_id) VALUES ({values}){suffix}",
            prefix = d.insert_ignore_prefix("job"),
            values = d.placeholders(7),
            suffix = d.insert_ignore_suffix(),
        );
        let result = sqlx::query(&sql)
            .bind(new_job.analysis_id)
            .bind(&input_id)
            .bind(new_job.prev_job_id)
            .bind(status.as_str())
            .bind(0_i32)
            .bind(new_job.semaphore_count)
            .bind(semaphored_job_id)
            .execute(self.pool())
            .await?;

        // The driver reports "no rows affected" numerically; zero means the
        // UNIQUE key discarded the insert.
        if result.rows_affected() == 0 {
            if explicit_funnel {
                if let Some(funnel) = semaphored_job_id {
                    // Cancel the caller's speculative increment.
                    self.decrease_semaphore_count(funnel, 1).await?;
                }
            }
            debug!(
                analysis_id = new_job.analysis_id,
                "duplicate job discarded by dedup key"
            );
            return Ok(None);
        }

        let select = format!(
            "SELECT job_id FROM job WHERE analysis_id = {} AND input_id = {}",
            d.ph(1),
            d.ph(2)
        );
        let job_id: i64 = sqlx::query_scalar(&select)
            .bind(new_job.analysis_id)
            .bind(&input_id)
            .fetch_one(self.pool())
            .await?;

        if !explicit_funnel {
            if let Some(funnel) = semaphored_job_id {
                self.increase_semaphore_count(funnel, 1).await?;
            }
        }

        if !self.stats_by_triggers() {
            let unclaimed_delta: i64 =
                if status == JobStatus::Ready && new_job.semaphore_count <= 0 {
                    1
                } else {
                    0
                };
            let bump = format!(
                "UPDATE analysis_stats SET \
                     total_job_count = total_job_count + 1, \
                     unclaimed_job_count = unclaimed_job_count + {p1}, \
                     status = CASE WHEN status <> 'BLOCKED' THEN 'LOADING' ELSE status END \
                 WHERE analysis_id = {p2}",
                p1 = d.ph(1),
                p2 = d.ph(2),
            );
            sqlx::query(&bump)
                .bind(unclaimed_delta)
                .bind(new_job.analysis_id)
                .execute(self.pool())
                .await?;
        }

        Ok(Some(job_id))
    }

    /// Store `content` in `analysis_data` if not already present and return
    /// the reference token; short payloads pass through unchanged.
    async fn offload_input_if_oversized(&self, stringified: &str) -> StoreResult<String> {
        if stringified.len() <= MAX_INPUT_ID_LENGTH {
            return Ok(stringified.to_string());
        }
        let data_id = self.store_analysis_data_if_needed(stringified).await?;
        Ok(format!("{EXT_INPUT_PREFIX}{data_id}"))
    }

    /// Write-once by content address: identical payloads share one row.
    pub async fn store_analysis_data_if_needed(&self, content: &str) -> StoreResult<i64> {
        let checksum = format!("{:x}", Sha256::digest(content.as_bytes()));
        let d = self.dialect();
        let insert = format!(
            "{prefix} (checksum, data) VALUES ({values}){suffix}",
            prefix = d.insert_ignore_prefix("analysis_data"),
            values = d.placeholders(2),
            suffix = d.insert_ignore_suffix(),
        );
        sqlx::query(&insert)
            .bind(&checksum)
            .bind(content)
            .execute(self.pool())
            .await?;
        let select = format!(
            "SELECT analysis_data_id FROM analysis_data WHERE checksum = {}",
            d.ph(1)
        );
        let id: i64 = sqlx::query_scalar(&select)
            .bind(&checksum)
            .fetch_one(self.pool())
            .await?;
        Ok(id)
    }

    pub async fn fetch_analysis_data(&self, analysis_data_id: i64) -> StoreResult<String> {
        let d = self.dialect();
        let select = format!(
            "SELECT data FROM analysis_data WHERE analysis_data_id = {}",
            d.ph(1)
        );
        sqlx::query_scalar(&select)
            .bind(analysis_data_id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("analysis_data {analysis_data_id}")))
    }

    /// Resolve a job's input back into a parameter mapping, expanding the
    /// `_ext_input_analysis_data_id` indirection if present.
    pub async fn job_input_params(&self, job: &Job) -> StoreResult<ParamSet> {
        let raw = match job.input_id.strip_prefix(EXT_INPUT_PREFIX) {
            Some(rest) => {
                let data_id: i64 = rest.trim().parse().map_err(|_| {
                    StoreError::InvalidRow(format!("bad overflow token '{}'", job.input_id))
                })?;
                self.fetch_analysis_data(data_id).await?
            }
            None => job.input_id.clone(),
        };
        Ok(ParamSet::parse(&raw)?)
    }

    // ========================================================================
    // Claiming
    // ========================================================================

    /// Claim up to `batch_size` READY jobs of the worker's analysis.
    ///
    /// Two-phase selection: virgin jobs (`retry_count = 0`) are preferred so
    /// fresh work progresses the pipeline before retries that may loop; the
    /// any-READY fallback only runs when the first phase claimed nothing.
    /// Under contention a phase may claim fewer than `batch_size` rows; a
    /// short batch is not end-of-work, only an empty one is.
    pub async fn claim_jobs_for_worker(
        &self,
        worker_id: i64,
        analysis_id: i64,
        batch_size: i64,
    ) -> StoreResult<Vec<Job>> {
        if let Some(stats) = self.fetch_analysis_stats(analysis_id).await? {
            if stats.status == AnalysisStatus::Blocked {
                return Ok(Vec::new());
            }
        }

        let mut claimed = self
            .claim_phase(worker_id, analysis_id, batch_size, true)
            .await?;
        if claimed == 0 {
            claimed = self
                .claim_phase(worker_id, analysis_id, batch_size, false)
                .await?;
        }
        if claimed == 0 {
            return Ok(Vec::new());
        }

        if !self.stats_by_triggers() {
            let d = self.dialect();
            let bump = format!(
                "UPDATE analysis_stats SET \
                     unclaimed_job_count = unclaimed_job_count - {p1} \
                 WHERE analysis_id = {p2}",
                p1 = d.ph(1),
                p2 = d.ph(2),
            );
            sqlx::query(&bump)
                .bind(claimed as i64)
                .bind(analysis_id)
                .execute(self.pool())
                .await?;
        }

        let d = self.dialect();
        let select = format!(
            "SELECT {JOB_COLUMNS} FROM job \
             WHERE worker_id = {p1} AND status = 'CLAIMED' ORDER BY job_id",
            p1 = d.ph(1),
        );
        let rows = sqlx::query(&select)
            .bind(worker_id)
            .fetch_all(self.pool())
            .await?;
        rows.iter().map(job_from_row).collect()
    }

    async fn claim_phase(
        &self,
        worker_id: i64,
        analysis_id: i64,
        batch_size: i64,
        virgin_only: bool,
    ) -> StoreResult<u64> {
        let d = self.dialect();
        let virgin = if virgin_only { " AND retry_count = 0" } else { "" };
        let sql = if d.supports_update_limit() {
            format!(
                "UPDATE job SET worker_id = {p1}, status = 'CLAIMED' \
                 WHERE analysis_id = {p2} AND status = 'READY' \
                   AND semaphore_count <= 0{virgin} \
                 LIMIT {batch_size}",
                p1 = d.ph(1),
                p2 = d.ph(2),
            )
        } else {
            // The second status guard is essential: it stops this statement
            // claiming a row another worker reclassified between the
            // subquery and the update.
            format!(
                "UPDATE job SET worker_id = {p1}, status = 'CLAIMED' \
                 WHERE job_id IN (\
                     SELECT job_id FROM job \
                     WHERE analysis_id = {p2} AND status = 'READY' \
                       AND semaphore_count <= 0{virgin} \
                     LIMIT {batch_size}) \
                   AND status = 'READY'",
                p1 = d.ph(1),
                p2 = d.ph(2),
            )
        };
        let result = sqlx::query(&sql)
            .bind(worker_id)
            .bind(analysis_id)
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected())
    }

    /// Conditional READY → CLAIMED used when a worker re-runs a specific
    /// job (for example under `--job-id`). Returns false when somebody else
    /// got there first.
    pub async fn reclaim_job(&self, worker_id: i64, job_id: i64) -> StoreResult<bool> {
        let d = self.dialect();
        let sql = format!(
            "UPDATE job SET worker_id = {p1}, status = 'CLAIMED' \
             WHERE job_id = {p2} AND status = 'READY'",
            p1 = d.ph(1),
            p2 = d.ph(2),
        );
        let result = sqlx::query(&sql)
            .bind(worker_id)
            .bind(job_id)
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected() == 1)
    }

    // ========================================================================
    // Status transitions
    // ========================================================================

    /// Persist a status transition.
    ///
    /// Terminal transitions (DONE, PASSED_ON) also record the observability
    /// fields from `job` and atomically decrement the funnel counter, so no
    /// funnel can be claimed while a fan child is still provably alive.
    /// The whole operation retries on the driver's deadlock sentinel (3
    /// attempts, 1 s linear backoff by default); any other error
    /// propagates.
    pub async fn update_job_status(&self, job: &Job, status: JobStatus) -> StoreResult<()> {
        let (attempts, backoff) = self.deadlock_retry_policy();
        retry_transient(attempts, backoff, StoreError::is_deadlock, || {
            self.update_job_status_once(job, status)
        })
        .await
    }

    async fn update_job_status_once(&self, job: &Job, status: JobStatus) -> StoreResult<()> {
        let d = self.dialect();
        if !matches!(status, JobStatus::Done | JobStatus::PassedOn) {
            let sql = format!(
                "UPDATE job SET status = {p1} WHERE job_id = {p2}",
                p1 = d.ph(1),
                p2 = d.ph(2),
            );
            sqlx::query(&sql)
                .bind(status.as_str())
                .bind(job.job_id)
                .execute(self.pool())
                .await?;
            return Ok(());
        }

        let mut tx = self.pool().begin().await?;
        let sql = format!(
            "UPDATE job SET status = {p1}, completed = {p2}, \
                 runtime_msec = {p3}, query_count = {p4} \
             WHERE job_id = {p5}",
            p1 = d.ph(1),
            p2 = d.ph(2),
            p3 = d.ph(3),
            p4 = d.ph(4),
            p5 = d.ph(5),
        );
        sqlx::query(&sql)
            .bind(status.as_str())
            .bind(now_str())
            .bind(job.runtime_msec)
            .bind(job.query_count)
            .bind(job.job_id)
            .execute(&mut *tx)
            .await?;

        if let Some(funnel) = job.semaphored_job_id {
            let decrement = format!(
                "UPDATE job SET semaphore_count = semaphore_count - 1 WHERE job_id = {p1}",
                p1 = d.ph(1),
            );
            sqlx::query(&decrement)
                .bind(funnel)
                .execute(&mut *tx)
                .await?;
        }

        if !self.stats_by_triggers() {
            let bump = format!(
                "UPDATE analysis_stats SET done_job_count = done_job_count + 1 \
                 WHERE analysis_id = {p1}",
                p1 = d.ph(1),
            );
            sqlx::query(&bump)
                .bind(job.analysis_id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Push a worker's CLAIMED-but-never-started jobs back to READY with no
    /// retry aging. Used when a worker winds down early and by the garbage
    /// collector for dead workers.
    pub async fn reset_claimed_jobs(&self, worker_id: i64) -> StoreResult<u64> {
        let d = self.dialect();
        let sql = format!(
            "UPDATE job SET status = 'READY', worker_id = NULL \
             WHERE worker_id = {p1} AND status = 'CLAIMED'",
            p1 = d.ph(1),
        );
        let result = sqlx::query(&sql)
            .bind(worker_id)
            .execute(self.pool())
            .await?;
        let released = result.rows_affected();
        if released > 0 && !self.stats_by_triggers() {
            // All of these rows belong to the worker's one analysis.
            let analysis_id: Option<i64> = {
                let select = format!(
                    "SELECT analysis_id FROM worker WHERE worker_id = {p1}",
                    p1 = d.ph(1),
                );
                sqlx::query_scalar(&select)
                    .bind(worker_id)
                    .fetch_optional(self.pool())
                    .await?
            };
            if let Some(analysis_id) = analysis_id {
                let bump = format!(
                    "UPDATE analysis_stats SET \
                         unclaimed_job_count = unclaimed_job_count + {p1} \
                     WHERE analysis_id = {p2}",
                    p1 = d.ph(1),
                    p2 = d.ph(2),
                );
                sqlx::query(&bump)
                    .bind(released as i64)
                    .bind(analysis_id)
                    .execute(self.pool())
                    .await?;
            }
        }
        Ok(released)
    }

    /// Release a job from a dead or failing attempt, aging it one retry.
    ///
    /// `status` is assigned before the `retry_count` increment on purpose:
    /// MySQL applies SET clauses left to right and the CASE must read the
    /// pre-increment count. Returns the status the job landed on.
    pub async fn release_and_age(
        &self,
        job_id: i64,
        max_retry_count: i32,
        may_retry: bool,
    ) -> StoreResult<JobStatus> {
        let d = self.dialect();
        let sql = if may_retry {
            format!(
                "UPDATE job SET \
                     status = CASE WHEN retry_count < {max_retry_count} \
                              THEN 'READY' ELSE 'FAILED' END, \
                     retry_count = retry_count + 1, \
                     worker_id = NULL \
                 WHERE job_id = {p1}",
                p1 = d.ph(1),
            )
        } else {
            format!(
                "UPDATE job SET status = 'FAILED', \
                     retry_count = retry_count + 1, \
                     worker_id = NULL \
                 WHERE job_id = {p1}",
                p1 = d.ph(1),
            )
        };
        sqlx::query(&sql).bind(job_id).execute(self.pool()).await?;

        let job = self.fetch_job(job_id).await?;
        match job.status {
            JobStatus::Ready => {
                if !self.stats_by_triggers() && job.semaphore_count <= 0 {
                    let bump = format!(
                        "UPDATE analysis_stats SET \
                             unclaimed_job_count = unclaimed_job_count + 1 \
                         WHERE analysis_id = {p1}",
                        p1 = d.ph(1),
                    );
                    sqlx::query(&bump)
                        .bind(job.analysis_id)
                        .execute(self.pool())
                        .await?;
                }
            }
            JobStatus::Failed => {
                if !self.stats_by_triggers() {
                    let bump = format!(
                        "UPDATE analysis_stats SET \
                             failed_job_count = failed_job_count + 1 \
                         WHERE analysis_id = {p1}",
                        p1 = d.ph(1),
                    );
                    sqlx::query(&bump)
                        .bind(job.analysis_id)
                        .execute(self.pool())
                        .await?;
                }
                // A job that will never complete releases its funnel.
                if let Some(funnel) = job.semaphored_job_id {
                    self.decrease_semaphore_count(funnel, 1).await?;
                }
            }
            _ => {}
        }
        Ok(job.status)
    }

    // ========================================================================
    // Semaphores
    // ========================================================================

    pub async fn increase_semaphore_count(&self, job_id: i64, by: i32) -> StoreResult<()> {
        self.adjust_semaphore_count(job_id, by as i64).await
    }

    pub async fn decrease_semaphore_count(&self, job_id: i64, by: i32) -> StoreResult<()> {
        self.adjust_semaphore_count(job_id, -(by as i64)).await
    }

    async fn adjust_semaphore_count(&self, job_id: i64, delta: i64) -> StoreResult<()> {
        let d = self.dialect();
        let sql = format!(
            "UPDATE job SET semaphore_count = semaphore_count + {p1} WHERE job_id = {p2}",
            p1 = d.ph(1),
            p2 = d.ph(2),
        );
        sqlx::query(&sql)
            .bind(delta)
            .bind(job_id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    // ========================================================================
    // Lookups & observability
    // ========================================================================

    /// Find the job holding this exact input, if any. Computes the same
    /// canonical string (and overflow token) the insert would have used, but
    /// without writing anything.
    pub async fn lookup_job_by_input(
        &self,
        analysis_id: i64,
        input: &ParamSet,
    ) -> StoreResult<Option<Job>> {
        let stringified = input.stringify();
        let input_id = if stringified.len() <= MAX_INPUT_ID_LENGTH {
            stringified
        } else {
            let checksum = format!("{:x}", Sha256::digest(stringified.as_bytes()));
            let d = self.dialect();
            let select = format!(
                "SELECT analysis_data_id FROM analysis_data WHERE checksum = {p1}",
                p1 = d.ph(1),
            );
            let data_id: Option<i64> = sqlx::query_scalar(&select)
                .bind(&checksum)
                .fetch_optional(self.pool())
                .await?;
            match data_id {
                Some(id) => format!("{EXT_INPUT_PREFIX}{id}"),
                None => return Ok(None),
            }
        };
        let d = self.dialect();
        let select = format!(
            "SELECT {JOB_COLUMNS} FROM job WHERE analysis_id = {p1} AND input_id = {p2}",
            p1 = d.ph(1),
            p2 = d.ph(2),
        );
        let row = sqlx::query(&select)
            .bind(analysis_id)
            .bind(&input_id)
            .fetch_optional(self.pool())
            .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    pub async fn fetch_job(&self, job_id: i64) -> StoreResult<Job> {
        let d = self.dialect();
        let select = format!(
            "SELECT {JOB_COLUMNS} FROM job WHERE job_id = {p1}",
            p1 = d.ph(1),
        );
        let row = sqlx::query(&select)
            .bind(job_id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("job {job_id}")))?;
        job_from_row(&row)
    }

    pub async fn fetch_jobs_for_analysis(&self, analysis_id: i64) -> StoreResult<Vec<Job>> {
        let d = self.dialect();
        let select = format!(
            "SELECT {JOB_COLUMNS} FROM job WHERE analysis_id = {p1} ORDER BY job_id",
            p1 = d.ph(1),
        );
        let rows = sqlx::query(&select)
            .bind(analysis_id)
            .fetch_all(self.pool())
            .await?;
        rows.iter().map(job_from_row).collect()
    }

    pub async fn fetch_jobs_for_worker(
        &self,
        worker_id: i64,
        statuses: &[JobStatus],
    ) -> StoreResult<Vec<Job>> {
        let d = self.dialect();
        let status_list = statuses
            .iter()
            .map(|s| format!("'{}'", s.as_str()))
            .collect::<Vec<_>>()
            .join(", ");
        let select = format!(
            "SELECT {JOB_COLUMNS} FROM job \
             WHERE worker_id = {p1} AND status IN ({status_list}) ORDER BY job_id",
            p1 = d.ph(1),
        );
        let rows = sqlx::query(&select)
            .bind(worker_id)
            .fetch_all(self.pool())
            .await?;
        rows.iter().map(job_from_row).collect()
    }

    /// Replace-into `job_file` keyed on `(job_id, retry)`.
    pub async fn store_out_files(
        &self,
        job_id: i64,
        retry: i32,
        worker_id: i64,
        stdout_file: Option<&str>,
        stderr_file: Option<&str>,
    ) -> StoreResult<()> {
        let d = self.dialect();
        let sql = match d {
            SqlDialect::Sqlite => format!(
                "INSERT OR REPLACE INTO job_file \
                     (job_id, retry, worker_id, stdout_file, stderr_file) \
                 VALUES ({})",
                d.placeholders(5)
            ),
            SqlDialect::MySql => format!(
                "REPLACE INTO job_file \
                     (job_id, retry, worker_id, stdout_file, stderr_file) \
                 VALUES ({})",
                d.placeholders(5)
            ),
            SqlDialect::Postgres => format!(
                "INSERT INTO job_file \
                     (job_id, retry, worker_id, stdout_file, stderr_file) \
                 VALUES ({}) \
                 ON CONFLICT (job_id, retry) DO UPDATE SET \
                     worker_id = EXCLUDED.worker_id, \
                     stdout_file = EXCLUDED.stdout_file, \
                     stderr_file = EXCLUDED.stderr_file",
                d.placeholders(5)
            ),
        };
        sqlx::query(&sql)
            .bind(job_id)
            .bind(retry)
            .bind(worker_id)
            .bind(stdout_file)
            .bind(stderr_file)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    pub async fn add_job_message(
        &self,
        job_id: Option<i64>,
        worker_id: Option<i64>,
        msg: &str,
        is_error: bool,
    ) -> StoreResult<()> {
        let d = self.dialect();
        let sql = format!(
            "INSERT INTO job_message (job_id, worker_id, msg, is_error, time) \
             VALUES ({})",
            d.placeholders(5)
        );
        sqlx::query(&sql)
            .bind(job_id)
            .bind(worker_id)
            .bind(msg)
            .bind(if is_error { 1_i32 } else { 0_i32 })
            .bind(now_str())
            .execute(self.pool())
            .await?;
        Ok(())
    }

    pub async fn fetch_job_messages(&self, job_id: i64) -> StoreResult<Vec<JobMessage>> {
        let d = self.dialect();
        let select = format!(
            "SELECT message_id, job_id, worker_id, msg, is_error, time \
             FROM job_message WHERE job_id = {p1} ORDER BY message_id",
            p1 = d.ph(1),
        );
        let rows = sqlx::query(&select)
            .bind(job_id)
            .fetch_all(self.pool())
            .await?;
        rows.iter()
            .map(|row| {
                let time_text: String = row.try_get("time")?;
                Ok(JobMessage {
                    message_id: row.try_get("message_id")?,
                    job_id: row.try_get("job_id")?,
                    worker_id: row.try_get("worker_id")?,
                    msg: row.try_get("msg")?,
                    is_error: row.try_get::<i64, _>("is_error")? != 0,
                    time: super::parse_ts(&time_text)?,
                })
            })
            .collect()
    }
}
