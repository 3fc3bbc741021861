//! Analysis statistics and scheduler feedback.
//!
//! `analysis_stats` rows are cached counters. Store operations keep them
//! approximately current with explicit increments (skipped entirely when DB
//! triggers mirror job transitions), and the periodic recalculation here
//! recomputes them exactly from the job table, derives the aggregate status
//! and refreshes `num_required_workers` for the external supervisor.

use sqlx::Row;
use tracing::debug;

use crate::model::{AnalysisStats, AnalysisStatus};
use crate::store::{JobStore, StoreResult};

/// Exact job counts for one analysis, recomputed from the job table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobCounts {
    pub total: i64,
    /// READY with `semaphore_count <= 0`
    pub unclaimed: i64,
    /// DONE or PASSED_ON
    pub done: i64,
    pub failed: i64,
    /// CLAIMED or in a working phase
    pub in_progress: i64,
}

/// Derive the aggregate status from exact counts.
///
/// Order matters: a gated analysis is BLOCKED regardless of its counters,
/// excess failures trump everything else, and ALL_CLAIMED wins over WORKING
/// because it means the analysis has nothing left to hand out.
pub(crate) fn derive_status(
    blocked: bool,
    counts: &JobCounts,
    failed_job_tolerance: f64,
) -> AnalysisStatus {
    if blocked {
        return AnalysisStatus::Blocked;
    }
    if counts.total > 0 {
        let failed_pct = counts.failed as f64 * 100.0 / counts.total as f64;
        if failed_pct > failed_job_tolerance {
            return AnalysisStatus::Failed;
        }
    }
    if counts.done + counts.failed == counts.total {
        return AnalysisStatus::Done;
    }
    if counts.unclaimed == 0 {
        return AnalysisStatus::AllClaimed;
    }
    if counts.in_progress > 0 {
        return AnalysisStatus::Working;
    }
    AnalysisStatus::Ready
}

pub(crate) fn required_workers(unclaimed: i64, batch_size: i64, hive_capacity: i64) -> i64 {
    let batch_size = batch_size.max(1);
    let needed = (unclaimed + batch_size - 1) / batch_size;
    needed.min(hive_capacity)
}

impl JobStore {
    /// Recompute exact job counts for an analysis.
    pub async fn count_jobs(&self, analysis_id: i64) -> StoreResult<JobCounts> {
        let d = self.dialect();
        let select = format!(
            "SELECT COUNT(*) AS total, \
                 COALESCE(SUM(CASE WHEN status = 'READY' AND semaphore_count <= 0 \
                     THEN 1 ELSE 0 END), 0) AS unclaimed, \
                 COALESCE(SUM(CASE WHEN status IN ('DONE', 'PASSED_ON') \
                     THEN 1 ELSE 0 END), 0) AS done, \
                 COALESCE(SUM(CASE WHEN status = 'FAILED' THEN 1 ELSE 0 END), 0) AS failed, \
                 COALESCE(SUM(CASE WHEN status IN ('CLAIMED', 'COMPILATION', 'GET_INPUT', \
                     'RUN', 'WRITE_OUTPUT') THEN 1 ELSE 0 END), 0) AS in_progress \
             FROM job WHERE analysis_id = {p1}",
            p1 = d.ph(1),
        );
        let row = sqlx::query(&select)
            .bind(analysis_id)
            .fetch_one(self.pool())
            .await?;
        Ok(JobCounts {
            total: row.try_get("total")?,
            unclaimed: row.try_get("unclaimed")?,
            done: row.try_get("done")?,
            failed: row.try_get("failed")?,
            in_progress: row.try_get("in_progress")?,
        })
    }

    /// Periodic status derivation for one analysis.
    ///
    /// Also lifts the gate: once every controlling analysis is DONE, jobs
    /// created BLOCKED flip to READY and become claimable on the next poll.
    pub async fn recalculate_stats(&self, analysis_id: i64) -> StoreResult<AnalysisStats> {
        let analysis = self.fetch_analysis(analysis_id).await?;

        let mut blocked = false;
        for rule in self.control_rules_for(analysis_id).await? {
            let condition_done = self
                .fetch_analysis_stats(rule.condition_analysis_id)
                .await?
                .map(|stats| stats.status == AnalysisStatus::Done)
                .unwrap_or(false);
            if !condition_done {
                blocked = true;
                break;
            }
        }

        let d = self.dialect();
        if !blocked {
            let unblock = format!(
                "UPDATE job SET status = 'READY' \
                 WHERE analysis_id = {p1} AND status = 'BLOCKED'",
                p1 = d.ph(1),
            );
            let unblocked = sqlx::query(&unblock)
                .bind(analysis_id)
                .execute(self.pool())
                .await?
                .rows_affected();
            if unblocked > 0 {
                debug!(
                    analysis = %analysis.logic_name,
                    unblocked,
                    "control conditions met; jobs released"
                );
            }
        }

        let counts = self.count_jobs(analysis_id).await?;
        let status = derive_status(blocked, &counts, analysis.failed_job_tolerance);
        let num_required_workers =
            required_workers(counts.unclaimed, analysis.batch_size, analysis.hive_capacity);

        let update = format!(
            "UPDATE analysis_stats SET \
                 status = {p1}, \
                 total_job_count = {p2}, \
                 unclaimed_job_count = {p3}, \
                 done_job_count = {p4}, \
                 failed_job_count = {p5}, \
                 num_required_workers = {p6} \
             WHERE analysis_id = {p7}",
            p1 = d.ph(1),
            p2 = d.ph(2),
            p3 = d.ph(3),
            p4 = d.ph(4),
            p5 = d.ph(5),
            p6 = d.ph(6),
            p7 = d.ph(7),
        );
        sqlx::query(&update)
            .bind(status.as_str())
            .bind(counts.total)
            .bind(counts.unclaimed)
            .bind(counts.done)
            .bind(counts.failed)
            .bind(num_required_workers)
            .bind(analysis_id)
            .execute(self.pool())
            .await?;

        Ok(AnalysisStats {
            analysis_id,
            status,
            total_job_count: counts.total,
            unclaimed_job_count: counts.unclaimed,
            done_job_count: counts.done,
            failed_job_count: counts.failed,
            num_required_workers,
        })
    }

    /// Recalculate every analysis in id order (pipelines are loaded
    /// upstream-first, so conditions usually refresh before their
    /// dependents).
    pub async fn recalculate_all_stats(&self) -> StoreResult<Vec<AnalysisStats>> {
        let analyses = self.list_analyses_matching("*").await?;
        let mut all = Vec::with_capacity(analyses.len());
        for analysis in analyses {
            all.push(self.recalculate_stats(analysis.analysis_id).await?);
        }
        Ok(all)
    }
}
