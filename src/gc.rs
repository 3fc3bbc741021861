//! Garbage collection: recovering jobs from dead workers.
//!
//! Invoked by the supervisor when it decides a worker is dead (missed
//! heartbeat, or the execution environment reported the host gone). Claimed
//! jobs that never started go straight back to READY unaged; jobs caught in
//! a working phase are first offered to a dataflow branch named for the
//! cause of death (so a MEMLIMIT victim can be passed on to a himem
//! analysis), then to `ANYFAILURE`, and only then released-and-aged.

use std::collections::HashMap;

use tracing::{debug, info};

use crate::dataflow::{DataflowEngine, DataflowError};
use crate::model::{Analysis, BranchCode, CauseOfDeath, Job, JobStatus};
use crate::store::JobStore;

/// What one dead-worker sweep did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcOutcome {
    /// CLAIMED rows pushed back to READY, unaged
    pub released_unstarted: u64,
    /// Working rows flowed onwards and marked PASSED_ON
    pub passed_on: usize,
    /// Working rows released back to READY with a retry increment
    pub aged_to_ready: usize,
    /// Working rows that exhausted their retries (or were not retriable)
    pub failed: usize,
}

pub struct GarbageCollector<'a> {
    store: &'a JobStore,
}

impl<'a> GarbageCollector<'a> {
    pub fn new(store: &'a JobStore) -> Self {
        Self { store }
    }

    /// Recover every job the dead worker still holds.
    pub async fn collect_dead_worker(
        &self,
        worker_id: i64,
        cause: CauseOfDeath,
    ) -> Result<GcOutcome, DataflowError> {
        // Idempotent when the supervisor already wrote the death.
        self.store.record_worker_death(worker_id, cause).await?;
        let worker = self.store.fetch_worker(worker_id).await?;
        let resource_overusage = cause.is_resource_overusage(worker.work_done);

        let claimed = self
            .store
            .fetch_jobs_for_worker(worker_id, &[JobStatus::Claimed])
            .await?;
        let mut outcome = GcOutcome {
            released_unstarted: self.store.reset_claimed_jobs(worker_id).await?,
            ..GcOutcome::default()
        };
        for job in &claimed {
            self.store
                .add_job_message(
                    Some(job.job_id),
                    Some(worker_id),
                    &format!("released unstarted claim of dead worker {worker_id} ({cause})"),
                    true,
                )
                .await?;
        }

        let working = self
            .store
            .fetch_jobs_for_worker(
                worker_id,
                &[
                    JobStatus::Compilation,
                    JobStatus::GetInput,
                    JobStatus::Run,
                    JobStatus::WriteOutput,
                ],
            )
            .await?;

        let mut analyses: HashMap<i64, Analysis> = HashMap::new();
        for job in working {
            let mut flowed = false;
            if resource_overusage {
                flowed = self
                    .gc_dataflow(&job, &BranchCode::Named(cause.as_str().to_string()))
                    .await?;
            }
            if !flowed {
                flowed = self
                    .gc_dataflow(&job, &BranchCode::Named(BranchCode::ANYFAILURE.to_string()))
                    .await?;
            }

            if flowed {
                self.store
                    .update_job_status(&job, JobStatus::PassedOn)
                    .await?;
                outcome.passed_on += 1;
            } else {
                if !analyses.contains_key(&job.analysis_id) {
                    let fetched = self.store.fetch_analysis(job.analysis_id).await?;
                    analyses.insert(job.analysis_id, fetched);
                }
                let analysis = &analyses[&job.analysis_id];
                let landed = self
                    .store
                    .release_and_age(job.job_id, analysis.max_retry_count, !resource_overusage)
                    .await?;
                match landed {
                    JobStatus::Ready => outcome.aged_to_ready += 1,
                    _ => outcome.failed += 1,
                }
            }

            self.store
                .add_job_message(
                    Some(job.job_id),
                    Some(worker_id),
                    &format!(
                        "garbage collected from dead worker {worker_id} ({cause}) in {}",
                        job.status
                    ),
                    true,
                )
                .await?;
        }

        info!(
            worker_id,
            cause_of_death = %cause,
            released_unstarted = outcome.released_unstarted,
            passed_on = outcome.passed_on,
            aged_to_ready = outcome.aged_to_ready,
            failed = outcome.failed,
            "dead worker collected"
        );
        Ok(outcome)
    }

    /// Re-flow a dead job's own input along `branch`. True when at least
    /// one rule matched and the flow went through.
    async fn gc_dataflow(&self, job: &Job, branch: &BranchCode) -> Result<bool, DataflowError> {
        let rules = self.store.dataflow_rules(job.analysis_id, branch).await?;
        if rules.is_empty() {
            return Ok(false);
        }
        let params = self.store.job_input_params(job).await?;
        debug!(job_id = job.job_id, branch = %branch, "re-flowing dead job input");
        let engine = DataflowEngine::new(self.store);
        engine
            .emit(job, &params, std::slice::from_ref(&params), branch)
            .await?;
        Ok(true)
    }
}
