//! Worker lifecycle and the job execution loop.
//!
//! A worker is a process-long entity bound to one analysis. Its life is a
//! single-threaded loop:
//!
//! ```text
//! register ─▶ claim batch ─▶ per job: COMPILATION ─▶ GET_INPUT ─▶ RUN ─▶
//!                 ▲                   WRITE_OUTPUT ─▶ DONE
//!                 └────────────── until a termination cause ──▶ record death
//! ```
//!
//! Each phase transition is persisted before the phase runs so the garbage
//! collector can attribute a crash to the right phase. Concurrency between
//! workers is mediated entirely by the store's atomic row updates; there is
//! nothing to lock here.

use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::model::{Analysis, CauseOfDeath, Job, JobStatus, WorkerRow};
use crate::runnable::{RunContext, RunnableError, RunnableRegistry};
use crate::store::{JobStore, StoreError};

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Knobs for one worker process.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Execution environment label recorded on the worker row
    pub meadow_type: String,
    /// Overrides the analysis's own claim batch size
    pub batch_size: Option<i64>,
    /// Retire after this many completed jobs
    pub job_limit: Option<u64>,
    /// Soft wall-clock deadline, checked between jobs
    pub life_span: Option<Duration>,
    /// Nap after an empty claim before concluding NO_WORK
    pub claim_grace: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            meadow_type: "LOCAL".to_string(),
            batch_size: None,
            job_limit: None,
            life_span: None,
            claim_grace: Duration::from_secs(1),
        }
    }
}

/// One failed job attempt: which phase died and why.
#[derive(Debug)]
struct JobFailure {
    phase: JobStatus,
    error: RunnableError,
}

impl JobFailure {
    fn new(phase: JobStatus, error: impl Into<RunnableError>) -> Self {
        Self {
            phase,
            error: error.into(),
        }
    }
}

fn read_hostname() -> String {
    std::fs::read_to_string("/proc/sys/kernel/hostname")
        .map(|s| s.trim().to_string())
        .or_else(|_| std::env::var("HOSTNAME"))
        .unwrap_or_else(|_| "localhost".to_string())
}

pub struct Worker {
    store: JobStore,
    registry: RunnableRegistry,
    analysis: Analysis,
    row: WorkerRow,
    config: WorkerConfig,
    work_done: u64,
    contaminated: bool,
}

impl Worker {
    /// Register a worker row and bind it to `logic_name` for its lifetime.
    pub async fn register(
        store: JobStore,
        registry: RunnableRegistry,
        logic_name: &str,
        config: WorkerConfig,
    ) -> Result<Self, WorkerError> {
        let analysis = store.fetch_analysis_by_logic_name(logic_name).await?;
        let host = read_hostname();
        let row = store
            .register_worker(
                analysis.analysis_id,
                &config.meadow_type,
                &host,
                std::process::id() as i64,
            )
            .await?;
        info!(
            worker_id = row.worker_id,
            analysis = %analysis.logic_name,
            host = %host,
            "worker registered"
        );
        Ok(Self {
            store,
            registry,
            analysis,
            row,
            config,
            work_done: 0,
            contaminated: false,
        })
    }

    pub fn worker_id(&self) -> i64 {
        self.row.worker_id
    }

    pub fn analysis(&self) -> &Analysis {
        &self.analysis
    }

    /// Run the main loop until a termination cause, record the death and
    /// return the cause.
    pub async fn run(mut self) -> Result<CauseOfDeath, WorkerError> {
        let started = Instant::now();
        let cause = self.main_loop(started).await?;
        self.store
            .record_worker_death(self.row.worker_id, cause)
            .await?;
        info!(
            worker_id = self.row.worker_id,
            cause_of_death = %cause,
            work_done = self.work_done,
            "worker retired"
        );
        Ok(cause)
    }

    async fn main_loop(&mut self, started: Instant) -> Result<CauseOfDeath, WorkerError> {
        let batch_size = self
            .config
            .batch_size
            .unwrap_or(self.analysis.batch_size)
            .max(1);

        loop {
            if let Some(cause) = self.termination_cause(started) {
                return Ok(cause);
            }

            let mut jobs = self
                .store
                .claim_jobs_for_worker(self.row.worker_id, self.analysis.analysis_id, batch_size)
                .await?;

            // A short batch is not end-of-work (contention can under-fill
            // it); only an empty claim is, and even then only after a grace
            // nap and one more look.
            if jobs.is_empty() {
                if !self.config.claim_grace.is_zero() {
                    tokio::time::sleep(self.config.claim_grace).await;
                    jobs = self
                        .store
                        .claim_jobs_for_worker(
                            self.row.worker_id,
                            self.analysis.analysis_id,
                            batch_size,
                        )
                        .await?;
                }
                if jobs.is_empty() {
                    return Ok(CauseOfDeath::NoWork);
                }
            }

            for job in jobs {
                if let Some(cause) = self.termination_cause(started) {
                    // Unstarted claims go straight back, unaged.
                    self.store.reset_claimed_jobs(self.row.worker_id).await?;
                    return Ok(cause);
                }
                self.run_one_job(job).await?;
                if self.contaminated {
                    return Ok(CauseOfDeath::Contaminated);
                }
            }
        }
    }

    fn termination_cause(&self, started: Instant) -> Option<CauseOfDeath> {
        if let Some(limit) = self.config.job_limit {
            if self.work_done >= limit {
                return Some(CauseOfDeath::JobLimit);
            }
        }
        if let Some(life_span) = self.config.life_span {
            if started.elapsed() >= life_span {
                return Some(CauseOfDeath::Lifespan);
            }
        }
        None
    }

    /// Reclaim and run one specific job (the `--job-id` path). Returns
    /// false when the job was not READY to reclaim.
    pub async fn run_specific_job(&mut self, job_id: i64) -> Result<bool, WorkerError> {
        if !self.store.reclaim_job(self.row.worker_id, job_id).await? {
            warn!(job_id, "job not READY; nothing reclaimed");
            return Ok(false);
        }
        let job = self.store.fetch_job(job_id).await?;
        self.run_one_job(job).await?;
        Ok(true)
    }

    async fn run_one_job(&mut self, job: Job) -> Result<(), WorkerError> {
        let attempt_started = Instant::now();
        match self.execute_phases(job.clone(), attempt_started).await {
            Ok(()) => {
                self.work_done += 1;
                self.store
                    .increment_worker_work_done(self.row.worker_id)
                    .await?;
                Ok(())
            }
            Err(failure) => self.handle_job_failure(&job, failure).await,
        }
    }

    async fn execute_phases(
        &mut self,
        mut job: Job,
        attempt_started: Instant,
    ) -> Result<(), JobFailure> {
        // COMPILATION: persist first so a crash here is attributable.
        self.store
            .update_job_status(&job, JobStatus::Compilation)
            .await
            .map_err(|err| JobFailure::new(JobStatus::Compilation, err))?;
        let Some(mut runnable) = self.registry.instantiate(&self.analysis.module) else {
            self.contaminated = true;
            return Err(JobFailure::new(
                JobStatus::Compilation,
                RunnableError::Data(format!(
                    "module '{}' is not registered",
                    self.analysis.module
                )),
            ));
        };

        // GET_INPUT: job input over analysis parameters over module
        // defaults, plus whatever this job's fan accumulated for it.
        self.store
            .update_job_status(&job, JobStatus::GetInput)
            .await
            .map_err(|err| JobFailure::new(JobStatus::GetInput, err))?;
        let mut params = self
            .store
            .job_input_params(&job)
            .await
            .map_err(|err| JobFailure::new(JobStatus::GetInput, err))?;
        params.merge_under(&self.analysis.parameters);
        params.merge_under(&runnable.param_defaults());
        let harvested = self
            .store
            .harvest_accu(job.job_id)
            .await
            .map_err(|err| JobFailure::new(JobStatus::GetInput, err))?;
        params.merge_under(&harvested);

        let mut ctx = RunContext::new(&self.store, job.clone(), params);
        runnable
            .fetch_input(&mut ctx)
            .await
            .map_err(|err| JobFailure::new(JobStatus::GetInput, err))?;

        // RUN
        self.store
            .update_job_status(&job, JobStatus::Run)
            .await
            .map_err(|err| JobFailure::new(JobStatus::Run, err))?;
        runnable
            .run(&mut ctx)
            .await
            .map_err(|err| JobFailure::new(JobStatus::Run, err))?;

        // WRITE_OUTPUT: dataflow lands before the job turns DONE.
        self.store
            .update_job_status(&job, JobStatus::WriteOutput)
            .await
            .map_err(|err| JobFailure::new(JobStatus::WriteOutput, err))?;
        runnable
            .write_output(&mut ctx)
            .await
            .map_err(|err| JobFailure::new(JobStatus::WriteOutput, err))?;

        let (stdout_file, stderr_file) = ctx.out_files();
        if stdout_file.is_some() || stderr_file.is_some() {
            self.store
                .store_out_files(
                    job.job_id,
                    job.retry_count,
                    self.row.worker_id,
                    stdout_file,
                    stderr_file,
                )
                .await
                .map_err(|err| JobFailure::new(JobStatus::WriteOutput, err))?;
        }

        job.runtime_msec = Some(attempt_started.elapsed().as_millis() as i64);
        job.query_count = Some(ctx.query_count());
        self.store
            .update_job_status(&job, JobStatus::Done)
            .await
            .map_err(|err| JobFailure::new(JobStatus::Done, err))?;
        debug!(
            job_id = job.job_id,
            runtime_msec = job.runtime_msec,
            "job done"
        );
        Ok(())
    }

    async fn handle_job_failure(
        &mut self,
        job: &Job,
        failure: JobFailure,
    ) -> Result<(), WorkerError> {
        let may_retry = failure.error.is_retriable();
        self.store
            .add_job_message(
                Some(job.job_id),
                Some(self.row.worker_id),
                &format!("{} failed: {}", failure.phase, failure.error),
                true,
            )
            .await?;
        let landed = self
            .store
            .release_and_age(job.job_id, self.analysis.max_retry_count, may_retry)
            .await?;
        warn!(
            job_id = job.job_id,
            phase = %failure.phase,
            landed = %landed,
            error = %failure.error,
            "job attempt failed"
        );
        // Compile failures are contagious: this worker cannot run anything.
        if failure.phase == JobStatus::Compilation {
            self.contaminated = true;
        }
        Ok(())
    }
}
