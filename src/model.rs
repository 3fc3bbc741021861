//! Persistent data model: analyses, jobs, workers, and dataflow rules.
//!
//! All cross-references between rows (job ↔ funnel, worker ↔ analysis) are
//! integer foreign keys, never in-memory pointers. In-process copies of rows
//! are short-lived; any state transition goes back through the store.

use chrono::{DateTime, Utc};

use crate::params::ParamSet;

// ============================================================================
// Status enums
// ============================================================================

/// Status of a single job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobStatus {
    Ready,
    Blocked,
    Claimed,
    Compilation,
    GetInput,
    Run,
    WriteOutput,
    Done,
    Failed,
    PassedOn,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ready => "READY",
            Self::Blocked => "BLOCKED",
            Self::Claimed => "CLAIMED",
            Self::Compilation => "COMPILATION",
            Self::GetInput => "GET_INPUT",
            Self::Run => "RUN",
            Self::WriteOutput => "WRITE_OUTPUT",
            Self::Done => "DONE",
            Self::Failed => "FAILED",
            Self::PassedOn => "PASSED_ON",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "READY" => Some(Self::Ready),
            "BLOCKED" => Some(Self::Blocked),
            "CLAIMED" => Some(Self::Claimed),
            "COMPILATION" => Some(Self::Compilation),
            "GET_INPUT" => Some(Self::GetInput),
            "RUN" => Some(Self::Run),
            "WRITE_OUTPUT" => Some(Self::WriteOutput),
            "DONE" => Some(Self::Done),
            "FAILED" => Some(Self::Failed),
            "PASSED_ON" => Some(Self::PassedOn),
            _ => None,
        }
    }

    /// True for the in-flight states a worker moves a claimed job through.
    /// A job in any of these states must have a non-null `worker_id`.
    pub fn is_working(&self) -> bool {
        matches!(
            self,
            Self::Compilation | Self::GetInput | Self::Run | Self::WriteOutput
        )
    }

    /// True once the job will never run again: it either finished or was
    /// handed on. Funnel counters only count jobs outside this set.
    pub fn is_final(&self) -> bool {
        matches!(self, Self::Done | Self::PassedOn | Self::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Aggregate status of an analysis, derived from its job counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnalysisStatus {
    Loading,
    Blocked,
    Ready,
    Working,
    AllClaimed,
    Done,
    Failed,
}

impl AnalysisStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Loading => "LOADING",
            Self::Blocked => "BLOCKED",
            Self::Ready => "READY",
            Self::Working => "WORKING",
            Self::AllClaimed => "ALL_CLAIMED",
            Self::Done => "DONE",
            Self::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "LOADING" => Some(Self::Loading),
            "BLOCKED" => Some(Self::Blocked),
            "READY" => Some(Self::Ready),
            "WORKING" => Some(Self::Working),
            "ALL_CLAIMED" => Some(Self::AllClaimed),
            "DONE" => Some(Self::Done),
            "FAILED" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for AnalysisStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a worker stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CauseOfDeath {
    NoWork,
    JobLimit,
    Lifespan,
    Contaminated,
    MemLimit,
    RunLimit,
    Fatality,
}

impl CauseOfDeath {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoWork => "NO_WORK",
            Self::JobLimit => "JOB_LIMIT",
            Self::Lifespan => "LIFESPAN",
            Self::Contaminated => "CONTAMINATED",
            Self::MemLimit => "MEMLIMIT",
            Self::RunLimit => "RUNLIMIT",
            Self::Fatality => "FATALITY",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "NO_WORK" => Some(Self::NoWork),
            "JOB_LIMIT" => Some(Self::JobLimit),
            "LIFESPAN" => Some(Self::Lifespan),
            "CONTAMINATED" => Some(Self::Contaminated),
            "MEMLIMIT" => Some(Self::MemLimit),
            "RUNLIMIT" => Some(Self::RunLimit),
            "FATALITY" => Some(Self::Fatality),
            _ => None,
        }
    }

    /// Resource overusage means the job itself outgrew the worker, so
    /// re-running it in place would fail the same way. MEMLIMIT always
    /// qualifies; RUNLIMIT only when the dead worker completed nothing
    /// (a worker that was making progress just ran out of wall time).
    pub fn is_resource_overusage(&self, work_done: i64) -> bool {
        match self {
            Self::MemLimit => true,
            Self::RunLimit => work_done == 0,
            _ => false,
        }
    }
}

impl std::fmt::Display for CauseOfDeath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Branch codes
// ============================================================================

/// Label on an outgoing dataflow edge: a small integer or a symbolic name.
///
/// Branch 1 is the main (autoflow) branch. Symbolic names double as GC
/// branches: a dead job's input is re-flowed along the branch named for the
/// worker's cause of death, falling back to `ANYFAILURE`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BranchCode {
    Main,
    Branch(i32),
    Named(String),
}

impl BranchCode {
    /// Conventional branch for a semaphored fan.
    pub const FAN: BranchCode = BranchCode::Branch(2);

    pub const ANYFAILURE: &'static str = "ANYFAILURE";

    pub fn parse(s: &str) -> Self {
        match s.parse::<i32>() {
            Ok(1) => Self::Main,
            Ok(n) => Self::Branch(n),
            Err(_) => Self::Named(s.to_string()),
        }
    }
}

impl std::fmt::Display for BranchCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Main => f.write_str("1"),
            Self::Branch(n) => write!(f, "{n}"),
            Self::Named(name) => f.write_str(name),
        }
    }
}

// ============================================================================
// Model structs
// ============================================================================

/// A node in the pipeline graph: the template for jobs sharing a runnable
/// module and a parameter set. Immutable after pipeline init except for the
/// capacity knobs.
#[derive(Debug, Clone)]
pub struct Analysis {
    pub analysis_id: i64,
    pub logic_name: String,
    pub module: String,
    pub parameters: ParamSet,
    /// Jobs claimed per worker poll.
    pub batch_size: i64,
    /// Maximum concurrent workers for this analysis.
    pub hive_capacity: i64,
    pub max_retry_count: i32,
    /// Tolerated percentage of failed jobs before the analysis is FAILED.
    pub failed_job_tolerance: f64,
}

/// Cached per-analysis counters consumed by the supervisor.
#[derive(Debug, Clone)]
pub struct AnalysisStats {
    pub analysis_id: i64,
    pub status: AnalysisStatus,
    pub total_job_count: i64,
    /// READY jobs with `semaphore_count <= 0`.
    pub unclaimed_job_count: i64,
    pub done_job_count: i64,
    pub failed_job_count: i64,
    pub num_required_workers: i64,
}

/// The unit of work: one instantiation of an analysis with a concrete input
/// parameter mapping.
#[derive(Debug, Clone)]
pub struct Job {
    pub job_id: i64,
    pub analysis_id: i64,
    /// Stringified input mapping, or an `_ext_input_analysis_data_id N`
    /// token when the payload was offloaded.
    pub input_id: String,
    pub prev_job_id: Option<i64>,
    pub worker_id: Option<i64>,
    pub status: JobStatus,
    pub retry_count: i32,
    /// While > 0 the job is ineligible to claim (its fan is still running).
    pub semaphore_count: i32,
    /// The funnel job whose counter this job decrements on completion.
    pub semaphored_job_id: Option<i64>,
    pub completed: Option<DateTime<Utc>>,
    pub runtime_msec: Option<i64>,
    pub query_count: Option<i64>,
}

/// A registered worker process.
#[derive(Debug, Clone)]
pub struct WorkerRow {
    pub worker_id: i64,
    pub analysis_id: i64,
    pub meadow_type: String,
    pub host: String,
    pub process_id: i64,
    pub born: DateTime<Utc>,
    pub died: Option<DateTime<Utc>>,
    pub cause_of_death: Option<CauseOfDeath>,
    pub work_done: i64,
}

/// Declarative dataflow edge `(from_analysis, branch_code) → target URL`.
///
/// A non-empty `funnel_group` marks the branch as a semaphored fan: before
/// fanning, the engine materializes the funnel by following the rules whose
/// branch code equals the group name.
#[derive(Debug, Clone)]
pub struct DataflowRule {
    pub rule_id: i64,
    pub from_analysis_id: i64,
    pub branch_code: BranchCode,
    pub to_url: String,
    pub input_id_template: Option<String>,
    pub funnel_group: Option<String>,
}

/// Execution gate: while `condition_analysis` is not DONE, jobs of
/// `ctrled_analysis` cannot be claimed.
#[derive(Debug, Clone)]
pub struct ControlRule {
    pub rule_id: i64,
    pub condition_analysis_id: i64,
    pub ctrled_analysis_id: i64,
}

/// One accumulated value, fed by a fan job and harvested when its funnel
/// finally runs.
#[derive(Debug, Clone)]
pub struct AccuEntry {
    pub receiving_job_id: i64,
    pub accu_name: String,
    pub accu_address: String,
    pub value: String,
}

/// Diagnostic message attached to a job.
#[derive(Debug, Clone)]
pub struct JobMessage {
    pub message_id: i64,
    pub job_id: Option<i64>,
    pub worker_id: Option<i64>,
    pub msg: String,
    pub is_error: bool,
    pub time: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_status_roundtrip() {
        for status in [
            JobStatus::Ready,
            JobStatus::Blocked,
            JobStatus::Claimed,
            JobStatus::Compilation,
            JobStatus::GetInput,
            JobStatus::Run,
            JobStatus::WriteOutput,
            JobStatus::Done,
            JobStatus::Failed,
            JobStatus::PassedOn,
        ] {
            assert_eq!(JobStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(JobStatus::parse("bogus"), None);
    }

    #[test]
    fn working_states_are_the_four_in_flight_phases() {
        assert!(JobStatus::Compilation.is_working());
        assert!(JobStatus::GetInput.is_working());
        assert!(JobStatus::Run.is_working());
        assert!(JobStatus::WriteOutput.is_working());
        assert!(!JobStatus::Claimed.is_working());
        assert!(!JobStatus::Ready.is_working());
        assert!(!JobStatus::Done.is_working());
    }

    #[test]
    fn final_states_release_funnels() {
        assert!(JobStatus::Done.is_final());
        assert!(JobStatus::PassedOn.is_final());
        assert!(JobStatus::Failed.is_final());
        assert!(!JobStatus::Run.is_final());
    }

    #[test]
    fn analysis_status_roundtrip() {
        for status in [
            AnalysisStatus::Loading,
            AnalysisStatus::Blocked,
            AnalysisStatus::Ready,
            AnalysisStatus::Working,
            AnalysisStatus::AllClaimed,
            AnalysisStatus::Done,
            AnalysisStatus::Failed,
        ] {
            assert_eq!(AnalysisStatus::parse(status.as_str()), Some(status));
        }
    }

    #[test]
    fn cause_of_death_roundtrip() {
        for cause in [
            CauseOfDeath::NoWork,
            CauseOfDeath::JobLimit,
            CauseOfDeath::Lifespan,
            CauseOfDeath::Contaminated,
            CauseOfDeath::MemLimit,
            CauseOfDeath::RunLimit,
            CauseOfDeath::Fatality,
        ] {
            assert_eq!(CauseOfDeath::parse(cause.as_str()), Some(cause));
        }
    }

    #[test]
    fn memlimit_is_always_resource_overusage() {
        assert!(CauseOfDeath::MemLimit.is_resource_overusage(0));
        assert!(CauseOfDeath::MemLimit.is_resource_overusage(10));
    }

    #[test]
    fn runlimit_is_overusage_only_without_progress() {
        assert!(CauseOfDeath::RunLimit.is_resource_overusage(0));
        assert!(!CauseOfDeath::RunLimit.is_resource_overusage(3));
        assert!(!CauseOfDeath::Fatality.is_resource_overusage(0));
    }

    #[test]
    fn branch_code_parse_and_display() {
        assert_eq!(BranchCode::parse("1"), BranchCode::Main);
        assert_eq!(BranchCode::parse("2"), BranchCode::FAN);
        assert_eq!(BranchCode::parse("7"), BranchCode::Branch(7));
        assert_eq!(
            BranchCode::parse("MEMLIMIT"),
            BranchCode::Named("MEMLIMIT".to_string())
        );
        assert_eq!(BranchCode::Main.to_string(), "1");
        assert_eq!(BranchCode::Branch(3).to_string(), "3");
        assert_eq!(BranchCode::Named("A".into()).to_string(), "A");
    }
}
