//! Apiary - a distributed workflow engine core.
//!
//! A pipeline is a directed graph of *analyses*; each analysis templates
//! *jobs* that independent *workers* claim and execute, coordinated entirely
//! through a shared relational store. The crate provides:
//!
//! ## Store
//!
//! - [`JobStore`]: the claim/execute/completion protocol over SQLite, MySQL
//!   or Postgres (single-statement compare-and-set updates, UNIQUE-key
//!   dedup, counting-semaphore fan-in)
//! - [`config`]: explicit engine configuration, no global state
//!
//! ## Execution
//!
//! - [`Worker`]: the process-long claim → run → write-output loop
//! - [`Runnable`] / [`RunnableRegistry`]: the module interface user code
//!   implements, dispatched by name
//! - [`DataflowEngine`]: turns emitted events into downstream jobs,
//!   including semaphored fans and their funnels
//! - [`JobFactory`]: the built-in batch-source expander
//!
//! ## Recovery
//!
//! - [`GarbageCollector`]: reclaims jobs from dead workers, re-flowing them
//!   along cause-of-death branches where configured

pub mod config;
pub mod dataflow;
pub mod dialect;
pub mod factory;
pub mod gc;
pub mod model;
pub mod params;
pub mod runnable;
pub mod stats;
pub mod store;
pub mod url;
pub mod worker;

// Configuration
pub use config::HiveConfig;

// Store
pub use store::{
    AnalysisSpec, DataflowRuleSpec, JobStore, NewJob, StoreError, StoreResult, EXT_INPUT_PREFIX,
    MAX_INPUT_ID_LENGTH,
};

// Data model
pub use model::{
    AccuEntry, Analysis, AnalysisStats, AnalysisStatus, BranchCode, CauseOfDeath, ControlRule,
    DataflowRule, Job, JobMessage, JobStatus, WorkerRow,
};

// Parameters
pub use params::{InputTemplate, ParamError, ParamSet};

// Execution
pub use dataflow::{DataflowEngine, DataflowError};
pub use factory::JobFactory;
pub use runnable::{RunContext, Runnable, RunnableError, RunnableRegistry};
pub use worker::{Worker, WorkerConfig, WorkerError};

// Recovery & feedback
pub use gc::{GarbageCollector, GcOutcome};
pub use stats::JobCounts;

// Resource URLs
pub use url::{InsertionMethod, ObjectType, RemoteEndpoint, ResourceUrl, UrlError};
