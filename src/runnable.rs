//! The runnable interface: what user modules provide and what the engine
//! hands them while a job runs.
//!
//! Modules are looked up by name in a [`RunnableRegistry`] populated at
//! startup; an unknown name fails the job's COMPILATION phase as a data
//! error rather than crashing the worker.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::dataflow::{DataflowEngine, DataflowError};
use crate::model::{BranchCode, Job};
use crate::params::{ParamError, ParamSet};
use crate::store::{JobStore, StoreError};

#[derive(Debug, Error)]
pub enum RunnableError {
    /// Bad input or configuration: the job fails without retry.
    #[error("data error: {0}")]
    Data(String),

    /// A runtime failure worth retrying (up to the analysis's retry limit).
    #[error("{0}")]
    Runtime(String),

    #[error(transparent)]
    Param(#[from] ParamError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Dataflow(#[from] DataflowError),
}

impl RunnableError {
    /// Whether the failure is worth another attempt. Data and template
    /// errors are deterministic; store hiccups are not.
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::Data(_) | Self::Param(_) => false,
            Self::Runtime(_) | Self::Store(_) => true,
            Self::Dataflow(err) => matches!(err, DataflowError::Store(_)),
        }
    }
}

/// Per-job state the engine passes to each runnable phase.
pub struct RunContext<'a> {
    store: &'a JobStore,
    job: Job,
    params: ParamSet,
    query_count: i64,
    stdout_file: Option<String>,
    stderr_file: Option<String>,
}

impl<'a> RunContext<'a> {
    pub fn new(store: &'a JobStore, job: Job, params: ParamSet) -> Self {
        Self {
            store,
            job,
            params,
            query_count: 0,
            stdout_file: None,
            stderr_file: None,
        }
    }

    pub fn job(&self) -> &Job {
        &self.job
    }

    /// Fully merged parameters: module defaults under analysis parameters
    /// under the job's own input.
    pub fn params(&self) -> &ParamSet {
        &self.params
    }

    pub fn params_mut(&mut self) -> &mut ParamSet {
        &mut self.params
    }

    pub fn store(&self) -> &JobStore {
        self.store
    }

    /// Store round-trips attributed to this job so far.
    pub fn query_count(&self) -> i64 {
        self.query_count
    }

    /// Count a store round-trip made on the job's behalf.
    pub fn note_query(&mut self) {
        self.query_count += 1;
    }

    /// Register where this attempt's captured stdout/stderr landed; the
    /// worker persists the paths keyed on `(job_id, retry)`.
    pub fn set_out_files(
        &mut self,
        stdout_file: Option<String>,
        stderr_file: Option<String>,
    ) {
        self.stdout_file = stdout_file;
        self.stderr_file = stderr_file;
    }

    pub fn out_files(&self) -> (Option<&str>, Option<&str>) {
        (self.stdout_file.as_deref(), self.stderr_file.as_deref())
    }

    /// Emit output parameters on a branch.
    ///
    /// Effects are durable immediately, before the job is marked DONE, so
    /// downstream jobs can be claimed while this one is still writing
    /// output. Returns the ids of the jobs created downstream.
    pub async fn dataflow_output_id(
        &mut self,
        output: Vec<ParamSet>,
        branch: BranchCode,
    ) -> Result<Vec<i64>, RunnableError> {
        self.query_count += 1;
        let engine = DataflowEngine::new(self.store);
        Ok(engine
            .emit(&self.job, &self.params, &output, &branch)
            .await?)
    }
}

/// A user module instantiated once per job.
///
/// `fetch_input`, `run` and `write_output` all default to no-ops so modules
/// implement only the phases they care about.
#[async_trait]
pub trait Runnable: Send {
    /// Compile-time constants merged under the analysis parameters.
    fn param_defaults(&self) -> ParamSet {
        ParamSet::new()
    }

    async fn fetch_input(&mut self, ctx: &mut RunContext<'_>) -> Result<(), RunnableError> {
        let _ = ctx;
        Ok(())
    }

    async fn run(&mut self, ctx: &mut RunContext<'_>) -> Result<(), RunnableError> {
        let _ = ctx;
        Ok(())
    }

    async fn write_output(&mut self, ctx: &mut RunContext<'_>) -> Result<(), RunnableError> {
        let _ = ctx;
        Ok(())
    }
}

pub type RunnableFactory = Arc<dyn Fn() -> Box<dyn Runnable> + Send + Sync>;

/// Maps module names to factories. Populated at startup; workers hold it
/// for their whole lifetime.
#[derive(Clone, Default)]
pub struct RunnableRegistry {
    factories: HashMap<String, RunnableFactory>,
}

impl RunnableRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the built-in modules (currently the job factory).
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("JobFactory", || {
            Box::new(crate::factory::JobFactory::default())
        });
        registry
    }

    pub fn register<F>(&mut self, module_name: impl Into<String>, factory: F)
    where
        F: Fn() -> Box<dyn Runnable> + Send + Sync + 'static,
    {
        self.factories
            .insert(module_name.into(), Arc::new(factory));
    }

    /// Instantiate a module by name, or `None` if it was never registered.
    pub fn instantiate(&self, module_name: &str) -> Option<Box<dyn Runnable>> {
        self.factories.get(module_name).map(|factory| factory())
    }

    pub fn contains(&self, module_name: &str) -> bool {
        self.factories.contains_key(module_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;

    #[async_trait]
    impl Runnable for Noop {}

    #[test]
    fn registry_instantiates_registered_modules() {
        let mut registry = RunnableRegistry::new();
        registry.register("Noop", || Box::new(Noop));
        assert!(registry.contains("Noop"));
        assert!(registry.instantiate("Noop").is_some());
    }

    #[test]
    fn unknown_module_is_none_not_a_panic() {
        let registry = RunnableRegistry::new();
        assert!(registry.instantiate("DoesNotExist").is_none());
    }

    #[test]
    fn builtins_include_the_job_factory() {
        let registry = RunnableRegistry::with_builtins();
        assert!(registry.contains("JobFactory"));
    }

    #[test]
    fn data_errors_are_not_retriable() {
        assert!(!RunnableError::Data("bad input".into()).is_retriable());
        assert!(RunnableError::Runtime("timeout".into()).is_retriable());
    }
}
