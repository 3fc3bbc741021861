//! The dataflow engine: turning emitted events into downstream jobs.
//!
//! When a job emits a batch of output parameters on a branch, the rules for
//! `(from_analysis, branch_code)` decide where they land: another analysis
//! (a new job per parameter set, deduplicated by the store), a naked table
//! (a plain row insert), or an accumulator (a value parked for the emitter's
//! funnel).
//!
//! A branch whose rules carry a `funnel_group` is a semaphored fan. The
//! engine materializes the funnel first - following the rules hung off the
//! group's own branch code - then creates the fan children against it with
//! per-child speculative counter increments. The funnel stays READY but
//! unclaimable (`semaphore_count > 0`) until every child reaches a final
//! state.
//!
//! All effects are durable before the emitting job is marked DONE, so
//! downstream jobs are claimable while the emitter is still in
//! WRITE_OUTPUT.

use std::collections::HashMap;

use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::model::{Analysis, BranchCode, DataflowRule, Job};
use crate::params::{InputTemplate, ParamError, ParamSet};
use crate::store::{JobStore, NewJob, StoreError};
use crate::url::{InsertionMethod, ObjectType, ResourceUrl, UrlError};

#[derive(Debug, Error)]
pub enum DataflowError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Param(#[from] ParamError),

    #[error(transparent)]
    Url(#[from] UrlError),

    #[error("dataflow target '{0}' is not supported from this store")]
    UnsupportedTarget(String),

    #[error("funnel group '{0}' has no analysis rule on its branch")]
    MissingFunnelRule(String),

    #[error("job {0} feeds an accumulator but belongs to no funnel")]
    AccuWithoutFunnel(i64),
}

/// What a rule's URL resolved to.
enum ResolvedTarget {
    Analysis(Analysis),
    Table {
        table_name: String,
        insertion_method: InsertionMethod,
    },
    Accu {
        accu_name: String,
        accu_address: String,
    },
}

pub struct DataflowEngine<'a> {
    store: &'a JobStore,
}

impl<'a> DataflowEngine<'a> {
    pub fn new(store: &'a JobStore) -> Self {
        Self { store }
    }

    /// Flow `output` emitted by `emitting_job` along `branch`.
    ///
    /// Returns the ids of the jobs actually created (dedup collisions and
    /// non-analysis targets contribute nothing).
    pub async fn emit(
        &self,
        emitting_job: &Job,
        emitting_params: &ParamSet,
        output: &[ParamSet],
        branch: &BranchCode,
    ) -> Result<Vec<i64>, DataflowError> {
        let rules = self
            .store
            .dataflow_rules(emitting_job.analysis_id, branch)
            .await?;
        if rules.is_empty() {
            debug!(
                job_id = emitting_job.job_id,
                branch = %branch,
                "no dataflow rules on branch; output discarded"
            );
            return Ok(Vec::new());
        }

        let funnel_ids = self
            .materialize_funnels(emitting_job, emitting_params, &rules)
            .await?;

        let mut created = Vec::new();
        for rule in &rules {
            match self.resolve_target(rule).await? {
                ResolvedTarget::Analysis(analysis) => {
                    let template = rule
                        .input_id_template
                        .as_deref()
                        .map(InputTemplate::compile)
                        .transpose()?;
                    for params in output {
                        let input = self.rule_input(&template, params, emitting_params)?;
                        let funnel = rule
                            .funnel_group
                            .as_ref()
                            .and_then(|group| funnel_ids.get(group).copied());
                        let new_job = match funnel {
                            Some(funnel_id) => {
                                // Speculative per-child increment; the store
                                // cancels it if the dedup key discards the
                                // insert.
                                self.store.increase_semaphore_count(funnel_id, 1).await?;
                                NewJob {
                                    analysis_id: analysis.analysis_id,
                                    input,
                                    prev_job_id: Some(emitting_job.job_id),
                                    semaphored_job_id: Some(funnel_id),
                                    ..NewJob::default()
                                }
                            }
                            None => NewJob {
                                analysis_id: analysis.analysis_id,
                                input,
                                prev_job_id: Some(emitting_job.job_id),
                                ..NewJob::default()
                            },
                        };
                        if let Some(job_id) = self.store.create_job(new_job).await? {
                            created.push(job_id);
                        }
                    }
                }
                ResolvedTarget::Table {
                    table_name,
                    insertion_method,
                } => {
                    let template = rule
                        .input_id_template
                        .as_deref()
                        .map(InputTemplate::compile)
                        .transpose()?;
                    for params in output {
                        let row = self.rule_input(&template, params, emitting_params)?;
                        self.store
                            .insert_into_table(&table_name, &row, insertion_method)
                            .await?;
                    }
                }
                ResolvedTarget::Accu {
                    accu_name,
                    accu_address,
                } => {
                    let receiving_job_id = emitting_job
                        .semaphored_job_id
                        .ok_or(DataflowError::AccuWithoutFunnel(emitting_job.job_id))?;
                    let address_template = InputTemplate::compile(&accu_address)?;
                    for params in output {
                        let mut scope = emitting_params.clone();
                        scope.merge_over(params);
                        let address = address_template.evaluate(&scope)?;
                        let value: Value = params
                            .get(&accu_name)
                            .cloned()
                            .unwrap_or_else(|| params.to_value());
                        self.store
                            .append_accu(receiving_job_id, &accu_name, &address, &value)
                            .await?;
                    }
                }
            }
        }
        Ok(created)
    }

    /// Create (or rediscover, on a re-run) the funnel job for every funnel
    /// group referenced by the fan rules. The funnel's own input comes from
    /// the emitting job's parameters through the funnel rule's template.
    async fn materialize_funnels(
        &self,
        emitting_job: &Job,
        emitting_params: &ParamSet,
        fan_rules: &[DataflowRule],
    ) -> Result<HashMap<String, i64>, DataflowError> {
        let mut funnel_ids = HashMap::new();
        for group in fan_rules.iter().filter_map(|r| r.funnel_group.as_ref()) {
            if funnel_ids.contains_key(group) {
                continue;
            }
            let funnel_rules = self
                .store
                .dataflow_rules(emitting_job.analysis_id, &BranchCode::parse(group))
                .await?;
            let mut funnel_id = None;
            for frule in &funnel_rules {
                let ResolvedTarget::Analysis(analysis) = self.resolve_target(frule).await? else {
                    continue;
                };
                let template = frule
                    .input_id_template
                    .as_deref()
                    .map(InputTemplate::compile)
                    .transpose()?;
                let input = self.rule_input(&template, emitting_params, emitting_params)?;
                let created = self
                    .store
                    .create_job(NewJob {
                        analysis_id: analysis.analysis_id,
                        input: input.clone(),
                        prev_job_id: Some(emitting_job.job_id),
                        semaphore_count: 0,
                        ..NewJob::default()
                    })
                    .await?;
                funnel_id = match created {
                    Some(id) => Some(id),
                    // Dedup collision: the funnel survived an earlier run.
                    None => self
                        .store
                        .lookup_job_by_input(analysis.analysis_id, &input)
                        .await?
                        .map(|job| job.job_id),
                };
                if funnel_id.is_some() {
                    break;
                }
            }
            let funnel_id =
                funnel_id.ok_or_else(|| DataflowError::MissingFunnelRule(group.clone()))?;
            funnel_ids.insert(group.clone(), funnel_id);
        }
        Ok(funnel_ids)
    }

    /// Downstream input: the emitted parameters, or the rule's template
    /// evaluated against `emitted ∪ emitting job params` (emitted wins).
    fn rule_input(
        &self,
        template: &Option<InputTemplate>,
        emitted: &ParamSet,
        emitting_params: &ParamSet,
    ) -> Result<ParamSet, DataflowError> {
        match template {
            Some(template) => {
                let mut scope = emitting_params.clone();
                scope.merge_over(emitted);
                Ok(template.evaluate_params(&scope)?)
            }
            None => Ok(emitted.clone()),
        }
    }

    async fn resolve_target(&self, rule: &DataflowRule) -> Result<ResolvedTarget, DataflowError> {
        match ResourceUrl::parse(&rule.to_url)? {
            ResourceUrl::LocalAnalysis { logic_name } => Ok(ResolvedTarget::Analysis(
                self.store.fetch_analysis_by_logic_name(&logic_name).await?,
            )),
            ResourceUrl::LocalTable {
                table_name,
                insertion_method,
            } => Ok(ResolvedTarget::Table {
                table_name,
                insertion_method,
            }),
            ResourceUrl::LocalAccu {
                accu_name,
                accu_address,
            } => Ok(ResolvedTarget::Accu {
                accu_name,
                accu_address,
            }),
            // A fully-qualified URL still resolves inside this store when it
            // names a concrete object; cross-server dataflow is not the
            // engine's business.
            ResourceUrl::Remote(endpoint) => match endpoint.object_type {
                Some(ObjectType::Analysis) | None => match endpoint.logic_name {
                    Some(logic_name) => Ok(ResolvedTarget::Analysis(
                        self.store.fetch_analysis_by_logic_name(&logic_name).await?,
                    )),
                    None => Err(DataflowError::UnsupportedTarget(rule.to_url.clone())),
                },
                Some(ObjectType::NakedTable) => match endpoint.table_name {
                    Some(table_name) => Ok(ResolvedTarget::Table {
                        table_name,
                        insertion_method: endpoint.insertion_method,
                    }),
                    None => Err(DataflowError::UnsupportedTarget(rule.to_url.clone())),
                },
                Some(ObjectType::Accumulator) => match endpoint.accu_name {
                    Some(accu_name) => Ok(ResolvedTarget::Accu {
                        accu_name,
                        accu_address: endpoint.accu_address.unwrap_or_default(),
                    }),
                    None => Err(DataflowError::UnsupportedTarget(rule.to_url.clone())),
                },
            },
            ResourceUrl::Registry { .. } => {
                Err(DataflowError::UnsupportedTarget(rule.to_url.clone()))
            }
        }
    }
}
