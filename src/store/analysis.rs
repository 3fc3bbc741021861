//! Analysis, rule, worker-row and accumulator operations.

use serde_json::Value;
use sqlx::any::AnyRow;
use sqlx::Row;

use super::{get_ts, now_str, JobStore, StoreError, StoreResult};
use crate::dialect::SqlDialect;
use crate::model::{
    AccuEntry, Analysis, AnalysisStats, AnalysisStatus, BranchCode, CauseOfDeath, ControlRule,
    DataflowRule, WorkerRow,
};
use crate::params::ParamSet;
use crate::url::InsertionMethod;

/// Named-field configuration for creating an analysis.
#[derive(Debug, Clone)]
pub struct AnalysisSpec {
    pub logic_name: String,
    pub module: String,
    pub parameters: ParamSet,
    pub batch_size: i64,
    pub hive_capacity: i64,
    pub max_retry_count: i32,
    pub failed_job_tolerance: f64,
}

impl AnalysisSpec {
    pub fn new(logic_name: impl Into<String>, module: impl Into<String>) -> Self {
        Self {
            logic_name: logic_name.into(),
            module: module.into(),
            parameters: ParamSet::new(),
            batch_size: 1,
            hive_capacity: 4,
            max_retry_count: 3,
            failed_job_tolerance: 0.0,
        }
    }
}

/// Named-field configuration for creating a dataflow rule.
#[derive(Debug, Clone)]
pub struct DataflowRuleSpec {
    pub from_analysis_id: i64,
    pub branch_code: BranchCode,
    pub to_url: String,
    pub input_id_template: Option<String>,
    /// Marks the branch as a semaphored fan; the group names the branch the
    /// funnel rules hang off.
    pub funnel_group: Option<String>,
}

fn analysis_from_row(row: &AnyRow) -> StoreResult<Analysis> {
    let parameters_text: String = row.try_get("parameters")?;
    Ok(Analysis {
        analysis_id: row.try_get("analysis_id")?,
        logic_name: row.try_get("logic_name")?,
        module: row.try_get("module")?,
        parameters: ParamSet::parse(&parameters_text)?,
        batch_size: row.try_get("batch_size")?,
        hive_capacity: row.try_get("hive_capacity")?,
        max_retry_count: row.try_get::<i64, _>("max_retry_count")? as i32,
        failed_job_tolerance: row.try_get("failed_job_tolerance")?,
    })
}

fn stats_from_row(row: &AnyRow) -> StoreResult<AnalysisStats> {
    let status_text: String = row.try_get("status")?;
    let status = AnalysisStatus::parse(&status_text).ok_or_else(|| {
        StoreError::InvalidRow(format!("unknown analysis status '{status_text}'"))
    })?;
    Ok(AnalysisStats {
        analysis_id: row.try_get("analysis_id")?,
        status,
        total_job_count: row.try_get("total_job_count")?,
        unclaimed_job_count: row.try_get("unclaimed_job_count")?,
        done_job_count: row.try_get("done_job_count")?,
        failed_job_count: row.try_get("failed_job_count")?,
        num_required_workers: row.try_get("num_required_workers")?,
    })
}

fn worker_from_row(row: &AnyRow) -> StoreResult<WorkerRow> {
    let cause_text: Option<String> = row.try_get("cause_of_death")?;
    let cause_of_death = match cause_text.as_deref() {
        Some(text) => Some(CauseOfDeath::parse(text).ok_or_else(|| {
            StoreError::InvalidRow(format!("unknown cause of death '{text}'"))
        })?),
        None => None,
    };
    let born = get_ts(row, "born")?
        .ok_or_else(|| StoreError::InvalidRow("worker row without born time".into()))?;
    Ok(WorkerRow {
        worker_id: row.try_get("worker_id")?,
        analysis_id: row.try_get("analysis_id")?,
        meadow_type: row.try_get("meadow_type")?,
        host: row.try_get("host")?,
        process_id: row.try_get("process_id")?,
        born,
        died: get_ts(row, "died")?,
        cause_of_death,
        work_done: row.try_get("work_done")?,
    })
}

fn is_safe_identifier(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .next()
            .map(|c| c.is_ascii_alphabetic() || c == '_')
            .unwrap_or(false)
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Translate a `*`/`?` glob into a LIKE pattern. `|` is the LIKE escape
/// character (a backslash would itself need escaping on MySQL).
fn glob_to_like(pattern: &str) -> String {
    let mut like = String::with_capacity(pattern.len());
    for c in pattern.chars() {
        match c {
            '|' => like.push_str("||"),
            '%' => like.push_str("|%"),
            '_' => like.push_str("|_"),
            '*' => like.push('%'),
            '?' => like.push('_'),
            other => like.push(other),
        }
    }
    like
}

const ANALYSIS_COLUMNS: &str = "analysis_id, logic_name, module, parameters, batch_size, \
     hive_capacity, max_retry_count, failed_job_tolerance";

const STATS_COLUMNS: &str = "analysis_id, status, total_job_count, unclaimed_job_count, \
     done_job_count, failed_job_count, num_required_workers";

const WORKER_COLUMNS: &str = "worker_id, analysis_id, meadow_type, host, process_id, born, \
     died, cause_of_death, work_done";

impl JobStore {
    // ========================================================================
    // Analyses
    // ========================================================================

    /// Create an analysis and its stats row.
    pub async fn create_analysis(&self, spec: AnalysisSpec) -> StoreResult<Analysis> {
        let d = self.dialect();
        let insert = format!(
            "INSERT INTO analysis (logic_name, module, parameters, batch_size, \
                 hive_capacity, max_retry_count, failed_job_tolerance) \
             VALUES ({})",
            d.placeholders(7)
        );
        sqlx::query(&insert)
            .bind(&spec.logic_name)
            .bind(&spec.module)
            .bind(spec.parameters.stringify())
            .bind(spec.batch_size)
            .bind(spec.hive_capacity)
            .bind(spec.max_retry_count)
            .bind(spec.failed_job_tolerance)
            .execute(self.pool())
            .await?;

        let analysis = self.fetch_analysis_by_logic_name(&spec.logic_name).await?;

        let stats_insert = format!(
            "INSERT INTO analysis_stats (analysis_id) VALUES ({})",
            d.ph(1)
        );
        sqlx::query(&stats_insert)
            .bind(analysis.analysis_id)
            .execute(self.pool())
            .await?;

        Ok(analysis)
    }

    pub async fn fetch_analysis(&self, analysis_id: i64) -> StoreResult<Analysis> {
        let d = self.dialect();
        let select = format!(
            "SELECT {ANALYSIS_COLUMNS} FROM analysis WHERE analysis_id = {p1}",
            p1 = d.ph(1),
        );
        let row = sqlx::query(&select)
            .bind(analysis_id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("analysis {analysis_id}")))?;
        analysis_from_row(&row)
    }

    pub async fn fetch_analysis_by_logic_name(&self, logic_name: &str) -> StoreResult<Analysis> {
        let d = self.dialect();
        let select = format!(
            "SELECT {ANALYSIS_COLUMNS} FROM analysis WHERE logic_name = {p1}",
            p1 = d.ph(1),
        );
        let row = sqlx::query(&select)
            .bind(logic_name)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("analysis '{logic_name}'")))?;
        analysis_from_row(&row)
    }

    /// Analyses whose `logic_name` matches a `*`/`?` glob.
    pub async fn list_analyses_matching(&self, pattern: &str) -> StoreResult<Vec<Analysis>> {
        let d = self.dialect();
        let select = format!(
            "SELECT {ANALYSIS_COLUMNS} FROM analysis \
             WHERE logic_name LIKE {p1} ESCAPE '|' ORDER BY analysis_id",
            p1 = d.ph(1),
        );
        let rows = sqlx::query(&select)
            .bind(glob_to_like(pattern))
            .fetch_all(self.pool())
            .await?;
        rows.iter().map(analysis_from_row).collect()
    }

    pub async fn fetch_analysis_stats(
        &self,
        analysis_id: i64,
    ) -> StoreResult<Option<AnalysisStats>> {
        let d = self.dialect();
        let select = format!(
            "SELECT {STATS_COLUMNS} FROM analysis_stats WHERE analysis_id = {p1}",
            p1 = d.ph(1),
        );
        let row = sqlx::query(&select)
            .bind(analysis_id)
            .fetch_optional(self.pool())
            .await?;
        row.as_ref().map(stats_from_row).transpose()
    }

    // ========================================================================
    // Rules
    // ========================================================================

    pub async fn create_dataflow_rule(&self, spec: DataflowRuleSpec) -> StoreResult<()> {
        let d = self.dialect();
        let insert = format!(
            "INSERT INTO dataflow_rule (from_analysis_id, branch_code, to_url, \
                 input_id_template, funnel_group) \
             VALUES ({})",
            d.placeholders(5)
        );
        sqlx::query(&insert)
            .bind(spec.from_analysis_id)
            .bind(spec.branch_code.to_string())
            .bind(&spec.to_url)
            .bind(spec.input_id_template.as_deref())
            .bind(spec.funnel_group.as_deref())
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Dataflow rules leaving `from_analysis_id` on `branch`.
    pub async fn dataflow_rules(
        &self,
        from_analysis_id: i64,
        branch: &BranchCode,
    ) -> StoreResult<Vec<DataflowRule>> {
        let d = self.dialect();
        let select = format!(
            "SELECT rule_id, from_analysis_id, branch_code, to_url, \
                 input_id_template, funnel_group \
             FROM dataflow_rule \
             WHERE from_analysis_id = {p1} AND branch_code = {p2} \
             ORDER BY rule_id",
            p1 = d.ph(1),
            p2 = d.ph(2),
        );
        let rows = sqlx::query(&select)
            .bind(from_analysis_id)
            .bind(branch.to_string())
            .fetch_all(self.pool())
            .await?;
        rows.iter()
            .map(|row| {
                let branch_text: String = row.try_get("branch_code")?;
                Ok(DataflowRule {
                    rule_id: row.try_get("rule_id")?,
                    from_analysis_id: row.try_get("from_analysis_id")?,
                    branch_code: BranchCode::parse(&branch_text),
                    to_url: row.try_get("to_url")?,
                    input_id_template: row.try_get("input_id_template")?,
                    funnel_group: row.try_get("funnel_group")?,
                })
            })
            .collect()
    }

    pub async fn create_control_rule(
        &self,
        condition_analysis_id: i64,
        ctrled_analysis_id: i64,
    ) -> StoreResult<()> {
        let d = self.dialect();
        let insert = format!(
            "INSERT INTO analysis_ctrl_rule (condition_analysis_id, ctrled_analysis_id) \
             VALUES ({})",
            d.placeholders(2)
        );
        sqlx::query(&insert)
            .bind(condition_analysis_id)
            .bind(ctrled_analysis_id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Control rules gating `ctrled_analysis_id`.
    pub async fn control_rules_for(&self, ctrled_analysis_id: i64) -> StoreResult<Vec<ControlRule>> {
        let d = self.dialect();
        let select = format!(
            "SELECT rule_id, condition_analysis_id, ctrled_analysis_id \
             FROM analysis_ctrl_rule WHERE ctrled_analysis_id = {p1} ORDER BY rule_id",
            p1 = d.ph(1),
        );
        let rows = sqlx::query(&select)
            .bind(ctrled_analysis_id)
            .fetch_all(self.pool())
            .await?;
        rows.iter()
            .map(|row| {
                Ok(ControlRule {
                    rule_id: row.try_get("rule_id")?,
                    condition_analysis_id: row.try_get("condition_analysis_id")?,
                    ctrled_analysis_id: row.try_get("ctrled_analysis_id")?,
                })
            })
            .collect()
    }

    // ========================================================================
    // Worker rows
    // ========================================================================

    /// Insert a worker row at registration and return it.
    pub async fn register_worker(
        &self,
        analysis_id: i64,
        meadow_type: &str,
        host: &str,
        process_id: i64,
    ) -> StoreResult<WorkerRow> {
        let d = self.dialect();
        let born = now_str();
        let insert = format!(
            "INSERT INTO worker (analysis_id, meadow_type, host, process_id, born) \
             VALUES ({})",
            d.placeholders(5)
        );
        sqlx::query(&insert)
            .bind(analysis_id)
            .bind(meadow_type)
            .bind(host)
            .bind(process_id)
            .bind(&born)
            .execute(self.pool())
            .await?;

        // Select the row back by its natural key; (host, process_id, born)
        // is unique at microsecond precision.
        let select = format!(
            "SELECT worker_id FROM worker \
             WHERE host = {p1} AND process_id = {p2} AND born = {p3} \
             ORDER BY worker_id DESC",
            p1 = d.ph(1),
            p2 = d.ph(2),
            p3 = d.ph(3),
        );
        let worker_id: i64 = sqlx::query_scalar(&select)
            .bind(host)
            .bind(process_id)
            .bind(&born)
            .fetch_one(self.pool())
            .await?;
        self.fetch_worker(worker_id).await
    }

    pub async fn fetch_worker(&self, worker_id: i64) -> StoreResult<WorkerRow> {
        let d = self.dialect();
        let select = format!(
            "SELECT {WORKER_COLUMNS} FROM worker WHERE worker_id = {p1}",
            p1 = d.ph(1),
        );
        let row = sqlx::query(&select)
            .bind(worker_id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("worker {worker_id}")))?;
        worker_from_row(&row)
    }

    /// Record termination. Idempotent: only the first death sticks.
    pub async fn record_worker_death(
        &self,
        worker_id: i64,
        cause: CauseOfDeath,
    ) -> StoreResult<()> {
        let d = self.dialect();
        let sql = format!(
            "UPDATE worker SET died = {p1}, cause_of_death = {p2} \
             WHERE worker_id = {p3} AND died IS NULL",
            p1 = d.ph(1),
            p2 = d.ph(2),
            p3 = d.ph(3),
        );
        sqlx::query(&sql)
            .bind(now_str())
            .bind(cause.as_str())
            .bind(worker_id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    pub async fn increment_worker_work_done(&self, worker_id: i64) -> StoreResult<()> {
        let d = self.dialect();
        let sql = format!(
            "UPDATE worker SET work_done = work_done + 1 WHERE worker_id = {p1}",
            p1 = d.ph(1),
        );
        sqlx::query(&sql)
            .bind(worker_id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    // ========================================================================
    // Accumulators
    // ========================================================================

    /// Append a value destined for a funnel job.
    pub async fn append_accu(
        &self,
        receiving_job_id: i64,
        accu_name: &str,
        accu_address: &str,
        value: &Value,
    ) -> StoreResult<()> {
        let d = self.dialect();
        let insert = format!(
            "INSERT INTO accu (receiving_job_id, accu_name, accu_address, value) \
             VALUES ({})",
            d.placeholders(4)
        );
        sqlx::query(&insert)
            .bind(receiving_job_id)
            .bind(accu_name)
            .bind(accu_address)
            .bind(value.to_string())
            .execute(self.pool())
            .await?;
        Ok(())
    }

    pub async fn fetch_accu_entries(&self, receiving_job_id: i64) -> StoreResult<Vec<AccuEntry>> {
        let d = self.dialect();
        let select = format!(
            "SELECT receiving_job_id, accu_name, accu_address, value \
             FROM accu WHERE receiving_job_id = {p1} ORDER BY accu_address",
            p1 = d.ph(1),
        );
        let rows = sqlx::query(&select)
            .bind(receiving_job_id)
            .fetch_all(self.pool())
            .await?;
        rows.iter()
            .map(|row| {
                Ok(AccuEntry {
                    receiving_job_id: row.try_get("receiving_job_id")?,
                    accu_name: row.try_get("accu_name")?,
                    accu_address: row.try_get("accu_address")?,
                    value: row.try_get("value")?,
                })
            })
            .collect()
    }

    /// Collapse the accumulated entries of a funnel into parameters:
    /// entries with addresses build a keyed object, the rest a list.
    pub async fn harvest_accu(&self, receiving_job_id: i64) -> StoreResult<ParamSet> {
        let entries = self.fetch_accu_entries(receiving_job_id).await?;
        let mut harvested = ParamSet::new();
        for entry in entries {
            let value: Value = serde_json::from_str(&entry.value)
                .unwrap_or_else(|_| Value::String(entry.value.clone()));
            if entry.accu_address.is_empty() {
                match harvested.remove(&entry.accu_name) {
                    Some(Value::Array(mut list)) => {
                        list.push(value);
                        harvested.insert(entry.accu_name, Value::Array(list));
                    }
                    Some(prev) => {
                        harvested.insert(entry.accu_name, Value::Array(vec![prev, value]));
                    }
                    None => {
                        harvested.insert(entry.accu_name, Value::Array(vec![value]));
                    }
                }
            } else {
                match harvested.remove(&entry.accu_name) {
                    Some(Value::Object(mut map)) => {
                        map.insert(entry.accu_address, value);
                        harvested.insert(entry.accu_name, Value::Object(map));
                    }
                    _ => {
                        let mut map = serde_json::Map::new();
                        map.insert(entry.accu_address, value);
                        harvested.insert(entry.accu_name, Value::Object(map));
                    }
                }
            }
        }
        Ok(harvested)
    }

    // ========================================================================
    // Naked tables
    // ========================================================================

    /// Generic single-row insert used by naked-table dataflow targets.
    /// Column names come from the parameter keys and must be plain
    /// identifiers.
    pub async fn insert_into_table(
        &self,
        table: &str,
        params: &ParamSet,
        method: InsertionMethod,
    ) -> StoreResult<()> {
        if !is_safe_identifier(table) {
            return Err(StoreError::InvalidRow(format!(
                "refusing unsafe table name '{table}'"
            )));
        }
        for (key, _) in params.iter() {
            if !is_safe_identifier(key) {
                return Err(StoreError::InvalidRow(format!(
                    "refusing unsafe column name '{key}'"
                )));
            }
        }
        if params.is_empty() {
            return Err(StoreError::InvalidRow(format!(
                "no columns to insert into '{table}'"
            )));
        }

        let d = self.dialect();
        let columns = params
            .iter()
            .map(|(k, _)| k.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        let prefix = match method {
            InsertionMethod::Insert => format!("INSERT INTO {table}"),
            InsertionMethod::InsertIgnore => d.insert_ignore_prefix(table),
            InsertionMethod::Replace => match d {
                SqlDialect::Sqlite => format!("INSERT OR REPLACE INTO {table}"),
                SqlDialect::MySql => format!("REPLACE INTO {table}"),
                // No generic REPLACE without knowing the key; plain insert.
                SqlDialect::Postgres => format!("INSERT INTO {table}"),
            },
        };
        let suffix = match method {
            InsertionMethod::InsertIgnore => d.insert_ignore_suffix(),
            _ => "",
        };
        let sql = format!(
            "{prefix} ({columns}) VALUES ({values}){suffix}",
            values = d.placeholders(params.len()),
        );

        let mut query = sqlx::query(&sql);
        for (_, value) in params.iter() {
            query = match value {
                Value::Number(n) if n.is_i64() => query.bind(n.as_i64()),
                Value::Number(n) => query.bind(n.as_f64()),
                Value::String(s) => query.bind(s.clone()),
                Value::Bool(b) => query.bind(if *b { 1_i32 } else { 0_i32 }),
                other => query.bind(other.to_string()),
            };
        }
        query.execute(self.pool()).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glob_translates_to_like() {
        assert_eq!(glob_to_like("part_*"), "part|_%");
        assert_eq!(glob_to_like("a?c"), "a_c");
        assert_eq!(glob_to_like("plain"), "plain");
        assert_eq!(glob_to_like("100%|"), "100|%||");
    }

    #[test]
    fn identifier_safety() {
        assert!(is_safe_identifier("final_result"));
        assert!(is_safe_identifier("_hidden"));
        assert!(!is_safe_identifier("1abc"));
        assert!(!is_safe_identifier("drop table"));
        assert!(!is_safe_identifier(""));
        assert!(!is_safe_identifier("a;b"));
    }
}
