//! The job factory: a built-in runnable that turns a batch source into many
//! downstream jobs.
//!
//! Exactly one input source must be configured:
//!
//! - `inputlist`  - a literal 1-D or 2-D list
//! - `inputfile`  - a file path, optionally split per line by `delimiter`
//! - `inputquery` - SQL against the shared store; column names come from
//!   the result metadata
//! - `inputcmd`   - a shell command whose output is treated like a file
//!
//! Options: `randomize` (Fisher-Yates shuffle before emission), `step`
//! (minibatch size) and `key_column` (the column undergoing ranging when
//! minibatching). Rows fan out on branch 2, one job per row or per
//! contiguous key range.

use async_trait::async_trait;
use rand::seq::SliceRandom;
use serde_json::Value;
use sqlx::{Column, Row};
use tokio::process::Command;

use crate::model::BranchCode;
use crate::params::ParamSet;
use crate::runnable::{RunContext, Runnable, RunnableError};

/// Stringwise successor matching the source's natural `++`.
///
/// Alphanumeric strings of letters-then-digits carry rightmost-first
/// (`"a"` → `"b"`, `"z"` → `"aa"`, `"Az"` → `"Ba"`, `"a9"` → `"b0"`,
/// `"9"` → `"10"`), so alphabetic and numeric keys both range. Anything
/// else falls back to numeric increment when the string parses as a
/// number, and to itself otherwise.
pub(crate) fn str_increment(s: &str) -> String {
    let magic = !s.is_empty() && {
        let digits_start = s
            .find(|c: char| c.is_ascii_digit())
            .unwrap_or(s.len());
        let (letters, digits) = s.split_at(digits_start);
        letters.chars().all(|c| c.is_ascii_alphabetic())
            && digits.chars().all(|c| c.is_ascii_digit())
    };
    if !magic {
        if let Ok(i) = s.parse::<i64>() {
            return (i + 1).to_string();
        }
        if let Ok(f) = s.parse::<f64>() {
            return (f + 1.0).to_string();
        }
        return s.to_string();
    }

    let mut chars: Vec<char> = s.chars().collect();
    let mut i = chars.len();
    loop {
        if i == 0 {
            let head = match chars[0] {
                '0'..='9' => '1',
                'a'..='z' => 'a',
                _ => 'A',
            };
            chars.insert(0, head);
            break;
        }
        i -= 1;
        let (next, carry) = match chars[i] {
            'z' => ('a', true),
            'Z' => ('A', true),
            '9' => ('0', true),
            c => ((c as u8 + 1) as char, false),
        };
        chars[i] = next;
        if !carry {
            break;
        }
    }
    chars.into_iter().collect()
}

fn cell_str(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// One emitted parameter set per row: `{column: value}` when names are
/// known, the positional fallback `{_: [row], _0: v0, _1: v1, ...}`
/// otherwise.
fn rows_to_param_sets(rows: &[Vec<Value>], column_names: Option<&[String]>) -> Vec<ParamSet> {
    rows.iter()
        .map(|row| {
            let mut params = ParamSet::new();
            match column_names {
                Some(names) => {
                    for (name, value) in names.iter().zip(row.iter()) {
                        params.insert(name.clone(), value.clone());
                    }
                }
                None => {
                    params.insert("_", Value::Array(row.clone()));
                    for (i, value) in row.iter().enumerate() {
                        params.insert(format!("_{i}"), value.clone());
                    }
                }
            }
            params
        })
        .collect()
}

/// Group rows into contiguous ranges of up to `step` values on the key
/// column. A range ends when the predicted successor of the previous key is
/// not the actual next key, comparing stringwise.
fn minibatch_ranges(rows: &[Vec<Value>], key_idx: usize, step: i64) -> Vec<ParamSet> {
    let step = step.max(1) as usize;
    let mut ranges = Vec::new();
    let mut start: Option<String> = None;
    let mut prev: Option<String> = None;
    let mut count = 0usize;

    let mut close = |start: &mut Option<String>, prev: &mut Option<String>, count: &mut usize| {
        if let (Some(s), Some(e)) = (start.take(), prev.take()) {
            let mut params = ParamSet::new();
            params.insert("_range_start", Value::String(s));
            params.insert("_range_end", Value::String(e));
            params.insert("_range_count", Value::from(*count as i64));
            ranges.push(params);
        }
        *count = 0;
    };

    for row in rows {
        let key = row.get(key_idx).map(cell_str).unwrap_or_default();
        let continues = match &prev {
            Some(previous) => count < step && str_increment(previous) == key,
            None => false,
        };
        if !continues {
            close(&mut start, &mut prev, &mut count);
            start = Some(key.clone());
        }
        prev = Some(key);
        count += 1;
    }
    close(&mut start, &mut prev, &mut count);
    ranges
}

#[derive(Default)]
pub struct JobFactory {
    rows: Vec<Vec<Value>>,
    column_names: Option<Vec<String>>,
    output: Vec<ParamSet>,
}

impl JobFactory {
    fn split_line(line: &str, delimiter: Option<&str>) -> Vec<Value> {
        match delimiter {
            Some(delimiter) => line
                .split(delimiter)
                .map(|cell| Value::String(cell.to_string()))
                .collect(),
            None => vec![Value::String(line.to_string())],
        }
    }

    fn ingest_lines(&mut self, text: &str, delimiter: Option<&str>, parse_header: bool) {
        let mut lines = text.lines().filter(|line| !line.is_empty());
        if parse_header {
            if let Some(header) = lines.next() {
                self.column_names = Some(
                    Self::split_line(header, delimiter)
                        .iter()
                        .map(cell_str)
                        .collect(),
                );
            }
        }
        self.rows = lines
            .map(|line| Self::split_line(line, delimiter))
            .collect();
    }
}

#[async_trait]
impl Runnable for JobFactory {
    fn param_defaults(&self) -> ParamSet {
        let mut defaults = ParamSet::new();
        defaults.insert("randomize", Value::Bool(false));
        defaults.insert("step", Value::from(0));
        defaults.insert("key_column", Value::from(0));
        defaults.insert("column_names", Value::Bool(false));
        defaults
    }

    async fn fetch_input(&mut self, ctx: &mut RunContext<'_>) -> Result<(), RunnableError> {
        let params = ctx.params().clone();
        let sources: Vec<&str> = ["inputlist", "inputfile", "inputquery", "inputcmd"]
            .into_iter()
            .filter(|key| params.contains_key(key))
            .collect();
        if sources.len() != 1 {
            return Err(RunnableError::Data(format!(
                "exactly one of inputlist/inputfile/inputquery/inputcmd required, got {}",
                sources.len()
            )));
        }

        let delimiter = params.get_str("delimiter");
        let delimiter = delimiter.as_deref();
        // column_names: false, true (parse from header) or an explicit list.
        let (explicit_names, parse_header) = match params.get("column_names") {
            Some(Value::Array(names)) => {
                (Some(names.iter().map(cell_str).collect::<Vec<_>>()), false)
            }
            Some(Value::Bool(true)) => (None, true),
            _ => (None, false),
        };
        self.column_names = explicit_names;

        match sources[0] {
            "inputlist" => {
                let Some(Value::Array(list)) = params.get("inputlist") else {
                    return Err(RunnableError::Data("inputlist must be a list".into()));
                };
                self.rows = list
                    .iter()
                    .map(|item| match item {
                        Value::Array(row) => row.clone(),
                        scalar => vec![scalar.clone()],
                    })
                    .collect();
            }
            "inputfile" => {
                let path = params
                    .get_str("inputfile")
                    .ok_or_else(|| RunnableError::Data("inputfile must be a path".into()))?;
                let text = tokio::fs::read_to_string(&path).await.map_err(|err| {
                    RunnableError::Data(format!("cannot read inputfile '{path}': {err}"))
                })?;
                self.ingest_lines(&text, delimiter, parse_header);
            }
            "inputquery" => {
                let query = params
                    .get_str("inputquery")
                    .ok_or_else(|| RunnableError::Data("inputquery must be SQL".into()))?;
                ctx.note_query();
                let rows = sqlx::query(&query)
                    .fetch_all(ctx.store().pool())
                    .await
                    .map_err(|err| {
                        RunnableError::Data(format!("inputquery failed: {err}"))
                    })?;
                if self.column_names.is_none() {
                    if let Some(first) = rows.first() {
                        self.column_names = Some(
                            first
                                .columns()
                                .iter()
                                .map(|c| c.name().to_string())
                                .collect(),
                        );
                    }
                }
                self.rows = rows
                    .iter()
                    .map(|row| {
                        (0..row.columns().len())
                            .map(|i| {
                                if let Ok(v) = row.try_get::<i64, _>(i) {
                                    Value::from(v)
                                } else if let Ok(v) = row.try_get::<f64, _>(i) {
                                    Value::from(v)
                                } else if let Ok(v) = row.try_get::<String, _>(i) {
                                    Value::String(v)
                                } else {
                                    Value::Null
                                }
                            })
                            .collect()
                    })
                    .collect();
            }
            "inputcmd" => {
                let cmd = params
                    .get_str("inputcmd")
                    .ok_or_else(|| RunnableError::Data("inputcmd must be a command".into()))?;
                let output = Command::new("sh")
                    .arg("-c")
                    .arg(&cmd)
                    .output()
                    .await
                    .map_err(|err| {
                        RunnableError::Runtime(format!("inputcmd '{cmd}' failed to spawn: {err}"))
                    })?;
                if !output.status.success() {
                    return Err(RunnableError::Runtime(format!(
                        "inputcmd '{cmd}' exited with {}",
                        output.status
                    )));
                }
                let text = String::from_utf8_lossy(&output.stdout).into_owned();
                self.ingest_lines(&text, delimiter, parse_header);
            }
            _ => unreachable!(),
        }
        Ok(())
    }

    async fn run(&mut self, ctx: &mut RunContext<'_>) -> Result<(), RunnableError> {
        let params = ctx.params();
        if params.get_bool("randomize").unwrap_or(false) {
            self.rows.shuffle(&mut rand::thread_rng());
        }

        let step = params.get_i64("step").unwrap_or(0);
        self.output = if step > 0 {
            let key_idx = match params.get("key_column") {
                Some(Value::String(name)) => self
                    .column_names
                    .as_ref()
                    .and_then(|names| names.iter().position(|n| n == name))
                    .ok_or_else(|| {
                        RunnableError::Data(format!("unknown key_column '{name}'"))
                    })?,
                _ => params.get_i64("key_column").unwrap_or(0) as usize,
            };
            minibatch_ranges(&self.rows, key_idx, step)
        } else {
            rows_to_param_sets(&self.rows, self.column_names.as_deref())
        };
        Ok(())
    }

    async fn write_output(&mut self, ctx: &mut RunContext<'_>) -> Result<(), RunnableError> {
        let output = std::mem::take(&mut self.output);
        ctx.dataflow_output_id(output, BranchCode::FAN).await?;
        Ok(())
    }
}
