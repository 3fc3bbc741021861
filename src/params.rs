//! Parameter mappings and `#param#` template substitution.
//!
//! Every job carries its input as a stringified parameter mapping. The
//! stringified form is canonical (sorted keys), so two structurally equal
//! mappings always serialize to the same string and the store's
//! `UNIQUE(input_id, analysis_id)` constraint deduplicates on content.

use std::collections::BTreeMap;

use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ParamError {
    #[error("parameter string is not a JSON object: {0}")]
    NotAnObject(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("template references unbound parameter '{0}'")]
    UnboundPlaceholder(String),

    #[error("unterminated placeholder in template '{0}'")]
    UnterminatedPlaceholder(String),
}

/// An ordered parameter mapping.
///
/// Backed by a `BTreeMap` so iteration (and therefore serialization) is
/// always in key order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParamSet(BTreeMap<String, Value>);

impl ParamSet {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Parse a stored parameter string back into a mapping.
    pub fn parse(input: &str) -> Result<Self, ParamError> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Ok(Self::new());
        }
        let value: Value = serde_json::from_str(trimmed)?;
        match value {
            Value::Object(map) => Ok(Self(map.into_iter().collect())),
            _ => Err(ParamError::NotAnObject(input.to_string())),
        }
    }

    /// Canonical stringified form: a JSON object with sorted keys.
    ///
    /// This is the job deduplication key, so it must be stable for
    /// structurally equal mappings.
    pub fn stringify(&self) -> String {
        let map: serde_json::Map<String, Value> =
            self.0.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        Value::Object(map).to_string()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Fetch a parameter rendered as a plain string (strings unquoted,
    /// everything else in JSON form, null as absent).
    pub fn get_str(&self, key: &str) -> Option<String> {
        match self.0.get(key)? {
            Value::Null => None,
            value => Some(value_to_plain_string(value)),
        }
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        match self.0.get(key)? {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        match self.0.get(key)? {
            Value::Bool(b) => Some(*b),
            Value::Number(n) => Some(n.as_i64()? != 0),
            _ => None,
        }
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.0.insert(key.into(), value);
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    /// Layer `defaults` under this mapping: keys already present win.
    ///
    /// Used to stack runnable `param_defaults()` under analysis parameters
    /// under the job's own input.
    pub fn merge_under(&mut self, defaults: &ParamSet) {
        for (k, v) in defaults.iter() {
            self.0.entry(k.clone()).or_insert_with(|| v.clone());
        }
    }

    /// Overlay `other` on top of this mapping: keys in `other` win.
    pub fn merge_over(&mut self, other: &ParamSet) {
        for (k, v) in other.iter() {
            self.0.insert(k.clone(), v.clone());
        }
    }

    /// The mapping as a JSON object value.
    pub fn to_value(&self) -> Value {
        let map: serde_json::Map<String, Value> =
            self.0.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        Value::Object(map)
    }
}

impl FromIterator<(String, Value)> for ParamSet {
    fn from_iter<T: IntoIterator<Item = (String, Value)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<'a> IntoIterator for &'a ParamSet {
    type Item = (&'a String, &'a Value);
    type IntoIter = std::collections::btree_map::Iter<'a, String, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

fn value_to_plain_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Convenience constructor used heavily in tests and seeding code:
/// `params![ "a" => json!(1), "b" => json!("x") ]`.
#[macro_export]
macro_rules! params {
    () => { $crate::params::ParamSet::new() };
    ( $( $k:expr => $v:expr ),+ $(,)? ) => {{
        let mut set = $crate::params::ParamSet::new();
        $( set.insert($k, $v); )+
        set
    }};
}

// ============================================================================
// Input templates
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Literal(String),
    Placeholder(String),
}

/// A compiled `input_id_template`.
///
/// Templates are strings with `#param#` placeholders, compiled once per rule
/// and evaluated against `emitted params ∪ emitting job params`. A doubled
/// `##` escapes a literal hash.
#[derive(Debug, Clone, PartialEq)]
pub struct InputTemplate {
    source: String,
    segments: Vec<Segment>,
}

impl InputTemplate {
    pub fn compile(template: &str) -> Result<Self, ParamError> {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut chars = template.chars().peekable();
        while let Some(c) = chars.next() {
            if c != '#' {
                literal.push(c);
                continue;
            }
            if chars.peek() == Some(&'#') {
                chars.next();
                literal.push('#');
                continue;
            }
            let mut name = String::new();
            let mut closed = false;
            for inner in chars.by_ref() {
                if inner == '#' {
                    closed = true;
                    break;
                }
                name.push(inner);
            }
            if !closed {
                return Err(ParamError::UnterminatedPlaceholder(template.to_string()));
            }
            if !literal.is_empty() {
                segments.push(Segment::Literal(std::mem::take(&mut literal)));
            }
            segments.push(Segment::Placeholder(name));
        }
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }
        Ok(Self {
            source: template.to_string(),
            segments,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Substitute placeholders from `scope`. String parameters substitute
    /// raw; other values substitute in JSON form.
    pub fn evaluate(&self, scope: &ParamSet) -> Result<String, ParamError> {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Placeholder(name) => {
                    let value = scope
                        .get(name)
                        .ok_or_else(|| ParamError::UnboundPlaceholder(name.clone()))?;
                    out.push_str(&value_to_plain_string(value));
                }
            }
        }
        Ok(out)
    }

    /// Evaluate and parse the result as a parameter mapping.
    ///
    /// This is the dataflow path: a rule's template produces the stringified
    /// input of the downstream job.
    pub fn evaluate_params(&self, scope: &ParamSet) -> Result<ParamSet, ParamError> {
        ParamSet::parse(&self.evaluate(scope)?)
    }
}
