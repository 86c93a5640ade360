//! Pattern normalization.
//!
//! # Responsibilities
//! - Parse textual or structured pattern descriptions
//! - Produce one canonical, comparable string form per set of constraints
//! - Merge service-wide prefix constraints into registered patterns
//!
//! # Design Decisions
//! - Fields are kept sorted by key; the canonical string is derived once
//! - Equality and hashing use the canonical string only
//! - Nested values are compared through key-sorted JSON
//! - Patterns are immutable and cheap to clone (shared inner)

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde_json::{Map, Value};
use thiserror::Error;

/// Errors raised while normalizing a pattern.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PatternError {
    /// The input could not be parsed into key/value constraints.
    #[error("malformed pattern '{input}': {reason}")]
    Malformed { input: String, reason: String },
}

impl PatternError {
    fn malformed(input: &str, reason: impl Into<String>) -> Self {
        PatternError::Malformed {
            input: input.to_string(),
            reason: reason.into(),
        }
    }
}

/// A canonical set of key/value constraints.
#[derive(Clone)]
pub struct Pattern {
    inner: Arc<PatternInner>,
}

struct PatternInner {
    fields: Vec<(String, Value)>,
    canonical: String,
}

impl Pattern {
    /// The pattern with no constraints. It matches every object message.
    pub fn empty() -> Self {
        Self::build(Vec::new())
    }

    /// Normalize a textual pattern.
    ///
    /// Accepts a JSON object (`{"role":"adder"}`) or the compact form
    /// (`role:adder, cmd:"sum"`). Blank input yields the empty pattern.
    pub fn parse(raw: &str) -> Result<Self, PatternError> {
        let trimmed = raw.trim();
        if trimmed.starts_with('{') {
            let value: Value = serde_json::from_str(trimmed)
                .map_err(|e| PatternError::malformed(raw, e.to_string()))?;
            return Self::from_value(&value).map_err(|_| {
                PatternError::malformed(raw, "pattern object contains an invalid key")
            });
        }

        let mut fields = Vec::new();
        if trimmed.is_empty() {
            return Ok(Self::empty());
        }
        for segment in split_top_level(trimmed).map_err(|r| PatternError::malformed(raw, r))? {
            let (key, value) = segment
                .split_once(':')
                .ok_or_else(|| PatternError::malformed(raw, format!("missing ':' in '{}'", segment.trim())))?;
            let key = key.trim();
            let value = parse_value(value.trim())
                .ok_or_else(|| PatternError::malformed(raw, format!("invalid value for key '{}'", key)))?;
            fields.push((key.to_string(), value));
        }
        Self::from_fields(fields).map_err(|e| match e {
            PatternError::Malformed { reason, .. } => PatternError::malformed(raw, reason),
        })
    }

    /// Normalize a structured pattern (a JSON object).
    pub fn from_value(value: &Value) -> Result<Self, PatternError> {
        match value {
            Value::Object(map) => Self::from_fields(
                map.iter().map(|(k, v)| (k.clone(), v.clone())),
            ),
            other => Err(PatternError::malformed(
                &other.to_string(),
                "pattern must be an object",
            )),
        }
    }

    /// Build a pattern from explicit fields. Keys must be unique and valid.
    pub fn from_fields<I>(fields: I) -> Result<Self, PatternError>
    where
        I: IntoIterator<Item = (String, Value)>,
    {
        let mut fields: Vec<(String, Value)> = fields.into_iter().collect();
        fields.sort_by(|a, b| a.0.cmp(&b.0));

        for (key, _) in &fields {
            validate_key(key).map_err(|reason| PatternError::malformed(key, reason))?;
        }
        if let Some(pair) = fields.windows(2).find(|w| w[0].0 == w[1].0) {
            return Err(PatternError::malformed(
                &pair[0].0,
                format!("duplicate key '{}'", pair[0].0),
            ));
        }

        Ok(Self::build(fields))
    }

    fn build(fields: Vec<(String, Value)>) -> Self {
        let canonical = fields
            .iter()
            .map(|(k, v)| format!("{}:{}", k, canonical_json(v)))
            .collect::<Vec<_>>()
            .join(",");
        Self {
            inner: Arc::new(PatternInner { fields, canonical }),
        }
    }

    /// The canonical string form. Two patterns are equal iff these are equal.
    pub fn as_str(&self) -> &str {
        &self.inner.canonical
    }

    /// The constrained keys.
    pub fn keys(&self) -> BTreeSet<&str> {
        self.inner.fields.iter().map(|(k, _)| k.as_str()).collect()
    }

    /// Iterate the constraints in key order.
    pub fn fields(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.inner.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Constraint value for `key`, if constrained.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.inner
            .fields
            .binary_search_by(|(k, _)| k.as_str().cmp(key))
            .ok()
            .map(|i| &self.inner.fields[i].1)
    }

    /// Specificity: the number of constrained keys.
    pub fn len(&self) -> usize {
        self.inner.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.fields.is_empty()
    }

    /// Merge prefix constraints into this pattern. Own values win on conflict.
    pub fn with_prefix(&self, prefix: &Pattern) -> Pattern {
        if prefix.is_empty() {
            return self.clone();
        }
        let mut fields = self.inner.fields.clone();
        for (key, value) in prefix.fields() {
            if self.get(key).is_none() {
                fields.push((key.to_string(), value.clone()));
            }
        }
        fields.sort_by(|a, b| a.0.cmp(&b.0));
        Self::build(fields)
    }

    /// True when every constraint is present and equal in `message`.
    pub fn matches(&self, message: &Value) -> bool {
        let Some(object) = message.as_object() else {
            return false;
        };
        self.inner
            .fields
            .iter()
            .all(|(k, v)| object.get(k).is_some_and(|m| m == v))
    }

    /// The constraints as a JSON object.
    pub fn to_value(&self) -> Value {
        let map: Map<String, Value> = self.inner.fields.iter().cloned().collect();
        Value::Object(map)
    }
}

impl PartialEq for Pattern {
    fn eq(&self, other: &Self) -> bool {
        self.inner.canonical == other.inner.canonical
    }
}

impl Eq for Pattern {}

impl std::hash::Hash for Pattern {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.inner.canonical.hash(state);
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.inner.canonical)
    }
}

impl fmt::Debug for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pattern({})", self.inner.canonical)
    }
}

impl FromStr for Pattern {
    type Err = PatternError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Pattern::parse(s)
    }
}

impl TryFrom<&Value> for Pattern {
    type Error = PatternError;

    fn try_from(value: &Value) -> Result<Self, Self::Error> {
        Pattern::from_value(value)
    }
}

/// Serialize a JSON value with object keys sorted at every depth.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (i, (key, item)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::from(key.as_str()).to_string());
                out.push(':');
                write_canonical(item, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

fn validate_key(key: &str) -> Result<(), String> {
    if key.is_empty() {
        return Err("empty key".to_string());
    }
    if key
        .chars()
        .any(|c| c == ':' || c == ',' || c == '"' || c.is_whitespace())
    {
        return Err(format!("invalid character in key '{}'", key));
    }
    Ok(())
}

/// Parse a compact-form value: JSON when it parses, otherwise a bare word.
fn parse_value(raw: &str) -> Option<Value> {
    if raw.is_empty() {
        return None;
    }
    if let Ok(value) = serde_json::from_str::<Value>(raw) {
        return Some(value);
    }
    let bare = raw
        .chars()
        .all(|c| !matches!(c, '"' | '{' | '}' | '[' | ']' | ',') && !c.is_whitespace());
    bare.then(|| Value::String(raw.to_string()))
}

/// Split on commas that are not nested in quotes or brackets.
fn split_top_level(input: &str) -> Result<Vec<&str>, String> {
    let mut segments = Vec::new();
    let mut depth: i32 = 0;
    let mut in_string = false;
    let mut escaped = false;
    let mut start = 0;

    for (i, c) in input.char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' | '[' => depth += 1,
            '}' | ']' => {
                depth -= 1;
                if depth < 0 {
                    return Err("unbalanced brackets".to_string());
                }
            }
            ',' if depth == 0 => {
                segments.push(&input[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    if in_string {
        return Err("unterminated string".to_string());
    }
    if depth != 0 {
        return Err("unbalanced brackets".to_string());
    }
    segments.push(&input[start..]);

    if segments.iter().any(|s| s.trim().is_empty()) {
        return Err("empty constraint".to_string());
    }
    Ok(segments)
}
