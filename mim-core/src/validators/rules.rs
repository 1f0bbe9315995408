//! Validation rule set
//!
//! Single source of truth for which record fields are required, which
//! JSON kind each field must have, the value constraints applied to it and
//! the defaults injected for absent optional fields.

use crate::file_handler::detect_format;
use crate::Mapping;
use chrono::NaiveDate;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::sync::Arc;

/// Modalities accepted by the default `modality` rule
pub const VALID_MODALITIES: &[&str] = &["CT", "MRI", "PET", "SPECT", "US", "XR", "MG", "DX"];

/// Default upper bound on any top-level string value (characters)
pub const DEFAULT_MAX_STRING_LENGTH: usize = 1000;

const MAX_PATIENT_AGE: i64 = 150;

/// Value predicate: `Err` carries a human-readable reason
pub type Constraint = fn(&Value) -> Result<(), String>;

/// Computes a default for an absent optional field from the rest of the record
pub type DefaultValue = fn(&Mapping) -> Option<Value>;

/// Primitive JSON kinds a rule can demand
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueKind {
    String,
    Integer,
    Number,
    Boolean,
    Array,
    Object,
    Null,
}

impl ValueKind {
    /// Kind of a concrete JSON value.
    ///
    /// Numbers without a fractional representation report `Integer`.
    pub fn of(value: &Value) -> Self {
        match value {
            Value::String(_) => ValueKind::String,
            Value::Number(n) if n.is_i64() || n.is_u64() => ValueKind::Integer,
            Value::Number(_) => ValueKind::Number,
            Value::Bool(_) => ValueKind::Boolean,
            Value::Array(_) => ValueKind::Array,
            Value::Object(_) => ValueKind::Object,
            Value::Null => ValueKind::Null,
        }
    }

    /// Whether a value of kind `actual` satisfies this expected kind
    pub fn accepts(self, actual: ValueKind) -> bool {
        self == actual || (self == ValueKind::Number && actual == ValueKind::Integer)
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueKind::String => "string",
            ValueKind::Integer => "integer",
            ValueKind::Number => "number",
            ValueKind::Boolean => "boolean",
            ValueKind::Array => "array",
            ValueKind::Object => "object",
            ValueKind::Null => "null",
        };
        f.write_str(name)
    }
}

/// One row of the rule table
#[derive(Clone, Copy)]
pub struct FieldRule {
    pub name: &'static str,
    pub required: bool,
    pub kind: ValueKind,
    pub description: &'static str,
    pub constraint: Option<Constraint>,
    pub default: Option<DefaultValue>,
}

impl fmt::Debug for FieldRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FieldRule")
            .field("name", &self.name)
            .field("required", &self.required)
            .field("kind", &self.kind)
            .field("has_constraint", &self.constraint.is_some())
            .field("has_default", &self.default.is_some())
            .finish()
    }
}

/// Rules for the record fields MIM knows about.
///
/// Fields not listed here are free-form: accepted with any type, only
/// subject to the global string length limit.
static DEFAULT_RULES: &[FieldRule] = &[
    FieldRule {
        name: "id",
        required: true,
        kind: ValueKind::String,
        description: "Unique image identifier; also names the sidecar file",
        constraint: Some(identifier),
        default: None,
    },
    FieldRule {
        name: "path",
        required: true,
        kind: ValueKind::String,
        description: "Location of the image file the record describes",
        constraint: Some(non_blank),
        default: None,
    },
    FieldRule {
        name: "modality",
        required: true,
        kind: ValueKind::String,
        description: "Acquisition modality",
        constraint: Some(known_modality),
        default: None,
    },
    FieldRule {
        name: "dimensions",
        required: false,
        kind: ValueKind::Array,
        description: "Image extent per axis",
        constraint: Some(positive_dimensions),
        default: None,
    },
    FieldRule {
        name: "format",
        required: false,
        kind: ValueKind::String,
        description: "Image file format, derived from the path extension when absent",
        constraint: Some(non_blank),
        default: Some(format_from_path),
    },
    FieldRule {
        name: "patient_id",
        required: false,
        kind: ValueKind::String,
        description: "Patient identifier",
        constraint: Some(non_blank),
        default: None,
    },
    FieldRule {
        name: "patient_age",
        required: false,
        kind: ValueKind::Integer,
        description: "Patient age in years",
        constraint: Some(plausible_age),
        default: None,
    },
    FieldRule {
        name: "patient_birth_date",
        required: false,
        kind: ValueKind::String,
        description: "Patient birth date (YYYY-MM-DD)",
        constraint: Some(calendar_date),
        default: None,
    },
    FieldRule {
        name: "study_date",
        required: false,
        kind: ValueKind::String,
        description: "Study date (YYYY-MM-DD)",
        constraint: Some(calendar_date),
        default: None,
    },
    FieldRule {
        name: "custom_fields",
        required: false,
        kind: ValueKind::Object,
        description: "User-defined nested fields",
        constraint: None,
        default: Some(empty_object),
    },
];

static SHARED_DEFAULT: Lazy<Arc<RuleSet>> = Lazy::new(|| Arc::new(RuleSet::default()));

/// The active validation configuration consulted by every validator
#[derive(Debug, Clone)]
pub struct RuleSet {
    rules: Vec<FieldRule>,
    max_string_length: usize,
}

impl Default for RuleSet {
    fn default() -> Self {
        Self {
            rules: DEFAULT_RULES.to_vec(),
            max_string_length: DEFAULT_MAX_STRING_LENGTH,
        }
    }
}

impl RuleSet {
    /// Process-wide immutable default rule set
    pub fn shared_default() -> Arc<RuleSet> {
        Arc::clone(&SHARED_DEFAULT)
    }

    /// Rule set with no field rules at all
    pub fn empty() -> Self {
        Self {
            rules: Vec::new(),
            max_string_length: DEFAULT_MAX_STRING_LENGTH,
        }
    }

    /// Add a rule, replacing any existing rule for the same field
    pub fn with_rule(mut self, rule: FieldRule) -> Self {
        match self.rules.iter_mut().find(|r| r.name == rule.name) {
            Some(existing) => *existing = rule,
            None => self.rules.push(rule),
        }
        self
    }

    pub fn with_max_string_length(mut self, max: usize) -> Self {
        self.max_string_length = max;
        self
    }

    pub fn rule(&self, name: &str) -> Option<&FieldRule> {
        self.rules.iter().find(|r| r.name == name)
    }

    pub fn rules(&self) -> &[FieldRule] {
        &self.rules
    }

    pub fn required_fields(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.rules.iter().filter(|r| r.required).map(|r| r.name)
    }

    pub fn max_string_length(&self) -> usize {
        self.max_string_length
    }
}

fn non_blank(value: &Value) -> Result<(), String> {
    match value.as_str() {
        Some(s) if s.trim().is_empty() => Err("must not be blank".to_string()),
        _ => Ok(()),
    }
}

fn identifier(value: &Value) -> Result<(), String> {
    non_blank(value)?;
    let s = value.as_str().unwrap_or_default();
    if s.contains('/') || s.contains('\\') || s.contains("..") {
        return Err(format!("'{}' cannot be used as a file name component", s));
    }
    Ok(())
}

fn known_modality(value: &Value) -> Result<(), String> {
    let s = value.as_str().unwrap_or_default();
    if VALID_MODALITIES.contains(&s) {
        Ok(())
    } else {
        Err(format!(
            "unknown modality '{}' (expected one of {})",
            s,
            VALID_MODALITIES.join(", ")
        ))
    }
}

fn positive_dimensions(value: &Value) -> Result<(), String> {
    let dims = value.as_array().map(Vec::as_slice).unwrap_or_default();
    if dims.is_empty() {
        return Err("must list at least one axis".to_string());
    }
    for (i, dim) in dims.iter().enumerate() {
        match dim.as_u64() {
            Some(n) if n >= 1 => {}
            _ => return Err(format!("axis {} is {}, expected a positive integer", i, dim)),
        }
    }
    Ok(())
}

fn plausible_age(value: &Value) -> Result<(), String> {
    match value.as_i64() {
        Some(age) if (0..=MAX_PATIENT_AGE).contains(&age) => Ok(()),
        _ => Err(format!("{} out of range [0, {}]", value, MAX_PATIENT_AGE)),
    }
}

fn calendar_date(value: &Value) -> Result<(), String> {
    let s = value.as_str().unwrap_or_default();
    if s.len() == 10 && NaiveDate::parse_from_str(s, "%Y-%m-%d").is_ok() {
        Ok(())
    } else {
        Err(format!("'{}' is not a YYYY-MM-DD date", s))
    }
}

fn format_from_path(record: &Mapping) -> Option<Value> {
    record
        .get("path")
        .and_then(Value::as_str)
        .map(|path| Value::String(detect_format(path).to_string()))
}

fn empty_object(_: &Mapping) -> Option<Value> {
    Some(json!({}))
}
