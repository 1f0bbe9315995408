//! Record validation
//!
//! Pure functions over a metadata mapping and a [`RuleSet`]. Every check
//! reports all problems it finds; [`validate_all`] always runs the three
//! passes and unions their findings so one call surfaces everything.

mod rules;

pub use rules::{
    Constraint, DefaultValue, FieldRule, RuleSet, ValueKind, DEFAULT_MAX_STRING_LENGTH,
    VALID_MODALITIES,
};

use crate::Mapping;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// A field whose value has the wrong JSON kind
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeMismatch {
    pub field: String,
    pub expected: ValueKind,
    pub actual: ValueKind,
}

/// A field whose value fails its constraint predicate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConstraintViolation {
    pub field: String,
    pub reason: String,
}

/// One problem found in a record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ValidationIssue {
    Missing {
        field: String,
    },
    TypeMismatch {
        field: String,
        expected: ValueKind,
        actual: ValueKind,
    },
    Constraint {
        field: String,
        reason: String,
    },
}

impl ValidationIssue {
    pub fn field(&self) -> &str {
        match self {
            ValidationIssue::Missing { field }
            | ValidationIssue::TypeMismatch { field, .. }
            | ValidationIssue::Constraint { field, .. } => field,
        }
    }
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationIssue::Missing { field } => {
                write!(f, "missing required field '{}'", field)
            }
            ValidationIssue::TypeMismatch {
                field,
                expected,
                actual,
            } => write!(f, "field '{}': expected {}, found {}", field, expected, actual),
            ValidationIssue::Constraint { field, reason } => {
                write!(f, "field '{}': {}", field, reason)
            }
        }
    }
}

impl From<TypeMismatch> for ValidationIssue {
    fn from(m: TypeMismatch) -> Self {
        ValidationIssue::TypeMismatch {
            field: m.field,
            expected: m.expected,
            actual: m.actual,
        }
    }
}

impl From<ConstraintViolation> for ValidationIssue {
    fn from(c: ConstraintViolation) -> Self {
        ValidationIssue::Constraint {
            field: c.field,
            reason: c.reason,
        }
    }
}

/// Outcome of validating one record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub ok: bool,
    pub errors: Vec<ValidationIssue>,
}

impl ValidationResult {
    pub fn passed() -> Self {
        Self {
            ok: true,
            errors: Vec::new(),
        }
    }

    pub fn from_issues(errors: Vec<ValidationIssue>) -> Self {
        Self {
            ok: errors.is_empty(),
            errors,
        }
    }

    /// Issues reported against `field`
    pub fn issues_for<'a>(&'a self, field: &'a str) -> impl Iterator<Item = &'a ValidationIssue> {
        self.errors.iter().filter(move |issue| issue.field() == field)
    }

    pub fn mentions(&self, field: &str) -> bool {
        self.issues_for(field).next().is_some()
    }
}

fn is_absent(value: Option<&Value>) -> bool {
    matches!(value, None | Some(Value::Null))
}

/// Every required field that is missing or `null`.
///
/// An empty list means the record passes.
pub fn validate_required(mapping: &Mapping, rules: &RuleSet) -> Vec<String> {
    rules
        .required_fields()
        .filter(|name| is_absent(mapping.get(*name)))
        .map(str::to_string)
        .collect()
}

/// Present, non-null rule fields whose value has the wrong kind
pub fn validate_types(mapping: &Mapping, rules: &RuleSet) -> Vec<TypeMismatch> {
    rules
        .rules()
        .iter()
        .filter_map(|rule| {
            let value = mapping.get(rule.name).filter(|v| !v.is_null())?;
            check_kind(rule, value)
        })
        .collect()
}

/// Constraint predicate failures plus over-long string values.
///
/// Rule constraints only run on fields that already have the right kind,
/// so a type mismatch is not reported twice.
pub fn validate_constraints(mapping: &Mapping, rules: &RuleSet) -> Vec<ConstraintViolation> {
    let mut violations: Vec<ConstraintViolation> = rules
        .rules()
        .iter()
        .filter_map(|rule| {
            let value = mapping.get(rule.name).filter(|v| !v.is_null())?;
            if check_kind(rule, value).is_some() {
                return None;
            }
            check_constraint(rule, value)
        })
        .collect();

    violations.extend(
        mapping
            .iter()
            .filter_map(|(name, value)| check_length(name, value, rules)),
    );
    violations
}

/// Run every check and union the results
pub fn validate_all(mapping: &Mapping, rules: &RuleSet) -> ValidationResult {
    let mut errors: Vec<ValidationIssue> = validate_required(mapping, rules)
        .into_iter()
        .map(|field| ValidationIssue::Missing { field })
        .collect();
    errors.extend(validate_types(mapping, rules).into_iter().map(ValidationIssue::from));
    errors.extend(
        validate_constraints(mapping, rules)
            .into_iter()
            .map(ValidationIssue::from),
    );

    ValidationResult::from_issues(errors)
}

/// Validate a single prospective field value.
///
/// Used for in-place mutation: `null` on a required field counts as
/// missing, `null` on anything else is accepted (it clears the field).
pub fn validate_field(name: &str, value: &Value, rules: &RuleSet) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();

    if let Some(rule) = rules.rule(name) {
        if value.is_null() {
            if rule.required {
                issues.push(ValidationIssue::Missing {
                    field: name.to_string(),
                });
            }
            return issues;
        }
        match check_kind(rule, value) {
            Some(mismatch) => issues.push(mismatch.into()),
            None => issues.extend(check_constraint(rule, value).map(ValidationIssue::from)),
        }
    }

    issues.extend(check_length(name, value, rules).map(ValidationIssue::from));
    issues
}

fn check_kind(rule: &FieldRule, value: &Value) -> Option<TypeMismatch> {
    let actual = ValueKind::of(value);
    if rule.kind.accepts(actual) {
        None
    } else {
        Some(TypeMismatch {
            field: rule.name.to_string(),
            expected: rule.kind,
            actual,
        })
    }
}

fn check_constraint(rule: &FieldRule, value: &Value) -> Option<ConstraintViolation> {
    let constraint = rule.constraint?;
    constraint(value).err().map(|reason| ConstraintViolation {
        field: rule.name.to_string(),
        reason,
    })
}

fn check_length(name: &str, value: &Value, rules: &RuleSet) -> Option<ConstraintViolation> {
    let s = value.as_str()?;
    let len = s.chars().count();
    (len > rules.max_string_length()).then(|| ConstraintViolation {
        field: name.to_string(),
        reason: format!(
            "length {} exceeds maximum {}",
            len,
            rules.max_string_length()
        ),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn mapping(value: Value) -> Mapping {
        match value {
            Value::Object(map) => map,
            other => panic!("not an object: {}", other),
        }
    }

    fn valid_record() -> Mapping {
        mapping(json!({
            "id": "img1",
            "path": "a.nii",
            "modality": "MRI",
            "dimensions": [256, 256, 128]
        }))
    }

    #[test]
    fn test_valid_record_passes() {
        let result = validate_all(&valid_record(), &RuleSet::default());
        assert!(result.ok, "unexpected issues: {:?}", result.errors);
        assert!(result.errors.is_empty());
    }

    #[test]
    fn test_missing_and_null_required_fields() {
        let record = mapping(json!({"id": "img1", "path": null}));
        let missing = validate_required(&record, &RuleSet::default());
        assert_eq!(missing, vec!["path", "modality"]);
    }

    #[test]
    fn test_type_mismatch_reports_expected_and_actual() {
        let mut record = valid_record();
        record.insert("modality".to_string(), json!(123));

        let mismatches = validate_types(&record, &RuleSet::default());
        assert_eq!(
            mismatches,
            vec![TypeMismatch {
                field: "modality".to_string(),
                expected: ValueKind::String,
                actual: ValueKind::Integer,
            }]
        );
    }

    #[test]
    fn test_constraints_skip_wrong_typed_fields() {
        let mut record = valid_record();
        record.insert("dimensions".to_string(), json!("256x256"));

        assert!(validate_constraints(&record, &RuleSet::default()).is_empty());
        assert_eq!(validate_types(&record, &RuleSet::default()).len(), 1);
    }

    #[test]
    fn test_validate_all_reports_everything_at_once() {
        let record = mapping(json!({
            "id": "img1",
            "modality": 7,
            "dimensions": [0, 12],
            "patient_birth_date": "yesterday",
            "notes": "x".repeat(DEFAULT_MAX_STRING_LENGTH + 1)
        }));

        let result = validate_all(&record, &RuleSet::default());

        assert!(!result.ok);
        assert!(result.mentions("path"));
        assert!(result.mentions("modality"));
        assert!(result.mentions("dimensions"));
        assert!(result.mentions("patient_birth_date"));
        assert!(result.mentions("notes"));
        assert_eq!(result.errors.len(), 5);
    }

    #[test]
    fn test_unknown_modality_is_constraint_violation() {
        let mut record = valid_record();
        record.insert("modality".to_string(), json!("XRAY"));

        let violations = validate_constraints(&record, &RuleSet::default());
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].field, "modality");
    }

    #[test]
    fn test_free_form_fields_are_untyped() {
        let mut record = valid_record();
        record.insert("contrast".to_string(), json!(true));
        record.insert("site".to_string(), json!({"name": "North", "floor": 2}));

        assert!(validate_all(&record, &RuleSet::default()).ok);
    }

    #[test]
    fn test_validate_field_null_on_required_is_missing() {
        let issues = validate_field("modality", &Value::Null, &RuleSet::default());
        assert_eq!(
            issues,
            vec![ValidationIssue::Missing {
                field: "modality".to_string()
            }]
        );
        assert!(validate_field("patient_id", &Value::Null, &RuleSet::default()).is_empty());
    }

    #[test]
    fn test_issue_display() {
        let issue = ValidationIssue::TypeMismatch {
            field: "modality".to_string(),
            expected: ValueKind::String,
            actual: ValueKind::Integer,
        };
        assert_eq!(
            issue.to_string(),
            "field 'modality': expected string, found integer"
        );
    }

    #[test]
    fn test_custom_rule_set_limits_strings() {
        let rules = RuleSet::empty().with_max_string_length(3);
        let record = mapping(json!({"code": "abcd", "n": 12345}));

        let result = validate_all(&record, &rules);
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].field(), "code");
    }
}
