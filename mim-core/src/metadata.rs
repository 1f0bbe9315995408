//! In-memory metadata record
//!
//! A [`Metadata`] is a validated field map. Construction validates the whole
//! record and injects declared defaults; every later mutation re-validates
//! the touched field and leaves the record untouched when it fails.
//!
//! A defaulted field whose value still equals what its default would
//! compute is treated as derived: changing the field it derives from
//! (e.g. `path` for `format`) recomputes it.

use crate::validators::{self, RuleSet, ValidationIssue, ValidationResult};
use crate::{Error, Mapping, Result};
use serde_json::Value;
use std::sync::Arc;

/// Field map of one image record plus the rule set it was validated against
#[derive(Debug, Clone)]
pub struct Metadata {
    fields: Mapping,
    rules: Arc<RuleSet>,
}

impl PartialEq for Metadata {
    fn eq(&self, other: &Self) -> bool {
        self.fields == other.fields
    }
}

impl Metadata {
    /// Validate `raw` against the default rule set and wrap it.
    ///
    /// # Errors
    ///
    /// [`Error::Validation`] carrying every violation found.
    pub fn from_mapping(raw: Mapping) -> Result<Self> {
        Self::from_mapping_with(raw, RuleSet::shared_default())
    }

    /// Record with no content yet, only the defaults `rules` can compute
    /// from nothing.
    ///
    /// Not validated: required fields are missing until set, which
    /// [`Metadata::validate`] reports.
    pub fn empty(rules: Arc<RuleSet>) -> Self {
        let mut metadata = Self {
            fields: Mapping::new(),
            rules,
        };
        metadata.apply_defaults();
        metadata
    }

    /// Same as [`Metadata::from_mapping`] with an explicit rule set
    pub fn from_mapping_with(raw: Mapping, rules: Arc<RuleSet>) -> Result<Self> {
        let result = validators::validate_all(&raw, &rules);
        if !result.ok {
            return Err(Error::validation(result));
        }

        let mut metadata = Self { fields: raw, rules };
        metadata.apply_defaults();
        Ok(metadata)
    }

    /// Plain field map, defaults included, ready for JSON encoding
    pub fn to_mapping(&self) -> Mapping {
        self.fields.clone()
    }

    pub fn into_mapping(self) -> Mapping {
        self.fields
    }

    /// Set one field after validating only that field.
    ///
    /// `null` on an optional rule field clears it (re-applying its default,
    /// if any). Derived fields are recomputed. On failure the previous value
    /// stays in place.
    pub fn set_field(&mut self, name: &str, value: Value) -> Result<()> {
        let issues = validators::validate_field(name, &value, &self.rules);
        if !issues.is_empty() {
            return Err(Error::validation(ValidationResult::from_issues(issues)));
        }

        let derived = self.derived_fields();
        if value.is_null() && self.rules.rule(name).is_some() {
            self.fields.shift_remove(name);
        } else {
            self.fields.insert(name.to_string(), value);
        }
        self.refresh_derived(&derived, name);
        self.apply_defaults();
        Ok(())
    }

    /// Remove a field, returning its previous value.
    ///
    /// Required fields cannot be removed. Fields with a declared default
    /// fall back to that default.
    pub fn remove_field(&mut self, name: &str) -> Result<Option<Value>> {
        if self.rules.rule(name).is_some_and(|rule| rule.required) {
            return Err(Error::validation(ValidationResult::from_issues(vec![
                ValidationIssue::Missing {
                    field: name.to_string(),
                },
            ])));
        }

        let derived = self.derived_fields();
        let previous = self.fields.shift_remove(name);
        self.refresh_derived(&derived, name);
        self.apply_defaults();
        Ok(previous)
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(Value::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    pub fn fields(&self) -> &Mapping {
        &self.fields
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn rules(&self) -> &Arc<RuleSet> {
        &self.rules
    }

    /// Re-run full validation of the current content
    pub fn validate(&self) -> ValidationResult {
        validators::validate_all(&self.fields, &self.rules)
    }

    /// Case-insensitive substring search over every value.
    ///
    /// Recurses into objects and arrays. Hits are reported with their
    /// location, e.g. `custom_fields.site` or `dimensions[0]`. Container
    /// values are matched on their serialized text as well as descended.
    pub fn search(&self, query: &str) -> Vec<(String, Value)> {
        let needle = query.to_lowercase();
        let mut hits = Vec::new();
        for (name, value) in &self.fields {
            search_value(name.clone(), value, &needle, &mut hits);
        }
        hits
    }

    /// Same as [`Metadata::search`], limited to the named top-level fields
    pub fn search_fields(&self, query: &str, names: &[&str]) -> Vec<(String, Value)> {
        let needle = query.to_lowercase();
        let mut hits = Vec::new();
        for name in names {
            if let Some(value) = self.fields.get(*name) {
                search_value(name.to_string(), value, &needle, &mut hits);
            }
        }
        hits
    }

    /// Defaulted fields whose current value is what their default computes
    fn derived_fields(&self) -> Vec<&'static str> {
        self.rules
            .rules()
            .iter()
            .filter(|rule| match (rule.default, self.fields.get(rule.name)) {
                (Some(default), Some(current)) => default(&self.fields).as_ref() == Some(current),
                _ => false,
            })
            .map(|rule| rule.name)
            .collect()
    }

    /// Recompute `derived` fields other than the one just changed
    fn refresh_derived(&mut self, derived: &[&'static str], changed: &str) {
        let rules = Arc::clone(&self.rules);
        for name in derived.iter().copied().filter(|name| *name != changed) {
            let Some(default) = rules.rule(name).and_then(|rule| rule.default) else {
                continue;
            };
            match default(&self.fields) {
                Some(value) => {
                    self.fields.insert(name.to_string(), value);
                }
                None => {
                    self.fields.shift_remove(name);
                }
            }
        }
    }

    fn apply_defaults(&mut self) {
        let rules = Arc::clone(&self.rules);
        for rule in rules.rules() {
            let Some(default) = rule.default else {
                continue;
            };
            let absent = matches!(self.fields.get(rule.name), None | Some(Value::Null));
            if absent {
                if let Some(value) = default(&self.fields) {
                    self.fields.insert(rule.name.to_string(), value);
                }
            }
        }
    }
}

fn search_value(location: String, value: &Value, needle: &str, hits: &mut Vec<(String, Value)>) {
    let text = match value {
        Value::String(s) => s.to_lowercase(),
        other => other.to_string().to_lowercase(),
    };
    let is_container = matches!(value, Value::Object(_) | Value::Array(_));
    if !is_container && text.contains(needle) {
        hits.push((location.clone(), value.clone()));
    }

    match value {
        Value::Object(map) => {
            for (key, child) in map {
                search_value(format!("{}.{}", location, key), child, needle, hits);
            }
        }
        Value::Array(items) => {
            for (i, child) in items.iter().enumerate() {
                search_value(format!("{}[{}]", location, i), child, needle, hits);
            }
        }
        _ => {}
    }
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

    fn sample() -> Metadata {
        Metadata::from_mapping(mapping(json!({
            "id": "img1",
            "path": "a.nii",
            "modality": "MRI",
            "dimensions": [256, 256, 128],
            "custom_fields": {"site": "North Clinic"}
        })))
        .unwrap()
    }

    #[test]
    fn test_defaults_are_injected() {
        let metadata = Metadata::from_mapping(mapping(json!({
            "id": "img1",
            "path": "scan.dcm",
            "modality": "CT"
        })))
        .unwrap();

        assert_eq!(metadata.get("format"), Some(&json!("DICOM")));
        assert_eq!(metadata.get("custom_fields"), Some(&json!({})));
    }

    #[test]
    fn test_explicit_values_beat_defaults() {
        let metadata = Metadata::from_mapping(mapping(json!({
            "id": "img1",
            "path": "scan.dcm",
            "modality": "CT",
            "format": "DICOM-enhanced"
        })))
        .unwrap();

        assert_eq!(metadata.get_str("format"), Some("DICOM-enhanced"));
    }

    #[test]
    fn test_round_trip_stabilizes_after_one_pass() {
        let once = sample().to_mapping();
        let twice = Metadata::from_mapping(once.clone()).unwrap().to_mapping();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_missing_required_field_fails() {
        let err = Metadata::from_mapping(mapping(json!({"id": "img1", "path": "a.nii"})))
            .unwrap_err();

        let result = err.validation_result().expect("validation error");
        assert!(result.mentions("modality"));
    }

    #[test]
    fn test_set_field_success() {
        let mut metadata = sample();
        metadata.set_field("modality", json!("CT")).unwrap();
        assert_eq!(metadata.get_str("modality"), Some("CT"));
    }

    #[test]
    fn test_set_field_failure_keeps_prior_value() {
        let mut metadata = sample();
        let before = metadata.clone();

        let err = metadata.set_field("modality", json!(123)).unwrap_err();

        assert!(err.validation_result().unwrap().mentions("modality"));
        assert_eq!(metadata, before);
    }

    #[test]
    fn test_set_field_null_clears_optional_and_restores_default() {
        let mut metadata = sample();
        metadata.set_field("format", json!("custom")).unwrap();
        metadata.set_field("format", Value::Null).unwrap();
        assert_eq!(metadata.get_str("format"), Some("NIfTI"));

        metadata.set_field("dimensions", Value::Null).unwrap();
        assert!(!metadata.contains("dimensions"));
    }

    #[test]
    fn test_set_field_null_on_required_fails() {
        let mut metadata = sample();
        assert!(metadata.set_field("id", Value::Null).is_err());
        assert_eq!(metadata.get_str("id"), Some("img1"));
    }

    #[test]
    fn test_derived_format_follows_path() {
        let mut metadata = sample();
        assert_eq!(metadata.get_str("format"), Some("NIfTI"));

        metadata.set_field("path", json!("b.dcm")).unwrap();
        assert_eq!(metadata.get_str("format"), Some("DICOM"));

        // Survives a round trip through the on-disk form
        let mut reloaded = Metadata::from_mapping(metadata.to_mapping()).unwrap();
        reloaded.set_field("path", json!("c.png")).unwrap();
        assert_eq!(reloaded.get_str("format"), Some("PNG"));
    }

    #[test]
    fn test_explicit_format_kept_when_path_changes() {
        let mut metadata = sample();
        metadata.set_field("format", json!("MINC")).unwrap();
        metadata.set_field("path", json!("b.dcm")).unwrap();
        assert_eq!(metadata.get_str("format"), Some("MINC"));
    }

    #[test]
    fn test_empty_is_built_up_by_setters() {
        let mut metadata = Metadata::empty(RuleSet::shared_default());
        assert_eq!(metadata.get("custom_fields"), Some(&json!({})));

        let result = metadata.validate();
        assert!(!result.ok);
        assert!(result.mentions("id"));
        assert!(result.mentions("path"));
        assert!(result.mentions("modality"));

        metadata.set_field("id", json!("img9")).unwrap();
        metadata.set_field("path", json!("scan.dcm")).unwrap();
        metadata.set_field("modality", json!("CT")).unwrap();

        assert!(metadata.validate().ok);
        assert_eq!(metadata.get_str("format"), Some("DICOM"));
    }

    #[test]
    fn test_key_order_is_preserved() {
        let mut metadata = Metadata::from_mapping(mapping(json!({
            "path": "a.nii",
            "modality": "MRI",
            "id": "img1",
            "scanner": "Prisma"
        })))
        .unwrap();
        metadata.set_field("modality", json!("CT")).unwrap();
        metadata.set_field("dimensions", json!([4, 4])).unwrap();
        metadata.set_field("dimensions", Value::Null).unwrap();

        let keys: Vec<&str> = metadata.fields().keys().map(String::as_str).collect();
        assert_eq!(
            keys,
            vec!["path", "modality", "id", "scanner", "format", "custom_fields"]
        );
    }

    #[test]
    fn test_search_fields_restricts_to_named_fields() {
        let metadata = sample();

        assert!(metadata.search_fields("north", &["path", "modality"]).is_empty());
        let hits = metadata.search_fields("north", &["custom_fields"]);
        assert_eq!(hits, vec![("custom_fields.site".to_string(), json!("North Clinic"))]);
        assert!(metadata.search_fields("north", &["absent"]).is_empty());
    }

    #[test]
    fn test_free_form_field() {
        let mut metadata = sample();
        metadata.set_field("contrast_agent", json!("gadolinium")).unwrap();
        assert_eq!(metadata.get_str("contrast_agent"), Some("gadolinium"));
        assert!(metadata.validate().ok);
    }

    #[test]
    fn test_remove_field() {
        let mut metadata = sample();
        assert!(metadata.remove_field("path").is_err());

        let removed = metadata.remove_field("custom_fields").unwrap();
        assert_eq!(removed, Some(json!({"site": "North Clinic"})));
        assert_eq!(metadata.get("custom_fields"), Some(&json!({})));
    }

    #[test]
    fn test_search_reports_nested_locations() {
        let metadata = sample();

        let hits = metadata.search("north");
        assert_eq!(hits, vec![("custom_fields.site".to_string(), json!("North Clinic"))]);

        let hits = metadata.search("256");
        let locations: Vec<&str> = hits.iter().map(|(loc, _)| loc.as_str()).collect();
        assert_eq!(locations, vec!["dimensions[0]", "dimensions[1]"]);
    }
}
