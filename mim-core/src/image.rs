//! Medical image entity
//!
//! Pairs the file reference of one image (`id`, `path`, `modality`,
//! `dimensions`) with its validated [`Metadata`]. The reference fields
//! live inside the metadata record itself, so the on-disk sidecar stays a
//! single flat JSON object and there is one source of truth for them.

use crate::config::METADATA_SUFFIX;
use crate::file_handler;
use crate::metadata::Metadata;
use crate::validators::{RuleSet, ValidationResult};
use crate::{Error, Mapping, Result};
use serde::de::Error as _;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// One image record
#[derive(Debug, Clone, PartialEq)]
pub struct MedicalImage {
    metadata: Metadata,
    /// Sidecar file the record was loaded from or last persisted to
    sidecar_path: Option<PathBuf>,
}

impl MedicalImage {
    /// Wrap already-validated metadata (no backing file yet)
    pub fn new(metadata: Metadata) -> Self {
        Self {
            metadata,
            sidecar_path: None,
        }
    }

    /// Load one `<id>_metadata.json` sidecar with the default rule set
    pub fn from_file(path: &Path) -> Result<Self> {
        Self::from_file_with(path, METADATA_SUFFIX, RuleSet::shared_default())
    }

    /// Load one sidecar file.
    ///
    /// When the content has no `id`, it is derived from the file name by
    /// stripping `suffix`. Validation errors are annotated with `path`.
    pub fn from_file_with(path: &Path, suffix: &str, rules: Arc<RuleSet>) -> Result<Self> {
        let mut raw = match file_handler::read_json(path)? {
            Value::Object(map) => map,
            other => {
                return Err(Error::Parse {
                    path: path.to_path_buf(),
                    source: serde_json::Error::custom(format!(
                        "expected a JSON object, found {}",
                        crate::validators::ValueKind::of(&other)
                    )),
                })
            }
        };

        if matches!(raw.get("id"), None | Some(Value::Null)) {
            if let Some(id) = id_from_file_name(path, suffix) {
                raw.insert("id".to_string(), Value::String(id));
            }
        }

        let metadata = Metadata::from_mapping_with(raw, rules).map_err(|e| e.with_path(path))?;

        Ok(Self {
            metadata,
            sidecar_path: Some(path.to_path_buf()),
        })
    }

    pub fn id(&self) -> &str {
        self.metadata.get_str("id").unwrap_or_default()
    }

    /// Location of the image file this record describes
    pub fn path(&self) -> &str {
        self.metadata.get_str("path").unwrap_or_default()
    }

    pub fn modality(&self) -> &str {
        self.metadata.get_str("modality").unwrap_or_default()
    }

    pub fn dimensions(&self) -> Option<Vec<u64>> {
        self.metadata
            .get("dimensions")?
            .as_array()?
            .iter()
            .map(Value::as_u64)
            .collect()
    }

    pub fn format(&self) -> Option<&str> {
        self.metadata.get_str("format")
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn sidecar_path(&self) -> Option<&Path> {
        self.sidecar_path.as_deref()
    }

    pub(crate) fn replace_metadata(&mut self, metadata: Metadata) {
        self.metadata = metadata;
    }

    pub(crate) fn set_sidecar_path(&mut self, path: PathBuf) {
        self.sidecar_path = Some(path);
    }

    /// Presentation view: reference fields on top, full record under `metadata`
    pub fn to_dict(&self) -> Mapping {
        let mut dict = Mapping::new();
        dict.insert("id".to_string(), Value::String(self.id().to_string()));
        dict.insert("path".to_string(), Value::String(self.path().to_string()));
        dict.insert(
            "modality".to_string(),
            Value::String(self.modality().to_string()),
        );
        dict.insert(
            "dimensions".to_string(),
            self.metadata
                .get("dimensions")
                .cloned()
                .unwrap_or(Value::Null),
        );
        dict.insert(
            "metadata".to_string(),
            Value::Object(self.metadata.to_mapping()),
        );
        dict
    }

    pub fn validate(&self) -> ValidationResult {
        self.metadata.validate()
    }
}

/// `<id><suffix>`, the sidecar file name for an identifier
pub fn sidecar_file_name(id: &str, suffix: &str) -> String {
    format!("{}{}", id, suffix)
}

/// Identifier encoded in a sidecar file name.
///
/// Falls back to the file stem when the name does not carry `suffix`.
pub fn id_from_file_name(path: &Path, suffix: &str) -> Option<String> {
    let name = path.file_name()?.to_string_lossy();
    let id = match name.strip_suffix(suffix) {
        Some(id) => id.to_string(),
        None => path.file_stem()?.to_string_lossy().into_owned(),
    };
    (!id.is_empty()).then_some(id)
}
