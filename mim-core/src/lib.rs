//! # MIM Core Library
//!
//! Load, validate and mutate JSON metadata sidecars describing medical
//! image files:
//! - Sidecar file access with atomic writes (`file_handler`)
//! - Rule-table driven record validation (`validators`)
//! - Validated metadata records and image entities (`metadata`, `image`)
//! - Directory scanning with per-file failure collection (`loader`)
//! - The collection façade: find/list/update/delete/batch validation (`manager`)
//! - Configuration loading (`config`)

pub mod config;
pub mod error;
pub mod file_handler;
pub mod image;
pub mod loader;
pub mod manager;
pub mod metadata;
pub mod validators;

pub use config::StoreConfig;
pub use error::{Error, Result};
pub use image::MedicalImage;
pub use loader::{DataLoader, ScanOutcome};
pub use manager::{ImageManager, ImageStatistics, LoadReport, SortBy};
pub use metadata::Metadata;
pub use validators::{RuleSet, ValidationIssue, ValidationResult, ValueKind};

/// Field name → JSON value map, the plain shape of one record
pub type Mapping = serde_json::Map<String, serde_json::Value>;
