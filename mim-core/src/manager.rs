//! Image collection manager
//!
//! [`ImageManager`] owns the in-memory collection for the life of the
//! process. Queries read it directly; mutations validate first, persist the
//! one affected sidecar file, and only then touch memory, so a rejected or
//! failed call leaves both the collection and the disk as they were.

use crate::config::StoreConfig;
use crate::file_handler;
use crate::image::{sidecar_file_name, MedicalImage};
use crate::loader::DataLoader;
use crate::metadata::Metadata;
use crate::validators::{RuleSet, ValidationIssue, ValidationResult};
use crate::{Error, Mapping, Result};
use serde::Serialize;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

/// Result of populating the collection from a directory
#[derive(Debug, Default)]
pub struct LoadReport {
    /// Images added to the collection
    pub loaded: usize,
    /// Files (or the directory itself) that could not be loaded
    pub failures: Vec<(PathBuf, Error)>,
}

impl LoadReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Aggregate counts over the collection
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ImageStatistics {
    pub total_images: usize,
    pub by_modality: BTreeMap<String, usize>,
    pub by_format: BTreeMap<String, usize>,
    /// Images whose current content no longer passes validation
    pub invalid_images: usize,
}

/// Column order of [`ImageManager::export_csv`]
pub const CSV_HEADER: [&str; 6] = ["id", "path", "modality", "format", "dimensions", "metadata_json"];

/// Ordering for [`ImageManager::list_sorted`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SortBy {
    /// Load/registration order
    #[default]
    Loaded,
    Id,
    Path,
    Modality,
    /// `study_date` ascending; records without one come last
    StudyDate,
}

impl SortBy {
    fn compare(self, a: &MedicalImage, b: &MedicalImage) -> Ordering {
        match self {
            SortBy::Loaded => Ordering::Equal,
            SortBy::Id => a.id().cmp(b.id()),
            SortBy::Path => a.path().cmp(b.path()),
            SortBy::Modality => a.modality().cmp(b.modality()),
            SortBy::StudyDate => {
                let a = a.metadata().get_str("study_date");
                let b = b.metadata().get_str("study_date");
                match (a, b) {
                    (Some(a), Some(b)) => a.cmp(b),
                    (Some(_), None) => Ordering::Less,
                    (None, Some(_)) => Ordering::Greater,
                    (None, None) => Ordering::Equal,
                }
            }
        }
    }
}

/// Façade over the loaded image collection
#[derive(Debug)]
pub struct ImageManager {
    config: StoreConfig,
    loader: DataLoader,
    images: HashMap<String, MedicalImage>,
    /// Insertion order of `images` keys
    order: Vec<String>,
    /// Sidecars rejected at load because another file already held the id
    shadowed: HashMap<String, Vec<PathBuf>>,
}

impl ImageManager {
    /// Empty manager; call [`ImageManager::load`] to populate it
    pub fn new(config: StoreConfig) -> Self {
        let loader = DataLoader::new().with_suffix(config.suffix.clone());
        Self {
            config,
            loader,
            images: HashMap::new(),
            order: Vec::new(),
            shadowed: HashMap::new(),
        }
    }

    /// Use a non-default rule set for loading, registering and updating
    pub fn with_rules(mut self, rules: Arc<RuleSet>) -> Self {
        self.loader = self.loader.with_rules(rules);
        self
    }

    /// Create a manager and load `config.data_dir`
    pub fn open(config: StoreConfig) -> (Self, LoadReport) {
        let data_dir = config.data_dir.clone();
        let mut manager = Self::new(config);
        let report = manager.load(&data_dir);
        (manager, report)
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn data_dir(&self) -> &Path {
        &self.config.data_dir
    }

    /// Replace the collection with the sidecars found in `dir`.
    ///
    /// Never fails: unreadable files, invalid records and duplicate
    /// identifiers (first one wins) are listed in the report. A missing
    /// directory is created when `create_data_dir` is set, otherwise it is
    /// reported as a single failure.
    pub fn load(&mut self, dir: &Path) -> LoadReport {
        self.config.data_dir = dir.to_path_buf();
        self.images.clear();
        self.order.clear();
        self.shadowed.clear();

        let mut report = LoadReport::default();

        if !dir.exists() && self.config.create_data_dir {
            if let Err(e) = std::fs::create_dir_all(dir) {
                report.failures.push((dir.to_path_buf(), Error::io(dir, e)));
                return report;
            }
            tracing::info!("Created data directory {}", dir.display());
        }

        let outcome = match self.loader.scan_directory(dir) {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::warn!("Cannot scan {}: {}", dir.display(), e);
                report.failures.push((dir.to_path_buf(), e));
                return report;
            }
        };
        report.failures = outcome.failures;

        for image in outcome.images {
            let id = image.id().to_string();
            if self.images.contains_key(&id) {
                let path = image
                    .sidecar_path()
                    .map(Path::to_path_buf)
                    .unwrap_or_else(|| dir.to_path_buf());
                tracing::warn!("Duplicate id {} in {}", id, path.display());
                self.shadowed
                    .entry(id.clone())
                    .or_default()
                    .push(path.clone());
                report.failures.push((path, Error::Duplicate(id)));
                continue;
            }
            self.insert(image);
            report.loaded += 1;
        }

        tracing::info!(
            "Loaded {} images from {} ({} failures)",
            report.loaded,
            dir.display(),
            report.failures.len()
        );
        report
    }

    pub fn find(&self, id: &str) -> Option<&MedicalImage> {
        self.images.get(id)
    }

    /// Every image in load/registration order
    pub fn list(&self) -> Vec<&MedicalImage> {
        self.iter().collect()
    }

    /// Images matching `predicate`, in load/registration order
    pub fn filter<F>(&self, predicate: F) -> Vec<&MedicalImage>
    where
        F: Fn(&MedicalImage) -> bool,
    {
        self.iter().filter(|image| predicate(*image)).collect()
    }

    /// Images of `format` (any when `None`, case-insensitive), ordered by `sort_by`
    pub fn list_sorted(&self, format: Option<&str>, sort_by: SortBy) -> Vec<&MedicalImage> {
        let mut images: Vec<&MedicalImage> = self
            .iter()
            .filter(|image| match format {
                Some(wanted) => image
                    .format()
                    .is_some_and(|actual| actual.eq_ignore_ascii_case(wanted)),
                None => true,
            })
            .collect();
        images.sort_by(|a, b| sort_by.compare(a, b));
        images
    }

    /// Sidecars sharing `id` that lost to the loaded one
    pub fn shadowed_sidecars(&self, id: &str) -> &[PathBuf] {
        self.shadowed.get(id).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn iter(&self) -> impl Iterator<Item = &MedicalImage> + '_ {
        self.order.iter().filter_map(|id| self.images.get(id))
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.images.contains_key(id)
    }

    /// Add a new record to the collection and write its sidecar.
    ///
    /// A record without `id` gets a random UUID.
    ///
    /// # Errors
    ///
    /// * [`Error::Validation`] if the record is invalid
    /// * [`Error::Duplicate`] if the id is already held, or its sidecar
    ///   file exists on disk without having loaded
    /// * [`Error::NotFound`] if the data directory is missing and may not be created
    /// * [`Error::Io`] if the sidecar cannot be written
    pub fn register(&mut self, mut raw: Mapping) -> Result<&MedicalImage> {
        if matches!(raw.get("id"), None | Some(Value::Null)) {
            raw.insert("id".to_string(), Value::String(Uuid::new_v4().to_string()));
        }

        let metadata = Metadata::from_mapping_with(raw, Arc::clone(self.loader.rules()))?;
        let id = metadata.get_str("id").unwrap_or_default().to_string();
        if self.contains(&id) {
            return Err(Error::Duplicate(id));
        }

        self.ensure_data_dir()?;
        let target = self.sidecar_path_for(&id);
        if file_handler::exists(&target) {
            tracing::warn!(
                "Refusing to register {}: {} already exists",
                id,
                target.display()
            );
            return Err(Error::Duplicate(id));
        }
        file_handler::write_json(&target, &Value::Object(metadata.to_mapping()))?;

        let mut image = MedicalImage::new(metadata);
        image.set_sidecar_path(target);
        self.insert(image);

        tracing::info!("Registered image {}", id);
        self.find(&id).ok_or(Error::NotFound(id))
    }

    /// Apply several field changes to one image as a unit.
    ///
    /// Every field is validated before anything is written; if any fails,
    /// all violations are returned together and neither memory nor disk
    /// changes. The identifier itself cannot be changed.
    ///
    /// # Errors
    ///
    /// * [`Error::NotFound`] if `id` is not in the collection
    /// * [`Error::Validation`] listing every rejected field
    /// * [`Error::Io`] if the sidecar cannot be written (memory unchanged)
    pub fn update(&mut self, id: &str, field_updates: Mapping) -> Result<&MedicalImage> {
        let image = self
            .images
            .get(id)
            .ok_or_else(|| Error::NotFound(format!("image {}", id)))?;

        let mut staged = image.metadata().clone();
        let mut issues = Vec::new();
        for (name, value) in field_updates {
            if name == "id" && value.as_str() != Some(id) {
                issues.push(ValidationIssue::Constraint {
                    field: name,
                    reason: "identifier is immutable".to_string(),
                });
                continue;
            }
            if let Err(e) = staged.set_field(&name, value) {
                match e {
                    Error::Validation { result, .. } => issues.extend(result.errors),
                    other => return Err(other),
                }
            }
        }

        if !issues.is_empty() {
            let result = ValidationResult::from_issues(issues);
            tracing::warn!("Rejected update of {}: {} issue(s)", id, result.errors.len());
            return Err(Error::validation(result));
        }

        let target = image
            .sidecar_path()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.sidecar_path_for(id));
        file_handler::write_json(&target, &Value::Object(staged.to_mapping()))?;

        let image = self
            .images
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("image {}", id)))?;
        image.replace_metadata(staged);
        image.set_sidecar_path(target);

        tracing::info!("Updated image {}", id);
        Ok(&*image)
    }

    /// Remove an image from the collection and delete its sidecar.
    ///
    /// Not idempotent: deleting an id that is no longer held fails with
    /// [`Error::NotFound`]. Sidecars shadowed by this one at load time are
    /// deleted too, so the id does not come back on the next load. A file
    /// that is already gone from disk is tolerated; any other I/O failure
    /// aborts and keeps the entry.
    pub fn delete(&mut self, id: &str) -> Result<()> {
        let image = self
            .images
            .get(id)
            .ok_or_else(|| Error::NotFound(format!("image {}", id)))?;

        let target = image
            .sidecar_path()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.sidecar_path_for(id));

        if let Some(shadowed) = self.shadowed.get_mut(id) {
            while let Some(path) = shadowed.last() {
                remove_sidecar(id, path)?;
                shadowed.pop();
            }
        }
        remove_sidecar(id, &target)?;

        self.images.remove(id);
        self.order.retain(|held| held != id);
        self.shadowed.remove(id);

        tracing::info!("Deleted image {}", id);
        Ok(())
    }

    /// Validate every held image without mutating or persisting anything
    pub fn batch_validate(&self) -> BTreeMap<String, ValidationResult> {
        self.images
            .iter()
            .map(|(id, image)| (id.clone(), image.validate()))
            .collect()
    }

    /// Images whose id, path or any metadata value contains `query`
    /// (case-insensitive)
    pub fn search(&self, query: &str) -> Vec<&MedicalImage> {
        let needle = query.to_lowercase();
        self.iter()
            .filter(|image| {
                image.id().to_lowercase().contains(&needle)
                    || image.path().to_lowercase().contains(&needle)
                    || !image.metadata().search(query).is_empty()
            })
            .collect()
    }

    /// Images where one of the named fields contains `query` (case-insensitive)
    pub fn search_fields(&self, query: &str, fields: &[&str]) -> Vec<&MedicalImage> {
        self.iter()
            .filter(|image| !image.metadata().search_fields(query, fields).is_empty())
            .collect()
    }

    pub fn statistics(&self) -> ImageStatistics {
        let mut stats = ImageStatistics {
            total_images: self.images.len(),
            ..ImageStatistics::default()
        };

        for image in self.images.values() {
            *stats
                .by_modality
                .entry(image.modality().to_string())
                .or_insert(0) += 1;
            let format = image.format().unwrap_or(file_handler::UNKNOWN_FORMAT);
            *stats.by_format.entry(format.to_string()).or_insert(0) += 1;
            if !image.validate().ok {
                stats.invalid_images += 1;
            }
        }
        stats
    }

    /// Write every image's `to_dict()` as one JSON array to `path`
    pub fn export(&self, path: &Path) -> Result<usize> {
        let records: Vec<Value> = self
            .iter()
            .map(|image| Value::Object(image.to_dict()))
            .collect();
        let count = records.len();
        file_handler::write_json(path, &Value::Array(records))?;

        tracing::info!("Exported {} images to {}", count, path.display());
        Ok(count)
    }

    /// Write one CSV row per image to `path`, columns as in [`CSV_HEADER`].
    ///
    /// `dimensions` is rendered as `256x256x128`; the whole record goes into
    /// `metadata_json`.
    pub fn export_csv(&self, path: &Path) -> Result<usize> {
        let mut count = 0;
        file_handler::write_atomic(path, |out| {
            let mut writer = csv::Writer::from_writer(out);
            writer.write_record(CSV_HEADER)?;
            for image in self.iter() {
                let dimensions = image
                    .dimensions()
                    .map(|dims| {
                        dims.iter()
                            .map(u64::to_string)
                            .collect::<Vec<_>>()
                            .join("x")
                    })
                    .unwrap_or_default();
                let metadata_json = serde_json::to_string(image.metadata().fields())
                    .map_err(std::io::Error::from)?;
                writer.write_record([
                    image.id(),
                    image.path(),
                    image.modality(),
                    image.format().unwrap_or(file_handler::UNKNOWN_FORMAT),
                    dimensions.as_str(),
                    metadata_json.as_str(),
                ])?;
                count += 1;
            }
            writer.flush()
        })?;

        tracing::info!("Exported {} images as CSV to {}", count, path.display());
        Ok(count)
    }

    /// Sidecar location for an id inside the data directory
    pub fn sidecar_path_for(&self, id: &str) -> PathBuf {
        self.config
            .data_dir
            .join(sidecar_file_name(id, &self.config.suffix))
    }

    fn ensure_data_dir(&self) -> Result<()> {
        let dir = &self.config.data_dir;
        if dir.is_dir() {
            return Ok(());
        }
        if !self.config.create_data_dir {
            return Err(Error::NotFound(dir.display().to_string()));
        }
        std::fs::create_dir_all(dir).map_err(|e| Error::io(dir, e))
    }

    fn insert(&mut self, image: MedicalImage) {
        let id = image.id().to_string();
        self.order.push(id.clone());
        self.images.insert(id, image);
    }
}

/// Remove one sidecar of `id`, tolerating a file that is already gone
fn remove_sidecar(id: &str, path: &Path) -> Result<()> {
    match file_handler::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.is_not_found() => {
            tracing::warn!("Sidecar for {} already absent: {}", id, path.display());
            Ok(())
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn mapping(value: Value) -> Mapping {
        match value {
            Value::Object(map) => map,
            other => panic!("not an object: {}", other),
        }
    }

    fn manager_in(dir: &TempDir) -> ImageManager {
        let (manager, report) = ImageManager::open(StoreConfig::new(dir.path()));
        assert!(report.is_clean());
        manager
    }

    #[test]
    fn test_register_assigns_uuid_when_id_missing() {
        let dir = TempDir::new().unwrap();
        let mut manager = manager_in(&dir);

        let image = manager
            .register(mapping(json!({"path": "x.dcm", "modality": "CT"})))
            .unwrap();
        let id = image.id().to_string();

        assert!(Uuid::parse_str(&id).is_ok());
        assert!(dir.path().join(format!("{}_metadata.json", id)).exists());
        assert!(manager.contains(&id));
    }

    #[test]
    fn test_register_duplicate_rejected() {
        let dir = TempDir::new().unwrap();
        let mut manager = manager_in(&dir);
        let record = json!({"id": "img1", "path": "a.nii", "modality": "MRI"});

        manager.register(mapping(record.clone())).unwrap();
        let err = manager.register(mapping(record)).unwrap_err();

        assert!(matches!(err, Error::Duplicate(ref id) if id == "img1"));
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn test_update_rejects_id_change() {
        let dir = TempDir::new().unwrap();
        let mut manager = manager_in(&dir);
        manager
            .register(mapping(json!({"id": "img1", "path": "a.nii", "modality": "MRI"})))
            .unwrap();

        let err = manager
            .update("img1", mapping(json!({"id": "img2"})))
            .unwrap_err();

        assert!(err.validation_result().unwrap().mentions("id"));
        assert!(manager.contains("img1"));
        assert!(!manager.contains("img2"));
    }

    #[test]
    fn test_open_creates_missing_directory() {
        let dir = TempDir::new().unwrap();
        let data_dir = dir.path().join("data").join("images");

        let (manager, report) = ImageManager::open(StoreConfig::new(&data_dir));

        assert!(report.is_clean());
        assert!(manager.is_empty());
        assert!(data_dir.is_dir());
    }

    #[test]
    fn test_load_missing_directory_without_create() {
        let dir = TempDir::new().unwrap();
        let mut config = StoreConfig::new(dir.path().join("absent"));
        config.create_data_dir = false;

        let (manager, report) = ImageManager::open(config);

        assert!(manager.is_empty());
        assert_eq!(report.failures.len(), 1);
        assert!(report.failures[0].1.is_not_found());
    }

    #[test]
    fn test_statistics() {
        let dir = TempDir::new().unwrap();
        let mut manager = manager_in(&dir);
        for (id, path, modality) in [("a", "a.nii", "MRI"), ("b", "b.dcm", "CT"), ("c", "c.nii.gz", "MRI")] {
            manager
                .register(mapping(json!({"id": id, "path": path, "modality": modality})))
                .unwrap();
        }

        let stats = manager.statistics();

        assert_eq!(stats.total_images, 3);
        assert_eq!(stats.by_modality.get("MRI"), Some(&2));
        assert_eq!(stats.by_modality.get("CT"), Some(&1));
        assert_eq!(stats.by_format.get("NIfTI"), Some(&2));
        assert_eq!(stats.by_format.get("DICOM"), Some(&1));
        assert_eq!(stats.invalid_images, 0);
    }

    fn three_images(dir: &TempDir) -> ImageManager {
        let mut manager = manager_in(dir);
        for record in [
            json!({"id": "b", "path": "z.dcm", "modality": "CT", "study_date": "2024-03-01"}),
            json!({"id": "c", "path": "y.nii", "modality": "MRI"}),
            json!({"id": "a", "path": "x.dcm", "modality": "PET", "study_date": "2023-11-20"}),
        ] {
            manager.register(mapping(record)).unwrap();
        }
        manager
    }

    fn ids(images: Vec<&MedicalImage>) -> Vec<&str> {
        images.into_iter().map(MedicalImage::id).collect()
    }

    #[test]
    fn test_list_sorted_orders() {
        let dir = TempDir::new().unwrap();
        let manager = three_images(&dir);

        assert_eq!(ids(manager.list_sorted(None, SortBy::Loaded)), vec!["b", "c", "a"]);
        assert_eq!(ids(manager.list_sorted(None, SortBy::Id)), vec!["a", "b", "c"]);
        assert_eq!(ids(manager.list_sorted(None, SortBy::Path)), vec!["a", "c", "b"]);
        assert_eq!(ids(manager.list_sorted(None, SortBy::Modality)), vec!["b", "c", "a"]);
        assert_eq!(ids(manager.list_sorted(None, SortBy::StudyDate)), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_list_sorted_filters_by_format() {
        let dir = TempDir::new().unwrap();
        let manager = three_images(&dir);

        assert_eq!(ids(manager.list_sorted(Some("dicom"), SortBy::Id)), vec!["a", "b"]);
        assert_eq!(ids(manager.list_sorted(Some("NIfTI"), SortBy::Loaded)), vec!["c"]);
        assert!(manager.list_sorted(Some("PNG"), SortBy::Loaded).is_empty());
    }

    #[test]
    fn test_search_fields_only_looks_at_named_fields() {
        let dir = TempDir::new().unwrap();
        let manager = three_images(&dir);

        // "dcm" appears in two paths but in no modality
        assert_eq!(ids(manager.search_fields("dcm", &["path"])), vec!["b", "a"]);
        assert!(manager.search_fields("dcm", &["modality"]).is_empty());
        assert_eq!(ids(manager.search_fields("2024", &["study_date"])), vec!["b"]);
    }

    #[test]
    fn test_export_csv() {
        let dir = TempDir::new().unwrap();
        let mut manager = manager_in(&dir);
        manager
            .register(mapping(json!({
                "id": "img1",
                "path": "a.nii",
                "modality": "MRI",
                "dimensions": [256, 256, 128],
                "notes": "left, then right"
            })))
            .unwrap();
        let target = dir.path().join("export.csv");

        let count = manager.export_csv(&target).unwrap();

        assert_eq!(count, 1);
        let mut reader = csv::Reader::from_path(&target).unwrap();
        let header: Vec<String> = reader.headers().unwrap().iter().map(String::from).collect();
        assert_eq!(header, CSV_HEADER);

        let rows: Vec<csv::StringRecord> = reader.records().map(|r| r.unwrap()).collect();
        assert_eq!(rows.len(), 1);
        assert_eq!(&rows[0][0], "img1");
        assert_eq!(&rows[0][3], "NIfTI");
        assert_eq!(&rows[0][4], "256x256x128");
        let record: Value = serde_json::from_str(&rows[0][5]).unwrap();
        assert_eq!(record["notes"], json!("left, then right"));
    }
}
