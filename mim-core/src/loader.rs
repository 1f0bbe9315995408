//! Sidecar directory scanner
//!
//! Lists `*_metadata.json` files in one directory (non-recursive) and
//! builds a [`MedicalImage`] from each. A file that fails to read, parse or
//! validate is recorded with its error and the scan moves on.

use crate::config::METADATA_SUFFIX;
use crate::file_handler;
use crate::image::MedicalImage;
use crate::validators::RuleSet;
use crate::{Error, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Everything one scan produced
#[derive(Debug, Default)]
pub struct ScanOutcome {
    /// Successfully loaded images, in file name order
    pub images: Vec<MedicalImage>,
    /// Files that could not be loaded and why
    pub failures: Vec<(PathBuf, Error)>,
}

impl ScanOutcome {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Directory scanner for metadata sidecars
#[derive(Debug, Clone)]
pub struct DataLoader {
    suffix: String,
    rules: Arc<RuleSet>,
}

impl Default for DataLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl DataLoader {
    /// Scanner for `_metadata.json` files using the default rule set
    pub fn new() -> Self {
        Self {
            suffix: METADATA_SUFFIX.to_string(),
            rules: RuleSet::shared_default(),
        }
    }

    pub fn with_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.suffix = suffix.into();
        self
    }

    pub fn with_rules(mut self, rules: Arc<RuleSet>) -> Self {
        self.rules = rules;
        self
    }

    pub fn suffix(&self) -> &str {
        &self.suffix
    }

    pub fn rules(&self) -> &Arc<RuleSet> {
        &self.rules
    }

    /// Load every sidecar in `dir`.
    ///
    /// Paths are sorted before parsing so repeated scans of the same
    /// directory yield the same order.
    ///
    /// # Errors
    ///
    /// Only when the directory itself cannot be listed. Per-file failures
    /// land in [`ScanOutcome::failures`].
    pub fn scan_directory(&self, dir: &Path) -> Result<ScanOutcome> {
        let mut paths: Vec<PathBuf> = file_handler::list_files(dir, &self.suffix)?.collect();
        paths.sort();

        tracing::debug!("Found {} sidecar files in {}", paths.len(), dir.display());

        let mut outcome = ScanOutcome::default();
        for path in paths {
            match MedicalImage::from_file_with(&path, &self.suffix, Arc::clone(&self.rules)) {
                Ok(image) => outcome.images.push(image),
                Err(e) => {
                    tracing::warn!("Skipping {}: {}", path.display(), e);
                    outcome.failures.push((path, e));
                }
            }
        }

        tracing::info!(
            "Scanned {}: {} loaded, {} failed",
            dir.display(),
            outcome.images.len(),
            outcome.failures.len()
        );
        Ok(outcome)
    }
}
