use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::{error, info};

use crate::errors::EvalError;
use crate::harness::EvalPaths;
use crate::model::{DatasetManifest, DatasetManifestEntry};
use crate::util::{append_line, count_file_lines, now_utc_string, read_json, sha256_bytes, sha256_file};

pub const ALL_DATASETS: &str = "all";
const MANIFEST_SUBJECT: &str = "<manifest>";

#[derive(Debug, Clone)]
pub struct ValidatedDatasets {
    pub names: Vec<String>,
    pub manifest: DatasetManifest,
}

pub fn compute_manifest_digest(entries: &BTreeMap<String, DatasetManifestEntry>) -> Result<String> {
    let bytes = serde_json::to_vec(entries).context("failed to serialize manifest entries")?;
    Ok(sha256_bytes(&bytes))
}

/// Fail-fast gate run before any case is evaluated. Every failure is written
/// to the integrity log before the error is returned.
pub struct IntegrityValidator<'a> {
    paths: &'a EvalPaths,
}

impl<'a> IntegrityValidator<'a> {
    pub fn new(paths: &'a EvalPaths) -> Self {
        Self { paths }
    }

    pub fn validate(&self, requested: &[String]) -> Result<ValidatedDatasets> {
        let manifest = self.load_manifest()?;
        let names = resolve_dataset_names(requested, &manifest);
        if names.is_empty() {
            return Err(self.fail(MANIFEST_SUBJECT, "no datasets selected for validation"));
        }

        for name in &names {
            self.validate_one(name, &manifest)?;
        }

        info!(
            datasets = %names.join(","),
            manifest_digest = %manifest.manifest_digest,
            "dataset integrity validated"
        );
        Ok(ValidatedDatasets { names, manifest })
    }

    pub fn load_manifest(&self) -> Result<DatasetManifest> {
        let path = self.paths.manifest_path();
        if !path.exists() {
            return Err(self.fail(
                MANIFEST_SUBJECT,
                &format!("manifest file missing: {}", path.display()),
            ));
        }

        let manifest: DatasetManifest = match read_json(&path) {
            Ok(manifest) => manifest,
            Err(err) => return Err(self.fail(MANIFEST_SUBJECT, &format!("{err:#}"))),
        };

        let recomputed = compute_manifest_digest(&manifest.datasets)?;
        if recomputed != manifest.manifest_digest {
            return Err(self.fail(
                MANIFEST_SUBJECT,
                &format!(
                    "manifest digest mismatch: recorded {} computed {}",
                    manifest.manifest_digest, recomputed
                ),
            ));
        }
        Ok(manifest)
    }

    fn validate_one(&self, name: &str, manifest: &DatasetManifest) -> Result<()> {
        let Some(entry) = manifest.datasets.get(name) else {
            return Err(self.fail(name, "dataset not present in manifest"));
        };

        if !is_plain_file_name(&entry.file) {
            return Err(self.fail(
                name,
                &format!("manifest file name is not a plain file name: {}", entry.file),
            ));
        }

        let path = self.paths.dataset_path(&entry.file);
        if !path.is_file() {
            return Err(self.fail(name, &format!("dataset file missing: {}", path.display())));
        }

        let digest = sha256_file(&path)?;
        if digest != entry.sha256 {
            return Err(self.fail(
                name,
                &format!("digest mismatch: recorded {} computed {}", entry.sha256, digest),
            ));
        }

        let line_count = count_file_lines(&path)?;
        if line_count != entry.line_count {
            return Err(self.fail(
                name,
                &format!(
                    "line count mismatch: recorded {} counted {}",
                    entry.line_count, line_count
                ),
            ));
        }
        Ok(())
    }

    fn fail(&self, dataset: &str, reason: &str) -> anyhow::Error {
        let log_path = self.paths.integrity_log_path();
        let line = format!("{}\t{}\t{}", now_utc_string(), dataset, reason);
        if let Err(err) = append_line(&log_path, &line) {
            error!(path = %log_path.display(), error = %err, "failed to write integrity log");
        }
        error!(dataset = %dataset, reason = %reason, "integrity check failed");
        EvalError::Integrity {
            dataset: dataset.to_string(),
            reason: reason.to_string(),
        }
        .into()
    }
}

pub fn resolve_dataset_names(requested: &[String], manifest: &DatasetManifest) -> Vec<String> {
    let mut names = if requested.is_empty()
        || requested
            .iter()
            .any(|name| name.trim().eq_ignore_ascii_case(ALL_DATASETS))
    {
        manifest.datasets.keys().cloned().collect::<Vec<String>>()
    } else {
        requested
            .iter()
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty())
            .collect::<Vec<String>>()
    };
    names.sort();
    names.dedup();
    names
}

fn is_plain_file_name(file: &str) -> bool {
    let path = Path::new(file);
    !file.is_empty()
        && path.components().count() == 1
        && path.file_name().and_then(|name| name.to_str()) == Some(file)
}
