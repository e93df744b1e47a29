use std::path::PathBuf;

pub mod buckets;
pub mod comparator;
pub mod dataset;
pub mod engine;
pub mod experiment_store;
pub mod experiments;
pub mod integrity;
pub mod metrics;
pub mod orchestrator;
pub mod pii;
pub mod promotion;
pub mod report;
pub mod scoring;
pub mod stability;

pub const MANIFEST_FILENAME: &str = "dataset_manifest.json";
pub const INTEGRITY_LOG_FILENAME: &str = "integrity_errors.log";
pub const EXPERIMENT_STORE_FILENAME: &str = "experiments.sqlite";
pub const LATEST_PRODUCTION_FILENAME: &str = "latest_production.json";

/// On-disk layout under the evaluation root.
#[derive(Debug, Clone)]
pub struct EvalPaths {
    pub root: PathBuf,
}

impl EvalPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn datasets_dir(&self) -> PathBuf {
        self.root.join("datasets")
    }

    pub fn manifest_dir(&self) -> PathBuf {
        self.root.join("manifests")
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.manifest_dir().join(MANIFEST_FILENAME)
    }

    pub fn reports_dir(&self) -> PathBuf {
        self.root.join("reports")
    }

    pub fn promotions_dir(&self) -> PathBuf {
        self.root.join("promotions")
    }

    pub fn latest_production_path(&self) -> PathBuf {
        self.promotions_dir().join(LATEST_PRODUCTION_FILENAME)
    }

    pub fn integrity_log_path(&self) -> PathBuf {
        self.root.join("logs").join(INTEGRITY_LOG_FILENAME)
    }

    pub fn experiment_store_path(&self) -> PathBuf {
        self.root.join(EXPERIMENT_STORE_FILENAME)
    }

    pub fn dataset_path(&self, file: &str) -> PathBuf {
        self.datasets_dir().join(file)
    }
}

#[cfg(test)]
pub(crate) mod fixtures;
