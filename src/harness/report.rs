use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Result, bail};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::harness::EvalPaths;
use crate::harness::buckets::{BucketKey, BucketSummary};
use crate::harness::metrics::FieldMetricsReport;
use crate::harness::scoring::{AggregateScores, ScoringConfig, ScoringResult};
use crate::harness::stability::StabilityReport;
use crate::model::{ActualFields, DatasetManifest, ExpectedFields, Field};
use crate::util::{read_json, utc_compact_string, utc_string, write_json_pretty};

pub const REPORT_VERSION: u32 = 1;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Passed,
    Failed,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Passed => "passed",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportMetadata {
    pub run_id: String,
    pub engine: String,
    pub engine_fingerprint: String,
    pub manifest_digest: String,
    pub active_experiments: Vec<String>,
    pub datasets: Vec<String>,
    pub started_at: String,
    pub completed_at: String,
    pub duration_ms: u64,
    pub case_count: usize,
    pub skipped_case_count: usize,
    pub scoring: ScoringConfig,
    #[serde(default)]
    pub target_percent: Option<f64>,
    #[serde(default)]
    pub target_met: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetBreakdown {
    pub name: String,
    pub case_count: usize,
    pub skipped_case_count: usize,
    pub aggregate: AggregateScores,
    pub field_accuracy: BTreeMap<Field, f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaseRecord {
    pub dataset: String,
    pub case_id: String,
    pub actual: ActualFields,
    pub expected: ExpectedFields,
    pub scoring: ScoringResult,
    pub buckets: Vec<BucketKey>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkippedCase {
    pub dataset: String,
    pub case_id: Option<String>,
    pub reason: String,
}

/// Immutable snapshot of one evaluation run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Report {
    pub report_version: u32,
    pub status: RunStatus,
    pub metadata: ReportMetadata,
    pub aggregate: AggregateScores,
    pub field_metrics: FieldMetricsReport,
    pub failure_buckets: Vec<BucketSummary>,
    pub datasets: Vec<DatasetBreakdown>,
    pub cases: Vec<CaseRecord>,
    pub skipped_cases: Vec<SkippedCase>,
    #[serde(default)]
    pub stability: Option<StabilityReport>,
}

impl Report {
    pub fn bucket_counts(&self) -> BTreeMap<BucketKey, usize> {
        self.failure_buckets
            .iter()
            .map(|bucket| (bucket.key, bucket.count))
            .collect()
    }

    pub fn dataset(&self, name: &str) -> Option<&DatasetBreakdown> {
        self.datasets.iter().find(|dataset| dataset.name == name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LatestReportPointer {
    pub report_path: String,
    pub run_id: String,
    pub status: RunStatus,
    pub manifest_digest: String,
    pub updated_at: String,
}

#[derive(Debug, Clone)]
pub struct PersistedReport {
    pub report_path: PathBuf,
    pub latest_path: PathBuf,
}

pub fn dataset_set_label(names: &[String], manifest: &DatasetManifest) -> String {
    let all = manifest.datasets.keys().cloned().collect::<Vec<String>>();
    if !names.is_empty() && names == all.as_slice() {
        return "all".to_string();
    }
    let mut sorted = names.to_vec();
    sorted.sort();
    sorted
        .join("+")
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '+') {
                ch
            } else {
                '_'
            }
        })
        .collect()
}

/// Millisecond resolution so back-to-back runs get distinct ids.
pub fn run_id_for(ts: DateTime<Utc>) -> String {
    format!("eval-{}", ts.format("%Y%m%dT%H%M%S%3fZ"))
}

/// Picks a snapshot path that no earlier run has used.
pub fn allocate_report_path(
    paths: &EvalPaths,
    set_label: &str,
    ts: DateTime<Utc>,
) -> Result<PathBuf> {
    let stem = format!("eval_{}_{}", set_label, utc_compact_string(ts));
    unique_path(&paths.reports_dir(), &stem)
}

/// Writes the snapshot and repoints the per-set latest file at it.
pub fn persist_report(
    paths: &EvalPaths,
    report: &Report,
    report_path: PathBuf,
    set_label: &str,
) -> Result<PersistedReport> {
    write_json_pretty(&report_path, report)?;

    let latest_path = latest_report_path(paths, set_label);
    let pointer = LatestReportPointer {
        report_path: report_path.display().to_string(),
        run_id: report.metadata.run_id.clone(),
        status: report.status,
        manifest_digest: report.metadata.manifest_digest.clone(),
        updated_at: utc_string(Utc::now()),
    };
    write_json_pretty(&latest_path, &pointer)?;

    info!(
        report = %report_path.display(),
        latest = %latest_path.display(),
        "report persisted"
    );
    Ok(PersistedReport {
        report_path,
        latest_path,
    })
}

pub fn latest_report_path(paths: &EvalPaths, set_label: &str) -> PathBuf {
    paths.reports_dir().join(format!("latest_{set_label}.json"))
}

/// First `<stem>.json` or `<stem>-N.json` under `dir` that does not exist yet.
pub(crate) fn unique_path(dir: &Path, stem: &str) -> Result<PathBuf> {
    let candidate = dir.join(format!("{stem}.json"));
    if !candidate.exists() {
        return Ok(candidate);
    }
    for attempt in 1..1000 {
        let candidate = dir.join(format!("{stem}-{attempt}.json"));
        if !candidate.exists() {
            return Ok(candidate);
        }
    }
    bail!("could not allocate a unique path for {stem} in {}", dir.display())
}

pub fn load_report(path: &Path) -> Result<Report> {
    read_json(path)
}

pub fn load_latest_pointer(path: &Path) -> Result<LatestReportPointer> {
    read_json(path)
}
