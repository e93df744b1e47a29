use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::harness::EvalPaths;
use crate::harness::buckets::BucketKey;
use crate::harness::report::{Report, load_report, unique_path};
use crate::model::Field;
use crate::util::{utc_compact_string, write_json_pretty};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricDelta {
    pub metric: String,
    pub previous: f64,
    pub current: f64,
    pub delta: f64,
}

impl MetricDelta {
    fn new(metric: impl Into<String>, previous: f64, current: f64) -> Self {
        Self {
            metric: metric.into(),
            previous,
            current,
            delta: current - previous,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BucketTrend {
    Improved,
    Regressed,
    Unchanged,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketDelta {
    pub bucket: BucketKey,
    pub previous: usize,
    pub current: usize,
    pub delta: i64,
    pub trend: BucketTrend,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetDelta {
    pub dataset: String,
    pub full_strict_mean: MetricDelta,
    pub full_strict_pass_rate: MetricDelta,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportDiff {
    pub current_run_id: String,
    pub previous_run_id: String,
    pub manifest_digest: String,
    pub aggregate: Vec<MetricDelta>,
    pub field_accuracy: Vec<MetricDelta>,
    pub buckets: Vec<BucketDelta>,
    pub datasets: Vec<DatasetDelta>,
}

impl ReportDiff {
    pub fn regressed_buckets(&self) -> impl Iterator<Item = &BucketDelta> {
        self.buckets
            .iter()
            .filter(|bucket| bucket.trend == BucketTrend::Regressed)
    }

    pub fn improved_buckets(&self) -> impl Iterator<Item = &BucketDelta> {
        self.buckets
            .iter()
            .filter(|bucket| bucket.trend == BucketTrend::Improved)
    }

    pub fn aggregate_delta(&self, metric: &str) -> Option<f64> {
        self.aggregate
            .iter()
            .find(|delta| delta.metric == metric)
            .map(|delta| delta.delta)
    }
}

/// Loads the previous report and diffs it against `current`. Neither report
/// file is modified. `None` means the comparison was refused.
pub fn compare(current: &Report, previous_path: &Path) -> Result<Option<ReportDiff>> {
    let previous = load_report(previous_path)
        .with_context(|| format!("failed to load baseline report {}", previous_path.display()))?;
    let diff = compare_reports(current, &previous);
    if diff.is_none() {
        warn!(
            current_digest = %current.metadata.manifest_digest,
            previous_digest = %previous.metadata.manifest_digest,
            previous = %previous_path.display(),
            "comparison refused: reports were produced from different dataset manifests"
        );
    }
    Ok(diff)
}

/// Pure diff of two reports. Refuses when the manifest digests differ.
pub fn compare_reports(current: &Report, previous: &Report) -> Option<ReportDiff> {
    if current.metadata.manifest_digest != previous.metadata.manifest_digest {
        return None;
    }

    let aggregate = current
        .aggregate
        .named_metrics()
        .into_iter()
        .zip(previous.aggregate.named_metrics())
        .map(|((metric, now), (_, before))| MetricDelta::new(metric, before, now))
        .collect();

    let field_accuracy = Field::ALL
        .iter()
        .map(|field| {
            MetricDelta::new(
                field.as_str(),
                previous.field_metrics.accuracy(*field).unwrap_or(0.0),
                current.field_metrics.accuracy(*field).unwrap_or(0.0),
            )
        })
        .collect();

    let current_buckets = current.bucket_counts();
    let previous_buckets = previous.bucket_counts();
    let keys = current_buckets
        .keys()
        .chain(previous_buckets.keys())
        .copied()
        .collect::<BTreeSet<BucketKey>>();
    let buckets = keys
        .into_iter()
        .map(|bucket| {
            let now = current_buckets.get(&bucket).copied().unwrap_or(0);
            let before = previous_buckets.get(&bucket).copied().unwrap_or(0);
            let delta = now as i64 - before as i64;
            BucketDelta {
                bucket,
                previous: before,
                current: now,
                delta,
                trend: match delta {
                    d if d < 0 => BucketTrend::Improved,
                    d if d > 0 => BucketTrend::Regressed,
                    _ => BucketTrend::Unchanged,
                },
            }
        })
        .collect();

    let datasets = current
        .datasets
        .iter()
        .filter_map(|now| {
            let before = previous.dataset(&now.name)?;
            Some(DatasetDelta {
                dataset: now.name.clone(),
                full_strict_mean: MetricDelta::new(
                    "full_strict_mean",
                    before.aggregate.full_strict_mean,
                    now.aggregate.full_strict_mean,
                ),
                full_strict_pass_rate: MetricDelta::new(
                    "full_strict_pass_rate",
                    before.aggregate.full_strict_pass_rate,
                    now.aggregate.full_strict_pass_rate,
                ),
            })
        })
        .collect();

    Some(ReportDiff {
        current_run_id: current.metadata.run_id.clone(),
        previous_run_id: previous.metadata.run_id.clone(),
        manifest_digest: current.metadata.manifest_digest.clone(),
        aggregate,
        field_accuracy,
        buckets,
        datasets,
    })
}

pub fn persist_diff(paths: &EvalPaths, diff: &ReportDiff, ts: DateTime<Utc>) -> Result<PathBuf> {
    let path = unique_path(
        &paths.reports_dir(),
        &format!("diff_{}", utc_compact_string(ts)),
    )?;
    write_json_pretty(&path, diff)?;
    info!(
        path = %path.display(),
        current = %diff.current_run_id,
        previous = %diff.previous_run_id,
        "comparison written"
    );
    Ok(path)
}
