use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::harness::EvalPaths;
use crate::harness::report::{Report, RunStatus, unique_path};
use crate::harness::scoring::AggregateScores;
use crate::util::{read_json, utc_compact_string, utc_string, write_json_pretty};

/// Summary of a report that was promoted to the production baseline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Promotion {
    pub promoted_at: String,
    pub run_id: String,
    pub report_path: String,
    pub manifest_digest: String,
    pub engine_fingerprint: String,
    pub active_experiments: Vec<String>,
    pub datasets: Vec<String>,
    pub aggregate: AggregateScores,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductionPointer {
    pub promotion_path: String,
    pub report_path: String,
    pub run_id: String,
    pub promoted_at: String,
}

pub fn promote(
    paths: &EvalPaths,
    report: &Report,
    report_path: &Path,
    ts: DateTime<Utc>,
) -> Result<PathBuf> {
    if report.status != RunStatus::Passed {
        bail!(
            "refusing to promote run {} with status {}",
            report.metadata.run_id,
            report.status.as_str()
        );
    }

    let promoted_at = utc_string(ts);
    let promotion = Promotion {
        promoted_at: promoted_at.clone(),
        run_id: report.metadata.run_id.clone(),
        report_path: report_path.display().to_string(),
        manifest_digest: report.metadata.manifest_digest.clone(),
        engine_fingerprint: report.metadata.engine_fingerprint.clone(),
        active_experiments: report.metadata.active_experiments.clone(),
        datasets: report.metadata.datasets.clone(),
        aggregate: report.aggregate,
    };
    let promotion_path = unique_path(
        &paths.promotions_dir(),
        &format!("promotion_{}", utc_compact_string(ts)),
    )?;
    write_json_pretty(&promotion_path, &promotion)?;

    let pointer = ProductionPointer {
        promotion_path: promotion_path.display().to_string(),
        report_path: promotion.report_path.clone(),
        run_id: promotion.run_id.clone(),
        promoted_at,
    };
    write_json_pretty(&paths.latest_production_path(), &pointer)?;

    info!(
        run_id = %promotion.run_id,
        promotion = %promotion_path.display(),
        "report promoted to production baseline"
    );
    Ok(promotion_path)
}

pub fn latest_production(paths: &EvalPaths) -> Result<Option<ProductionPointer>> {
    let path = paths.latest_production_path();
    if !path.exists() {
        return Ok(None);
    }
    read_json(&path).map(Some)
}

pub fn production_report_path(paths: &EvalPaths) -> Result<PathBuf> {
    let pointer = latest_production(paths)?.with_context(|| {
        format!(
            "no production baseline promoted yet ({} missing)",
            paths.latest_production_path().display()
        )
    })?;
    Ok(PathBuf::from(pointer.report_path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harness::fixtures::sample_report;

    #[test]
    fn promotion_writes_snapshot_and_repoints_production() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = EvalPaths::new(dir.path());
        assert!(latest_production(&paths).expect("lookup").is_none());
        assert!(production_report_path(&paths).is_err());

        let report = sample_report("digest-a");
        let report_path = paths.reports_dir().join("eval_core_20261018T120000Z.json");
        let promotion_path = promote(&paths, &report, &report_path, Utc::now()).expect("promote");

        let promotion: Promotion = read_json(&promotion_path).expect("promotion snapshot");
        assert_eq!(promotion.manifest_digest, "digest-a");
        assert_eq!(promotion.aggregate, report.aggregate);
        assert_eq!(
            production_report_path(&paths).expect("production path"),
            report_path
        );
    }

    #[test]
    fn promotions_in_the_same_second_keep_separate_snapshots() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = EvalPaths::new(dir.path());
        let ts = "2026-10-18T12:00:00Z".parse::<DateTime<Utc>>().expect("timestamp");

        let mut first = sample_report("digest-a");
        first.metadata.run_id = "run-one".to_string();
        let mut second = sample_report("digest-a");
        second.metadata.run_id = "run-two".to_string();

        let first_path =
            promote(&paths, &first, Path::new("one.json"), ts).expect("first promotion");
        let second_path =
            promote(&paths, &second, Path::new("two.json"), ts).expect("second promotion");
        assert_ne!(first_path, second_path);
        assert_eq!(
            second_path,
            paths.promotions_dir().join("promotion_20261018T120000Z-1.json")
        );

        let reread: Promotion = read_json(&first_path).expect("first snapshot");
        assert_eq!(reread.run_id, "run-one");
        let pointer = latest_production(&paths).expect("lookup").expect("pointer");
        assert_eq!(pointer.run_id, "run-two");
        assert_eq!(pointer.promotion_path, second_path.display().to_string());
    }

    #[test]
    fn failed_runs_are_never_promoted() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = EvalPaths::new(dir.path());
        let mut report = sample_report("digest-a");
        report.status = RunStatus::Failed;

        let err = promote(&paths, &report, Path::new("r.json"), Utc::now())
            .expect_err("failed run must not promote");
        assert!(err.to_string().contains("status failed"));
        assert!(!paths.latest_production_path().exists());
    }
}
