use std::cell::Cell;
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use anyhow::Result;

use crate::commands::manifest::build_manifest;
use crate::harness::EvalPaths;
use crate::harness::engine::{CaseMetadata, EngineConfig, ExtractionEngine};
use crate::harness::metrics::FieldMetricsReport;
use crate::harness::report::{DatasetBreakdown, REPORT_VERSION, Report, ReportMetadata, RunStatus};
use crate::harness::scoring::{AggregateScores, ScoringConfig};
use crate::model::{ActualFields, DatasetManifest, FieldSet, Strictness, TestCase};
use crate::util::write_json_pretty;

pub(crate) fn fields(
    name: Option<&str>,
    category: Option<&str>,
    urgency: Option<&str>,
    amount: Option<f64>,
) -> FieldSet {
    FieldSet {
        name: name.map(str::to_string),
        category: category.map(str::to_string),
        urgency_level: urgency.map(str::to_string),
        goal_amount: amount,
    }
}

pub(crate) fn case_line(id: &str, transcript: &str, expected: FieldSet) -> String {
    serde_json::to_string(&TestCase {
        id: id.to_string(),
        transcript: transcript.to_string(),
        expected,
        strictness: Strictness::default(),
        notes: None,
    })
    .expect("serialize case")
}

pub(crate) fn write_dataset(paths: &EvalPaths, name: &str, lines: &[&str]) -> PathBuf {
    let path = paths.dataset_path(&format!("{name}.jsonl"));
    fs::create_dir_all(paths.datasets_dir()).expect("create datasets dir");
    let mut body = lines.join("\n");
    body.push('\n');
    fs::write(&path, body).expect("write dataset");
    path
}

pub(crate) fn write_manifest_for(paths: &EvalPaths) -> DatasetManifest {
    let manifest = build_manifest(&paths.datasets_dir()).expect("build manifest");
    write_json_pretty(&paths.manifest_path(), &manifest).expect("write manifest");
    manifest
}

pub(crate) fn sample_aggregate() -> AggregateScores {
    AggregateScores {
        case_count: 4,
        structural_mean: 0.9166666666666666,
        full_strict_mean: 0.8125,
        urgency_accuracy: 0.75,
        structural_strict_pass_rate: 0.75,
        structural_acceptable_pass_rate: 1.0,
        full_strict_pass_rate: 0.25,
        full_acceptable_pass_rate: 1.0,
    }
}

pub(crate) fn sample_report(manifest_digest: &str) -> Report {
    let aggregate = sample_aggregate();
    Report {
        report_version: REPORT_VERSION,
        status: RunStatus::Passed,
        metadata: ReportMetadata {
            run_id: "eval-20261018T120000Z".to_string(),
            engine: "replay:<memory>".to_string(),
            engine_fingerprint: "f".repeat(64),
            manifest_digest: manifest_digest.to_string(),
            active_experiments: Vec::new(),
            datasets: vec!["core".to_string()],
            started_at: "2026-10-18T12:00:00.000Z".to_string(),
            completed_at: "2026-10-18T12:00:01.000Z".to_string(),
            duration_ms: 1000,
            case_count: aggregate.case_count,
            skipped_case_count: 0,
            scoring: ScoringConfig::default(),
            target_percent: None,
            target_met: None,
        },
        aggregate,
        field_metrics: FieldMetricsReport::default(),
        failure_buckets: Vec::new(),
        datasets: vec![DatasetBreakdown {
            name: "core".to_string(),
            case_count: aggregate.case_count,
            skipped_case_count: 0,
            aggregate,
            field_accuracy: BTreeMap::new(),
        }],
        cases: Vec::new(),
        skipped_cases: Vec::new(),
        stability: None,
    }
}

/// Deliberately stateful engine: after `stable_calls` calls it stops
/// reporting urgency.
pub(crate) struct FlakyEngine<E> {
    inner: E,
    stable_calls: usize,
    calls: Cell<usize>,
}

impl<E> FlakyEngine<E> {
    pub(crate) fn new(inner: E, stable_calls: usize) -> Self {
        Self {
            inner,
            stable_calls,
            calls: Cell::new(0),
        }
    }
}

impl<E: ExtractionEngine> ExtractionEngine for FlakyEngine<E> {
    fn describe(&self) -> String {
        format!("flaky:{}", self.inner.describe())
    }

    fn extract(
        &self,
        transcript: &str,
        case: &CaseMetadata<'_>,
        config: &EngineConfig,
    ) -> Result<ActualFields> {
        let call = self.calls.get();
        self.calls.set(call + 1);
        let mut fields = self.inner.extract(transcript, case, config)?;
        if call >= self.stable_calls {
            fields.urgency_level = None;
        }
        Ok(fields)
    }
}
