use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{debug, info, warn};

use crate::errors::EvalError;
use crate::harness::EvalPaths;
use crate::harness::buckets::{BucketKey, BucketSummary, ClassificationContext, FailureClassifier};
use crate::harness::comparator::{ReportDiff, compare, persist_diff};
use crate::harness::dataset::{LoadedDataset, load_dataset};
use crate::harness::engine::{CaseMetadata, EngineConfig, ExtractionEngine};
use crate::harness::experiment_store::ExperimentStore;
use crate::harness::experiments::{ExperimentEngine, compute_engine_fingerprint};
use crate::harness::integrity::IntegrityValidator;
use crate::harness::metrics::{FieldMetricsCollector, FieldMetricsReport};
use crate::harness::pii::PiiScanner;
use crate::harness::promotion::{production_report_path, promote};
use crate::harness::report::{
    CaseRecord, DatasetBreakdown, PersistedReport, REPORT_VERSION, Report, ReportMetadata,
    RunStatus, SkippedCase, allocate_report_path, dataset_set_label, persist_report, run_id_for,
};
use crate::harness::scoring::{AggregateScores, ScoringConfig, aggregate_scores, score};
use crate::harness::stability::{StabilityReport, analyze};
use crate::model::TestCase;
use crate::util::utc_string;

#[derive(Debug, Clone)]
pub enum Baseline {
    Report(PathBuf),
    Production,
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub datasets: Vec<String>,
    pub experiments: Vec<String>,
    pub scoring: ScoringConfig,
    pub target_percent: Option<f64>,
    pub stability_runs: Option<usize>,
    pub baseline: Option<Baseline>,
    pub promote: bool,
    pub fingerprint_sources: Vec<PathBuf>,
}

#[derive(Debug)]
pub struct RunOutcome {
    pub report: Report,
    pub persisted: PersistedReport,
    pub diff: Option<ReportDiff>,
    pub diff_path: Option<PathBuf>,
    pub promotion_path: Option<PathBuf>,
    pub gate_failure: Option<EvalError>,
}

impl RunOutcome {
    /// Surfaces a post-run gate failure once all artifacts are on disk.
    pub fn into_result(self) -> Result<Self> {
        match self.gate_failure {
            Some(err) => Err(err.into()),
            None => Ok(self),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Validating,
    ExperimentSetup,
    Evaluating,
    Aggregating,
    Reporting,
    Deactivating,
}

impl Phase {
    fn as_str(self) -> &'static str {
        match self {
            Self::Validating => "validating",
            Self::ExperimentSetup => "experiment_setup",
            Self::Evaluating => "evaluating",
            Self::Aggregating => "aggregating",
            Self::Reporting => "reporting",
            Self::Deactivating => "deactivating",
        }
    }
}

struct PassResult {
    aggregate: AggregateScores,
    field_metrics: FieldMetricsReport,
    failure_buckets: Vec<BucketSummary>,
    datasets: Vec<DatasetBreakdown>,
    cases: Vec<CaseRecord>,
    skipped: Vec<SkippedCase>,
}

/// Drives one evaluation run end to end. Cases are evaluated strictly in
/// order, one engine call at a time.
pub struct Orchestrator<'a> {
    paths: &'a EvalPaths,
    engine: &'a dyn ExtractionEngine,
    store: Option<&'a ExperimentStore>,
    base_config: EngineConfig,
}

impl<'a> Orchestrator<'a> {
    pub fn new(
        paths: &'a EvalPaths,
        engine: &'a dyn ExtractionEngine,
        store: Option<&'a ExperimentStore>,
        base_config: EngineConfig,
    ) -> Self {
        Self {
            paths,
            engine,
            store,
            base_config,
        }
    }

    pub fn run(&self, options: &RunOptions) -> Result<RunOutcome> {
        let started = Instant::now();
        let started_at = Utc::now();
        let run_id = run_id_for(started_at);

        enter(Phase::Validating, &run_id);
        let validated = IntegrityValidator::new(self.paths).validate(&options.datasets)?;
        let datasets = validated
            .names
            .iter()
            .map(|name| {
                let entry = validated
                    .manifest
                    .datasets
                    .get(name)
                    .with_context(|| format!("dataset {name} vanished from manifest"))?;
                load_dataset(name, &self.paths.dataset_path(&entry.file))
            })
            .collect::<Result<Vec<LoadedDataset>>>()?;

        enter(Phase::ExperimentSetup, &run_id);
        let sources = options
            .fingerprint_sources
            .iter()
            .cloned()
            .chain(self.engine.source_inputs())
            .collect::<Vec<PathBuf>>();
        let fingerprint = compute_engine_fingerprint(&self.engine.describe(), &sources)?;
        let mut config = self.base_config.clone();
        let experiments = ExperimentEngine::new(self.store);
        let mut session = experiments.activate(&options.experiments, &mut config)?;
        let active_experiments = session.active().to_vec();

        let passes = options.stability_runs.unwrap_or(1).max(1);
        let mut classifier = FailureClassifier::new()?;
        let mut first_pass = None;
        let mut pass_aggregates = Vec::with_capacity(passes);
        for pass in 1..=passes {
            enter(Phase::Evaluating, &run_id);
            classifier.reset();
            let result =
                self.evaluate_pass(&datasets, session.config(), options, &mut classifier);
            debug!(
                pass,
                passes,
                strict_pass_percent = result.aggregate.strict_pass_percent(),
                bucketed_failures = classifier.total_entries(),
                "evaluation pass finished"
            );
            pass_aggregates.push(result.aggregate);
            if first_pass.is_none() {
                first_pass = Some(result);
            }
        }

        enter(Phase::Aggregating, &run_id);
        let pass = first_pass.context("evaluation produced no passes")?;
        let stability = options.stability_runs.map(|_| analyze(&pass_aggregates));

        let target_met = options
            .target_percent
            .map(|target| pass.aggregate.strict_pass_percent() >= target);
        let mut gate_failure = gate_failure_for(&pass.aggregate, options, stability.as_ref());
        let status = if gate_failure.is_some() {
            RunStatus::Failed
        } else {
            RunStatus::Passed
        };

        enter(Phase::Reporting, &run_id);
        let completed_at = Utc::now();
        let mut report = Report {
            report_version: REPORT_VERSION,
            status,
            metadata: ReportMetadata {
                run_id: run_id.clone(),
                engine: self.engine.describe(),
                engine_fingerprint: fingerprint,
                manifest_digest: validated.manifest.manifest_digest.clone(),
                active_experiments,
                datasets: validated.names.clone(),
                started_at: utc_string(started_at),
                completed_at: utc_string(completed_at),
                duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
                case_count: pass.aggregate.case_count,
                skipped_case_count: pass.skipped.len(),
                scoring: options.scoring,
                target_percent: options.target_percent,
                target_met,
            },
            aggregate: pass.aggregate,
            field_metrics: pass.field_metrics,
            failure_buckets: pass.failure_buckets,
            datasets: pass.datasets,
            cases: pass.cases,
            skipped_cases: pass.skipped,
            stability,
        };

        let set_label = dataset_set_label(&validated.names, &validated.manifest);
        let report_path = allocate_report_path(self.paths, &set_label, completed_at)?;

        // Scanned before writing; snapshots are never rewritten.
        let rendered = serde_json::to_string_pretty(&report)
            .context("failed to render report for PII scan")?;
        if let Err(err) = PiiScanner::new()?.enforce_clean(&report_path, &rendered) {
            report.status = RunStatus::Failed;
            gate_failure.get_or_insert(err.downcast::<EvalError>()?);
        }
        let persisted = persist_report(self.paths, &report, report_path, &set_label)?;

        let (diff, diff_path) = match &options.baseline {
            Some(baseline) => {
                let baseline_path = match baseline {
                    Baseline::Report(path) => path.clone(),
                    Baseline::Production => production_report_path(self.paths)?,
                };
                match compare(&report, &baseline_path)? {
                    Some(diff) => {
                        let path = persist_diff(self.paths, &diff, completed_at)?;
                        (Some(diff), Some(path))
                    }
                    None => (None, None),
                }
            }
            None => (None, None),
        };

        let promotion_path = if options.promote {
            if report.status == RunStatus::Passed {
                Some(promote(self.paths, &report, &persisted.report_path, completed_at)?)
            } else {
                warn!(run_id = %run_id, "promotion skipped: run did not pass");
                None
            }
        } else {
            None
        };

        enter(Phase::Deactivating, &run_id);
        session.deactivate();

        info!(
            run_id = %run_id,
            status = report.status.as_str(),
            cases = report.metadata.case_count,
            skipped = report.metadata.skipped_case_count,
            strict_pass_percent = report.aggregate.strict_pass_percent(),
            report = %persisted.report_path.display(),
            "evaluation run finished"
        );

        Ok(RunOutcome {
            report,
            persisted,
            diff,
            diff_path,
            promotion_path,
            gate_failure,
        })
    }

    fn evaluate_pass(
        &self,
        datasets: &[LoadedDataset],
        config: &EngineConfig,
        options: &RunOptions,
        classifier: &mut FailureClassifier,
    ) -> PassResult {
        let mut run_metrics = FieldMetricsCollector::new();
        let mut breakdowns = Vec::with_capacity(datasets.len());
        let mut cases = Vec::new();
        let mut skipped = Vec::new();

        for dataset in datasets {
            let mut dataset_metrics = FieldMetricsCollector::new();
            let mut dataset_cases = Vec::with_capacity(dataset.cases.len());
            let mut dataset_skipped = 0usize;

            for record in &dataset.malformed {
                let err = EvalError::CaseEvaluation {
                    dataset: dataset.name.clone(),
                    case_id: record
                        .case_id
                        .clone()
                        .unwrap_or_else(|| format!("line {}", record.line_number)),
                    details: record.error.clone(),
                };
                warn!(code = err.code(), error = %err, "case skipped");
                skipped.push(SkippedCase {
                    dataset: dataset.name.clone(),
                    case_id: record.case_id.clone(),
                    reason: err.to_string(),
                });
                dataset_skipped += 1;
            }

            for case in &dataset.cases {
                match self.evaluate_case(&dataset.name, case, config, &options.scoring, classifier)
                {
                    Ok(record) => {
                        run_metrics.record(
                            &record.actual,
                            &record.expected,
                            &record.scoring.field_matches,
                        );
                        dataset_metrics.record(
                            &record.actual,
                            &record.expected,
                            &record.scoring.field_matches,
                        );
                        dataset_cases.push(record);
                    }
                    Err(err) => {
                        let err = EvalError::CaseEvaluation {
                            dataset: dataset.name.clone(),
                            case_id: case.id.clone(),
                            details: format!("{err:#}"),
                        };
                        warn!(code = err.code(), error = %err, "case skipped");
                        skipped.push(SkippedCase {
                            dataset: dataset.name.clone(),
                            case_id: Some(case.id.clone()),
                            reason: err.to_string(),
                        });
                        dataset_skipped += 1;
                    }
                }
            }

            breakdowns.push(DatasetBreakdown {
                name: dataset.name.clone(),
                case_count: dataset_cases.len(),
                skipped_case_count: dataset_skipped,
                aggregate: aggregate_scores(dataset_cases.iter().map(|case| &case.scoring)),
                field_accuracy: dataset_metrics.report().accuracy_map(),
            });
            cases.extend(dataset_cases);
        }

        PassResult {
            aggregate: aggregate_scores(cases.iter().map(|case| &case.scoring)),
            field_metrics: run_metrics.report(),
            failure_buckets: classifier.summary(),
            datasets: breakdowns,
            cases,
            skipped,
        }
    }

    fn evaluate_case(
        &self,
        dataset: &str,
        case: &TestCase,
        config: &EngineConfig,
        scoring: &ScoringConfig,
        classifier: &mut FailureClassifier,
    ) -> Result<CaseRecord> {
        let metadata = CaseMetadata {
            case_id: &case.id,
            dataset,
            notes: case.notes.as_deref(),
        };
        let actual = self.engine.extract(&case.transcript, &metadata, config)?;
        let result = score(&actual, &case.expected, &case.strictness, scoring);

        let ctx = ClassificationContext {
            case_id: &case.id,
            actual: &actual,
            expected: &case.expected,
            transcript: &case.transcript,
            notes: case.notes.as_deref(),
        };
        let buckets = result
            .field_matches
            .failed_fields()
            .into_iter()
            .map(|field| classifier.classify(field, &ctx))
            .collect::<Vec<BucketKey>>();

        debug!(
            dataset,
            case_id = %case.id,
            full_strict_score = result.full_strict_score,
            failed_fields = buckets.len(),
            "case scored"
        );

        Ok(CaseRecord {
            dataset: dataset.to_string(),
            case_id: case.id.clone(),
            actual,
            expected: case.expected.clone(),
            scoring: result,
            buckets,
        })
    }
}

fn enter(phase: Phase, run_id: &str) {
    debug!(run_id, phase = phase.as_str(), "run phase");
}

fn gate_failure_for(
    aggregate: &AggregateScores,
    options: &RunOptions,
    stability: Option<&StabilityReport>,
) -> Option<EvalError> {
    if let Some(target) = options.target_percent {
        let actual = aggregate.strict_pass_percent();
        if actual < target {
            return Some(EvalError::TargetMissed {
                actual_percent: actual,
                target_percent: target,
            });
        }
    }
    if let Some(stability) = stability
        && let Err(err) = stability.ensure_deterministic()
    {
        return err.downcast::<EvalError>().ok();
    }
    None
}
