use std::io::{self, Write};

use anyhow::{Context, Result};
use tracing::info;

use crate::cli::{EngineKind, RunArgs};
use crate::commands::compare::write_diff_text;
use crate::harness::EvalPaths;
use crate::harness::engine::{CommandEngine, EngineConfig, ExtractionEngine, ReplayEngine};
use crate::harness::experiment_store::ExperimentStore;
use crate::harness::orchestrator::{Baseline, Orchestrator, RunOptions, RunOutcome};
use crate::harness::report::Report;
use crate::harness::scoring::ScoringConfig;

pub fn run(args: RunArgs) -> Result<()> {
    let paths = EvalPaths::new(&args.eval_root);
    let engine = build_engine(&args)?;
    let store = ExperimentStore::open_existing(&paths.experiment_store_path())?;

    let options = RunOptions {
        datasets: args.datasets.clone(),
        experiments: args.experiments.clone(),
        scoring: ScoringConfig::resolve(
            args.strict_threshold,
            args.acceptable_threshold,
            args.amount_tolerance,
        ),
        target_percent: args.target,
        stability_runs: args.stability.map(|runs| runs as usize),
        baseline: match (&args.compare, args.compare_production) {
            (Some(path), _) => Some(Baseline::Report(path.clone())),
            (None, true) => Some(Baseline::Production),
            (None, false) => None,
        },
        promote: args.promote,
        fingerprint_sources: args.engine_sources.clone(),
    };

    info!(
        engine = %engine.describe(),
        datasets = %options.datasets.join(","),
        experiments = %options.experiments.join(","),
        strict_threshold = options.scoring.strict_threshold,
        acceptable_threshold = options.scoring.acceptable_threshold,
        amount_tolerance = options.scoring.amount_tolerance,
        "evaluation requested"
    );

    let orchestrator = Orchestrator::new(
        &paths,
        engine.as_ref(),
        store.as_ref(),
        EngineConfig::inherit_process_env(),
    );
    let outcome = orchestrator.run(&options)?;

    let mut output = io::BufWriter::new(io::stdout().lock());
    write_summary(&mut output, &outcome, args.verbose)?;
    output.flush()?;

    outcome.into_result().map(|_| ())
}

fn build_engine(args: &RunArgs) -> Result<Box<dyn ExtractionEngine>> {
    match args.engine {
        EngineKind::Command => {
            let program = args
                .engine_command
                .clone()
                .context("--engine-command is required with --engine command")?;
            Ok(Box::new(CommandEngine::new(program, args.engine_args.clone())))
        }
        EngineKind::Replay => {
            let path = args
                .replay_file
                .as_deref()
                .context("--replay-file is required with --engine replay")?;
            Ok(Box::new(ReplayEngine::load(path)?))
        }
    }
}

fn write_summary(output: &mut impl Write, outcome: &RunOutcome, verbose: bool) -> Result<()> {
    let report = &outcome.report;
    let metadata = &report.metadata;

    writeln!(output, "Run: {} ({})", metadata.run_id, report.status.as_str())?;
    writeln!(output, "Engine: {}", metadata.engine)?;
    writeln!(output, "Fingerprint: {}", metadata.engine_fingerprint)?;
    if !metadata.active_experiments.is_empty() {
        writeln!(output, "Experiments: {}", metadata.active_experiments.join(", "))?;
    }
    writeln!(
        output,
        "Cases: {} evaluated, {} skipped",
        metadata.case_count, metadata.skipped_case_count
    )?;
    for (metric, value) in report.aggregate.named_metrics() {
        writeln!(output, "  {metric:<34} {value:>8.4}")?;
    }
    if let Some(target) = metadata.target_percent {
        writeln!(
            output,
            "Target: {:.2}% strict pass, actual {:.2}%",
            target,
            report.aggregate.strict_pass_percent()
        )?;
    }

    write_datasets(output, report)?;

    if !report.failure_buckets.is_empty() {
        writeln!(output, "Failure buckets:")?;
        for bucket in &report.failure_buckets {
            writeln!(
                output,
                "  {:<34} {:>4}  [{:?}] {}",
                bucket.key.as_str(),
                bucket.count,
                bucket.severity,
                bucket.description
            )?;
        }
    }

    if let Some(stability) = &report.stability {
        writeln!(
            output,
            "Stability: {} over {} runs",
            stability.verdict.as_str(),
            stability.runs
        )?;
        for series in &stability.metrics {
            writeln!(
                output,
                "  {:<34} variance {:.6}",
                series.metric, series.variance
            )?;
        }
    }

    if verbose {
        for case in &report.cases {
            let buckets = case
                .buckets
                .iter()
                .map(|bucket| bucket.as_str())
                .collect::<Vec<&str>>()
                .join(",");
            writeln!(
                output,
                "  case {}/{} strict={:.2} structural={:.2} {}",
                case.dataset,
                case.case_id,
                case.scoring.full_strict_score,
                case.scoring.structural_score,
                buckets
            )?;
        }
        for skipped in &report.skipped_cases {
            writeln!(output, "  skipped {}: {}", skipped.dataset, skipped.reason)?;
        }
    }

    if let Some(diff) = &outcome.diff {
        write_diff_text(output, diff)?;
    }
    writeln!(output, "Report: {}", outcome.persisted.report_path.display())?;
    writeln!(output, "Latest: {}", outcome.persisted.latest_path.display())?;
    if let Some(path) = &outcome.diff_path {
        writeln!(output, "Comparison: {}", path.display())?;
    }
    if let Some(path) = &outcome.promotion_path {
        writeln!(output, "Promotion: {}", path.display())?;
    }
    Ok(())
}

fn write_datasets(output: &mut impl Write, report: &Report) -> Result<()> {
    if report.datasets.len() < 2 {
        return Ok(());
    }
    writeln!(output, "Datasets:")?;
    for dataset in &report.datasets {
        writeln!(
            output,
            "  {:<20} cases={:<5} skipped={:<4} strict_pass={:.4} structural={:.4}",
            dataset.name,
            dataset.case_count,
            dataset.skipped_case_count,
            dataset.aggregate.full_strict_pass_rate,
            dataset.aggregate.structural_mean
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::harness::fixtures::sample_report;
    use crate::harness::report::PersistedReport;

    fn args(engine: EngineKind) -> RunArgs {
        RunArgs {
            eval_root: PathBuf::from(".eval"),
            datasets: vec!["all".to_string()],
            experiments: Vec::new(),
            compare: None,
            compare_production: false,
            target: None,
            promote: false,
            stability: None,
            verbose: false,
            strict_threshold: None,
            acceptable_threshold: None,
            amount_tolerance: None,
            engine,
            engine_command: None,
            engine_args: Vec::new(),
            replay_file: None,
            engine_sources: Vec::new(),
        }
    }

    #[test]
    fn engine_selection_requires_its_input() {
        let err = build_engine(&args(EngineKind::Command)).err().expect("missing command");
        assert!(err.to_string().contains("--engine-command"));
        let err = build_engine(&args(EngineKind::Replay)).err().expect("missing replay");
        assert!(err.to_string().contains("--replay-file"));

        let mut command = args(EngineKind::Command);
        command.engine_command = Some(PathBuf::from("/bin/cat"));
        command.engine_args = vec!["-u".to_string()];
        let engine = build_engine(&command).expect("command engine");
        assert_eq!(engine.describe(), "/bin/cat -u");
    }

    #[test]
    fn summary_reports_status_and_artifacts() {
        let outcome = RunOutcome {
            report: sample_report("digest-a"),
            persisted: PersistedReport {
                report_path: PathBuf::from("reports/eval_core.json"),
                latest_path: PathBuf::from("reports/latest_core.json"),
            },
            diff: None,
            diff_path: None,
            promotion_path: Some(PathBuf::from("promotions/promotion_x.json")),
            gate_failure: None,
        };
        let mut buffer = Vec::new();
        write_summary(&mut buffer, &outcome, true).expect("render");
        let text = String::from_utf8(buffer).expect("utf8");
        assert!(text.contains("(passed)"));
        assert!(text.contains("full_strict_pass_rate"));
        assert!(text.contains("Report: reports/eval_core.json"));
        assert!(text.contains("Latest: reports/latest_core.json"));
        assert!(text.contains("Promotion: promotions/promotion_x.json"));
    }
}
