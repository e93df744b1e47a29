use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

#[derive(Parser, Debug)]
#[command(
    name = "extraction-eval",
    version,
    about = "Evaluation harness for transcript field extraction engines"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    pub fn verbose(&self) -> bool {
        matches!(&self.command, Commands::Run(args) if args.verbose)
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Evaluate an engine against one or more validated datasets.
    Run(RunArgs),
    /// Manage custom experiment definitions.
    Experiments(ExperimentsArgs),
    /// Diff two persisted reports.
    Compare(CompareArgs),
    /// Regenerate the dataset manifest from datasets/*.jsonl.
    Manifest(ManifestArgs),
    Status(StatusArgs),
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum EngineKind {
    Command,
    Replay,
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    #[arg(long, default_value = ".eval")]
    pub eval_root: PathBuf,

    #[arg(long = "dataset", default_value = "all")]
    pub datasets: Vec<String>,

    #[arg(long = "experiment")]
    pub experiments: Vec<String>,

    #[arg(long, conflicts_with = "compare_production")]
    pub compare: Option<PathBuf>,

    #[arg(long, default_value_t = false)]
    pub compare_production: bool,

    /// Minimum full-strict pass rate, in percent.
    #[arg(long)]
    pub target: Option<f64>,

    #[arg(long, default_value_t = false)]
    pub promote: bool,

    #[arg(long, value_parser = clap::value_parser!(u32).range(2..))]
    pub stability: Option<u32>,

    #[arg(long, default_value_t = false)]
    pub verbose: bool,

    #[arg(long, value_parser = ratio_arg)]
    pub strict_threshold: Option<f64>,

    #[arg(long, value_parser = ratio_arg)]
    pub acceptable_threshold: Option<f64>,

    #[arg(long, value_parser = ratio_arg)]
    pub amount_tolerance: Option<f64>,

    #[arg(long, value_enum, default_value_t = EngineKind::Command)]
    pub engine: EngineKind,

    /// Engine executable for `--engine command`.
    #[arg(long)]
    pub engine_command: Option<PathBuf>,

    #[arg(long = "engine-arg", allow_hyphen_values = true)]
    pub engine_args: Vec<String>,

    /// Recorded outputs for `--engine replay`.
    #[arg(long)]
    pub replay_file: Option<PathBuf>,

    /// Files or directories hashed into the engine fingerprint.
    #[arg(long = "engine-source")]
    pub engine_sources: Vec<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct ExperimentsArgs {
    #[arg(long, default_value = ".eval")]
    pub eval_root: PathBuf,

    #[command(subcommand)]
    pub action: ExperimentAction,
}

#[derive(Subcommand, Debug, Clone)]
pub enum ExperimentAction {
    List,
    Add(AddExperimentArgs),
    Remove(RemoveExperimentArgs),
}

#[derive(Args, Debug, Clone)]
pub struct AddExperimentArgs {
    pub name: String,

    #[arg(long, default_value = "")]
    pub description: String,

    /// Environment override as KEY=VALUE.
    #[arg(long = "env")]
    pub env: Vec<String>,

    /// Config override as KEY=JSON; non-JSON values are stored as strings.
    #[arg(long = "set")]
    pub config: Vec<String>,
}

#[derive(Args, Debug, Clone)]
pub struct RemoveExperimentArgs {
    pub name: String,
}

#[derive(Args, Debug, Clone)]
pub struct CompareArgs {
    pub current: PathBuf,

    pub previous: PathBuf,
}

#[derive(Args, Debug, Clone)]
pub struct ManifestArgs {
    #[arg(long, default_value = ".eval")]
    pub eval_root: PathBuf,

    #[arg(long, default_value_t = false)]
    pub dry_run: bool,
}

#[derive(Args, Debug, Clone)]
pub struct StatusArgs {
    #[arg(long, default_value = ".eval")]
    pub eval_root: PathBuf,
}

fn ratio_arg(value: &str) -> Result<f64, String> {
    crate::harness::scoring::parse_ratio(Some(value))
        .ok_or_else(|| format!("expected a number between 0 and 1, got '{value}'"))
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn run_accepts_repeated_datasets_and_experiments() {
        let cli = Cli::try_parse_from([
            "extraction-eval",
            "run",
            "--dataset",
            "core",
            "--dataset",
            "edge",
            "--experiment",
            "urgency_v2_thresholds",
            "--engine",
            "replay",
            "--replay-file",
            "outputs.jsonl",
            "--stability",
            "3",
        ])
        .expect("parse run");
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.datasets, vec!["core", "edge"]);
        assert_eq!(args.experiments, vec!["urgency_v2_thresholds"]);
        assert_eq!(args.engine, EngineKind::Replay);
        assert_eq!(args.stability, Some(3));
    }

    #[test]
    fn dataset_defaults_to_all() {
        let cli = Cli::try_parse_from([
            "extraction-eval",
            "run",
            "--engine-command",
            "./engine",
        ])
        .expect("parse run");
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.datasets, vec!["all"]);
    }

    #[test]
    fn unknown_flags_and_single_stability_pass_are_rejected() {
        assert!(Cli::try_parse_from(["extraction-eval", "run", "--bogus"]).is_err());
        assert!(
            Cli::try_parse_from([
                "extraction-eval",
                "run",
                "--engine-command",
                "./engine",
                "--stability",
                "1",
            ])
            .is_err()
        );
    }

    #[test]
    fn scoring_ratios_must_lie_between_zero_and_one() {
        let parse = |flag: &str, value: &str| {
            Cli::try_parse_from([
                "extraction-eval",
                "run",
                "--engine-command",
                "./engine",
                flag,
                value,
            ])
        };
        assert!(parse("--strict-threshold", "5").is_err());
        assert!(parse("--amount-tolerance", "-1").is_err());
        assert!(parse("--acceptable-threshold", "NaN").is_err());

        let cli = parse("--acceptable-threshold", "0.6").expect("valid ratio");
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.acceptable_threshold, Some(0.6));
    }

    #[test]
    fn compare_flags_are_mutually_exclusive() {
        let parsed = Cli::try_parse_from([
            "extraction-eval",
            "run",
            "--engine-command",
            "./engine",
            "--compare",
            "a.json",
            "--compare-production",
        ]);
        assert!(parsed.is_err());
    }
}
