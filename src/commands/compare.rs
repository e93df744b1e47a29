use std::io::{self, Write};

use anyhow::{Context, Result};
use tracing::info;

use crate::cli::CompareArgs;
use crate::harness::comparator::{BucketTrend, ReportDiff, compare};
use crate::harness::report::load_report;

pub fn run(args: CompareArgs) -> Result<()> {
    let current = load_report(&args.current)
        .with_context(|| format!("failed to load report {}", args.current.display()))?;

    let Some(diff) = compare(&current, &args.previous)? else {
        return Ok(());
    };

    let strict_delta = diff.aggregate_delta("full_strict_pass_rate").unwrap_or(0.0);
    info!(
        current = %diff.current_run_id,
        previous = %diff.previous_run_id,
        regressed_buckets = diff.regressed_buckets().count(),
        improved_buckets = diff.improved_buckets().count(),
        full_strict_pass_rate_delta = strict_delta,
        "comparison completed"
    );

    let mut output = io::BufWriter::new(io::stdout().lock());
    serde_json::to_writer_pretty(&mut output, &diff)
        .context("failed to serialize comparison json output")?;
    writeln!(output)?;
    output.flush()?;
    Ok(())
}

pub fn write_diff_text(output: &mut impl Write, diff: &ReportDiff) -> Result<()> {
    writeln!(
        output,
        "Comparison: {} vs {}",
        diff.current_run_id, diff.previous_run_id
    )?;
    for delta in &diff.aggregate {
        writeln!(
            output,
            "  {:<34} {:>8.4} -> {:>8.4} ({:+.4})",
            delta.metric, delta.previous, delta.current, delta.delta
        )?;
    }
    for delta in &diff.field_accuracy {
        writeln!(
            output,
            "  accuracy.{:<25} {:>8.4} -> {:>8.4} ({:+.4})",
            delta.metric, delta.previous, delta.current, delta.delta
        )?;
    }
    for bucket in diff
        .buckets
        .iter()
        .filter(|bucket| bucket.trend != BucketTrend::Unchanged)
    {
        let label = match bucket.trend {
            BucketTrend::Improved => "improved",
            BucketTrend::Regressed => "REGRESSED",
            BucketTrend::Unchanged => "unchanged",
        };
        writeln!(
            output,
            "  bucket {:<34} {:>4} -> {:>4} {}",
            bucket.bucket.as_str(),
            bucket.previous,
            bucket.current,
            label
        )?;
    }
    for dataset in &diff.datasets {
        writeln!(
            output,
            "  dataset {:<20} strict pass {:>8.4} -> {:>8.4} ({:+.4})",
            dataset.dataset,
            dataset.full_strict_pass_rate.previous,
            dataset.full_strict_pass_rate.current,
            dataset.full_strict_pass_rate.delta
        )?;
    }
    Ok(())
}
