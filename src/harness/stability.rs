use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::errors::EvalError;
use crate::harness::scoring::AggregateScores;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StabilityVerdict {
    Deterministic,
    NonDeterministic,
}

impl StabilityVerdict {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Deterministic => "DETERMINISTIC",
            Self::NonDeterministic => "NON_DETERMINISTIC",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSeries {
    pub metric: String,
    pub values: Vec<f64>,
    pub mean: f64,
    pub variance: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StabilityReport {
    pub runs: usize,
    pub metrics: Vec<MetricSeries>,
    pub verdict: StabilityVerdict,
}

impl StabilityReport {
    pub fn is_deterministic(&self) -> bool {
        self.verdict == StabilityVerdict::Deterministic
    }

    pub fn unstable_metrics(&self) -> Vec<&MetricSeries> {
        self.metrics
            .iter()
            .filter(|series| series.variance > 0.0)
            .collect()
    }

    pub fn ensure_deterministic(&self) -> Result<()> {
        if self.is_deterministic() {
            return Ok(());
        }
        let details = self
            .unstable_metrics()
            .iter()
            .map(|series| format!("{} variance {:.6}", series.metric, series.variance))
            .collect::<Vec<String>>()
            .join(", ");
        Err(EvalError::NonDeterministic {
            runs: self.runs,
            details,
        }
        .into())
    }
}

/// Zero variance on every tracked metric is the only deterministic outcome.
pub fn analyze(runs: &[AggregateScores]) -> StabilityReport {
    let tracked: [(&str, fn(&AggregateScores) -> f64); 4] = [
        ("structural_mean", |scores| scores.structural_mean),
        ("full_strict_mean", |scores| scores.full_strict_mean),
        ("urgency_accuracy", |scores| scores.urgency_accuracy),
        ("strict_pass_rate_percent", AggregateScores::strict_pass_percent),
    ];

    let metrics = tracked
        .iter()
        .map(|(metric, extract)| {
            let values = runs.iter().map(extract).collect::<Vec<f64>>();
            MetricSeries {
                metric: (*metric).to_string(),
                mean: mean(&values),
                variance: variance(&values),
                values,
            }
        })
        .collect::<Vec<MetricSeries>>();

    let verdict = if metrics.iter().all(|series| series.variance == 0.0) {
        StabilityVerdict::Deterministic
    } else {
        StabilityVerdict::NonDeterministic
    };

    StabilityReport {
        runs: runs.len(),
        metrics,
        verdict,
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Population variance. Identical samples are exactly zero.
pub fn variance(values: &[f64]) -> f64 {
    if values.windows(2).all(|pair| pair[0] == pair[1]) {
        return 0.0;
    }
    let mean = mean(values);
    values
        .iter()
        .map(|value| (value - mean).powi(2))
        .sum::<f64>()
        / values.len() as f64
}
