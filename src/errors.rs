use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EvalError {
    #[error("integrity check failed for dataset '{dataset}': {reason}")]
    Integrity { dataset: String, reason: String },

    #[error("unknown experiment '{name}'; available: {}", available.join(", "))]
    UnknownExperiment {
        name: String,
        available: Vec<String>,
    },

    #[error("case '{case_id}' in dataset '{dataset}' could not be evaluated: {details}")]
    CaseEvaluation {
        dataset: String,
        case_id: String,
        details: String,
    },

    #[error("PII detected in {path}: {}", findings.join("; "))]
    PiiDetected {
        path: PathBuf,
        findings: Vec<String>,
    },

    #[error("strict pass rate {actual_percent:.2}% is below target {target_percent:.2}%")]
    TargetMissed {
        actual_percent: f64,
        target_percent: f64,
    },

    #[error("engine is non-deterministic across {runs} stability runs: {details}")]
    NonDeterministic { runs: usize, details: String },
}

impl EvalError {
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Integrity { .. } => "integrity",
            Self::UnknownExperiment { .. } => "unknown_experiment",
            Self::CaseEvaluation { .. } => "case_evaluation",
            Self::PiiDetected { .. } => "pii_detected",
            Self::TargetMissed { .. } => "target_missed",
            Self::NonDeterministic { .. } => "non_deterministic",
        }
    }
}
