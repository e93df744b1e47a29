use serde::{Deserialize, Serialize};

use crate::model::{ActualFields, ExpectedFields, Field, Strictness};

pub const DEFAULT_STRICT_THRESHOLD: f64 = 1.0;
pub const DEFAULT_ACCEPTABLE_THRESHOLD: f64 = 0.75;
pub const DEFAULT_AMOUNT_TOLERANCE: f64 = 0.0;

pub const STRICT_THRESHOLD_ENV: &str = "EVAL_STRICT_THRESHOLD";
pub const ACCEPTABLE_THRESHOLD_ENV: &str = "EVAL_ACCEPTABLE_THRESHOLD";
pub const AMOUNT_TOLERANCE_ENV: &str = "EVAL_AMOUNT_TOLERANCE";

const STRUCTURAL_FIELDS: usize = 3;
const ALL_FIELDS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoringConfig {
    pub strict_threshold: f64,
    pub acceptable_threshold: f64,
    pub amount_tolerance: f64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            strict_threshold: DEFAULT_STRICT_THRESHOLD,
            acceptable_threshold: DEFAULT_ACCEPTABLE_THRESHOLD,
            amount_tolerance: DEFAULT_AMOUNT_TOLERANCE,
        }
    }
}

impl ScoringConfig {
    /// CLI values win over `EVAL_*` environment values, which win over defaults.
    pub fn resolve(
        strict_threshold: Option<f64>,
        acceptable_threshold: Option<f64>,
        amount_tolerance: Option<f64>,
    ) -> Self {
        let from_env = |key: &str| parse_ratio(std::env::var(key).ok().as_deref());
        Self {
            strict_threshold: strict_threshold
                .or_else(|| from_env(STRICT_THRESHOLD_ENV))
                .unwrap_or(DEFAULT_STRICT_THRESHOLD),
            acceptable_threshold: acceptable_threshold
                .or_else(|| from_env(ACCEPTABLE_THRESHOLD_ENV))
                .unwrap_or(DEFAULT_ACCEPTABLE_THRESHOLD),
            amount_tolerance: amount_tolerance
                .or_else(|| from_env(AMOUNT_TOLERANCE_ENV))
                .unwrap_or(DEFAULT_AMOUNT_TOLERANCE),
        }
    }
}

pub fn parse_ratio(value: Option<&str>) -> Option<f64> {
    let parsed = value?.trim().parse::<f64>().ok()?;
    (parsed.is_finite() && (0.0..=1.0).contains(&parsed)).then_some(parsed)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldMatches {
    pub name: bool,
    pub category: bool,
    pub urgency: bool,
    pub amount: bool,
}

impl FieldMatches {
    pub fn get(&self, field: Field) -> bool {
        match field {
            Field::Name => self.name,
            Field::Category => self.category,
            Field::Urgency => self.urgency,
            Field::Amount => self.amount,
        }
    }

    pub fn structural_count(&self) -> usize {
        [self.name, self.category, self.amount]
            .into_iter()
            .filter(|matched| *matched)
            .count()
    }

    pub fn full_count(&self) -> usize {
        self.structural_count() + usize::from(self.urgency)
    }

    pub fn failed_fields(&self) -> Vec<Field> {
        Field::ALL
            .into_iter()
            .filter(|field| !self.get(*field))
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoringResult {
    pub field_matches: FieldMatches,
    pub structural_score: f64,
    pub full_strict_score: f64,
    pub urgency_score: f64,
    pub structural_pass_strict: bool,
    pub structural_pass_acceptable: bool,
    pub full_pass_strict: bool,
    pub full_pass_acceptable: bool,
}

pub fn score(
    actual: &ActualFields,
    expected: &ExpectedFields,
    strictness: &Strictness,
    config: &ScoringConfig,
) -> ScoringResult {
    let tolerance = strictness.amount_tolerance.unwrap_or(config.amount_tolerance);
    let field_matches = FieldMatches {
        name: name_matches(
            actual.name.as_deref(),
            expected.name.as_deref(),
            strictness.allow_fuzzy_name,
        ),
        category: exact_matches(actual.category.as_deref(), expected.category.as_deref()),
        urgency: exact_matches(
            actual.urgency_level.as_deref(),
            expected.urgency_level.as_deref(),
        ),
        amount: amount_matches(actual.goal_amount, expected.goal_amount, tolerance),
    };

    let structural_score = field_matches.structural_count() as f64 / STRUCTURAL_FIELDS as f64;
    let full_strict_score = field_matches.full_count() as f64 / ALL_FIELDS as f64;
    let urgency_score = if field_matches.urgency { 1.0 } else { 0.0 };

    ScoringResult {
        field_matches,
        structural_score,
        full_strict_score,
        urgency_score,
        structural_pass_strict: structural_score >= config.strict_threshold,
        structural_pass_acceptable: structural_score >= config.acceptable_threshold,
        full_pass_strict: full_strict_score >= config.strict_threshold,
        full_pass_acceptable: full_strict_score >= config.acceptable_threshold,
    }
}

pub fn name_matches(actual: Option<&str>, expected: Option<&str>, allow_fuzzy: bool) -> bool {
    match (actual, expected) {
        (None, None) => true,
        (Some(actual), Some(expected)) => {
            if actual.trim() == expected.trim() {
                return true;
            }
            allow_fuzzy && normalize_name(actual) == normalize_name(expected)
        }
        _ => false,
    }
}

pub fn normalize_name(value: &str) -> String {
    value
        .chars()
        .map(|ch| {
            if ch.is_alphanumeric() || ch.is_whitespace() {
                ch.to_lowercase().collect::<String>()
            } else {
                String::new()
            }
        })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<&str>>()
        .join(" ")
}

pub fn exact_matches(actual: Option<&str>, expected: Option<&str>) -> bool {
    actual == expected
}

pub fn amount_matches(actual: Option<f64>, expected: Option<f64>, tolerance: f64) -> bool {
    match (actual, expected) {
        (None, None) => true,
        (Some(actual), Some(expected)) => {
            if actual == expected {
                return true;
            }
            tolerance > 0.0
                && actual.is_finite()
                && expected.is_finite()
                && (actual - expected).abs() <= expected.abs() * tolerance
        }
        _ => false,
    }
}

/// Run-level reduction. Only integer counters are accumulated, so the result
/// is identical for any ordering of the input.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregateScores {
    pub case_count: usize,
    pub structural_mean: f64,
    pub full_strict_mean: f64,
    pub urgency_accuracy: f64,
    pub structural_strict_pass_rate: f64,
    pub structural_acceptable_pass_rate: f64,
    pub full_strict_pass_rate: f64,
    pub full_acceptable_pass_rate: f64,
}

impl AggregateScores {
    pub fn strict_pass_percent(&self) -> f64 {
        self.full_strict_pass_rate * 100.0
    }

    pub fn named_metrics(&self) -> Vec<(&'static str, f64)> {
        vec![
            ("structural_mean", self.structural_mean),
            ("full_strict_mean", self.full_strict_mean),
            ("urgency_accuracy", self.urgency_accuracy),
            ("structural_strict_pass_rate", self.structural_strict_pass_rate),
            ("structural_acceptable_pass_rate", self.structural_acceptable_pass_rate),
            ("full_strict_pass_rate", self.full_strict_pass_rate),
            ("full_acceptable_pass_rate", self.full_acceptable_pass_rate),
        ]
    }
}

pub fn aggregate_scores<'a, I>(results: I) -> AggregateScores
where
    I: IntoIterator<Item = &'a ScoringResult>,
{
    let mut case_count = 0usize;
    let mut structural_matches = 0usize;
    let mut full_matches = 0usize;
    let mut urgency_correct = 0usize;
    let mut structural_strict = 0usize;
    let mut structural_acceptable = 0usize;
    let mut full_strict = 0usize;
    let mut full_acceptable = 0usize;

    for result in results {
        case_count += 1;
        structural_matches += result.field_matches.structural_count();
        full_matches += result.field_matches.full_count();
        urgency_correct += usize::from(result.field_matches.urgency);
        structural_strict += usize::from(result.structural_pass_strict);
        structural_acceptable += usize::from(result.structural_pass_acceptable);
        full_strict += usize::from(result.full_pass_strict);
        full_acceptable += usize::from(result.full_pass_acceptable);
    }

    if case_count == 0 {
        return AggregateScores::default();
    }

    let ratio = |numerator: usize, denominator: usize| numerator as f64 / denominator as f64;
    AggregateScores {
        case_count,
        structural_mean: ratio(structural_matches, case_count * STRUCTURAL_FIELDS),
        full_strict_mean: ratio(full_matches, case_count * ALL_FIELDS),
        urgency_accuracy: ratio(urgency_correct, case_count),
        structural_strict_pass_rate: ratio(structural_strict, case_count),
        structural_acceptable_pass_rate: ratio(structural_acceptable, case_count),
        full_strict_pass_rate: ratio(full_strict, case_count),
        full_acceptable_pass_rate: ratio(full_acceptable, case_count),
    }
}
