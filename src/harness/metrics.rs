use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::harness::buckets::urgency_rank;
use crate::harness::scoring::FieldMatches;
use crate::model::{ActualFields, ExpectedFields, Field};

const NULL_LABEL: &str = "<null>";
const NEAR_MISS_RELATIVE_ERROR: f64 = 0.25;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldStats {
    pub evaluated: usize,
    pub correct: usize,
    pub incorrect: usize,
    pub missing_actual: usize,
    pub unexpected_actual: usize,
    pub accuracy: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PartialSignals {
    pub name_token_overlap: usize,
    pub name_case_only: usize,
    pub amount_within_tolerance: usize,
    pub amount_near_miss: usize,
    pub urgency_off_by_one: usize,
}

pub type ConfusionMatrix = BTreeMap<String, BTreeMap<String, usize>>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldMetricsReport {
    pub fields: BTreeMap<Field, FieldStats>,
    pub category_confusion: ConfusionMatrix,
    pub urgency_confusion: ConfusionMatrix,
    pub partial_signals: PartialSignals,
}

impl FieldMetricsReport {
    pub fn accuracy(&self, field: Field) -> Option<f64> {
        self.fields
            .get(&field)
            .filter(|stats| stats.evaluated > 0)
            .map(|stats| stats.accuracy)
    }

    pub fn accuracy_map(&self) -> BTreeMap<Field, f64> {
        self.fields
            .iter()
            .map(|(field, stats)| (*field, stats.accuracy))
            .collect()
    }
}

#[derive(Debug, Default)]
pub struct FieldMetricsCollector {
    fields: BTreeMap<Field, FieldStats>,
    category_confusion: ConfusionMatrix,
    urgency_confusion: ConfusionMatrix,
    partial_signals: PartialSignals,
}

impl FieldMetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(
        &mut self,
        actual: &ActualFields,
        expected: &ExpectedFields,
        matches: &FieldMatches,
    ) {
        for field in Field::ALL {
            let stats = self.fields.entry(field).or_default();
            stats.evaluated += 1;
            if matches.get(field) {
                stats.correct += 1;
            } else {
                stats.incorrect += 1;
            }

            let actual_present = actual.display_value(field).is_some();
            let expected_present = expected.display_value(field).is_some();
            if expected_present && !actual_present {
                stats.missing_actual += 1;
            }
            if actual_present && !expected_present {
                stats.unexpected_actual += 1;
            }
        }

        if !matches.category {
            increment_confusion(
                &mut self.category_confusion,
                expected.category.as_deref(),
                actual.category.as_deref(),
            );
        }
        if !matches.urgency {
            increment_confusion(
                &mut self.urgency_confusion,
                expected.urgency_level.as_deref(),
                actual.urgency_level.as_deref(),
            );
        }

        self.record_partial_signals(actual, expected, matches);
    }

    fn record_partial_signals(
        &mut self,
        actual: &ActualFields,
        expected: &ExpectedFields,
        matches: &FieldMatches,
    ) {
        if !matches.name
            && let (Some(actual_name), Some(expected_name)) =
                (actual.name.as_deref(), expected.name.as_deref())
        {
            if actual_name.trim().to_lowercase() == expected_name.trim().to_lowercase() {
                self.partial_signals.name_case_only += 1;
            } else if shares_token(actual_name, expected_name) {
                self.partial_signals.name_token_overlap += 1;
            }
        }

        if let (Some(actual_amount), Some(expected_amount)) =
            (actual.goal_amount, expected.goal_amount)
        {
            if matches.amount && actual_amount != expected_amount {
                self.partial_signals.amount_within_tolerance += 1;
            } else if !matches.amount
                && (actual_amount - expected_amount).abs()
                    <= expected_amount.abs() * NEAR_MISS_RELATIVE_ERROR
            {
                self.partial_signals.amount_near_miss += 1;
            }
        }

        if !matches.urgency
            && let (Some(actual_rank), Some(expected_rank)) = (
                urgency_rank(actual.urgency_level.as_deref()),
                urgency_rank(expected.urgency_level.as_deref()),
            )
            && actual_rank.abs_diff(expected_rank) == 1
        {
            self.partial_signals.urgency_off_by_one += 1;
        }
    }

    pub fn report(&self) -> FieldMetricsReport {
        let fields = self
            .fields
            .iter()
            .map(|(field, stats)| {
                let mut stats = stats.clone();
                stats.accuracy = if stats.evaluated == 0 {
                    0.0
                } else {
                    stats.correct as f64 / stats.evaluated as f64
                };
                (*field, stats)
            })
            .collect();

        FieldMetricsReport {
            fields,
            category_confusion: self.category_confusion.clone(),
            urgency_confusion: self.urgency_confusion.clone(),
            partial_signals: self.partial_signals.clone(),
        }
    }
}

fn increment_confusion(matrix: &mut ConfusionMatrix, expected: Option<&str>, actual: Option<&str>) {
    *matrix
        .entry(expected.unwrap_or(NULL_LABEL).to_string())
        .or_default()
        .entry(actual.unwrap_or(NULL_LABEL).to_string())
        .or_default() += 1;
}

fn shares_token(left: &str, right: &str) -> bool {
    let right_tokens = right
        .split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<String>>();
    left.split_whitespace()
        .map(str::to_lowercase)
        .any(|token| right_tokens.contains(&token))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harness::scoring::{ScoringConfig, score};
    use crate::model::Strictness;

    fn set(
        name: Option<&str>,
        category: Option<&str>,
        urgency: Option<&str>,
        amount: Option<f64>,
    ) -> ActualFields {
        ActualFields {
            name: name.map(str::to_string),
            category: category.map(str::to_string),
            urgency_level: urgency.map(str::to_string),
            goal_amount: amount,
        }
    }

    fn record(
        collector: &mut FieldMetricsCollector,
        actual: &ActualFields,
        expected: &ExpectedFields,
        tolerance: f64,
    ) {
        let config = ScoringConfig {
            amount_tolerance: tolerance,
            ..ScoringConfig::default()
        };
        let result = score(actual, expected, &Strictness::default(), &config);
        collector.record(actual, expected, &result.field_matches);
    }

    #[test]
    fn accuracy_and_null_counters_are_tracked_per_field() {
        let mut collector = FieldMetricsCollector::new();
        let expected = set(Some("Dana Ruiz"), Some("HOUSING"), Some("HIGH"), Some(1500.0));
        record(&mut collector, &expected.clone(), &expected, 0.0);
        record(&mut collector, &set(None, Some("FOOD"), Some("HIGH"), None), &expected, 0.0);

        let report = collector.report();
        let name = &report.fields[&Field::Name];
        assert_eq!(name.evaluated, 2);
        assert_eq!(name.correct, 1);
        assert_eq!(name.missing_actual, 1);
        assert_eq!(report.accuracy(Field::Urgency), Some(1.0));
        assert_eq!(report.accuracy(Field::Category), Some(0.5));
        assert_eq!(report.category_confusion["HOUSING"]["FOOD"], 1);
        assert!(report.urgency_confusion.is_empty());
    }

    #[test]
    fn partial_signals_capture_near_misses() {
        let mut collector = FieldMetricsCollector::new();
        let expected = set(Some("Dana Ruiz"), None, Some("CRITICAL"), Some(1000.0));
        let case_only = set(Some("dana ruiz"), None, Some("HIGH"), Some(1100.0));
        let partial = set(Some("Dana"), None, Some("LOW"), Some(1050.0));
        record(&mut collector, &case_only, &expected, 0.0);
        record(&mut collector, &partial, &expected, 0.1);

        let signals = collector.report().partial_signals;
        assert_eq!(signals.name_case_only, 1);
        assert_eq!(signals.name_token_overlap, 1);
        assert_eq!(signals.amount_near_miss, 1);
        assert_eq!(signals.amount_within_tolerance, 1);
        assert_eq!(signals.urgency_off_by_one, 1);
    }

    #[test]
    fn unexpected_values_and_null_labels_are_reported() {
        let mut collector = FieldMetricsCollector::new();
        let expected = set(None, None, Some("LOW"), None);
        record(&mut collector, &set(None, Some("LEGAL"), None, Some(20.0)), &expected, 0.0);

        let report = collector.report();
        assert_eq!(report.fields[&Field::Amount].unexpected_actual, 1);
        assert_eq!(report.fields[&Field::Category].unexpected_actual, 1);
        assert_eq!(report.category_confusion["<null>"]["LEGAL"], 1);
        assert_eq!(report.urgency_confusion["LOW"]["<null>"], 1);
    }
}
