use std::collections::{BTreeMap, BTreeSet};

use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::model::{ActualFields, ExpectedFields, Field};
use crate::util::now_utc_string;

pub const DEFAULT_CATEGORY_VOCABULARY: &[&str] = &[
    "HOUSING",
    "HEALTHCARE",
    "FOOD",
    "UTILITIES",
    "TRANSPORTATION",
    "EMPLOYMENT",
    "EDUCATION",
    "LEGAL",
    "CHILDCARE",
    "SAFETY",
    "FAMILY",
    "OTHER",
];

const NON_NAME_INDICATORS: &[&str] = &[
    "about", "and", "bills", "calling", "emergency", "from", "going", "hello", "help", "here",
    "hey", "hi", "just", "looking", "money", "need", "needs", "ok", "okay", "please", "really",
    "rent", "sorry", "speaking", "thank", "thanks", "the", "trying", "urgent", "with", "worried",
];

const INTRO_PATTERNS: &[&str] = &[
    r"(?i)\bmy name(?:'s| is)\s+\w+",
    r"(?i)\bcall me\s+\w+",
    r"(?i)\bthis is\s+\w+(?:\s+\w+)?\s+(?:calling|speaking|here)\b",
    r"\b[Tt]his is\s+[A-Z][a-z]+",
    r"\b(?:I'm|I am|i'm|i am)\s+[A-Z][a-z]+",
];

const PARTIAL_AMOUNT_RATIO: f64 = 0.5;
const NEAR_AMOUNT_RELATIVE_ERROR: f64 = 0.25;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BucketKey {
    NameIntroPatternMissed,
    NameNullExtraction,
    NameRejectFilterFailure,
    NamePartialCapture,
    NameLowercaseCapture,
    AmountFalsePositive,
    AmountNullExtraction,
    AmountPartialMatchOverride,
    AmountToleranceExceeded,
    AmountSpokenNumberFailure,
    CategoryVocabularyGap,
    CategoryMultiSignalConflict,
    CategoryPriorityConflict,
    UrgencyEngineConflict,
    UrgencySignalAbsent,
    UrgencyThresholdMiss,
    UrgencyMultiplierOverride,
}

impl BucketKey {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NameIntroPatternMissed => "name_intro_pattern_missed",
            Self::NameNullExtraction => "name_null_extraction",
            Self::NameRejectFilterFailure => "name_reject_filter_failure",
            Self::NamePartialCapture => "name_partial_capture",
            Self::NameLowercaseCapture => "name_lowercase_capture",
            Self::AmountFalsePositive => "amount_false_positive",
            Self::AmountNullExtraction => "amount_null_extraction",
            Self::AmountPartialMatchOverride => "amount_partial_match_override",
            Self::AmountToleranceExceeded => "amount_tolerance_exceeded",
            Self::AmountSpokenNumberFailure => "amount_spoken_number_failure",
            Self::CategoryVocabularyGap => "category_vocabulary_gap",
            Self::CategoryMultiSignalConflict => "category_multi_signal_conflict",
            Self::CategoryPriorityConflict => "category_priority_conflict",
            Self::UrgencyEngineConflict => "urgency_engine_conflict",
            Self::UrgencySignalAbsent => "urgency_signal_absent",
            Self::UrgencyThresholdMiss => "urgency_threshold_miss",
            Self::UrgencyMultiplierOverride => "urgency_multiplier_override",
        }
    }

    pub fn field(self) -> Field {
        match self {
            Self::NameIntroPatternMissed
            | Self::NameNullExtraction
            | Self::NameRejectFilterFailure
            | Self::NamePartialCapture
            | Self::NameLowercaseCapture => Field::Name,
            Self::AmountFalsePositive
            | Self::AmountNullExtraction
            | Self::AmountPartialMatchOverride
            | Self::AmountToleranceExceeded
            | Self::AmountSpokenNumberFailure => Field::Amount,
            Self::CategoryVocabularyGap
            | Self::CategoryMultiSignalConflict
            | Self::CategoryPriorityConflict => Field::Category,
            Self::UrgencyEngineConflict
            | Self::UrgencySignalAbsent
            | Self::UrgencyThresholdMiss
            | Self::UrgencyMultiplierOverride => Field::Urgency,
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            Self::NameIntroPatternMissed => {
                "transcript contains a self-introduction the engine did not capture"
            }
            Self::NameNullExtraction => "no name was extracted",
            Self::NameRejectFilterFailure => {
                "captured name contains non-name words the reject filter should drop"
            }
            Self::NamePartialCapture => "only part of the full name was captured",
            Self::NameLowercaseCapture => "name captured with the wrong casing",
            Self::AmountFalsePositive => "amount extracted where none was stated",
            Self::AmountNullExtraction => "stated amount was not extracted",
            Self::AmountPartialMatchOverride => {
                "compound number under-matched to less than half of the expected amount"
            }
            Self::AmountToleranceExceeded => "amount is close to expected but outside tolerance",
            Self::AmountSpokenNumberFailure => "spoken number parsed to the wrong value",
            Self::CategoryVocabularyGap => "expected category is outside the engine vocabulary",
            Self::CategoryMultiSignalConflict => "transcript carries signals for several categories",
            Self::CategoryPriorityConflict => "engine preferred a different category by priority",
            Self::UrgencyEngineConflict => "runaway CRITICAL override",
            Self::UrgencySignalAbsent => "urgency signals in the transcript conflict",
            Self::UrgencyThresholdMiss => "urgency scored below the expected level",
            Self::UrgencyMultiplierOverride => "urgency inflated above the expected level",
        }
    }

    pub fn severity(self) -> Severity {
        match self {
            Self::AmountNullExtraction | Self::UrgencyEngineConflict => Severity::Critical,
            Self::NameIntroPatternMissed
            | Self::NameNullExtraction
            | Self::AmountFalsePositive
            | Self::AmountPartialMatchOverride => Severity::High,
            Self::NameRejectFilterFailure
            | Self::AmountSpokenNumberFailure
            | Self::CategoryVocabularyGap
            | Self::CategoryPriorityConflict
            | Self::UrgencyThresholdMiss
            | Self::UrgencyMultiplierOverride => Severity::Medium,
            Self::NamePartialCapture
            | Self::NameLowercaseCapture
            | Self::AmountToleranceExceeded
            | Self::CategoryMultiSignalConflict
            | Self::UrgencySignalAbsent => Severity::Low,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ClassificationContext<'a> {
    pub case_id: &'a str,
    pub actual: &'a ActualFields,
    pub expected: &'a ExpectedFields,
    pub transcript: &'a str,
    pub notes: Option<&'a str>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketEntry {
    pub case_id: String,
    pub actual: Option<String>,
    pub expected: Option<String>,
    pub timestamp: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketSummary {
    pub key: BucketKey,
    pub field: Field,
    pub description: String,
    pub severity: Severity,
    pub count: usize,
    pub case_ids: Vec<String>,
    pub entries: Vec<BucketEntry>,
}

type Predicate = fn(&FailureClassifier, &ClassificationContext<'_>) -> bool;

struct Rule {
    predicate: Predicate,
    bucket: BucketKey,
}

struct RuleTable {
    rules: &'static [Rule],
    fallback: BucketKey,
}

// Rows are evaluated top to bottom; the first matching predicate wins.
static NAME_RULES: RuleTable = RuleTable {
    rules: &[
        Rule {
            predicate: |classifier, ctx| {
                name_missing(ctx) && classifier.has_intro_pattern(ctx.transcript)
            },
            bucket: BucketKey::NameIntroPatternMissed,
        },
        Rule {
            predicate: |_, ctx| name_missing(ctx),
            bucket: BucketKey::NameNullExtraction,
        },
        Rule {
            predicate: |_, ctx| {
                both_names(ctx).is_some_and(|(actual, _)| has_non_name_indicator(actual))
            },
            bucket: BucketKey::NameRejectFilterFailure,
        },
        Rule {
            predicate: |_, ctx| {
                both_names(ctx)
                    .is_some_and(|(actual, expected)| is_partial_capture(actual, expected))
            },
            bucket: BucketKey::NamePartialCapture,
        },
        Rule {
            predicate: |_, ctx| {
                both_names(ctx)
                    .is_some_and(|(actual, expected)| is_case_only_difference(actual, expected))
            },
            bucket: BucketKey::NameLowercaseCapture,
        },
    ],
    fallback: BucketKey::NameNullExtraction,
};

static AMOUNT_RULES: RuleTable = RuleTable {
    rules: &[
        Rule {
            predicate: |_, ctx| ctx.actual.goal_amount.is_some() && ctx.expected.goal_amount.is_none(),
            bucket: BucketKey::AmountFalsePositive,
        },
        Rule {
            predicate: |_, ctx| ctx.actual.goal_amount.is_none() && ctx.expected.goal_amount.is_some(),
            bucket: BucketKey::AmountNullExtraction,
        },
        Rule {
            predicate: |_, ctx| {
                both_amounts(ctx).is_some_and(|(actual, expected)| actual < expected * PARTIAL_AMOUNT_RATIO)
            },
            bucket: BucketKey::AmountPartialMatchOverride,
        },
        Rule {
            predicate: |_, ctx| {
                both_amounts(ctx).is_some_and(|(actual, expected)| {
                    (actual - expected).abs() <= expected.abs() * NEAR_AMOUNT_RELATIVE_ERROR
                })
            },
            bucket: BucketKey::AmountToleranceExceeded,
        },
    ],
    fallback: BucketKey::AmountSpokenNumberFailure,
};

static CATEGORY_RULES: RuleTable = RuleTable {
    rules: &[
        Rule {
            predicate: |classifier, ctx| {
                ctx.expected
                    .category
                    .as_deref()
                    .is_some_and(|category| !classifier.knows_category(category))
            },
            bucket: BucketKey::CategoryVocabularyGap,
        },
        Rule {
            predicate: |classifier, ctx| {
                ctx.notes
                    .is_some_and(|notes| classifier.multi_category_notes.is_match(notes))
            },
            bucket: BucketKey::CategoryMultiSignalConflict,
        },
    ],
    fallback: BucketKey::CategoryPriorityConflict,
};

static URGENCY_RULES: RuleTable = RuleTable {
    rules: &[
        Rule {
            predicate: |_, ctx| {
                urgency_rank(ctx.actual.urgency_level.as_deref()) == Some(MAX_URGENCY_RANK)
                    && urgency_rank(ctx.expected.urgency_level.as_deref()) != Some(MAX_URGENCY_RANK)
            },
            bucket: BucketKey::UrgencyEngineConflict,
        },
        Rule {
            predicate: |classifier, ctx| {
                ctx.notes
                    .is_some_and(|notes| classifier.signal_conflict_notes.is_match(notes))
            },
            bucket: BucketKey::UrgencySignalAbsent,
        },
        Rule {
            predicate: |_, ctx| urgency_ordering(ctx) == Some(std::cmp::Ordering::Less),
            bucket: BucketKey::UrgencyThresholdMiss,
        },
        Rule {
            predicate: |_, ctx| urgency_ordering(ctx) == Some(std::cmp::Ordering::Greater),
            bucket: BucketKey::UrgencyMultiplierOverride,
        },
    ],
    fallback: BucketKey::UrgencyThresholdMiss,
};

const MAX_URGENCY_RANK: u8 = 4;

pub fn urgency_rank(level: Option<&str>) -> Option<u8> {
    match level?.trim().to_ascii_uppercase().as_str() {
        "LOW" => Some(1),
        "MEDIUM" => Some(2),
        "HIGH" => Some(3),
        "CRITICAL" => Some(MAX_URGENCY_RANK),
        _ => None,
    }
}

// A missing actual level ranks below every level; an unknown expected level
// is not comparable.
fn urgency_ordering(ctx: &ClassificationContext<'_>) -> Option<std::cmp::Ordering> {
    let actual = match ctx.actual.urgency_level.as_deref() {
        None => 0,
        Some(level) => urgency_rank(Some(level))?,
    };
    let expected = match ctx.expected.urgency_level.as_deref() {
        None => 0,
        Some(level) => urgency_rank(Some(level))?,
    };
    Some(actual.cmp(&expected))
}

fn name_missing(ctx: &ClassificationContext<'_>) -> bool {
    ctx.expected.name.is_some() && ctx.actual.name.is_none()
}

fn both_names<'a>(ctx: &ClassificationContext<'a>) -> Option<(&'a str, &'a str)> {
    Some((ctx.actual.name.as_deref()?, ctx.expected.name.as_deref()?))
}

fn both_amounts(ctx: &ClassificationContext<'_>) -> Option<(f64, f64)> {
    Some((ctx.actual.goal_amount?, ctx.expected.goal_amount?))
}

fn name_tokens(value: &str) -> Vec<String> {
    value
        .split_whitespace()
        .map(|token| {
            token
                .trim_matches(|ch: char| !ch.is_alphanumeric())
                .to_lowercase()
        })
        .filter(|token| !token.is_empty())
        .collect()
}

fn has_non_name_indicator(actual: &str) -> bool {
    name_tokens(actual)
        .iter()
        .any(|token| NON_NAME_INDICATORS.contains(&token.as_str()))
}

fn is_partial_capture(actual: &str, expected: &str) -> bool {
    let actual_tokens = name_tokens(actual);
    let expected_tokens = name_tokens(expected);
    actual_tokens.len() < expected_tokens.len()
        && actual_tokens
            .iter()
            .any(|token| expected_tokens.contains(token))
}

fn is_case_only_difference(actual: &str, expected: &str) -> bool {
    let actual = actual.trim();
    let expected = expected.trim();
    actual != expected && actual.to_lowercase() == expected.to_lowercase()
}

/// Maps field failures to exactly one bucket and accumulates them for a run.
pub struct FailureClassifier {
    intro_patterns: Vec<Regex>,
    multi_category_notes: Regex,
    signal_conflict_notes: Regex,
    vocabulary: BTreeSet<String>,
    buckets: BTreeMap<BucketKey, Vec<BucketEntry>>,
}

impl FailureClassifier {
    pub fn new() -> Result<Self> {
        Self::with_vocabulary(DEFAULT_CATEGORY_VOCABULARY.iter().copied())
    }

    pub fn with_vocabulary<I, S>(vocabulary: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let intro_patterns = INTRO_PATTERNS
            .iter()
            .map(|pattern| {
                Regex::new(pattern)
                    .with_context(|| format!("failed to compile intro pattern: {pattern}"))
            })
            .collect::<Result<Vec<Regex>>>()?;
        let multi_category_notes = Regex::new(
            r"(?i)\bmulti[- ]?(?:category|categories)\b|\bmultiple categories\b|\bcategory conflict\b",
        )
        .context("failed to compile multi-category notes pattern")?;
        let signal_conflict_notes = Regex::new(
            r"(?i)\bsignal conflict\b|\bconflicting (?:urgency )?signals\b|\bmixed signals\b",
        )
        .context("failed to compile signal-conflict notes pattern")?;

        Ok(Self {
            intro_patterns,
            multi_category_notes,
            signal_conflict_notes,
            vocabulary: vocabulary
                .into_iter()
                .map(|category| category.as_ref().trim().to_ascii_uppercase())
                .filter(|category| !category.is_empty())
                .collect(),
            buckets: BTreeMap::new(),
        })
    }

    pub fn has_intro_pattern(&self, transcript: &str) -> bool {
        self.intro_patterns
            .iter()
            .any(|pattern| pattern.is_match(transcript))
    }

    pub fn knows_category(&self, category: &str) -> bool {
        self.vocabulary
            .contains(&category.trim().to_ascii_uppercase())
    }

    /// Pure rule evaluation; does not record anything.
    pub fn resolve(&self, field: Field, ctx: &ClassificationContext<'_>) -> BucketKey {
        let table = match field {
            Field::Name => &NAME_RULES,
            Field::Amount => &AMOUNT_RULES,
            Field::Category => &CATEGORY_RULES,
            Field::Urgency => &URGENCY_RULES,
        };
        table
            .rules
            .iter()
            .find(|rule| (rule.predicate)(self, ctx))
            .map_or(table.fallback, |rule| rule.bucket)
    }

    pub fn classify(&mut self, field: Field, ctx: &ClassificationContext<'_>) -> BucketKey {
        let bucket = self.resolve(field, ctx);
        self.buckets.entry(bucket).or_default().push(BucketEntry {
            case_id: ctx.case_id.to_string(),
            actual: ctx.actual.display_value(field),
            expected: ctx.expected.display_value(field),
            timestamp: now_utc_string(),
        });
        bucket
    }

    #[cfg(test)]
    pub fn count(&self, bucket: BucketKey) -> usize {
        self.buckets.get(&bucket).map_or(0, Vec::len)
    }

    pub fn total_entries(&self) -> usize {
        self.buckets.values().map(Vec::len).sum()
    }

    pub fn summary(&self) -> Vec<BucketSummary> {
        let mut summary = self
            .buckets
            .iter()
            .filter(|(_, entries)| !entries.is_empty())
            .map(|(key, entries)| BucketSummary {
                key: *key,
                field: key.field(),
                description: key.description().to_string(),
                severity: key.severity(),
                count: entries.len(),
                case_ids: entries.iter().map(|entry| entry.case_id.clone()).collect(),
                entries: entries.clone(),
            })
            .collect::<Vec<BucketSummary>>();
        summary.sort_by(|left, right| right.count.cmp(&left.count).then(left.key.cmp(&right.key)));
        summary
    }

    pub fn reset(&mut self) {
        self.buckets.clear();
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

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

    fn resolve_with(
        field: Field,
        actual: &ActualFields,
        expected: &ExpectedFields,
        transcript: &str,
        notes: Option<&str>,
    ) -> BucketKey {
        let classifier = FailureClassifier::new().expect("classifier");
        classifier.resolve(
            field,
            &ClassificationContext {
                case_id: "case",
                actual,
                expected,
                transcript,
                notes,
            },
        )
    }

    #[test]
    fn missing_name_with_intro_pattern_is_intro_miss() {
        let expected = set(Some("Dana Ruiz"), None, None, None);
        let actual = set(None, None, None, None);
        assert_eq!(
            resolve_with(Field::Name, &actual, &expected, "Hello, my name is Dana Ruiz.", None),
            BucketKey::NameIntroPatternMissed
        );
        assert_eq!(
            resolve_with(Field::Name, &actual, &expected, "Dana needs rent help.", None),
            BucketKey::NameNullExtraction
        );
    }

    #[test]
    fn every_intro_form_counts_as_an_intro_miss() {
        let expected = set(Some("Dana Ruiz"), None, None, None);
        let actual = set(None, None, None, None);
        for transcript in [
            "Hi, you can call me Dana. The rent is late.",
            "Hello, this is Dana Ruiz calling about my bills.",
            "I'm Dana and I need help with surgery costs.",
            "My name's Dana, I lost my job.",
        ] {
            assert_eq!(
                resolve_with(Field::Name, &actual, &expected, transcript, None),
                BucketKey::NameIntroPatternMissed,
                "transcript: {transcript}"
            );
        }
        assert_eq!(
            resolve_with(Field::Name, &actual, &expected, "I'm worried about the rent.", None),
            BucketKey::NameNullExtraction
        );
    }

    #[test]
    fn name_rules_apply_in_fixed_order() {
        let expected = set(Some("Dana Ruiz"), None, None, None);
        let reject = set(Some("Dana calling"), None, None, None);
        assert_eq!(
            resolve_with(Field::Name, &reject, &expected, "", None),
            BucketKey::NameRejectFilterFailure
        );

        let partial = set(Some("Dana"), None, None, None);
        assert_eq!(
            resolve_with(Field::Name, &partial, &expected, "", None),
            BucketKey::NamePartialCapture
        );

        let lowercase = set(Some("dana ruiz"), None, None, None);
        assert_eq!(
            resolve_with(Field::Name, &lowercase, &expected, "", None),
            BucketKey::NameLowercaseCapture
        );

        let unrelated = set(Some("Morgan Lee"), None, None, None);
        assert_eq!(
            resolve_with(Field::Name, &unrelated, &expected, "", None),
            BucketKey::NameNullExtraction
        );
    }

    #[test]
    fn amount_scenarios_map_to_expected_buckets() {
        let expected = set(None, None, None, Some(15000.0));
        assert_eq!(
            resolve_with(Field::Amount, &set(None, None, None, None), &expected, "", None),
            BucketKey::AmountNullExtraction
        );

        let compound = set(None, None, None, Some(3500.0));
        assert_eq!(
            resolve_with(Field::Amount, &set(None, None, None, Some(1700.0)), &compound, "", None),
            BucketKey::AmountPartialMatchOverride
        );

        assert_eq!(
            resolve_with(Field::Amount, &set(None, None, None, Some(16000.0)), &expected, "", None),
            BucketKey::AmountToleranceExceeded
        );
        assert_eq!(
            resolve_with(Field::Amount, &set(None, None, None, Some(50000.0)), &expected, "", None),
            BucketKey::AmountSpokenNumberFailure
        );
        assert_eq!(
            resolve_with(Field::Amount, &set(None, None, None, Some(200.0)), &set(None, None, None, None), "", None),
            BucketKey::AmountFalsePositive
        );
    }

    #[test]
    fn category_rules_check_vocabulary_before_notes() {
        let actual = set(None, Some("HOUSING"), None, None);
        let gap = set(None, Some("PET_CARE"), None, None);
        assert_eq!(
            resolve_with(Field::Category, &actual, &gap, "", Some("multi-category conflict")),
            BucketKey::CategoryVocabularyGap
        );

        let known = set(None, Some("UTILITIES"), None, None);
        assert_eq!(
            resolve_with(Field::Category, &actual, &known, "", Some("Multiple categories mentioned")),
            BucketKey::CategoryMultiSignalConflict
        );
        assert_eq!(
            resolve_with(Field::Category, &actual, &known, "", None),
            BucketKey::CategoryPriorityConflict
        );
    }

    #[test]
    fn urgency_rules_follow_ordinal_scale() {
        let critical = set(None, None, Some("CRITICAL"), None);
        let high = set(None, None, Some("HIGH"), None);
        let low = set(None, None, Some("LOW"), None);

        assert_eq!(
            resolve_with(Field::Urgency, &high, &critical, "", None),
            BucketKey::UrgencyThresholdMiss
        );
        assert_eq!(
            resolve_with(Field::Urgency, &critical, &high, "", Some("conflicting signals")),
            BucketKey::UrgencyEngineConflict
        );
        assert_eq!(
            resolve_with(Field::Urgency, &low, &high, "", Some("signal conflict noted")),
            BucketKey::UrgencySignalAbsent
        );
        assert_eq!(
            resolve_with(Field::Urgency, &high, &low, "", None),
            BucketKey::UrgencyMultiplierOverride
        );
        assert_eq!(
            resolve_with(Field::Urgency, &set(None, None, None, None), &low, "", None),
            BucketKey::UrgencyThresholdMiss
        );
        assert_eq!(
            resolve_with(Field::Urgency, &high, &high, "", None),
            BucketKey::UrgencyThresholdMiss
        );
    }

    #[test]
    fn summary_sorts_by_count_and_reset_clears() {
        let mut classifier = FailureClassifier::new().expect("classifier");
        let expected = set(None, None, Some("CRITICAL"), Some(15000.0));
        let actual = set(None, None, Some("HIGH"), None);
        for case_id in ["a", "b"] {
            let ctx = ClassificationContext {
                case_id,
                actual: &actual,
                expected: &expected,
                transcript: "",
                notes: None,
            };
            classifier.classify(Field::Amount, &ctx);
        }
        let ctx = ClassificationContext {
            case_id: "c",
            actual: &actual,
            expected: &expected,
            transcript: "",
            notes: None,
        };
        classifier.classify(Field::Urgency, &ctx);

        let summary = classifier.summary();
        assert_eq!(summary.len(), 2);
        assert_eq!(summary[0].key, BucketKey::AmountNullExtraction);
        assert_eq!(summary[0].case_ids, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(summary[0].entries[0].expected.as_deref(), Some("15000"));
        assert_eq!(summary[1].key, BucketKey::UrgencyThresholdMiss);

        classifier.reset();
        assert!(classifier.summary().is_empty());
        assert_eq!(classifier.total_entries(), 0);
    }

    fn opt_text() -> impl Strategy<Value = Option<String>> {
        prop::option::of(prop::sample::select(vec![
            "Dana", "dana", "Dana Ruiz", "Dana calling", "LOW", "HIGH", "CRITICAL", "HOUSING",
            "PET_CARE", "",
        ]))
        .prop_map(|value| value.map(str::to_string))
    }

    fn field_set() -> impl Strategy<Value = ActualFields> {
        (opt_text(), opt_text(), opt_text(), prop::option::of(-10.0f64..20000.0))
            .prop_map(|(name, category, urgency_level, goal_amount)| ActualFields {
                name,
                category,
                urgency_level,
                goal_amount,
            })
    }

    proptest! {
        #[test]
        fn classify_is_pure_and_records_exactly_one_entry(
            actual in field_set(),
            expected in field_set(),
            transcript in prop::sample::select(vec!["", "my name is Dana", "I am Dana", "rent is due"]),
            notes in prop::option::of(prop::sample::select(vec!["multi-category", "signal conflict", "plain"])),
            field in prop::sample::select(Field::ALL.to_vec()),
        ) {
            let mut classifier = FailureClassifier::new().expect("classifier");
            let ctx = ClassificationContext {
                case_id: "prop",
                actual: &actual,
                expected: &expected,
                transcript,
                notes,
            };
            let first = classifier.resolve(field, &ctx);
            let second = classifier.resolve(field, &ctx);
            prop_assert_eq!(first, second);
            prop_assert_eq!(first.field(), field);

            let recorded = classifier.classify(field, &ctx);
            prop_assert_eq!(recorded, first);
            prop_assert_eq!(classifier.total_entries(), 1);
            prop_assert_eq!(classifier.count(first), 1);
        }
    }
}
