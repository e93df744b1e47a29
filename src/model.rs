use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};

pub const MANIFEST_VERSION: u32 = 1;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    Name,
    Category,
    Urgency,
    Amount,
}

impl Field {
    pub const ALL: [Field; 4] = [Field::Name, Field::Category, Field::Urgency, Field::Amount];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Name => "name",
            Self::Category => "category",
            Self::Urgency => "urgency",
            Self::Amount => "amount",
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The four extracted fields. Used for both the labeled expectation and the
/// engine output.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldSet {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default, alias = "urgency_level", alias = "urgency")]
    pub urgency_level: Option<String>,
    #[serde(
        default,
        alias = "goal_amount",
        alias = "amount",
        deserialize_with = "deserialize_amount"
    )]
    pub goal_amount: Option<f64>,
}

pub type ExpectedFields = FieldSet;
pub type ActualFields = FieldSet;

impl FieldSet {
    pub fn display_value(&self, field: Field) -> Option<String> {
        match field {
            Field::Name => self.name.clone(),
            Field::Category => self.category.clone(),
            Field::Urgency => self.urgency_level.clone(),
            Field::Amount => self.goal_amount.map(format_amount),
        }
    }
}

pub fn format_amount(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{value}")
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawAmount {
    Number(f64),
    Text(String),
}

fn deserialize_amount<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<RawAmount>::deserialize(deserializer)?;
    match raw {
        None => Ok(None),
        Some(RawAmount::Number(value)) => Ok(Some(value)),
        Some(RawAmount::Text(text)) => {
            let trimmed = text.trim();
            if trimmed.is_empty()
                || trimmed.eq_ignore_ascii_case("none")
                || trimmed.eq_ignore_ascii_case("null")
            {
                return Ok(None);
            }
            trimmed
                .replace([',', '$'], "")
                .parse::<f64>()
                .map(Some)
                .map_err(|_| serde::de::Error::custom(format!("invalid amount: {text}")))
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Strictness {
    #[serde(default, alias = "amount_tolerance")]
    pub amount_tolerance: Option<f64>,
    #[serde(default, alias = "allow_fuzzy_name", alias = "fuzzyName")]
    pub allow_fuzzy_name: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestCase {
    pub id: String,
    #[serde(alias = "transcriptText")]
    pub transcript: String,
    pub expected: ExpectedFields,
    #[serde(default)]
    pub strictness: Strictness,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatasetMetadata {
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default, alias = "generator_version")]
    pub generator_version: Option<String>,
    #[serde(default)]
    pub count: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetManifestEntry {
    pub file: String,
    pub sha256: String,
    pub line_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetManifest {
    pub manifest_version: u32,
    pub generated_at: String,
    pub datasets: BTreeMap<String, DatasetManifestEntry>,
    pub manifest_digest: String,
}
