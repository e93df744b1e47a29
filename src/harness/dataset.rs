use std::collections::HashSet;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde_json::Value;
use tracing::{debug, warn};

use crate::model::{DatasetMetadata, TestCase};

const METADATA_FLAG: &str = "_meta";

#[derive(Debug, Clone)]
pub struct MalformedRecord {
    pub line_number: usize,
    pub case_id: Option<String>,
    pub error: String,
}

#[derive(Debug, Clone)]
pub struct LoadedDataset {
    pub name: String,
    pub metadata: Option<DatasetMetadata>,
    pub cases: Vec<TestCase>,
    pub malformed: Vec<MalformedRecord>,
}

pub fn load_dataset(name: &str, path: &Path) -> Result<LoadedDataset> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read dataset {}: {}", name, path.display()))?;
    let dataset = parse_dataset(name, &raw);

    if let Some(declared) = dataset.metadata.as_ref().and_then(|meta| meta.count) {
        let observed = dataset.cases.len() + dataset.malformed.len();
        if declared != observed {
            warn!(
                dataset = %name,
                declared,
                observed,
                "dataset metadata count differs from record count"
            );
        }
    }
    debug!(
        dataset = %name,
        cases = dataset.cases.len(),
        malformed = dataset.malformed.len(),
        "loaded dataset"
    );
    Ok(dataset)
}

pub fn parse_dataset(name: &str, raw: &str) -> LoadedDataset {
    let mut metadata = None;
    let mut cases = Vec::<TestCase>::new();
    let mut malformed = Vec::<MalformedRecord>::new();
    let mut seen_ids = HashSet::<String>::new();
    let mut first_record = true;

    for (index, line) in raw.lines().enumerate() {
        let line_number = index + 1;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let value = match serde_json::from_str::<Value>(trimmed) {
            Ok(value) => value,
            Err(err) => {
                malformed.push(MalformedRecord {
                    line_number,
                    case_id: None,
                    error: format!("invalid json: {err}"),
                });
                first_record = false;
                continue;
            }
        };

        let is_first = std::mem::replace(&mut first_record, false);
        if is_first && is_metadata_record(&value) {
            match serde_json::from_value::<DatasetMetadata>(value) {
                Ok(parsed) => metadata = Some(parsed),
                Err(err) => malformed.push(MalformedRecord {
                    line_number,
                    case_id: None,
                    error: format!("invalid metadata record: {err}"),
                }),
            }
            continue;
        }

        let case_id = value
            .get("id")
            .and_then(Value::as_str)
            .map(ToOwned::to_owned);
        match serde_json::from_value::<TestCase>(value) {
            Ok(case) => {
                if let Err(reason) = check_case(&case, &seen_ids) {
                    malformed.push(MalformedRecord {
                        line_number,
                        case_id: Some(case.id),
                        error: reason,
                    });
                    continue;
                }
                seen_ids.insert(case.id.clone());
                cases.push(case);
            }
            Err(err) => malformed.push(MalformedRecord {
                line_number,
                case_id,
                error: format!("invalid test case: {err}"),
            }),
        }
    }

    LoadedDataset {
        name: name.to_string(),
        metadata,
        cases,
        malformed,
    }
}

fn is_metadata_record(value: &Value) -> bool {
    value
        .get(METADATA_FLAG)
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

fn check_case(case: &TestCase, seen_ids: &HashSet<String>) -> std::result::Result<(), String> {
    if case.id.trim().is_empty() {
        return Err("case id is empty".to_string());
    }
    if case.transcript.trim().is_empty() {
        return Err("transcript is empty".to_string());
    }
    if seen_ids.contains(&case.id) {
        return Err(format!("duplicate case id {}", case.id));
    }
    if let Some(tolerance) = case.strictness.amount_tolerance
        && !(tolerance.is_finite() && tolerance >= 0.0)
    {
        return Err(format!("invalid amount tolerance {tolerance}"));
    }
    Ok(())
}
