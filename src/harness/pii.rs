use std::path::Path;

use anyhow::{Context, Result};
use regex::Regex;
use serde::Serialize;
use tracing::error;

use crate::errors::EvalError;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PiiKind {
    Email,
    Phone,
    Ssn,
    StreetAddress,
    CreditCard,
}

impl PiiKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Email => "email",
            Self::Phone => "phone",
            Self::Ssn => "ssn",
            Self::StreetAddress => "street_address",
            Self::CreditCard => "credit_card",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PiiFinding {
    pub kind: PiiKind,
    pub line: usize,
}

pub struct PiiScanner {
    detectors: Vec<(PiiKind, Regex)>,
}

impl PiiScanner {
    pub fn new() -> Result<Self> {
        let patterns = [
            (PiiKind::Email, r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}"),
            (PiiKind::Ssn, r"\b\d{3}-\d{2}-\d{4}\b"),
            (PiiKind::Phone, r"(?:\(\d{3}\)\s?|\b\d{3}[-.\s])\d{3}[-.\s]\d{4}\b"),
            (
                PiiKind::StreetAddress,
                r"\b\d{1,5}\s+(?:[A-Z][a-z]+\s+){1,3}(?:Street|St|Avenue|Ave|Road|Rd|Boulevard|Blvd|Lane|Ln|Drive|Dr|Court|Ct|Way|Place|Pl)\b",
            ),
            (PiiKind::CreditCard, r"\b(?:\d[ -]?){12,18}\d\b"),
        ];
        let detectors = patterns
            .into_iter()
            .map(|(kind, pattern)| {
                Regex::new(pattern)
                    .map(|regex| (kind, regex))
                    .with_context(|| format!("failed to compile {} detector", kind.as_str()))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { detectors })
    }

    pub fn scan_text(&self, text: &str) -> Vec<PiiFinding> {
        let mut findings = Vec::new();
        for (index, line) in text.lines().enumerate() {
            for (kind, regex) in &self.detectors {
                let hit = regex.find_iter(line).any(|found| {
                    *kind != PiiKind::CreditCard
                        || is_card_number(line, found.start(), found.as_str())
                });
                if hit {
                    findings.push(PiiFinding {
                        kind: *kind,
                        line: index + 1,
                    });
                }
            }
        }
        findings
    }

    /// Gate for content that is about to be written to `path`. Matched values
    /// are never logged, only their kind and line.
    pub fn enforce_clean(&self, path: &Path, text: &str) -> Result<()> {
        let findings = self.scan_text(text);
        if findings.is_empty() {
            return Ok(());
        }
        let described = findings
            .iter()
            .map(|finding| format!("{} at line {}", finding.kind.as_str(), finding.line))
            .collect::<Vec<String>>();
        error!(
            path = %path.display(),
            findings = findings.len(),
            "PII detected in output file"
        );
        Err(EvalError::PiiDetected {
            path: path.to_path_buf(),
            findings: described,
        }
        .into())
    }
}

// Digit runs that are the fractional part of a decimal number are not card
// numbers; the remaining candidates must pass the Luhn check.
fn is_card_number(line: &str, start: usize, candidate: &str) -> bool {
    if line[..start].ends_with('.') {
        return false;
    }
    let digits = candidate
        .chars()
        .filter_map(|ch| ch.to_digit(10))
        .collect::<Vec<u32>>();
    if !(13..=19).contains(&digits.len()) {
        return false;
    }
    let checksum = digits
        .iter()
        .rev()
        .enumerate()
        .map(|(index, digit)| {
            if index % 2 == 1 {
                let doubled = digit * 2;
                if doubled > 9 { doubled - 9 } else { doubled }
            } else {
                *digit
            }
        })
        .sum::<u32>();
    checksum % 10 == 0
}
