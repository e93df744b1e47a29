use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::{ActualFields, FieldSet};

#[derive(Debug, Clone, Copy, Serialize)]
pub struct CaseMetadata<'a> {
    pub case_id: &'a str,
    pub dataset: &'a str,
    pub notes: Option<&'a str>,
}

/// Explicit engine configuration: the exact environment handed to the engine
/// plus named tuning fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    pub env: BTreeMap<String, String>,
    pub fields: BTreeMap<String, Value>,
}

impl EngineConfig {
    pub fn inherit_process_env() -> Self {
        Self {
            env: std::env::vars().collect(),
            fields: BTreeMap::new(),
        }
    }
}

/// Engines must not keep mutable state between calls: `extract` takes
/// `&self` and its output may depend only on its arguments.
pub trait ExtractionEngine {
    fn describe(&self) -> String;

    /// Files whose contents determine the engine's answers.
    fn source_inputs(&self) -> Vec<PathBuf> {
        Vec::new()
    }

    fn extract(
        &self,
        transcript: &str,
        case: &CaseMetadata<'_>,
        config: &EngineConfig,
    ) -> Result<ActualFields>;
}

#[derive(Debug, Serialize)]
struct EngineRequest<'a> {
    case_id: &'a str,
    dataset: &'a str,
    transcript: &'a str,
    notes: Option<&'a str>,
    config: &'a BTreeMap<String, Value>,
}

/// Runs the engine as a fresh child process per case.
#[derive(Debug, Clone)]
pub struct CommandEngine {
    program: PathBuf,
    args: Vec<String>,
}

impl CommandEngine {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

impl ExtractionEngine for CommandEngine {
    fn describe(&self) -> String {
        std::iter::once(self.program.display().to_string())
            .chain(self.args.iter().cloned())
            .collect::<Vec<String>>()
            .join(" ")
    }

    fn extract(
        &self,
        transcript: &str,
        case: &CaseMetadata<'_>,
        config: &EngineConfig,
    ) -> Result<ActualFields> {
        let request = EngineRequest {
            case_id: case.case_id,
            dataset: case.dataset,
            transcript,
            notes: case.notes,
            config: &config.fields,
        };
        let payload = serde_json::to_vec(&request).context("failed to encode engine request")?;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .env_clear()
            .envs(&config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("failed to spawn engine: {}", self.program.display()))?;

        // A broken pipe means the engine exited early; its exit status decides.
        if let Some(mut stdin) = child.stdin.take()
            && let Err(err) = stdin.write_all(&payload)
            && err.kind() != std::io::ErrorKind::BrokenPipe
        {
            let _ = child.kill();
            let _ = child.wait();
            return Err(err).context("failed to write engine request");
        }

        let output = child
            .wait_with_output()
            .context("failed to wait for engine process")?;
        if !output.status.success() {
            bail!(
                "engine exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let body = stdout
            .lines()
            .rev()
            .find(|line| !line.trim().is_empty())
            .context("engine produced no output")?;
        serde_json::from_str::<ActualFields>(body.trim())
            .with_context(|| format!("failed to decode engine output: {}", body.trim()))
    }
}

#[derive(Debug, Deserialize)]
struct ReplayRecord {
    id: String,
    #[serde(default)]
    dataset: Option<String>,
    #[serde(flatten)]
    fields: FieldSet,
}

/// Serves previously recorded engine outputs keyed by case id.
#[derive(Debug, Clone)]
pub struct ReplayEngine {
    source: Option<PathBuf>,
    outputs: HashMap<String, ActualFields>,
}

impl ReplayEngine {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read replay file {}", path.display()))?;
        let mut outputs = HashMap::new();
        for (index, line) in raw.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let record = serde_json::from_str::<ReplayRecord>(line).with_context(|| {
                format!("invalid replay record at {}:{}", path.display(), index + 1)
            })?;
            outputs.insert(replay_key(record.dataset.as_deref(), &record.id), record.fields);
        }
        Ok(Self {
            source: Some(path.to_path_buf()),
            outputs,
        })
    }

    #[cfg(test)]
    pub fn from_outputs(outputs: HashMap<String, ActualFields>) -> Self {
        Self {
            source: None,
            outputs,
        }
    }
}

fn replay_key(dataset: Option<&str>, case_id: &str) -> String {
    match dataset {
        Some(dataset) => format!("{dataset}/{case_id}"),
        None => case_id.to_string(),
    }
}

impl ExtractionEngine for ReplayEngine {
    fn describe(&self) -> String {
        match &self.source {
            Some(source) => format!("replay:{}", source.display()),
            None => "replay:<memory>".to_string(),
        }
    }

    fn source_inputs(&self) -> Vec<PathBuf> {
        self.source.iter().cloned().collect()
    }

    fn extract(
        &self,
        _transcript: &str,
        case: &CaseMetadata<'_>,
        _config: &EngineConfig,
    ) -> Result<ActualFields> {
        self.outputs
            .get(&replay_key(Some(case.dataset), case.case_id))
            .or_else(|| self.outputs.get(case.case_id))
            .cloned()
            .with_context(|| format!("no recorded output for case {}", case.case_id))
    }
}
