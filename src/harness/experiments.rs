use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::errors::EvalError;
use crate::harness::engine::EngineConfig;
use crate::harness::experiment_store::ExperimentStore;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentDefinition {
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub config: BTreeMap<String, Value>,
}

fn definition(
    name: &str,
    description: &str,
    env: &[(&str, &str)],
    config: &[(&str, Value)],
) -> ExperimentDefinition {
    ExperimentDefinition {
        name: name.to_string(),
        description: description.to_string(),
        env: env
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect(),
        config: config
            .iter()
            .map(|(key, value)| (key.to_string(), value.clone()))
            .collect(),
    }
}

pub fn registry() -> Vec<ExperimentDefinition> {
    vec![
        definition(
            "urgency_v2_thresholds",
            "Second-generation urgency thresholds with lower HIGH cut point",
            &[("URGENCY_SCORING_VERSION", "v2")],
            &[
                ("urgency_high_threshold", json!(0.65)),
                ("urgency_critical_threshold", json!(0.85)),
            ],
        ),
        definition(
            "disable_critical_override",
            "Turn off the keyword-driven CRITICAL urgency override",
            &[("URGENCY_CRITICAL_OVERRIDE", "off")],
            &[],
        ),
        definition(
            "compound_amount_parser",
            "Parse compound spoken numbers such as 'thirty-five hundred'",
            &[("AMOUNT_PARSER", "compound")],
            &[("amount_max_tokens", json!(6))],
        ),
        definition(
            "strict_name_reject_filter",
            "Reject captured names that contain filler or intent words",
            &[("NAME_REJECT_FILTER", "strict")],
            &[],
        ),
        definition(
            "category_priority_v2",
            "Revised category priority table with first-mention tie break",
            &[("CATEGORY_PRIORITY_TABLE", "v2")],
            &[("category_tie_break", json!("first_mention"))],
        ),
    ]
}

/// Resolves experiment names against the static registry, then the custom
/// store.
pub struct ExperimentEngine<'s> {
    store: Option<&'s ExperimentStore>,
}

impl<'s> ExperimentEngine<'s> {
    pub fn new(store: Option<&'s ExperimentStore>) -> Self {
        Self { store }
    }

    pub fn definitions(&self) -> Result<Vec<ExperimentDefinition>> {
        let mut definitions = registry();
        if let Some(store) = self.store {
            for custom in store.list()? {
                if !definitions.iter().any(|known| known.name == custom.name) {
                    definitions.push(custom);
                }
            }
        }
        Ok(definitions)
    }

    pub fn available(&self) -> Result<Vec<String>> {
        let mut names = self
            .definitions()?
            .into_iter()
            .map(|definition| definition.name)
            .collect::<Vec<String>>();
        names.sort();
        Ok(names)
    }

    pub fn lookup(&self, name: &str) -> Result<ExperimentDefinition> {
        if let Some(found) = registry().into_iter().find(|known| known.name == name) {
            return Ok(found);
        }
        if let Some(store) = self.store
            && let Some(found) = store.get(name)?
        {
            return Ok(found);
        }
        Err(EvalError::UnknownExperiment {
            name: name.to_string(),
            available: self.available()?,
        }
        .into())
    }

    /// Applies the named experiments to `config` for the lifetime of the
    /// returned session. Earlier activations are rolled back if a later name
    /// is unknown.
    pub fn activate<'c>(
        &self,
        names: &[String],
        config: &'c mut EngineConfig,
    ) -> Result<ExperimentSession<'c>> {
        let mut session = ExperimentSession {
            config,
            env_backups: BTreeMap::new(),
            field_backups: BTreeMap::new(),
            active: Vec::new(),
        };
        for name in names {
            let definition = self.lookup(name)?;
            session.apply(&definition);
            info!(
                experiment = %definition.name,
                env_overrides = definition.env.len(),
                config_overrides = definition.config.len(),
                "experiment activated"
            );
        }
        Ok(session)
    }
}

/// Scoped override guard. Every touched key is restored to its
/// pre-activation value when the session is deactivated or dropped.
#[derive(Debug)]
pub struct ExperimentSession<'c> {
    config: &'c mut EngineConfig,
    env_backups: BTreeMap<String, Option<String>>,
    field_backups: BTreeMap<String, Option<Value>>,
    active: Vec<String>,
}

impl ExperimentSession<'_> {
    pub fn config(&self) -> &EngineConfig {
        self.config
    }

    pub fn active(&self) -> &[String] {
        &self.active
    }

    fn apply(&mut self, definition: &ExperimentDefinition) {
        for (key, value) in &definition.env {
            // First write wins: the restore point is the pre-activation value.
            if !self.env_backups.contains_key(key) {
                let original = self.config.env.get(key).cloned();
                self.env_backups.insert(key.clone(), original);
            }
            self.config.env.insert(key.clone(), value.clone());
        }
        for (key, value) in &definition.config {
            if !self.field_backups.contains_key(key) {
                let original = self.config.fields.get(key).cloned();
                self.field_backups.insert(key.clone(), original);
            }
            self.config.fields.insert(key.clone(), value.clone());
        }
        if !self.active.contains(&definition.name) {
            self.active.push(definition.name.clone());
        }
    }

    pub fn deactivate(&mut self) {
        for (key, original) in std::mem::take(&mut self.env_backups) {
            match original {
                Some(value) => {
                    self.config.env.insert(key, value);
                }
                None => {
                    self.config.env.remove(&key);
                }
            }
        }
        for (key, original) in std::mem::take(&mut self.field_backups) {
            match original {
                Some(value) => {
                    self.config.fields.insert(key, value);
                }
                None => {
                    self.config.fields.remove(&key);
                }
            }
        }
        if !self.active.is_empty() {
            debug!(experiments = %self.active.join(","), "experiment overrides restored");
        }
        self.active.clear();
    }
}

impl Drop for ExperimentSession<'_> {
    fn drop(&mut self) {
        self.deactivate();
    }
}

/// Content-derived identifier over the engine command line and its source
/// inputs. Directories are walked recursively in sorted order.
pub fn compute_engine_fingerprint(engine_description: &str, sources: &[PathBuf]) -> Result<String> {
    let mut hasher = Sha256::new();
    hasher.update(b"engine\0");
    hasher.update(engine_description.as_bytes());
    hasher.update(b"\0");

    let mut ordered = sources.to_vec();
    ordered.sort();
    ordered.dedup();
    for source in &ordered {
        if !source.exists() {
            bail!("engine source input does not exist: {}", source.display());
        }
        let mut files = Vec::<PathBuf>::new();
        collect_source_files(source, &mut files)?;
        files.sort();
        for file in files {
            let relative = file.strip_prefix(source).unwrap_or(&file);
            let bytes =
                fs::read(&file).with_context(|| format!("failed to read {}", file.display()))?;
            hasher.update(relative.to_string_lossy().as_bytes());
            hasher.update(b"\0");
            hasher.update((bytes.len() as u64).to_le_bytes());
            hasher.update(&bytes);
        }
    }

    Ok(format!("{:x}", hasher.finalize()))
}

fn collect_source_files(path: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    if path.is_file() {
        out.push(path.to_path_buf());
        return Ok(());
    }

    let entries =
        fs::read_dir(path).with_context(|| format!("failed to read {}", path.display()))?;
    for entry in entries {
        let entry = entry.with_context(|| format!("failed to read entry in {}", path.display()))?;
        let child = entry.path();
        let hidden = child
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.starts_with('.') || name == "target");
        if hidden {
            continue;
        }
        let file_type = entry
            .file_type()
            .with_context(|| format!("failed to inspect file type: {}", child.display()))?;
        if file_type.is_dir() {
            collect_source_files(&child, out)?;
        } else if file_type.is_file() {
            out.push(child);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn base_config() -> EngineConfig {
        let mut config = EngineConfig::default();
        config
            .env
            .insert("URGENCY_SCORING_VERSION".to_string(), "v1".to_string());
        config
            .env
            .insert("UNRELATED".to_string(), "keep".to_string());
        config
            .fields
            .insert("category_tie_break".to_string(), json!("highest_priority"));
        config
    }

    #[test]
    fn activation_patches_and_deactivation_restores() {
        let engine = ExperimentEngine::new(None);
        let mut config = base_config();
        let before = config.clone();
        {
            let mut session = engine
                .activate(
                    &["urgency_v2_thresholds".to_string(), "category_priority_v2".to_string()],
                    &mut config,
                )
                .expect("activate");
            assert_eq!(session.config().env["URGENCY_SCORING_VERSION"], "v2");
            assert_eq!(session.config().env["CATEGORY_PRIORITY_TABLE"], "v2");
            assert_eq!(session.config().fields["urgency_high_threshold"], json!(0.65));
            assert_eq!(session.config().fields["category_tie_break"], json!("first_mention"));
            assert_eq!(session.active().len(), 2);

            session.deactivate();
            assert_eq!(session.config(), &before);
            assert!(session.active().is_empty());
        }
        assert_eq!(config, before);
    }

    #[test]
    fn drop_restores_overrides_on_early_exit() {
        fn run_that_fails(engine: &ExperimentEngine<'_>, config: &mut EngineConfig) -> Result<()> {
            let session = engine.activate(&["disable_critical_override".to_string()], config)?;
            assert_eq!(session.config().env["URGENCY_CRITICAL_OVERRIDE"], "off");
            bail!("engine crashed mid-run");
        }

        let engine = ExperimentEngine::new(None);
        let mut config = base_config();
        let before = config.clone();
        assert!(run_that_fails(&engine, &mut config).is_err());
        assert_eq!(config, before);
        assert!(!config.env.contains_key("URGENCY_CRITICAL_OVERRIDE"));
    }

    #[test]
    fn unknown_experiment_fails_and_rolls_back_earlier_names() {
        let engine = ExperimentEngine::new(None);
        let mut config = base_config();
        let before = config.clone();
        let err = engine
            .activate(
                &["compound_amount_parser".to_string(), "does_not_exist".to_string()],
                &mut config,
            )
            .expect_err("unknown experiment must fail");
        match err.downcast_ref::<EvalError>() {
            Some(EvalError::UnknownExperiment { name, available }) => {
                assert_eq!(name, "does_not_exist");
                assert!(available.contains(&"compound_amount_parser".to_string()));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(config, before);
    }

    #[test]
    fn overlapping_experiments_keep_first_backup() {
        let engine = ExperimentEngine::new(None);
        let mut config = base_config();
        let before = config.clone();
        {
            let session = engine
                .activate(
                    &[
                        "urgency_v2_thresholds".to_string(),
                        "urgency_v2_thresholds".to_string(),
                    ],
                    &mut config,
                )
                .expect("activate twice");
            assert_eq!(session.active(), &["urgency_v2_thresholds".to_string()]);
        }
        assert_eq!(config.env["URGENCY_SCORING_VERSION"], "v1");
        assert_eq!(config, before);
    }

    #[test]
    fn custom_store_is_consulted_after_registry() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ExperimentStore::open(&dir.path().join("experiments.sqlite")).expect("store");
        store
            .upsert(&definition("local_amounts", "custom", &[("AMOUNT_PARSER", "v9")], &[]))
            .expect("insert custom");

        let engine = ExperimentEngine::new(Some(&store));
        let found = engine.lookup("local_amounts").expect("custom lookup");
        assert_eq!(found.env["AMOUNT_PARSER"], "v9");
        assert!(engine.available().expect("available").contains(&"local_amounts".to_string()));
    }

    #[test]
    fn fingerprint_tracks_source_content() {
        let dir = tempfile::tempdir().expect("tempdir");
        let src = dir.path().join("engine");
        fs::create_dir_all(src.join("nested")).expect("mkdir");
        fs::write(src.join("main.py"), "print('a')").expect("write main");
        fs::write(src.join("nested").join("rules.txt"), "rule").expect("write rules");

        let sources = vec![src.clone()];
        let first = compute_engine_fingerprint("python main.py", &sources).expect("fingerprint");
        let again = compute_engine_fingerprint("python main.py", &sources).expect("fingerprint");
        assert_eq!(first, again);

        fs::write(src.join("nested").join("rules.txt"), "rule2").expect("rewrite rules");
        let changed = compute_engine_fingerprint("python main.py", &sources).expect("fingerprint");
        assert_ne!(first, changed);

        let other_cmd = compute_engine_fingerprint("python other.py", &sources).expect("fingerprint");
        assert_ne!(changed, other_cmd);

        assert!(compute_engine_fingerprint("x", &[dir.path().join("missing")]).is_err());
    }

    proptest! {
        #[test]
        fn activate_then_deactivate_round_trips_config(
            selection in prop::collection::vec(0usize..5, 0..8),
            preset in prop::collection::btree_map(
                prop::sample::select(vec![
                    "URGENCY_SCORING_VERSION",
                    "URGENCY_CRITICAL_OVERRIDE",
                    "AMOUNT_PARSER",
                    "NAME_REJECT_FILTER",
                    "OTHER_KEY",
                ]),
                "[a-z0-9]{1,6}",
                0..5,
            ),
        ) {
            let names = registry()
                .into_iter()
                .map(|definition| definition.name)
                .collect::<Vec<String>>();
            let requested = selection
                .iter()
                .map(|index| names[*index].clone())
                .collect::<Vec<String>>();

            let mut config = EngineConfig::default();
            for (key, value) in &preset {
                config.env.insert(key.to_string(), value.clone());
            }
            let before = config.clone();

            let engine = ExperimentEngine::new(None);
            let mut session = engine.activate(&requested, &mut config).expect("activate");
            session.deactivate();
            prop_assert_eq!(session.config(), &before);
            drop(session);
            prop_assert_eq!(config, before);
        }
    }
}
