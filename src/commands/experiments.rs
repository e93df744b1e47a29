use std::collections::BTreeMap;
use std::io::{self, Write};

use anyhow::{Context, Result, bail};
use serde_json::Value;
use tracing::info;

use crate::cli::{AddExperimentArgs, ExperimentAction, ExperimentsArgs};
use crate::harness::EvalPaths;
use crate::harness::experiment_store::ExperimentStore;
use crate::harness::experiments::{ExperimentDefinition, ExperimentEngine, registry};

pub fn run(args: ExperimentsArgs) -> Result<()> {
    let paths = EvalPaths::new(&args.eval_root);
    match args.action {
        ExperimentAction::List => {
            let store = ExperimentStore::open_existing(&paths.experiment_store_path())?;
            let definitions = ExperimentEngine::new(store.as_ref()).definitions()?;
            let mut output = io::BufWriter::new(io::stdout().lock());
            write_listing(&mut output, &definitions)?;
            output.flush()?;
            Ok(())
        }
        ExperimentAction::Add(add) => {
            let definition = parse_definition(&add)?;
            let store = ExperimentStore::open(&paths.experiment_store_path())?;
            store.upsert(&definition)?;
            info!(
                experiment = %definition.name,
                env_overrides = definition.env.len(),
                config_overrides = definition.config.len(),
                "custom experiment saved"
            );
            Ok(())
        }
        ExperimentAction::Remove(remove) => {
            if is_builtin(&remove.name) {
                bail!("experiment '{}' is built in and cannot be removed", remove.name);
            }
            let Some(store) = ExperimentStore::open_existing(&paths.experiment_store_path())?
            else {
                bail!("no custom experiment named '{}'", remove.name);
            };
            if !store.remove(&remove.name)? {
                bail!("no custom experiment named '{}'", remove.name);
            }
            info!(experiment = %remove.name, "custom experiment removed");
            Ok(())
        }
    }
}

fn is_builtin(name: &str) -> bool {
    registry().iter().any(|known| known.name == name)
}

fn parse_definition(args: &AddExperimentArgs) -> Result<ExperimentDefinition> {
    let name = args.name.trim();
    if name.is_empty() {
        bail!("experiment name must not be empty");
    }
    if is_builtin(name) {
        bail!("experiment '{name}' is built in and cannot be redefined");
    }

    let mut env = BTreeMap::new();
    for pair in &args.env {
        let (key, value) = split_pair(pair)?;
        env.insert(key.to_string(), value.to_string());
    }

    let mut config = BTreeMap::new();
    for pair in &args.config {
        let (key, raw) = split_pair(pair)?;
        let value = serde_json::from_str::<Value>(raw)
            .unwrap_or_else(|_| Value::String(raw.to_string()));
        config.insert(key.to_string(), value);
    }

    if env.is_empty() && config.is_empty() {
        bail!("experiment '{name}' needs at least one --env or --set override");
    }

    Ok(ExperimentDefinition {
        name: name.to_string(),
        description: args.description.clone(),
        env,
        config,
    })
}

fn split_pair(pair: &str) -> Result<(&str, &str)> {
    let (key, value) = pair
        .split_once('=')
        .with_context(|| format!("expected KEY=VALUE, got '{pair}'"))?;
    let key = key.trim();
    if key.is_empty() {
        bail!("empty key in '{pair}'");
    }
    Ok((key, value))
}

fn write_listing(output: &mut impl Write, definitions: &[ExperimentDefinition]) -> Result<()> {
    let mut sorted = definitions.iter().collect::<Vec<&ExperimentDefinition>>();
    sorted.sort_by(|left, right| left.name.cmp(&right.name));
    for definition in sorted {
        let source = if is_builtin(&definition.name) {
            "builtin"
        } else {
            "custom"
        };
        writeln!(
            output,
            "{:<28} {:<8} {}",
            definition.name, source, definition.description
        )?;
        for (key, value) in &definition.env {
            writeln!(output, "    env {key}={value}")?;
        }
        for (key, value) in &definition.config {
            writeln!(output, "    set {key}={value}")?;
        }
    }
    Ok(())
}
