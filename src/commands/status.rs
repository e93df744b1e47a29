use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::cli::StatusArgs;
use crate::harness::EvalPaths;
use crate::harness::experiment_store::ExperimentStore;
use crate::harness::integrity::IntegrityValidator;
use crate::harness::promotion::latest_production;
use crate::harness::report::load_latest_pointer;
use crate::model::DatasetManifest;
use crate::util::{count_file_lines, read_json};

pub fn run(args: StatusArgs) -> Result<()> {
    let paths = EvalPaths::new(&args.eval_root);
    info!(eval_root = %args.eval_root.display(), "status requested");

    let manifest_path = paths.manifest_path();
    if manifest_path.exists() {
        let manifest: DatasetManifest = read_json(&manifest_path)?;
        info!(
            generated_at = %manifest.generated_at,
            dataset_count = manifest.datasets.len(),
            manifest_digest = %manifest.manifest_digest,
            "loaded dataset manifest"
        );
        match IntegrityValidator::new(&paths).validate(&[]) {
            Ok(validated) => info!(
                datasets = %validated.names.join(","),
                "datasets match manifest"
            ),
            Err(err) => warn!(error = %err, "datasets do not match manifest"),
        }
    } else {
        warn!(path = %manifest_path.display(), "dataset manifest missing");
    }

    let pointers = latest_pointer_paths(&paths.reports_dir())?;
    if pointers.is_empty() {
        warn!(path = %paths.reports_dir().display(), "no evaluation reports yet");
    }
    for path in pointers {
        let pointer = load_latest_pointer(&path)?;
        info!(
            pointer = %path.display(),
            run_id = %pointer.run_id,
            status = pointer.status.as_str(),
            report = %pointer.report_path,
            updated_at = %pointer.updated_at,
            "latest report"
        );
    }

    match latest_production(&paths)? {
        Some(production) => info!(
            run_id = %production.run_id,
            report = %production.report_path,
            promoted_at = %production.promoted_at,
            "production baseline"
        ),
        None => warn!("no production baseline promoted"),
    }

    match ExperimentStore::open_existing(&paths.experiment_store_path())? {
        Some(store) => info!(
            path = %paths.experiment_store_path().display(),
            custom_experiments = store.list()?.len(),
            "experiment store"
        ),
        None => info!("no custom experiments defined"),
    }

    let integrity_log = paths.integrity_log_path();
    if integrity_log.exists() {
        warn!(
            path = %integrity_log.display(),
            entries = count_file_lines(&integrity_log)?,
            "integrity failures recorded"
        );
    }

    Ok(())
}

fn latest_pointer_paths(reports_dir: &Path) -> Result<Vec<PathBuf>> {
    if !reports_dir.exists() {
        return Ok(Vec::new());
    }
    let mut pointers = Vec::new();
    let entries = fs::read_dir(reports_dir)
        .with_context(|| format!("failed to read {}", reports_dir.display()))?;
    for entry in entries {
        let entry =
            entry.with_context(|| format!("failed to read entry in {}", reports_dir.display()))?;
        let path = entry.path();
        let is_pointer = path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.starts_with("latest_") && name.ends_with(".json"));
        if is_pointer {
            pointers.push(path);
        }
    }
    pointers.sort();
    Ok(pointers)
}
