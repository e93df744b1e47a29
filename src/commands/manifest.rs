use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use tracing::info;

use crate::cli::ManifestArgs;
use crate::harness::EvalPaths;
use crate::harness::integrity::compute_manifest_digest;
use crate::model::{DatasetManifest, DatasetManifestEntry, MANIFEST_VERSION};
use crate::util::{count_file_lines, now_utc_string, sha256_file, write_json_pretty};

pub fn run(args: ManifestArgs) -> Result<()> {
    let paths = EvalPaths::new(&args.eval_root);
    let manifest = build_manifest(&paths.datasets_dir())?;

    if args.dry_run {
        info!(
            dataset_count = manifest.datasets.len(),
            manifest_digest = %manifest.manifest_digest,
            "manifest dry-run complete"
        );
        return Ok(());
    }

    let manifest_path = paths.manifest_path();
    write_json_pretty(&manifest_path, &manifest)?;
    info!(path = %manifest_path.display(), "wrote dataset manifest");
    info!(
        dataset_count = manifest.datasets.len(),
        manifest_digest = %manifest.manifest_digest,
        "manifest completed"
    );

    Ok(())
}

pub fn build_manifest(datasets_dir: &Path) -> Result<DatasetManifest> {
    let mut dataset_paths = discover_datasets(datasets_dir)?;
    dataset_paths.sort();

    if dataset_paths.is_empty() {
        bail!("no .jsonl datasets found in {}", datasets_dir.display());
    }

    let mut datasets = BTreeMap::new();
    for path in dataset_paths {
        let file = path
            .file_name()
            .and_then(|name| name.to_str())
            .map(ToOwned::to_owned)
            .with_context(|| format!("invalid UTF-8 filename: {}", path.display()))?;
        let name = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .map(ToOwned::to_owned)
            .with_context(|| format!("invalid UTF-8 filename: {}", path.display()))?;

        let entry = DatasetManifestEntry {
            file,
            sha256: sha256_file(&path)?,
            line_count: count_file_lines(&path)?,
        };
        info!(
            dataset = %name,
            line_count = entry.line_count,
            "dataset hashed"
        );
        datasets.insert(name, entry);
    }

    let manifest_digest = compute_manifest_digest(&datasets)?;
    Ok(DatasetManifest {
        manifest_version: MANIFEST_VERSION,
        generated_at: now_utc_string(),
        datasets,
        manifest_digest,
    })
}

fn discover_datasets(datasets_dir: &Path) -> Result<Vec<PathBuf>> {
    let mut datasets = Vec::new();

    let entries = fs::read_dir(datasets_dir)
        .with_context(|| format!("failed to read {}", datasets_dir.display()))?;

    for entry in entries {
        let entry = entry
            .with_context(|| format!("failed to read entry in {}", datasets_dir.display()))?;
        let path = entry.path();

        if !entry
            .file_type()
            .with_context(|| format!("failed to inspect file type: {}", path.display()))?
            .is_file()
        {
            continue;
        }

        let is_jsonl = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("jsonl"));

        if is_jsonl {
            datasets.push(path);
        }
    }

    Ok(datasets)
}
