//! `presence models` — check and (re)write the model directory's integrity manifest.

use anyhow::{bail, Context, Result};
use presence_models::{sha256_file_hex, Manifest, MANIFEST, MODEL_FILES};
use std::path::{Path, PathBuf};

/// Determine the model directory: `$PRESENCE_MODEL_DIR`, else
/// `$XDG_DATA_HOME/presence/models` (~/.local/share/presence/models).
pub fn default_model_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("PRESENCE_MODEL_DIR") {
        return PathBuf::from(dir);
    }
    let data_home = std::env::var("XDG_DATA_HOME").unwrap_or_else(|_| {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
        format!("{home}/.local/share")
    });
    PathBuf::from(data_home).join("presence/models")
}

fn resolve(model_dir: Option<String>) -> PathBuf {
    model_dir.map(PathBuf::from).unwrap_or_else(default_model_dir)
}

/// Check every model file against the manifest. Fails if any check fails.
pub fn verify(model_dir: Option<String>) -> Result<()> {
    let dir = resolve(model_dir);
    println!("Model directory: {}", dir.display());

    let manifest = Manifest::load(&dir)?;
    let failed = report(&dir, &manifest);

    println!();
    if failed > 0 {
        bail!("{failed} model file(s) failed verification");
    }
    println!("All {} model files verified.", MODEL_FILES.len());
    Ok(())
}

fn report(dir: &Path, manifest: &Manifest) -> usize {
    let mut failed = 0;
    for name in MODEL_FILES {
        match manifest.verify(dir, name) {
            Ok(()) => println!("  {name}: ok"),
            Err(e) => {
                println!("  {name}: FAILED\n    {e}");
                failed += 1;
            }
        }
    }
    failed
}

/// Hash the current model files and write a fresh manifest.
pub fn write_manifest(model_dir: Option<String>, force: bool) -> Result<()> {
    let dir = resolve(model_dir);
    let existing = dir.join(MANIFEST);
    if existing.exists() && !force {
        bail!(
            "{} already exists; pass --force to overwrite",
            existing.display()
        );
    }

    let manifest = Manifest::generate(&dir, MODEL_FILES)
        .with_context(|| format!("failed to hash models in {}", dir.display()))?;
    for entry in &manifest.models {
        println!("  {}  {}", entry.sha256, entry.name);
    }
    let path = manifest.save(&dir)?;
    println!("\nWrote {}", path.display());
    Ok(())
}

/// Print the SHA-256 of a single file.
pub fn hash(path: &Path) -> Result<()> {
    println!("{}  {}", sha256_file_hex(path)?, path.display());
    Ok(())
}
