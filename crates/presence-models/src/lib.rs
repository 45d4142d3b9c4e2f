//! Model files and their integrity manifest.
//!
//! A model directory holds the face and eye cascades, the LBPH appearance
//! model and a `manifest.toml` listing the expected SHA-256 of each:
//!
//! ```toml
//! [[model]]
//! name = "face_cascade.json"
//! sha256 = "5838f7fe…"
//! ```

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const FACE_CASCADE: &str = "face_cascade.json";
pub const EYE_CASCADE: &str = "eye_cascade.json";
pub const APPEARANCE_MODEL: &str = "lbph_model.json";
pub const MANIFEST: &str = "manifest.toml";

/// Every file the daemon loads from the model directory.
pub const MODEL_FILES: &[&str] = &[FACE_CASCADE, EYE_CASCADE, APPEARANCE_MODEL];

#[derive(Error, Debug)]
pub enum ModelIntegrityError {
    #[error("model file not found: {name} ({path})")]
    MissingModel { name: String, path: PathBuf },

    #[error("model {name} is not listed in {manifest}")]
    Unlisted { name: String, manifest: PathBuf },

    #[error("failed to open model file: {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read model file: {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid manifest {path}: {reason}")]
    Manifest { path: PathBuf, reason: String },

    #[error(
        "model checksum mismatch for {name} ({path})\n  expected: {expected}\n  got:      {got}"
    )]
    ChecksumMismatch {
        name: String,
        path: PathBuf,
        expected: String,
        got: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelEntry {
    pub name: String,
    pub sha256: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default, rename = "model")]
    pub models: Vec<ModelEntry>,
}

impl Manifest {
    /// Read `manifest.toml` from `model_dir`.
    pub fn load(model_dir: &Path) -> Result<Self, ModelIntegrityError> {
        let path = model_dir.join(MANIFEST);
        let text = fs::read_to_string(&path).map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                ModelIntegrityError::MissingModel {
                    name: MANIFEST.to_string(),
                    path: path.clone(),
                }
            } else {
                ModelIntegrityError::Read {
                    path: path.clone(),
                    source,
                }
            }
        })?;
        toml::from_str(&text).map_err(|e| ModelIntegrityError::Manifest {
            path,
            reason: e.to_string(),
        })
    }

    /// Hash the named files in `model_dir` into a fresh manifest.
    pub fn generate(model_dir: &Path, names: &[&str]) -> Result<Self, ModelIntegrityError> {
        let models = names
            .iter()
            .map(|name| {
                let path = model_dir.join(name);
                if !path.exists() {
                    return Err(ModelIntegrityError::MissingModel {
                        name: name.to_string(),
                        path,
                    });
                }
                Ok(ModelEntry {
                    name: name.to_string(),
                    sha256: sha256_file_hex(&path)?,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { models })
    }

    /// Write as `manifest.toml` into `model_dir`.
    pub fn save(&self, model_dir: &Path) -> Result<PathBuf, ModelIntegrityError> {
        let path = model_dir.join(MANIFEST);
        let text = toml::to_string_pretty(self).map_err(|e| ModelIntegrityError::Manifest {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        fs::write(&path, text).map_err(|source| ModelIntegrityError::Write {
            path: path.clone(),
            source,
        })?;
        Ok(path)
    }

    pub fn entry(&self, name: &str) -> Option<&ModelEntry> {
        self.models.iter().find(|m| m.name == name)
    }

    /// Verify one listed model file.
    pub fn verify(&self, model_dir: &Path, name: &str) -> Result<(), ModelIntegrityError> {
        let entry = self.entry(name).ok_or_else(|| ModelIntegrityError::Unlisted {
            name: name.to_string(),
            manifest: model_dir.join(MANIFEST),
        })?;
        verify_file_sha256(name, &model_dir.join(name), &entry.sha256)
    }
}

/// Compute SHA-256 hex digest of a file.
pub fn sha256_file_hex(path: &Path) -> Result<String, ModelIntegrityError> {
    let mut file = fs::File::open(path).map_err(|source| ModelIntegrityError::Open {
        path: path.to_path_buf(),
        source,
    })?;

    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];

    loop {
        let n = file
            .read(&mut buf)
            .map_err(|source| ModelIntegrityError::Read {
                path: path.to_path_buf(),
                source,
            })?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

pub fn verify_file_sha256(
    name: &str,
    path: &Path,
    expected_sha256: &str,
) -> Result<(), ModelIntegrityError> {
    if !path.exists() {
        return Err(ModelIntegrityError::MissingModel {
            name: name.to_string(),
            path: path.to_path_buf(),
        });
    }

    let digest = sha256_file_hex(path)?;
    if !digest.eq_ignore_ascii_case(expected_sha256) {
        return Err(ModelIntegrityError::ChecksumMismatch {
            name: name.to_string(),
            path: path.to_path_buf(),
            expected: expected_sha256.to_string(),
            got: digest,
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "presence-models-test-{tag}-{}",
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_nanos()
        ))
    }

    fn populated(tag: &str) -> PathBuf {
        let dir = scratch(tag);
        fs::create_dir_all(&dir).unwrap();
        for name in MODEL_FILES {
            fs::write(dir.join(name), format!("{{\"name\":\"{name}\"}}")).unwrap();
        }
        dir
    }

    #[test]
    fn verify_file_sha256_rejects_missing() {
        let path = scratch("missing").join("nope.json");
        let err = verify_file_sha256("nope.json", &path, "00").unwrap_err();
        assert!(matches!(err, ModelIntegrityError::MissingModel { .. }));
    }

    #[test]
    fn verify_file_sha256_rejects_mismatch() {
        let dir = scratch("mismatch");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("model.json");
        fs::write(&path, b"hello").unwrap();

        let err = verify_file_sha256("model.json", &path, "00").unwrap_err();
        assert!(matches!(err, ModelIntegrityError::ChecksumMismatch { .. }));

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn sha256_of_known_content() {
        let dir = scratch("known");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("model.json");
        fs::write(&path, b"hello").unwrap();

        assert_eq!(
            sha256_file_hex(&path).unwrap(),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn generated_manifest_verifies() {
        let dir = populated("generated");
        let manifest = Manifest::generate(&dir, MODEL_FILES).unwrap();
        manifest.save(&dir).unwrap();

        let loaded = Manifest::load(&dir).unwrap();
        assert_eq!(loaded, manifest);
        for name in MODEL_FILES {
            loaded.verify(&dir, name).unwrap();
        }

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn tampered_model_is_detected() {
        let dir = populated("tampered");
        Manifest::generate(&dir, MODEL_FILES).unwrap().save(&dir).unwrap();
        fs::write(dir.join(APPEARANCE_MODEL), b"{}").unwrap();

        let manifest = Manifest::load(&dir).unwrap();
        manifest.verify(&dir, FACE_CASCADE).unwrap();
        let err = manifest.verify(&dir, APPEARANCE_MODEL).unwrap_err();
        assert!(matches!(err, ModelIntegrityError::ChecksumMismatch { .. }));

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn unlisted_model_is_rejected() {
        let dir = populated("unlisted");
        Manifest::generate(&dir, &[FACE_CASCADE]).unwrap().save(&dir).unwrap();

        let manifest = Manifest::load(&dir).unwrap();
        manifest.verify(&dir, FACE_CASCADE).unwrap();
        let err = manifest.verify(&dir, EYE_CASCADE).unwrap_err();
        assert!(matches!(err, ModelIntegrityError::Unlisted { ref name, .. } if name == EYE_CASCADE));

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn missing_manifest_is_reported() {
        let err = Manifest::load(&scratch("no-manifest")).unwrap_err();
        assert!(matches!(err, ModelIntegrityError::MissingModel { ref name, .. } if name == MANIFEST));
    }

    #[test]
    fn save_into_missing_dir_is_write_error() {
        let dir = scratch("unwritable").join("does-not-exist");
        let err = Manifest::default().save(&dir).unwrap_err();
        assert!(matches!(err, ModelIntegrityError::Write { .. }));
    }
}
