use presence_core::PipelineConfig;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Daemon configuration.
///
/// Pipeline tuning comes from an optional TOML file (`PRESENCE_CONFIG`);
/// everything else, and the most common pipeline knob, from `PRESENCE_*`
/// environment variables. Environment wins over the file.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory of still images replayed as the camera feed.
    pub frame_dir: PathBuf,
    /// Directory holding the cascade and LBPH model files.
    pub model_dir: PathBuf,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Delay between frames in milliseconds.
    pub frame_interval_ms: u64,
    /// Replay the frame directory from the start once exhausted.
    pub loop_frames: bool,
    /// Checkpoint name written with every attendance record.
    pub checkpoint: String,
    /// Check model files against `manifest.toml` before loading them.
    pub verify_models: bool,
    /// Whether the daemon is running on the session bus (development mode).
    pub session_bus: bool,
    pub pipeline: PipelineConfig,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let data_dir = var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                let home = var("HOME").unwrap_or_else(|| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("presence");

        let mut pipeline = match var("PRESENCE_CONFIG") {
            Some(path) => load_pipeline(Path::new(&path))?,
            None => PipelineConfig::default(),
        };
        if let Some(cutoff) = parse(&var, "PRESENCE_ACCEPT_CUTOFF") {
            pipeline.accept_cutoff = cutoff;
        }
        if let Some(threads) = parse(&var, "PRESENCE_MATCH_THREADS") {
            pipeline.matcher.threads = threads;
        }

        Ok(Self {
            frame_dir: var("PRESENCE_FRAME_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| data_dir.join("frames")),
            model_dir: var("PRESENCE_MODEL_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| data_dir.join("models")),
            db_path: var("PRESENCE_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| data_dir.join("attendance.db")),
            frame_interval_ms: parse(&var, "PRESENCE_FRAME_INTERVAL_MS").unwrap_or(100),
            loop_frames: var("PRESENCE_LOOP_FRAMES").is_some_and(|v| v != "0"),
            checkpoint: var("PRESENCE_CHECKPOINT").unwrap_or_else(|| "main-entrance".to_string()),
            verify_models: var("PRESENCE_VERIFY_MODELS").map_or(true, |v| v != "0"),
            session_bus: var("PRESENCE_SESSION_BUS").is_some(),
            pipeline,
        })
    }

    pub fn face_cascade_path(&self) -> PathBuf {
        self.model_dir.join(presence_models::FACE_CASCADE)
    }

    pub fn eye_cascade_path(&self) -> PathBuf {
        self.model_dir.join(presence_models::EYE_CASCADE)
    }

    pub fn appearance_model_path(&self) -> PathBuf {
        self.model_dir.join(presence_models::APPEARANCE_MODEL)
    }

    /// Optional `identity = "Display Name"` table imported into the roster.
    pub fn roster_path(&self) -> PathBuf {
        self.model_dir.join("roster.toml")
    }
}

fn load_pipeline(path: &Path) -> Result<PipelineConfig, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&text).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn parse<T: std::str::FromStr>(var: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = var(key)?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparsable setting");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(lookup(&[("HOME", "/home/gate")])).unwrap();
        assert_eq!(
            config.db_path,
            PathBuf::from("/home/gate/.local/share/presence/attendance.db")
        );
        assert_eq!(config.frame_interval_ms, 100);
        assert_eq!(config.checkpoint, "main-entrance");
        assert!(config.verify_models);
        assert!(!config.session_bus);
        assert!(!config.loop_frames);
        assert_eq!(config.pipeline.accept_cutoff, 50.0);
    }

    #[test]
    fn test_env_overrides() {
        let config = Config::from_lookup(lookup(&[
            ("PRESENCE_MODEL_DIR", "/srv/models"),
            ("PRESENCE_ACCEPT_CUTOFF", "65"),
            ("PRESENCE_VERIFY_MODELS", "0"),
            ("PRESENCE_SESSION_BUS", "1"),
            ("PRESENCE_FRAME_INTERVAL_MS", "not-a-number"),
        ]))
        .unwrap();
        assert_eq!(
            config.face_cascade_path(),
            PathBuf::from("/srv/models/face_cascade.json")
        );
        assert_eq!(config.pipeline.accept_cutoff, 65.0);
        assert!(!config.verify_models);
        assert!(config.session_bus);
        assert_eq!(config.frame_interval_ms, 100);
    }

    #[test]
    fn test_file_then_env() {
        let path = std::env::temp_dir().join(format!("presence-config-{}.toml", uuid::Uuid::new_v4()));
        std::fs::write(
            &path,
            "accept_cutoff = 70.0\n[tracking]\ngrace_frames = 8\n",
        )
        .unwrap();
        let path_str = path.to_string_lossy().into_owned();

        let from_file = Config::from_lookup(lookup(&[("PRESENCE_CONFIG", path_str.as_str())])).unwrap();
        assert_eq!(from_file.pipeline.accept_cutoff, 70.0);
        assert_eq!(from_file.pipeline.tracking.grace_frames, 8);

        let overridden = Config::from_lookup(lookup(&[
            ("PRESENCE_CONFIG", path_str.as_str()),
            ("PRESENCE_ACCEPT_CUTOFF", "55"),
        ]))
        .unwrap();
        assert_eq!(overridden.pipeline.accept_cutoff, 55.0);
        assert_eq!(overridden.pipeline.tracking.grace_frames, 8);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_bad_file_is_error() {
        let err = Config::from_lookup(lookup(&[("PRESENCE_CONFIG", "/nonexistent/presence.toml")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
