// Application configuration for scribe-local
//
// Loaded from a JSON file; every field has a default so a partial file (or no
// file at all) is valid.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::models::{default_cache_dir, is_known_model, ModelSelector, AUTO_MODEL};
use crate::transcription::ChunkSettings;
use crate::worker::discovery::default_worker_name;
use crate::worker::{find_worker_path, WorkerSpec, WorkerTimeouts};

/// Environment variable naming the config file
pub const CONFIG_PATH_ENV: &str = "SCRIBE_CONFIG";

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("scribe-local")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Explicit worker executable; discovered when unset
    pub path: Option<PathBuf>,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    /// Prepended to the platform's library search path
    pub library_paths: Vec<PathBuf>,
    pub env: HashMap<String, String>,
    pub startup_timeout_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        let mut env = HashMap::new();
        // Keep a scripted worker from buffering its protocol output
        env.insert("PYTHONUNBUFFERED".to_string(), "1".to_string());
        Self {
            path: None,
            args: Vec::new(),
            working_dir: None,
            library_paths: Vec::new(),
            env,
            startup_timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingConfig {
    pub ceiling_seconds: f64,
    pub overlap_seconds: f64,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        let defaults = ChunkSettings::default();
        Self {
            ceiling_seconds: defaults.ceiling_seconds,
            overlap_seconds: defaults.overlap_seconds,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub ping_secs: u64,
    pub load_model_secs: u64,
    pub transcribe_secs: u64,
    pub diarize_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        let defaults = WorkerTimeouts::default();
        Self {
            ping_secs: defaults.ping.as_secs(),
            load_model_secs: defaults.load_model.as_secs(),
            transcribe_secs: defaults.transcribe.as_secs(),
            diarize_secs: defaults.diarize.as_secs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Tried in order when a job asks for "auto"
    pub preferences: Vec<String>,
    /// Where downloaded weights live; HuggingFace hub cache when unset
    pub cache_dir: Option<PathBuf>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            preferences: ModelSelector::default().preferences().to_vec(),
            cache_dir: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScribeConfig {
    pub database_path: PathBuf,
    /// Scratch space for per-window audio files
    pub work_dir: PathBuf,
    /// ffmpeg used for non-WAV input; found on PATH when unset
    pub ffmpeg_path: Option<PathBuf>,
    pub worker: WorkerConfig,
    pub chunking: ChunkingConfig,
    pub timeouts: TimeoutConfig,
    pub models: ModelConfig,
}

impl Default for ScribeConfig {
    fn default() -> Self {
        let data_dir = default_data_dir();
        Self {
            database_path: data_dir.join("scribe.db"),
            work_dir: data_dir.join("work"),
            ffmpeg_path: None,
            worker: WorkerConfig::default(),
            chunking: ChunkingConfig::default(),
            timeouts: TimeoutConfig::default(),
            models: ModelConfig::default(),
        }
    }
}

impl ScribeConfig {
    /// Parse and validate a JSON config file
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: ScribeConfig = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        config.validate()?;
        log::info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Load `path`, else the file named by `SCRIBE_CONFIG`, else defaults
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Self::load(path);
        }
        if let Ok(from_env) = std::env::var(CONFIG_PATH_ENV) {
            if !from_env.trim().is_empty() {
                return Self::load(Path::new(from_env.trim()));
            }
        }
        log::info!("No config file given, using defaults");
        Ok(Self::default())
    }

    pub fn validate(&self) -> Result<()> {
        self.chunk_settings().validate().context("Invalid chunking settings")?;

        if self.worker.startup_timeout_secs == 0 {
            return Err(anyhow!("worker.startup_timeout_secs must be positive"));
        }
        let timeouts = &self.timeouts;
        if [timeouts.ping_secs, timeouts.load_model_secs, timeouts.transcribe_secs, timeouts.diarize_secs]
            .contains(&0)
        {
            return Err(anyhow!("request timeouts must be positive"));
        }

        for model in &self.models.preferences {
            if model == AUTO_MODEL {
                return Err(anyhow!("\"{}\" cannot appear in the model preference list", AUTO_MODEL));
            }
            if !is_known_model(model) {
                log::warn!("Preferred model {} is not a known model size", model);
            }
        }
        Ok(())
    }

    pub fn chunk_settings(&self) -> ChunkSettings {
        ChunkSettings {
            ceiling_seconds: self.chunking.ceiling_seconds,
            overlap_seconds: self.chunking.overlap_seconds,
        }
    }

    pub fn worker_timeouts(&self) -> WorkerTimeouts {
        WorkerTimeouts {
            ping: Duration::from_secs(self.timeouts.ping_secs),
            load_model: Duration::from_secs(self.timeouts.load_model_secs),
            transcribe: Duration::from_secs(self.timeouts.transcribe_secs),
            diarize: Duration::from_secs(self.timeouts.diarize_secs),
        }
    }

    pub fn model_selector(&self) -> ModelSelector {
        let cache_dir = self.models.cache_dir.clone().or_else(default_cache_dir);
        ModelSelector::new(self.models.preferences.clone(), cache_dir)
    }

    /// Launch description for the worker; fails when no executable is found
    pub fn worker_spec(&self) -> Result<WorkerSpec> {
        let name = default_worker_name();
        let program = find_worker_path(self.worker.path.as_deref(), name)?;

        let mut spec = WorkerSpec::new(name, program);
        spec.args = self.worker.args.clone();
        spec.working_dir = self.worker.working_dir.clone();
        spec.library_paths = self.worker.library_paths.clone();
        spec.env = self.worker.env.clone();
        spec.startup_timeout = Duration::from_secs(self.worker.startup_timeout_secs);
        Ok(spec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults_are_valid() {
        let config = ScribeConfig::default();
        config.validate().unwrap();
        assert_eq!(config.chunk_settings(), ChunkSettings::default());
        assert_eq!(config.worker_timeouts(), WorkerTimeouts::default());
        assert_eq!(config.worker.env.get("PYTHONUNBUFFERED").map(String::as_str), Some("1"));
        assert!(config.database_path.ends_with("scribe-local/scribe.db"));
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{ "chunking": { "ceiling_seconds": 20 }, "timeouts": { "ping_secs": 3 } }"#,
        ).unwrap();

        let config = ScribeConfig::load(&path).unwrap();
        assert_eq!(config.chunking.ceiling_seconds, 20.0);
        assert_eq!(config.chunking.overlap_seconds, 1.0);
        assert_eq!(config.worker_timeouts().ping, Duration::from_secs(3));
        assert_eq!(config.timeouts.transcribe_secs, 1800);
    }

    #[test]
    fn test_rejects_overlap_not_below_ceiling() {
        let mut config = ScribeConfig::default();
        config.chunking.overlap_seconds = config.chunking.ceiling_seconds;
        assert!(config.validate().is_err());

        config.chunking.overlap_seconds = 1.0;
        config.chunking.ceiling_seconds = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_auto_in_preferences_and_zero_timeouts() {
        let mut config = ScribeConfig::default();
        config.models.preferences = vec!["auto".to_string()];
        assert!(config.validate().is_err());

        let mut config = ScribeConfig::default();
        config.timeouts.diarize_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(ScribeConfig::load(&path).is_err());
        assert!(ScribeConfig::load(&dir.path().join("missing.json")).is_err());
    }

    #[test]
    fn test_explicit_worker_path_is_used() {
        let dir = tempdir().unwrap();
        let worker = dir.path().join("my-worker");
        std::fs::write(&worker, "").unwrap();

        let mut config = ScribeConfig::default();
        config.worker.path = Some(worker.clone());
        config.worker.args = vec!["--device".to_string(), "cpu".to_string()];

        let spec = config.worker_spec().unwrap();
        assert_eq!(spec.program, worker);
        assert_eq!(spec.args, config.worker.args);
        assert_eq!(spec.startup_timeout, Duration::from_secs(60));
    }
}
