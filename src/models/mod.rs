// Model selection
//
// Resolves the transcription model for a job. An explicit request is used
// as-is; "auto" (or no request) walks an ordered preference list and picks
// the first model already present in the local cache, falling back to the
// head of the list when nothing is cached.

use log::{debug, info, warn};
use std::path::{Path, PathBuf};

/// Model configuration: (name, approximate size_mb, description)
pub const MODEL_CONFIGS: &[(&str, u32, &str)] = &[
    ("tiny", 75, "Fastest processing, lowest accuracy"),
    ("base", 145, "Good balance of speed and accuracy"),
    ("small", 484, "Better accuracy, moderate speed"),
    ("medium", 1530, "High accuracy for professional use"),
    ("large-v2", 3090, "High accuracy, previous large model"),
    ("large-v3", 3090, "Best accuracy, latest large model"),
    ("tiny.en", 75, "English-only tiny model"),
    ("base.en", 145, "English-only base model"),
    ("small.en", 484, "English-only small model"),
    ("medium.en", 1530, "English-only medium model"),
];

/// Request value meaning "choose for me"
pub const AUTO_MODEL: &str = "auto";

pub fn is_known_model(name: &str) -> bool {
    MODEL_CONFIGS.iter().any(|(n, _, _)| *n == name)
}

/// Default HuggingFace hub cache used by the worker's model loader
pub fn default_cache_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".cache").join("huggingface").join("hub"))
}

/// Cache directory name for one model size
fn cache_entry_name(model: &str) -> String {
    format!("models--Systran--faster-whisper-{}", model)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelChoice {
    pub model: String,
    /// Whether the weights are already on disk
    pub cached: bool,
}

#[derive(Debug, Clone)]
pub struct ModelSelector {
    preferences: Vec<String>,
    cache_dir: Option<PathBuf>,
}

impl ModelSelector {
    pub fn new(preferences: Vec<String>, cache_dir: Option<PathBuf>) -> Self {
        Self {
            preferences,
            cache_dir,
        }
    }

    pub fn preferences(&self) -> &[String] {
        &self.preferences
    }

    pub fn is_cached(&self, model: &str) -> bool {
        self.cache_dir
            .as_deref()
            .map(|dir| is_cached_in(dir, model))
            .unwrap_or(false)
    }

    /// Resolve the model for a job
    pub fn select(&self, requested: Option<&str>) -> ModelChoice {
        if let Some(model) = requested.map(str::trim).filter(|m| !m.is_empty() && *m != AUTO_MODEL) {
            if !is_known_model(model) {
                warn!("Model {} is not in the known model list, passing it through", model);
            }
            return ModelChoice {
                model: model.to_string(),
                cached: self.is_cached(model),
            };
        }

        for model in &self.preferences {
            if self.is_cached(model) {
                info!("Auto-selected cached model {}", model);
                return ModelChoice {
                    model: model.clone(),
                    cached: true,
                };
            }
            debug!("Preferred model {} is not cached", model);
        }

        let model = self
            .preferences
            .first()
            .cloned()
            .unwrap_or_else(|| "base".to_string());
        info!("No preferred model cached, falling back to {}", model);
        ModelChoice {
            model,
            cached: false,
        }
    }
}

impl Default for ModelSelector {
    fn default() -> Self {
        Self::new(
            vec!["base".to_string(), "small".to_string(), "tiny".to_string()],
            default_cache_dir(),
        )
    }
}

fn is_cached_in(cache_dir: &Path, model: &str) -> bool {
    cache_dir.join(cache_entry_name(model)).is_dir()
}
