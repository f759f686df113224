// worker/discovery.rs
//
// Locates the worker executable.

use anyhow::{anyhow, Result};
use std::path::{Path, PathBuf};

/// Environment override for the worker location
pub const WORKER_PATH_ENV: &str = "SCRIBE_WORKER_PATH";

/// Default executable name of the bundled reference worker
pub fn default_worker_name() -> &'static str {
    if cfg!(windows) {
        "scribe-worker.exe"
    } else {
        "scribe-worker"
    }
}

/// Search order: configured path, `SCRIBE_WORKER_PATH`, next to the current
/// executable, `target/{debug,release}` of up to three ancestors, then PATH.
pub fn find_worker_path(configured: Option<&Path>, name: &str) -> Result<PathBuf> {
    if let Some(path) = configured {
        if path.exists() {
            return Ok(path.to_path_buf());
        }
        log::warn!("Configured worker path does not exist: {}", path.display());
    }

    if let Ok(path) = std::env::var(WORKER_PATH_ENV) {
        let path = PathBuf::from(path);
        if path.exists() {
            log::debug!("Found worker via {}: {}", WORKER_PATH_ENV, path.display());
            return Ok(path);
        }
    }

    if let Ok(exe_path) = std::env::current_exe() {
        let exe_dir = exe_path.parent().unwrap_or(Path::new("."));

        let path = exe_dir.join(name);
        if path.exists() {
            log::debug!("Found worker in exe dir: {}", path.display());
            return Ok(path);
        }

        // Dev builds: the caller may live in target/debug/deps
        let mut current = exe_dir;
        for _ in 0..3 {
            let Some(parent) = current.parent() else {
                break;
            };
            for profile in ["debug", "release"] {
                let path = parent.join("target").join(profile).join(name);
                if path.exists() {
                    log::debug!("Found worker at: {}", path.display());
                    return Ok(path);
                }
            }
            current = parent;
        }
    }

    which::which(name).map_err(|_| {
        anyhow!(
            "Worker binary `{}` not found. Set worker.path in the config or {}",
            name,
            WORKER_PATH_ENV
        )
    })
}
