// jobs/runner_lock.rs
//
// One job runner per work directory. The lock file holds the owner's PID; a
// file naming a process that no longer exists is stale and is taken over.

use anyhow::{anyhow, Context, Result};
use log::{debug, warn};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use sysinfo::{Pid, System};

pub const LOCK_FILE_NAME: &str = "runner.lock";

/// Held for as long as this process may start jobs. Released on drop.
#[derive(Debug)]
pub struct RunnerLock {
    path: PathBuf,
    pid: u32,
}

impl RunnerLock {
    pub fn acquire(dir: &Path) -> Result<Self> {
        let path = dir.join(LOCK_FILE_NAME);
        let pid = std::process::id();

        // Second pass only after removing a stale file
        for _ in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    write!(file, "{}", pid)
                        .with_context(|| format!("Failed to write runner lock {}", path.display()))?;
                    debug!("Acquired runner lock {}", path.display());
                    return Ok(Self { path, pid });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    let owner = read_owner(&path).ok_or_else(|| {
                        anyhow!(
                            "Runner lock {} is unreadable; remove it if no scribe-local is processing jobs",
                            path.display()
                        )
                    })?;
                    if is_alive(owner) {
                        return Err(anyhow!(
                            "Another scribe-local (pid {}) is already processing jobs in {}",
                            owner,
                            dir.display()
                        ));
                    }

                    warn!("Taking over stale runner lock left by pid {}", owner);
                    match fs::remove_file(&path) {
                        Ok(()) => {}
                        Err(e) if e.kind() == ErrorKind::NotFound => {}
                        Err(e) => {
                            return Err(e).with_context(|| {
                                format!("Failed to remove stale runner lock {}", path.display())
                            })
                        }
                    }
                }
                Err(e) => {
                    return Err(e)
                        .with_context(|| format!("Failed to create runner lock {}", path.display()))
                }
            }
        }

        Err(anyhow!("Lost the race for runner lock {}", path.display()))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunnerLock {
    fn drop(&mut self) {
        if read_owner(&self.path) == Some(self.pid) {
            if let Err(e) = fs::remove_file(&self.path) {
                warn!("Failed to release runner lock {}: {}", self.path.display(), e);
            }
        }
    }
}

fn read_owner(path: &Path) -> Option<u32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

fn is_alive(pid: u32) -> bool {
    System::new_all().process(Pid::from_u32(pid)).is_some()
}
