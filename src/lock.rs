// ABOUTME: Per-source run lock backed by a PID file
// ABOUTME: Keeps two invocations from syncing the same source_name at once

use anyhow::{bail, Context, Result};
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

use crate::utils::sanitize_identifier;

/// Check if a process with the given PID is running
#[cfg(unix)]
fn is_process_running(pid: i32) -> bool {
    // Signal 0 checks existence without delivering anything
    if unsafe { libc::kill(pid, 0) } == 0 {
        return true;
    }
    // EPERM: the process exists but belongs to another user
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// Without a portable liveness probe, assume the holder is alive
#[cfg(not(unix))]
fn is_process_running(_pid: i32) -> bool {
    true
}

/// What an existing lock file says about its holder.
#[derive(Debug, PartialEq, Eq)]
enum Holder {
    Pid(i32),
    /// Empty or garbled; treated as held
    Unreadable,
    /// Removed between the failed link and the read
    Gone,
}

/// Exclusive lock for one `source_name`, released on drop.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
}

impl RunLock {
    /// Default directory for lock files
    pub fn default_dir() -> PathBuf {
        PathBuf::from(".watermark-replicator").join("locks")
    }

    /// Path of the lock file for `source_name` under `lock_dir`.
    pub fn lock_path(lock_dir: &Path, source_name: &str) -> PathBuf {
        lock_dir.join(format!("{}.lock", sanitize_identifier(source_name)))
    }

    /// Acquire the lock for `source_name`, failing fast when another live
    /// process holds it. A lock left behind by a dead process is reclaimed.
    ///
    /// The PID is written to a staged file first and published with a hard
    /// link, which fails if the lock exists. A lock file is therefore never
    /// visible without its PID.
    pub fn acquire(lock_dir: &Path, source_name: &str) -> Result<Self> {
        fs::create_dir_all(lock_dir)
            .with_context(|| format!("Failed to create lock directory: {:?}", lock_dir))?;
        let path = Self::lock_path(lock_dir, source_name);

        let mut staged = NamedTempFile::new_in(lock_dir)
            .with_context(|| format!("Failed to stage lock file in {:?}", lock_dir))?;
        write!(staged, "{}", std::process::id())
            .with_context(|| format!("Failed to write staged lock file: {:?}", staged.path()))?;

        // Two attempts: the second follows reclaiming a stale lock
        for _ in 0..2 {
            match fs::hard_link(staged.path(), &path) {
                Ok(()) => {
                    tracing::debug!("Acquired run lock {:?}", path);
                    return Ok(Self { path });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => match read_holder(&path)? {
                    Holder::Pid(pid) if is_process_running(pid) => {
                        bail!(
                            "Another sync for '{}' is already running (PID: {}). Lock file: {:?}",
                            source_name,
                            pid,
                            path
                        );
                    }
                    Holder::Pid(pid) => {
                        tracing::warn!(
                            "Reclaiming stale lock for '{}' (PID: {})",
                            source_name,
                            pid
                        );
                        match fs::remove_file(&path) {
                            Ok(()) => {}
                            Err(e) if e.kind() == ErrorKind::NotFound => {}
                            Err(e) => {
                                return Err(e).with_context(|| {
                                    format!("Failed to remove stale lock file: {:?}", path)
                                })
                            }
                        }
                    }
                    Holder::Unreadable => {
                        bail!(
                            "Lock file {:?} for '{}' has no readable PID. Remove it if no sync is running",
                            path,
                            source_name
                        );
                    }
                    Holder::Gone => {}
                },
                Err(e) => {
                    return Err(e)
                        .with_context(|| format!("Failed to create lock file: {:?}", path))
                }
            }
        }

        bail!(
            "Could not acquire run lock for '{}': lock file {:?} keeps reappearing",
            source_name,
            path
        )
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            tracing::warn!("Failed to remove lock file {:?}: {}", self.path, e);
        }
    }
}

fn read_holder(path: &Path) -> Result<Holder> {
    match fs::read_to_string(path) {
        Ok(content) => Ok(match content.trim().parse::<i32>() {
            Ok(pid) if pid > 0 => Holder::Pid(pid),
            _ => Holder::Unreadable,
        }),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(Holder::Gone),
        Err(e) => Err(e).with_context(|| format!("Failed to read lock file: {:?}", path)),
    }
}
