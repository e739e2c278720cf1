//! Server lock file kept next to the database.
//!
//! Instance claims live inside one process, so a `recover` run against a
//! database that `serve` is driving would start a second run of every
//! RUNNING instance. `serve` writes `<db>.serve.lock` for as long as it is
//! up and `recover` refuses to start while a live server holds it.

use std::ffi::OsString;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

#[derive(Debug, Serialize, Deserialize)]
pub struct LockInfo {
    pub pid: u32,
    pub addr: String,
    pub started_at_epoch_secs: u64,
}

pub fn lock_path(db_path: &Path) -> PathBuf {
    let mut name = OsString::from(db_path.as_os_str());
    name.push(".serve.lock");
    PathBuf::from(name)
}

/// The server recorded in the lock file, if there is one.
pub fn read_lock(db_path: &Path) -> Result<Option<LockInfo>> {
    let path = lock_path(db_path);
    if !path.exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(&path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let info = serde_json::from_str(&content)
        .with_context(|| format!("{} is not a server lock file", path.display()))?;
    Ok(Some(info))
}

/// Removes the lock file when dropped.
#[derive(Debug)]
pub struct ServeLock {
    path: PathBuf,
}

impl ServeLock {
    /// Take the lock for a server listening on `addr`. Fails while another
    /// live server holds it; a lock left by a dead process is replaced.
    pub fn acquire(db_path: &Path, addr: &str) -> Result<Self> {
        if let Some(existing) = read_lock(db_path)? {
            if existing.pid != std::process::id() && is_process_alive(existing.pid) {
                bail!(
                    "another server (pid {}, {}) is already using this database",
                    existing.pid,
                    existing.addr
                );
            }
            warn!(pid = existing.pid, "replacing stale server lock");
        }

        let path = lock_path(db_path);
        let info = LockInfo {
            pid: std::process::id(),
            addr: addr.to_string(),
            started_at_epoch_secs: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or_default(),
        };
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&path)
            .with_context(|| format!("failed to create {}", path.display()))?;
        file.write_all(serde_json::to_string_pretty(&info)?.as_bytes())?;
        debug!(path = %path.display(), "server lock written");
        Ok(Self { path })
    }
}

impl Drop for ServeLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "failed to remove server lock");
        }
    }
}

/// Refuse to recover while a live server drives the database, unless
/// `force` is set.
pub fn ensure_no_server(db_path: &Path, force: bool) -> Result<()> {
    let Some(holder) = read_lock(db_path)? else {
        return Ok(());
    };
    if force {
        warn!(pid = holder.pid, "recovering despite a server lock");
        return Ok(());
    }
    if !is_process_alive(holder.pid) {
        warn!(pid = holder.pid, "ignoring server lock left by a dead process");
        return Ok(());
    }
    bail!(
        "a server (pid {}, {}) is driving this database; it already recovers \
         on startup (use --force to override)",
        holder.pid,
        holder.addr
    )
}

fn is_process_alive(pid: u32) -> bool {
    #[cfg(unix)]
    {
        Command::new("kill")
            .arg("-0")
            .arg(pid.to_string())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(true)
    }

    #[cfg(not(unix))]
    {
        let _ = pid;
        true
    }
}
