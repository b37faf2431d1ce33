//! Lock files for mutual exclusion across threads and processes.
//!
//! A lock is a file created with `create_new`; it is held until the guard is
//! dropped. The file records who holds it. A process that dies without
//! dropping its guard leaves the file behind, so a lock whose holder is gone
//! (or that is older than [`MAX_LOCK_AGE`]) is reclaimed by the next caller.

use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Locks older than this are reclaimed even if their holder is alive.
pub const MAX_LOCK_AGE: Duration = Duration::from_secs(12 * 60 * 60);

/// An unreadable lock file younger than this is assumed to be mid-write.
const WRITE_GRACE: Duration = Duration::from_secs(5);

/// Contents of a lock file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockHolder {
    pub holder: String,
    pub pid: u32,
    pub acquired_at: DateTime<Utc>,
}

impl LockHolder {
    fn current(holder: &str) -> Self {
        Self {
            holder: holder.to_string(),
            pid: std::process::id(),
            acquired_at: Utc::now(),
        }
    }

    /// Why this holder no longer protects anything, if it doesn't.
    fn stale_reason(&self, now: DateTime<Utc>) -> Option<String> {
        if self.pid != std::process::id() && !is_process_alive(self.pid) {
            return Some(format!("process {} is gone", self.pid));
        }
        let age = now.signed_duration_since(self.acquired_at).to_std().ok()?;
        (age > MAX_LOCK_AGE).then(|| format!("held for {}s", age.as_secs()))
    }
}

impl fmt::Display for LockHolder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (pid {}, since {})",
            self.holder,
            self.pid,
            self.acquired_at.to_rfc3339()
        )
    }
}

#[derive(Debug)]
pub struct LockFile {
    path: PathBuf,
}

impl LockFile {
    /// Take the lock if it is free or stale. Returns `None` when a live
    /// holder has it.
    pub fn try_acquire(path: &Path, holder: &str) -> anyhow::Result<Option<LockFile>> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create lock directory: {}", parent.display()))?;
        }

        // One reclaim attempt; losing that race to another caller means it is held
        for _ in 0..2 {
            if let Some(lock) = Self::create(path, holder)? {
                return Ok(Some(lock));
            }
            match Self::observe(path)? {
                Observed::Gone => continue,
                Observed::Stale { raw, reason } => {
                    if reclaim(path, &raw)? {
                        warn!(lock = %path.display(), reason = %reason, "Reclaimed stale lock");
                    }
                }
                Observed::Held => return Ok(None),
            }
        }
        Ok(None)
    }

    /// Wait for the lock, up to `timeout`.
    pub fn acquire(path: &Path, holder: &str, timeout: Duration) -> anyhow::Result<LockFile> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(lock) = Self::try_acquire(path, holder)? {
                return Ok(lock);
            }
            if Instant::now() >= deadline {
                anyhow::bail!(
                    "Timed out waiting for lock {} (held by {})",
                    path.display(),
                    Self::holder(path)
                        .map(|h| h.to_string())
                        .unwrap_or_else(|| "unknown".to_string())
                );
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    /// Holder recorded in an existing lock file.
    pub fn holder(path: &Path) -> Option<LockHolder> {
        let raw = fs::read_to_string(path).ok()?;
        serde_json::from_str(&raw).ok()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn create(path: &Path, holder: &str) -> anyhow::Result<Option<LockFile>> {
        match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(mut file) => {
                let lock = LockFile {
                    path: path.to_path_buf(),
                };
                let record = serde_json::to_vec(&LockHolder::current(holder))
                    .context("Failed to serialize lock holder")?;
                file.write_all(&record)
                    .with_context(|| format!("Failed to write lock file: {}", path.display()))?;
                Ok(Some(lock))
            }
            Err(err) if err.kind() == ErrorKind::AlreadyExists => Ok(None),
            Err(err) => {
                Err(err).with_context(|| format!("Failed to create lock file: {}", path.display()))
            }
        }
    }

    fn observe(path: &Path) -> anyhow::Result<Observed> {
        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Observed::Gone),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("Failed to read lock file: {}", path.display()));
            }
        };

        let reason = match serde_json::from_str::<LockHolder>(&raw) {
            Ok(holder) => holder.stale_reason(Utc::now()),
            Err(_) => {
                let age = fs::metadata(path)
                    .and_then(|m| m.modified())
                    .ok()
                    .and_then(|modified| SystemTime::now().duration_since(modified).ok());
                age.filter(|age| *age > WRITE_GRACE)
                    .map(|_| "lock file is unreadable".to_string())
            }
        };

        Ok(match reason {
            Some(reason) => Observed::Stale { raw, reason },
            None => Observed::Held,
        })
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

enum Observed {
    Gone,
    Held,
    Stale { raw: String, reason: String },
}

/// Remove a stale lock file, unless it changed since it was judged stale.
///
/// The file is moved aside first so a concurrent reclaimer cannot delete a
/// fresh lock taken in between.
fn reclaim(path: &Path, observed: &str) -> anyhow::Result<bool> {
    let aside = path.with_extension(format!(
        "stale-{}-{}",
        std::process::id(),
        Utc::now().timestamp_nanos_opt().unwrap_or_default()
    ));
    match fs::rename(path, &aside) {
        Ok(()) => {}
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(false),
        Err(err) => {
            return Err(err)
                .with_context(|| format!("Failed to reclaim lock file: {}", path.display()));
        }
    }

    let taken = fs::read_to_string(&aside).unwrap_or_default();
    if taken != observed {
        // A live holder replaced the stale file; put its lock back
        let _ = fs::hard_link(&aside, path);
        let _ = fs::remove_file(&aside);
        return Ok(false);
    }
    fs::remove_file(&aside)
        .with_context(|| format!("Failed to remove stale lock: {}", aside.display()))?;
    Ok(true)
}

/// Conservative liveness check; platforms without one report alive.
fn is_process_alive(pid: u32) -> bool {
    #[cfg(target_os = "linux")]
    {
        Path::new(&format!("/proc/{pid}")).exists()
    }
    #[cfg(target_os = "macos")]
    {
        std::process::Command::new("ps")
            .args(["-p", &pid.to_string()])
            .output()
            .map(|o| o.status.success())
            .unwrap_or(true)
    }
    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    {
        let _ = pid;
        true
    }
}
