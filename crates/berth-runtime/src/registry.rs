use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub const LOCK_SCHEMA_VERSION: &str = "berth.lock@0.1.0";
pub const LOCK_FILE: &str = "runner.lock.json";

/// Proof-of-running-instance record, one per alias.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockInfo {
    pub schema_version: String,
    pub alias: String,
    pub pid: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    pub target: PathBuf,
    pub started_at_unix_ms: u64,
    pub runner_path: PathBuf,
}

/// Alias -> lock record table backed by one JSON file per alias.
///
/// `read` and `list` reconcile liveness: a record whose pid is gone is
/// removed as a side effect and reported as absent. That is the normal
/// self-healing path after crashes and `kill -9`, not an error.
#[derive(Debug, Clone)]
pub struct LockRegistry {
    state_dir: PathBuf,
}

impl LockRegistry {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
        }
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    pub fn lock_path(&self, alias: &str) -> PathBuf {
        self.state_dir.join(alias).join(LOCK_FILE)
    }

    /// Raw read with no liveness reconciliation. An unreadable record is
    /// dropped rather than wedging every caller.
    pub fn peek(&self, alias: &str) -> Result<Option<LockInfo>> {
        let path = self.lock_path(alias);
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err).with_context(|| format!("read {}", path.display())),
        };
        match serde_json::from_slice::<LockInfo>(&bytes) {
            Ok(info) => Ok(Some(info)),
            Err(_) => {
                let _ = std::fs::remove_file(&path);
                Ok(None)
            }
        }
    }

    pub fn read(&self, alias: &str) -> Result<Option<LockInfo>> {
        match self.peek(alias)? {
            Some(info) if pid_alive(info.pid) => Ok(Some(info)),
            Some(_) => {
                self.remove(alias)?;
                Ok(None)
            }
            None => Ok(None),
        }
    }

    /// Atomic: the record lands via write-then-rename so readers never see a
    /// half-written file.
    pub fn write(&self, info: &LockInfo) -> Result<()> {
        let path = self.lock_path(&info.alias);
        let parent = path.parent().context("lock path has no parent dir")?;
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create_dir_all {}", parent.display()))?;
        let mut bytes = serde_json::to_vec_pretty(info)?;
        bytes.push(b'\n');
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, &bytes).with_context(|| format!("write {}", tmp.display()))?;
        std::fs::rename(&tmp, &path)
            .with_context(|| format!("rename {} -> {}", tmp.display(), path.display()))?;
        Ok(())
    }

    pub fn remove(&self, alias: &str) -> Result<bool> {
        let path = self.lock_path(alias);
        match std::fs::remove_file(&path) {
            Ok(()) => {
                if let Some(parent) = path.parent() {
                    let _ = std::fs::remove_dir(parent);
                }
                Ok(true)
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err).with_context(|| format!("remove {}", path.display())),
        }
    }

    pub fn list(&self) -> Result<Vec<LockInfo>> {
        let mut out = Vec::new();
        let rd = match std::fs::read_dir(&self.state_dir) {
            Ok(rd) => rd,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("read_dir {}", self.state_dir.display()))
            }
        };
        for entry in rd {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let alias = entry.file_name().to_string_lossy().to_string();
            if let Some(info) = self.read(&alias)? {
                out.push(info);
            }
        }
        out.sort_by(|a, b| a.alias.cmp(&b.alias));
        Ok(out)
    }
}

pub fn pid_alive(pid: u32) -> bool {
    #[cfg(unix)]
    {
        let Ok(pid) = i32::try_from(pid) else {
            return false;
        };
        if pid <= 0 {
            return false;
        }
        unsafe { libc::kill(pid, 0) == 0 }
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        true
    }
}
