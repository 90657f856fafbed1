//! File-backed process supervision: a lock registry keyed by alias plus
//! start/stop/status/doctor/log-tail operations. There is no daemon; every
//! invocation is short-lived and liveness is inferred from pid existence.

pub mod registry;
pub mod supervisor;

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use anyhow::{bail, Result};

pub use registry::{pid_alive, LockInfo, LockRegistry, LOCK_SCHEMA_VERSION};
pub use supervisor::{
    DoctorReport, DoctorStatus, Supervisor, SupervisorError, DEFAULT_PORT_BASE, DEFAULT_STOP_GRACE,
};

/// Root for all supervision state. Injected everywhere instead of read as
/// ambient globals so tests get isolated instances.
#[derive(Debug, Clone)]
pub struct RuntimeHome {
    root: PathBuf,
}

impl RuntimeHome {
    pub fn at(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn from_env() -> Result<Self> {
        if let Some(v) = std::env::var_os("BERTH_HOME") {
            if !v.is_empty() {
                return Ok(Self::at(PathBuf::from(v)));
            }
        }
        Ok(Self::at(home_dir()?.join(".berth")))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn state_dir(&self) -> PathBuf {
        self.root.join("state")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn log_path(&self, alias: &str) -> PathBuf {
        self.logs_dir().join(format!("{alias}.log"))
    }
}

fn home_dir() -> Result<PathBuf> {
    if let Some(v) = std::env::var_os("HOME") {
        if !v.is_empty() {
            return Ok(PathBuf::from(v));
        }
    }
    if let Some(v) = std::env::var_os("USERPROFILE") {
        if !v.is_empty() {
            return Ok(PathBuf::from(v));
        }
    }
    if let (Some(drive), Some(path)) = (std::env::var_os("HOMEDRIVE"), std::env::var_os("HOMEPATH"))
    {
        let mut s = OsString::new();
        s.push(drive);
        s.push(path);
        if !s.is_empty() {
            return Ok(PathBuf::from(s));
        }
    }
    bail!("could not determine home directory (HOME/USERPROFILE/HOMEDRIVE+HOMEPATH)");
}
