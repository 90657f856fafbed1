use std::collections::BTreeSet;
use std::fs::OpenOptions;
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Serialize;

use berth_install::runner::{load_runner, RunnerDescriptor, RunnerKind, RunnerResolveError};
use berth_install::RUNNER_FILE;

use crate::registry::{pid_alive, LockInfo, LockRegistry, LOCK_SCHEMA_VERSION};
use crate::RuntimeHome;

pub const DEFAULT_PORT_BASE: u16 = 7300;
const PORT_SCAN_ATTEMPTS: u16 = 100;
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(5);
const HEALTH_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub enum SupervisorError {
    InvalidAlias { alias: String, detail: &'static str },
    AlreadyRunning { alias: String, pid: u32 },
    RunnerMissing { path: PathBuf },
    RunnerInvalid { path: PathBuf, detail: String },
    EnvNotPrepared { detail: String },
    Spawn { detail: String },
    PortExhausted { base: u16, attempts: u16 },
    Io { what: String, detail: String },
}

impl std::fmt::Display for SupervisorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidAlias { alias, detail } => write!(f, "invalid alias {alias:?}: {detail}"),
            Self::AlreadyRunning { alias, pid } => {
                write!(f, "alias {alias:?} is already running (pid {pid})")
            }
            Self::RunnerMissing { path } => {
                write!(f, "runner descriptor not found: {}", path.display())
            }
            Self::RunnerInvalid { path, detail } => {
                write!(f, "invalid runner descriptor {}: {detail}", path.display())
            }
            Self::EnvNotPrepared { detail } => write!(f, "environment not prepared: {detail}"),
            Self::Spawn { detail } => write!(f, "failed to start process: {detail}"),
            Self::PortExhausted { base, attempts } => write!(
                f,
                "no free port found in {attempts} attempts starting at {base}"
            ),
            Self::Io { what, detail } => write!(f, "{what}: {detail}"),
        }
    }
}

impl std::error::Error for SupervisorError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DoctorStatus {
    Ok,
    Fail,
}

#[derive(Debug, Clone, Serialize)]
pub struct DoctorReport {
    pub status: DoctorStatus,
    pub reason: String,
}

impl DoctorReport {
    pub fn is_ok(&self) -> bool {
        self.status == DoctorStatus::Ok
    }

    fn ok(reason: impl Into<String>) -> Self {
        Self {
            status: DoctorStatus::Ok,
            reason: reason.into(),
        }
    }

    fn fail(reason: impl Into<String>) -> Self {
        Self {
            status: DoctorStatus::Fail,
            reason: reason.into(),
        }
    }
}

/// Per-alias process lifecycle built on [`LockRegistry`] and OS process
/// primitives. absent -> starting -> running -> stopped, collapsing back to
/// absent once a stale record is reconciled away.
pub struct Supervisor {
    home: RuntimeHome,
    registry: LockRegistry,
}

impl Supervisor {
    pub fn new(home: RuntimeHome) -> Result<Self, SupervisorError> {
        for dir in [home.state_dir(), home.logs_dir()] {
            std::fs::create_dir_all(&dir)
                .map_err(|e| io_err(format!("create {}", dir.display()), &e))?;
        }
        let registry = LockRegistry::new(home.state_dir());
        Ok(Self { home, registry })
    }

    pub fn registry(&self) -> &LockRegistry {
        &self.registry
    }

    pub fn log_path(&self, alias: &str) -> PathBuf {
        self.home.log_path(alias)
    }

    /// Spawn the target's runner and record it under `alias`.
    ///
    /// Fails with `AlreadyRunning` when a live record exists; the registry is
    /// re-checked immediately before the spawn so two racing starts for the
    /// same alias get exactly one winner.
    pub fn start(
        &self,
        target: &Path,
        alias: Option<&str>,
        requested_port: Option<u16>,
    ) -> Result<LockInfo, SupervisorError> {
        let target = std::fs::canonicalize(target)
            .map_err(|e| io_err(format!("resolve target {}", target.display()), &e))?;
        let alias = match alias {
            Some(a) => a.to_string(),
            None => target
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default(),
        };
        validate_alias(&alias)?;

        if let Some(existing) = self.registry.read(&alias).map_err(reg_io)? {
            return Err(SupervisorError::AlreadyRunning {
                alias,
                pid: existing.pid,
            });
        }

        let runner_path = target.join(RUNNER_FILE);
        if !runner_path.is_file() {
            return Err(SupervisorError::RunnerMissing { path: runner_path });
        }
        let runner = load_runner(&runner_path).map_err(|err| match err {
            RunnerResolveError::Invalid { path, detail } => {
                SupervisorError::RunnerInvalid { path, detail }
            }
            other => SupervisorError::Io {
                what: "load runner descriptor".to_string(),
                detail: other.to_string(),
            },
        })?;

        let (program, args) = build_command(&target, &runner)?;
        let port = self.choose_port(requested_port)?;

        if let Some(existing) = self.registry.read(&alias).map_err(reg_io)? {
            return Err(SupervisorError::AlreadyRunning {
                alias,
                pid: existing.pid,
            });
        }

        let log_path = self.home.log_path(&alias);
        if let Some(parent) = log_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| io_err(format!("create {}", parent.display()), &e))?;
        }
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .map_err(|e| io_err(format!("open {}", log_path.display()), &e))?;
        let log_err = log
            .try_clone()
            .map_err(|e| io_err(format!("clone handle for {}", log_path.display()), &e))?;

        let mut cmd = Command::new(&program);
        cmd.args(&args)
            .current_dir(&target)
            .envs(&runner.env)
            .env("PORT", port.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err));
        let child = cmd.spawn().map_err(|e| SupervisorError::Spawn {
            detail: format!("spawn {}: {e}", program.display()),
        })?;

        let info = LockInfo {
            schema_version: LOCK_SCHEMA_VERSION.to_string(),
            alias,
            pid: child.id(),
            port: Some(port),
            target,
            started_at_unix_ms: now_unix_ms(),
            runner_path,
        };
        self.registry.write(&info).map_err(reg_io)?;
        Ok(info)
    }

    /// All currently-live records, stale ones reconciled away.
    pub fn status(&self) -> Result<Vec<LockInfo>, SupervisorError> {
        self.registry.list().map_err(reg_io)
    }

    /// Graceful stop with bounded escalation. Returns `false` when nothing
    /// was running under `alias` (idempotent no-op).
    pub fn stop(&self, alias: &str, grace: Duration) -> Result<bool, SupervisorError> {
        validate_alias(alias)?;
        let Some(info) = self.registry.read(alias).map_err(reg_io)? else {
            return Ok(false);
        };
        terminate(info.pid, grace);
        self.registry.remove(alias).map_err(reg_io)?;
        Ok(true)
    }

    /// Health check: never errors for a merely-unhealthy target.
    pub fn doctor(&self, alias: &str) -> Result<DoctorReport, SupervisorError> {
        validate_alias(alias)?;
        let Some(info) = self.registry.peek(alias).map_err(reg_io)? else {
            return Ok(DoctorReport::fail("not running (no lock record)"));
        };
        if !pid_alive(info.pid) {
            let _ = self.registry.remove(alias);
            return Ok(DoctorReport::fail(format!(
                "process {} is not running",
                info.pid
            )));
        }
        let Some(port) = info.port else {
            return Ok(DoctorReport::ok(format!(
                "process {} is running (no port to probe)",
                info.pid
            )));
        };

        let url = format!("http://127.0.0.1:{port}/health");
        let agent: ureq::Agent = ureq::Agent::config_builder()
            .timeout_global(Some(HEALTH_PROBE_TIMEOUT))
            .build()
            .into();
        match agent.get(&url).call() {
            Ok(resp) => Ok(DoctorReport::ok(format!(
                "responded {} from {url}",
                resp.status()
            ))),
            Err(ureq::Error::StatusCode(code)) => Ok(DoctorReport::fail(format!(
                "health endpoint returned http {code} at {url}"
            ))),
            Err(err) => Ok(DoctorReport::fail(format!(
                "health probe failed for {url}: {err}"
            ))),
        }
    }

    /// Last `n` lines of the alias log, re-read from the start each call. A
    /// shorter file yields what it has; a missing file yields nothing.
    pub fn tail_logs(&self, alias: &str, n: usize) -> Result<Vec<String>, SupervisorError> {
        validate_alias(alias)?;
        let path = self.home.log_path(alias);
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(io_err(format!("read {}", path.display()), &err)),
        };
        let text = String::from_utf8_lossy(&bytes);
        let lines: Vec<String> = text.lines().map(|l| l.to_string()).collect();
        let skip = lines.len().saturating_sub(n);
        Ok(lines[skip..].to_vec())
    }

    fn choose_port(&self, requested: Option<u16>) -> Result<u16, SupervisorError> {
        let claimed: BTreeSet<u16> = self
            .registry
            .list()
            .map_err(reg_io)?
            .into_iter()
            .filter_map(|info| info.port)
            .collect();
        pick_port(requested.unwrap_or(DEFAULT_PORT_BASE), &claimed)
    }
}

fn build_command(
    target: &Path,
    runner: &RunnerDescriptor,
) -> Result<(PathBuf, Vec<String>), SupervisorError> {
    let entry = runner.entry.trim();
    if entry.is_empty() {
        return Err(SupervisorError::RunnerInvalid {
            path: target.join(RUNNER_FILE),
            detail: "missing required entry".to_string(),
        });
    }
    match runner.kind {
        RunnerKind::Python => {
            let venv = target.join(runner.venv_dir());
            let py = if cfg!(windows) {
                venv.join("Scripts").join("python.exe")
            } else {
                venv.join("bin").join("python")
            };
            if !py.is_file() {
                return Err(SupervisorError::EnvNotPrepared {
                    detail: format!(
                        "python interpreter not found at {} (run install to prepare the environment)",
                        py.display()
                    ),
                });
            }
            Ok((py, vec![entry.to_string()]))
        }
        RunnerKind::Node => {
            let node = std::env::var_os("NODE")
                .filter(|v| !v.is_empty())
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("node"));
            Ok((node, vec![entry.to_string()]))
        }
    }
}

/// Scan upward from `base`, skipping ports claimed by live records and ports
/// the OS says are taken. A user-requested base follows the same rule: the
/// bind probe is the ground truth, stale claims do not reserve anything.
fn pick_port(base: u16, claimed: &BTreeSet<u16>) -> Result<u16, SupervisorError> {
    for i in 0..PORT_SCAN_ATTEMPTS {
        let Some(port) = base.checked_add(i) else {
            break;
        };
        if claimed.contains(&port) {
            continue;
        }
        if port_available(port) {
            return Ok(port);
        }
    }
    Err(SupervisorError::PortExhausted {
        base,
        attempts: PORT_SCAN_ATTEMPTS,
    })
}

fn port_available(port: u16) -> bool {
    TcpListener::bind(("127.0.0.1", port)).is_ok()
}

#[cfg(unix)]
fn terminate(pid: u32, grace: Duration) {
    use std::time::Instant;

    let Ok(signed) = i32::try_from(pid) else {
        return;
    };
    if signed <= 0 {
        return;
    }
    unsafe {
        let _ = libc::kill(signed, libc::SIGTERM);
    }
    let deadline = Instant::now() + grace;
    while Instant::now() < deadline {
        if !pid_alive(pid) {
            return;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    unsafe {
        let _ = libc::kill(signed, libc::SIGKILL);
    }
}

#[cfg(not(unix))]
fn terminate(pid: u32, grace: Duration) {
    let _ = (pid, grace);
}

fn validate_alias(alias: &str) -> Result<(), SupervisorError> {
    if alias.is_empty() {
        return Err(SupervisorError::InvalidAlias {
            alias: alias.to_string(),
            detail: "must be non-empty",
        });
    }
    if alias.contains('/') || alias.contains('\\') {
        return Err(SupervisorError::InvalidAlias {
            alias: alias.to_string(),
            detail: "contains path separators",
        });
    }
    if alias.contains("..") {
        return Err(SupervisorError::InvalidAlias {
            alias: alias.to_string(),
            detail: "contains '..'",
        });
    }
    Ok(())
}

fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

fn io_err(what: String, err: &std::io::Error) -> SupervisorError {
    SupervisorError::Io {
        what,
        detail: err.to_string(),
    }
}

fn reg_io(err: anyhow::Error) -> SupervisorError {
    SupervisorError::Io {
        what: "lock registry".to_string(),
        detail: format!("{err:#}"),
    }
}
