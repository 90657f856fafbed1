use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::runner::{RunnerDescriptor, RunnerKind};

pub const DEFAULT_ENV_TIMEOUT: Duration = Duration::from_secs(900);

/// Stamp written inside the venv after a successful dependency install; its
/// presence makes the whole python step a no-op on later calls.
const DEPS_STAMP: &str = ".deps-installed";

#[derive(Debug, Clone)]
pub struct EnvPrepareOptions {
    pub timeout: Duration,
}

impl Default for EnvPrepareOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_ENV_TIMEOUT,
        }
    }
}

impl EnvPrepareOptions {
    pub fn from_env() -> Self {
        let timeout = std::env::var("BERTH_ENV_TIMEOUT")
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_ENV_TIMEOUT);
        Self { timeout }
    }
}

/// What preparation actually ran, as opposed to being skipped because the
/// environment already existed.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EnvReport {
    pub python_prepared: bool,
    pub venv_created: bool,
    pub node_prepared: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

#[derive(Debug)]
pub enum EnvPrepareError {
    ToolMissing { detail: String },
    Install { detail: String },
    Timeout { detail: String },
    Io { what: String, detail: String },
}

impl std::fmt::Display for EnvPrepareError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ToolMissing { detail } => write!(f, "required tool not found: {detail}"),
            Self::Install { detail } => write!(f, "dependency install failed: {detail}"),
            Self::Timeout { detail } => write!(f, "environment step timed out: {detail}"),
            Self::Io { what, detail } => write!(f, "{what}: {detail}"),
        }
    }
}

impl std::error::Error for EnvPrepareError {}

fn io_err(what: String, err: &std::io::Error) -> EnvPrepareError {
    EnvPrepareError::Io {
        what,
        detail: err.to_string(),
    }
}

/// Provision the runtime environment a runner descriptor asks for.
///
/// Python runners get an isolated venv plus a dependency install driven by
/// whatever manifest the target carries; node runners get a package-manager
/// install. Both are idempotent: pre-existing state short-circuits to a
/// no-op recorded in the report.
pub fn prepare_env(
    target: &Path,
    runner: &RunnerDescriptor,
    opts: &EnvPrepareOptions,
) -> Result<EnvReport, EnvPrepareError> {
    let mut report = EnvReport::default();
    let mut notes: Vec<String> = Vec::new();

    if runner.kind == RunnerKind::Python {
        prepare_python(target, runner, opts, &mut report, &mut notes)?;
    }
    // a python runner may also carry a node sub-config
    if runner.kind == RunnerKind::Node || (runner.kind == RunnerKind::Python && runner.node.is_some())
    {
        prepare_node(target, runner, opts, &mut report, &mut notes)?;
    }

    report.notes = if notes.is_empty() {
        None
    } else {
        Some(notes.join("; "))
    };
    Ok(report)
}

fn prepare_python(
    target: &Path,
    runner: &RunnerDescriptor,
    opts: &EnvPrepareOptions,
    report: &mut EnvReport,
    notes: &mut Vec<String>,
) -> Result<(), EnvPrepareError> {
    let venv_path = target.join(runner.venv_dir());
    let py = venv_python(&venv_path);
    let stamp = venv_path.join(DEPS_STAMP);

    if py.is_file() && stamp.is_file() {
        report.python_prepared = true;
        notes.push("python environment already prepared".to_string());
        return Ok(());
    }

    if !py.is_file() {
        let python = host_python();
        let mut cmd = Command::new(&python);
        cmd.args(["-m", "venv"]).arg(&venv_path).current_dir(target);
        run_step(cmd, &format!("{python} -m venv"), opts.timeout)?;
        report.venv_created = true;
    }

    let pyproject = target.join("pyproject.toml");
    let requirements = target.join("requirements.txt");
    let makefile = target.join("Makefile");

    if pyproject.is_file() {
        let contents = std::fs::read_to_string(&pyproject)
            .map_err(|e| io_err(format!("read {}", pyproject.display()), &e))?;
        if poetry_application_mode(&contents) {
            let deps = poetry_dependencies(&contents);
            if deps.is_empty() {
                notes.push("pyproject.toml declares no installable dependencies".to_string());
            } else {
                let mut cmd = Command::new(&py);
                cmd.args(["-m", "pip", "install"]).args(&deps).current_dir(target);
                run_step(cmd, "pip install (pyproject dependencies)", opts.timeout)?;
            }
        } else {
            let mut cmd = Command::new(&py);
            cmd.args(["-m", "pip", "install", "."]).current_dir(target);
            run_step(cmd, "pip install .", opts.timeout)?;
        }
    } else if requirements.is_file() {
        let mut cmd = Command::new(&py);
        cmd.args(["-m", "pip", "install", "-r", "requirements.txt"])
            .current_dir(target);
        run_step(cmd, "pip install -r requirements.txt", opts.timeout)?;
    } else if makefile.is_file() {
        let mut installed = false;
        let mut last = String::new();
        for make_target in ["install", "setup"] {
            let mut cmd = Command::new("make");
            cmd.arg(make_target).current_dir(target);
            match run_step(cmd, &format!("make {make_target}"), opts.timeout) {
                Ok(()) => {
                    installed = true;
                    break;
                }
                Err(err @ EnvPrepareError::Timeout { .. }) => return Err(err),
                Err(err) => last = err.to_string(),
            }
        }
        if !installed {
            return Err(EnvPrepareError::Install {
                detail: format!("Makefile present but no install target succeeded: {last}"),
            });
        }
    } else {
        notes.push(
            "no dependency manifest found (pyproject.toml, requirements.txt, or Makefile)"
                .to_string(),
        );
    }

    std::fs::write(&stamp, b"ok\n").map_err(|e| io_err(format!("write {}", stamp.display()), &e))?;
    report.python_prepared = true;
    Ok(())
}

fn prepare_node(
    target: &Path,
    runner: &RunnerDescriptor,
    opts: &EnvPrepareOptions,
    report: &mut EnvReport,
    notes: &mut Vec<String>,
) -> Result<(), EnvPrepareError> {
    if target.join("node_modules").is_dir() {
        report.node_prepared = true;
        notes.push("node modules already present".to_string());
        return Ok(());
    }

    let node_cfg = runner.node.clone().unwrap_or_default();
    let pm = node_cfg
        .package_manager
        .clone()
        .or_else(|| detect_package_manager(target));
    let Some(pm) = pm else {
        notes.push("node requested but no package manager detected".to_string());
        return Ok(());
    };

    let mut cmd = Command::new(&pm);
    cmd.arg("install")
        .args(&node_cfg.install_args)
        .current_dir(target);
    run_step(cmd, &format!("{pm} install"), opts.timeout)?;
    report.node_prepared = true;
    Ok(())
}

fn venv_python(venv_path: &Path) -> PathBuf {
    if cfg!(windows) {
        venv_path.join("Scripts").join("python.exe")
    } else {
        venv_path.join("bin").join("python")
    }
}

fn host_python() -> String {
    if let Ok(v) = std::env::var("BERTH_PYTHON") {
        let v = v.trim().to_string();
        if !v.is_empty() {
            return v;
        }
    }
    if cfg!(windows) {
        "python".to_string()
    } else {
        "python3".to_string()
    }
}

fn detect_package_manager(target: &Path) -> Option<String> {
    if target.join("pnpm-lock.yaml").is_file() {
        return Some("pnpm".to_string());
    }
    if target.join("yarn.lock").is_file() {
        return Some("yarn".to_string());
    }
    if target.join("package-lock.json").is_file() || target.join("package.json").is_file() {
        return Some("npm".to_string());
    }
    None
}

/// Run one environment step with a deadline, output captured to a scratch
/// file so a chatty installer cannot stall the wait loop.
fn run_step(mut cmd: Command, what: &str, timeout: Duration) -> Result<(), EnvPrepareError> {
    let log = scratch_file()?;
    let out = File::create(&log).map_err(|e| io_err(format!("create {}", log.display()), &e))?;
    let err = out
        .try_clone()
        .map_err(|e| io_err(format!("clone handle for {}", log.display()), &e))?;
    cmd.stdin(Stdio::null())
        .stdout(Stdio::from(out))
        .stderr(Stdio::from(err));

    let mut child = cmd.spawn().map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            EnvPrepareError::ToolMissing {
                detail: format!("{what}: command not found"),
            }
        } else {
            EnvPrepareError::Install {
                detail: format!("{what}: spawn failed: {e}"),
            }
        }
    })?;

    let deadline = Instant::now() + timeout;
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) => {}
            Err(e) => {
                return Err(EnvPrepareError::Install {
                    detail: format!("{what}: wait failed: {e}"),
                })
            }
        }
        if Instant::now() >= deadline {
            let _ = child.kill();
            let _ = child.wait();
            let _ = std::fs::remove_file(&log);
            return Err(EnvPrepareError::Timeout {
                detail: what.to_string(),
            });
        }
        std::thread::sleep(Duration::from_millis(50));
    };

    let output = std::fs::read_to_string(&log).unwrap_or_default();
    let _ = std::fs::remove_file(&log);
    if !status.success() {
        return Err(EnvPrepareError::Install {
            detail: format!("{what} failed ({status}): {}", last_lines(&output, 20)),
        });
    }
    Ok(())
}

fn last_lines(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let skip = lines.len().saturating_sub(n);
    lines[skip..].join("\n").trim().to_string()
}

static SCRATCH_COUNTER: AtomicU64 = AtomicU64::new(0);

fn scratch_file() -> Result<PathBuf, EnvPrepareError> {
    let base = std::env::temp_dir();
    let pid = std::process::id();
    let n = SCRATCH_COUNTER.fetch_add(1, Ordering::Relaxed);
    Ok(base.join(format!("berth_env_{pid}_{n}.log")))
}

/// Minimal pyproject.toml line scan: is this a Poetry project explicitly in
/// non-package (application) mode?
fn poetry_application_mode(contents: &str) -> bool {
    let mut section = String::new();
    for line in contents.lines() {
        let line = line.trim();
        if line.starts_with('[') {
            section = line.trim_matches(|c| c == '[' || c == ']').to_string();
            continue;
        }
        if section == "tool.poetry" {
            if let Some(rest) = line.strip_prefix("package-mode") {
                let rest = rest.trim_start();
                if let Some(value) = rest.strip_prefix('=') {
                    return value.trim() == "false";
                }
            }
        }
    }
    false
}

/// Collect `name = "constraint"` entries from `[tool.poetry.dependencies]`.
/// Table-valued entries and the python version pin are skipped.
fn poetry_dependencies(contents: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut section = String::new();
    for line in contents.lines() {
        let line = line.trim();
        if line.starts_with('[') {
            section = line.trim_matches(|c| c == '[' || c == ']').to_string();
            continue;
        }
        if section != "tool.poetry.dependencies" {
            continue;
        }
        let Some((name, value)) = line.split_once('=') else {
            continue;
        };
        let name = name.trim();
        if name.is_empty() || name.eq_ignore_ascii_case("python") {
            continue;
        }
        let value = value.trim();
        let Some(constraint) = value.strip_prefix('"').and_then(|v| v.strip_suffix('"')) else {
            continue;
        };
        let constraint = constraint.trim();
        if constraint.is_empty() || constraint == "*" {
            out.push(name.to_string());
        } else {
            out.push(format!("{name}{constraint}"));
        }
    }
    out
}
