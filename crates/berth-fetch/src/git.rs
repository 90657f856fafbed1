use std::fs::File;
use std::path::{Component, Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use url::Url;

pub const DEFAULT_GIT_TIMEOUT: Duration = Duration::from_secs(180);
pub const DEFAULT_ALLOWED_HOSTS: [&str; 3] = ["github.com", "gitlab.com", "bitbucket.org"];

fn default_true() -> bool {
    true
}

fn default_depth() -> u32 {
    1
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GitArtifact {
    pub repo: String,
    #[serde(rename = "ref")]
    pub git_ref: String,
    #[serde(default = "default_depth")]
    pub depth: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subdir: Option<String>,
    #[serde(default = "default_true")]
    pub strip_vcs: bool,
    #[serde(default)]
    pub recurse_submodules: bool,
    #[serde(default)]
    pub lfs: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verify_sha: Option<String>,
}

#[derive(Debug, Clone)]
pub struct GitFetchOptions {
    pub git_bin: PathBuf,
    /// `None` falls back to [`DEFAULT_ALLOWED_HOSTS`]; an explicitly empty
    /// list denies every host.
    pub allow_hosts: Option<Vec<String>>,
    pub allow_insecure_http: bool,
    pub timeout: Duration,
}

impl Default for GitFetchOptions {
    fn default() -> Self {
        Self {
            git_bin: PathBuf::from("git"),
            allow_hosts: None,
            allow_insecure_http: false,
            timeout: DEFAULT_GIT_TIMEOUT,
        }
    }
}

impl GitFetchOptions {
    pub fn from_env() -> Self {
        let git_bin = std::env::var_os("BERTH_GIT_BIN")
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("git"));
        let allow_hosts = std::env::var("BERTH_GIT_ALLOWED_HOSTS").ok().map(|v| {
            v.split(',')
                .map(|h| h.trim().to_string())
                .filter(|h| !h.is_empty())
                .collect()
        });
        let allow_insecure_http = std::env::var("BERTH_GIT_ALLOW_INSECURE")
            .map(|v| v.trim() == "1")
            .unwrap_or(false);
        let timeout = std::env::var("BERTH_GIT_TIMEOUT")
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_GIT_TIMEOUT);
        Self {
            git_bin,
            allow_hosts,
            allow_insecure_http,
            timeout,
        }
    }
}

#[derive(Debug)]
pub enum GitFetchError {
    InvalidRepoUrl { url: String, detail: String },
    InsecureScheme { url: String },
    DisallowedHost { host: String },
    InvalidRef { git_ref: String },
    InvalidSubdir { subdir: String },
    GitMissing { git_bin: String },
    Process { detail: String },
    Timeout { detail: String },
    SubdirMissing { subdir: String },
    VerifyMismatch { expected: String, head: String },
    Io { what: String, detail: String },
}

impl GitFetchError {
    pub fn retryable(&self) -> bool {
        matches!(self, Self::Process { .. } | Self::Timeout { .. })
    }
}

impl std::fmt::Display for GitFetchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidRepoUrl { url, detail } => {
                write!(f, "invalid repo url {url:?}: {detail}")
            }
            Self::InsecureScheme { url } => write!(
                f,
                "repo must be an https url (set BERTH_GIT_ALLOW_INSECURE=1 to allow http): {url}"
            ),
            Self::DisallowedHost { host } => write!(f, "git host not allowed: {host}"),
            Self::InvalidRef { git_ref } => {
                write!(f, "invalid git ref (unsafe characters): {git_ref:?}")
            }
            Self::InvalidSubdir { subdir } => write!(f, "invalid subdir: {subdir:?}"),
            Self::GitMissing { git_bin } => {
                write!(f, "git not found at {git_bin}; install git or set BERTH_GIT_BIN")
            }
            Self::Process { detail } => write!(f, "{detail}"),
            Self::Timeout { detail } => write!(f, "git command timed out: {detail}"),
            Self::SubdirMissing { subdir } => {
                write!(f, "subdir not found in repository: {subdir}")
            }
            Self::VerifyMismatch { expected, head } => {
                write!(f, "HEAD {head} does not match verify_sha {expected}")
            }
            Self::Io { what, detail } => write!(f, "{what}: {detail}"),
        }
    }
}

impl std::error::Error for GitFetchError {}

fn io_err(what: String, err: &std::io::Error) -> GitFetchError {
    GitFetchError::Io {
        what,
        detail: err.to_string(),
    }
}

/// Materialize a git artifact into `target`.
///
/// The repository host is checked against the allow-list before any git
/// process is spawned; plain-http remotes need the explicit insecure
/// override. Returns non-fatal warnings (currently only from `git lfs pull`).
pub fn fetch_git_artifact(
    spec: &GitArtifact,
    target: &Path,
    opts: &GitFetchOptions,
) -> Result<Vec<String>, GitFetchError> {
    let repo = spec.repo.trim();
    let url = Url::parse(repo).map_err(|e| GitFetchError::InvalidRepoUrl {
        url: spec.repo.clone(),
        detail: e.to_string(),
    })?;
    match url.scheme() {
        "https" => {}
        "http" if opts.allow_insecure_http => {}
        _ => {
            return Err(GitFetchError::InsecureScheme {
                url: spec.repo.clone(),
            })
        }
    }
    let host = url.host_str().unwrap_or("").to_string();
    if host.is_empty() {
        return Err(GitFetchError::InvalidRepoUrl {
            url: spec.repo.clone(),
            detail: "missing host".to_string(),
        });
    }
    let default_hosts: Vec<String> = DEFAULT_ALLOWED_HOSTS.iter().map(|s| s.to_string()).collect();
    let allow = opts.allow_hosts.as_ref().unwrap_or(&default_hosts);
    if !host_allowed(&host, allow) {
        return Err(GitFetchError::DisallowedHost { host });
    }

    let git_ref = spec.git_ref.trim();
    if !ref_is_safe(git_ref) {
        return Err(GitFetchError::InvalidRef {
            git_ref: spec.git_ref.clone(),
        });
    }
    let subdir = normalize_subdir(spec.subdir.as_deref())?;

    std::fs::create_dir_all(target)
        .map_err(|e| io_err(format!("create target dir {}", target.display()), &e))?;

    let scratch = scratch_dir()?;
    let result = clone_into(spec, repo, git_ref, subdir.as_deref(), target, opts, &scratch);
    let _ = std::fs::remove_dir_all(&scratch);
    result
}

fn clone_into(
    spec: &GitArtifact,
    repo: &str,
    git_ref: &str,
    subdir: Option<&str>,
    target: &Path,
    opts: &GitFetchOptions,
    scratch: &Path,
) -> Result<Vec<String>, GitFetchError> {
    let mut warnings = Vec::new();

    run_git(opts, &["--version"], None, scratch, Duration::from_secs(15))?;

    let clone_dir = scratch.join("checkout");
    let depth = spec.depth.max(1).to_string();
    let clone_dir_str = clone_dir.display().to_string();
    let mut clone_args: Vec<&str> = vec![
        "clone",
        "--filter=blob:none",
        "--no-checkout",
        "--depth",
        depth.as_str(),
    ];
    if spec.recurse_submodules {
        clone_args.push("--recurse-submodules");
    }
    clone_args.push(repo);
    clone_args.push(clone_dir_str.as_str());
    run_git(opts, &clone_args, None, scratch, opts.timeout)?;

    if let Some(sub) = subdir {
        run_git(
            opts,
            &["sparse-checkout", "init", "--cone"],
            Some(&clone_dir),
            scratch,
            opts.timeout,
        )?;
        run_git(
            opts,
            &["sparse-checkout", "set", sub],
            Some(&clone_dir),
            scratch,
            opts.timeout,
        )?;
    }

    run_git(
        opts,
        &["-c", "advice.detachedHead=false", "checkout", "--detach", git_ref],
        Some(&clone_dir),
        scratch,
        opts.timeout,
    )?;

    if spec.lfs {
        if let Err(err) = run_git(opts, &["lfs", "pull"], Some(&clone_dir), scratch, opts.timeout) {
            warnings.push(format!("git lfs pull failed (continuing): {err}"));
        }
    }

    if let Some(expected) = spec
        .verify_sha
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
    {
        let head = run_git(
            opts,
            &["rev-parse", "--verify", "HEAD"],
            Some(&clone_dir),
            scratch,
            opts.timeout,
        )?;
        if !head
            .to_ascii_lowercase()
            .starts_with(&expected.to_ascii_lowercase())
        {
            return Err(GitFetchError::VerifyMismatch {
                expected: expected.to_string(),
                head,
            });
        }
    }

    let src = match subdir {
        Some(sub) => clone_dir.join(sub),
        None => clone_dir.clone(),
    };
    if !src.is_dir() {
        return Err(GitFetchError::SubdirMissing {
            subdir: subdir.unwrap_or_default().to_string(),
        });
    }

    copy_tree(&src, target, spec.strip_vcs)?;
    if spec.strip_vcs {
        let git_dir = target.join(".git");
        if git_dir.exists() {
            let _ = std::fs::remove_dir_all(&git_dir);
        }
    }

    Ok(warnings)
}

/// Run one git command with explicit argv, no shell, capturing output to
/// scratch files so a chatty child cannot stall the deadline loop.
fn run_git(
    opts: &GitFetchOptions,
    args: &[&str],
    cwd: Option<&Path>,
    scratch: &Path,
    timeout: Duration,
) -> Result<String, GitFetchError> {
    let out_path = scratch.join("git-stdout");
    let err_path = scratch.join("git-stderr");
    let out_file =
        File::create(&out_path).map_err(|e| io_err(format!("create {}", out_path.display()), &e))?;
    let err_file =
        File::create(&err_path).map_err(|e| io_err(format!("create {}", err_path.display()), &e))?;

    let mut cmd = Command::new(&opts.git_bin);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::from(out_file))
        .stderr(Stdio::from(err_file));
    if let Some(cwd) = cwd {
        cmd.current_dir(cwd);
    }
    let mut child = cmd.spawn().map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            GitFetchError::GitMissing {
                git_bin: opts.git_bin.display().to_string(),
            }
        } else {
            GitFetchError::Process {
                detail: format!("spawn git {}: {e}", args.first().copied().unwrap_or("")),
            }
        }
    })?;

    let deadline = Instant::now() + timeout;
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) => {}
            Err(e) => {
                return Err(GitFetchError::Process {
                    detail: format!("wait for git: {e}"),
                })
            }
        }
        if Instant::now() >= deadline {
            let _ = child.kill();
            let _ = child.wait();
            let shown: Vec<&str> = args.iter().take(3).copied().collect();
            return Err(GitFetchError::Timeout {
                detail: format!("git {} ...", shown.join(" ")),
            });
        }
        std::thread::sleep(Duration::from_millis(25));
    };

    let stdout = std::fs::read_to_string(&out_path).unwrap_or_default();
    if !status.success() {
        let stderr = std::fs::read_to_string(&err_path).unwrap_or_default();
        return Err(GitFetchError::Process {
            detail: format!(
                "git {} failed ({status}): {}",
                args.first().copied().unwrap_or(""),
                stderr.trim()
            ),
        });
    }
    Ok(stdout.trim().to_string())
}

fn host_allowed(host: &str, allow: &[String]) -> bool {
    let host = host.to_ascii_lowercase();
    allow
        .iter()
        .map(|h| h.trim().to_ascii_lowercase())
        .filter(|h| !h.is_empty())
        .any(|h| host == h || host.ends_with(&format!(".{h}")))
}

fn ref_is_safe(git_ref: &str) -> bool {
    !git_ref.is_empty()
        && git_ref
            .bytes()
            .all(|b| matches!(b, b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'/' | b'.' | b'_' | b'-' | b'@'))
}

fn normalize_subdir(subdir: Option<&str>) -> Result<Option<String>, GitFetchError> {
    let Some(raw) = subdir else {
        return Ok(None);
    };
    let trimmed = raw.trim().trim_matches('/');
    if trimmed.is_empty() {
        return Ok(None);
    }
    for c in Path::new(trimmed).components() {
        match c {
            Component::Normal(_) | Component::CurDir => {}
            _ => {
                return Err(GitFetchError::InvalidSubdir {
                    subdir: raw.to_string(),
                })
            }
        }
    }
    Ok(Some(trimmed.to_string()))
}

/// Copy `src` into `dst`, optionally skipping a top-level `.git`.
fn copy_tree(src: &Path, dst: &Path, exclude_vcs: bool) -> Result<(), GitFetchError> {
    std::fs::create_dir_all(dst).map_err(|e| io_err(format!("create {}", dst.display()), &e))?;
    for entry in
        std::fs::read_dir(src).map_err(|e| io_err(format!("read_dir {}", src.display()), &e))?
    {
        let entry = entry.map_err(|e| io_err(format!("read_dir {}", src.display()), &e))?;
        let name = entry.file_name();
        if exclude_vcs && name == ".git" {
            continue;
        }
        let ty = entry
            .file_type()
            .map_err(|e| io_err(format!("stat {}", entry.path().display()), &e))?;
        let src_path = entry.path();
        let dst_path = dst.join(&name);
        if ty.is_dir() {
            copy_dir_all(&src_path, &dst_path)?;
        } else if ty.is_file() {
            std::fs::copy(&src_path, &dst_path).map_err(|e| {
                io_err(
                    format!("copy {} -> {}", src_path.display(), dst_path.display()),
                    &e,
                )
            })?;
        }
    }
    Ok(())
}

fn copy_dir_all(src: &Path, dst: &Path) -> Result<(), GitFetchError> {
    std::fs::create_dir_all(dst).map_err(|e| io_err(format!("create {}", dst.display()), &e))?;
    for entry in
        std::fs::read_dir(src).map_err(|e| io_err(format!("read_dir {}", src.display()), &e))?
    {
        let entry = entry.map_err(|e| io_err(format!("read_dir {}", src.display()), &e))?;
        let ty = entry
            .file_type()
            .map_err(|e| io_err(format!("stat {}", entry.path().display()), &e))?;
        let src_path = entry.path();
        let dst_path = dst.join(entry.file_name());
        if ty.is_dir() {
            copy_dir_all(&src_path, &dst_path)?;
        } else if ty.is_file() {
            std::fs::copy(&src_path, &dst_path).map_err(|e| {
                io_err(
                    format!("copy {} -> {}", src_path.display(), dst_path.display()),
                    &e,
                )
            })?;
        }
    }
    Ok(())
}

static SCRATCH_COUNTER: AtomicU64 = AtomicU64::new(0);

fn scratch_dir() -> Result<PathBuf, GitFetchError> {
    let base = std::env::temp_dir();
    let pid = std::process::id();
    for _ in 0..10_000 {
        let n = SCRATCH_COUNTER.fetch_add(1, Ordering::Relaxed);
        let path = base.join(format!("berth_git_{pid}_{n}"));
        if std::fs::create_dir(&path).is_ok() {
            return Ok(path);
        }
    }
    Err(GitFetchError::Io {
        what: format!("create scratch dir under {}", base.display()),
        detail: "exhausted candidate names".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hosts(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn host_allowed_exact_and_subdomain() {
        let allow = hosts(&["github.com"]);
        assert!(host_allowed("github.com", &allow));
        assert!(host_allowed("GITHUB.COM", &allow));
        assert!(host_allowed("codeload.github.com", &allow));
        assert!(!host_allowed("github.com.evil.io", &allow));
        assert!(!host_allowed("notgithub.com", &allow));
    }

    #[test]
    fn empty_allow_list_denies_everything() {
        assert!(!host_allowed("github.com", &[]));
        assert!(!host_allowed("github.com", &hosts(&["", "  "])));
    }

    #[test]
    fn ref_charset() {
        assert!(ref_is_safe("main"));
        assert!(ref_is_safe("v1.2.3"));
        assert!(ref_is_safe("feature/x_y-z@2"));
        assert!(ref_is_safe("0123abcd"));
        assert!(!ref_is_safe(""));
        assert!(!ref_is_safe("main branch"));
        assert!(!ref_is_safe("x;rm"));
        assert!(!ref_is_safe("a\tb"));
    }

    #[test]
    fn subdir_normalization() {
        assert_eq!(normalize_subdir(None).unwrap(), None);
        assert_eq!(normalize_subdir(Some("  ")).unwrap(), None);
        assert_eq!(
            normalize_subdir(Some("/src/lib/")).unwrap(),
            Some("src/lib".to_string())
        );
        assert!(normalize_subdir(Some("../escape")).is_err());
    }

    #[test]
    fn retryable_classification() {
        assert!(GitFetchError::Timeout { detail: "d".into() }.retryable());
        assert!(!GitFetchError::DisallowedHost {
            host: "h".into()
        }
        .retryable());
        assert!(!GitFetchError::VerifyMismatch {
            expected: "a".into(),
            head: "b".into()
        }
        .retryable());
    }
}
