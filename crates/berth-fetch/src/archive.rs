use std::fs::File;
use std::io::{Read as _, Write as _};
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HttpArtifact {
    pub url: String,
    /// Relative path under the target where the raw download is kept. When
    /// absent the download is only used for unpacking.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dest: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    #[serde(default)]
    pub unpack: bool,
}

#[derive(Debug, Clone)]
pub struct HttpFetchOptions {
    pub timeout: Duration,
}

impl Default for HttpFetchOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_HTTP_TIMEOUT,
        }
    }
}

impl HttpFetchOptions {
    pub fn from_env() -> Self {
        let timeout = std::env::var("BERTH_HTTP_TIMEOUT")
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_HTTP_TIMEOUT);
        Self { timeout }
    }
}

#[derive(Debug)]
pub enum ArchiveFetchError {
    Http { url: String, detail: String },
    Status { url: String, code: u16 },
    Integrity { url: String, expected: String, actual: String },
    UnsafePath { entry: String },
    UnknownFormat { detail: String },
    Io { what: String, detail: String },
}

impl ArchiveFetchError {
    /// Network-shaped failures are worth retrying; integrity and safety
    /// violations are not.
    pub fn retryable(&self) -> bool {
        match self {
            Self::Http { .. } => true,
            Self::Status { code, .. } => *code >= 500,
            Self::Integrity { .. }
            | Self::UnsafePath { .. }
            | Self::UnknownFormat { .. }
            | Self::Io { .. } => false,
        }
    }
}

impl std::fmt::Display for ArchiveFetchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Http { url, detail } => write!(f, "download failed for {url}: {detail}"),
            Self::Status { url, code } => write!(f, "http {code} for {url}"),
            Self::Integrity {
                url,
                expected,
                actual,
            } => write!(f, "sha256 mismatch for {url}: expected {expected} got {actual}"),
            Self::UnsafePath { entry } => write!(f, "unsafe archive entry path: {entry}"),
            Self::UnknownFormat { detail } => {
                write!(f, "cannot unpack unknown archive type: {detail}")
            }
            Self::Io { what, detail } => write!(f, "{what}: {detail}"),
        }
    }
}

impl std::error::Error for ArchiveFetchError {}

fn io_err(what: String, err: &std::io::Error) -> ArchiveFetchError {
    ArchiveFetchError::Io {
        what,
        detail: err.to_string(),
    }
}

/// Download an artifact into `target`, verify integrity when a sha256 is
/// declared, and unpack zip/tar archives with traversal protection.
///
/// Partially written files are left in place on failure so callers can
/// inspect them; the error reports which step failed.
pub fn fetch_http_artifact(
    spec: &HttpArtifact,
    target: &Path,
    opts: &HttpFetchOptions,
) -> Result<(), ArchiveFetchError> {
    std::fs::create_dir_all(target)
        .map_err(|e| io_err(format!("create target dir {}", target.display()), &e))?;

    let agent: ureq::Agent = ureq::Agent::config_builder()
        .timeout_global(Some(opts.timeout))
        .build()
        .into();

    let resp = agent.get(&spec.url).call().map_err(|e| match e {
        ureq::Error::StatusCode(code) => ArchiveFetchError::Status {
            url: spec.url.clone(),
            code,
        },
        other => ArchiveFetchError::Http {
            url: spec.url.clone(),
            detail: other.to_string(),
        },
    })?;
    let mut reader = resp.into_body().into_reader();

    let tmp = target.join(format!(".fetch_{}.part", std::process::id()));
    let mut out =
        File::create(&tmp).map_err(|e| io_err(format!("create {}", tmp.display()), &e))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf).map_err(|e| ArchiveFetchError::Http {
            url: spec.url.clone(),
            detail: format!("read download stream: {e}"),
        })?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        out.write_all(&buf[..n])
            .map_err(|e| io_err(format!("write {}", tmp.display()), &e))?;
    }
    out.flush().ok();
    drop(out);

    if let Some(expected) = spec.sha256.as_deref() {
        let actual = hex_lower(&hasher.finalize());
        if !actual.trim().eq_ignore_ascii_case(expected.trim()) {
            let _ = std::fs::remove_file(&tmp);
            return Err(ArchiveFetchError::Integrity {
                url: spec.url.clone(),
                expected: expected.to_string(),
                actual,
            });
        }
    }

    let raw_path = match spec.dest.as_deref() {
        Some(dest) => {
            let rel = sanitize_rel_path(Path::new(dest))?;
            let dest_path = target.join(rel);
            if let Some(parent) = dest_path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| io_err(format!("create {}", parent.display()), &e))?;
            }
            rename_overwrite_file(&tmp, &dest_path)?;
            Some(dest_path)
        }
        None => None,
    };

    let looks_zip = looks_like_zip(&spec.url, spec.dest.as_deref());
    let looks_tar = looks_like_tar(&spec.url, spec.dest.as_deref());
    if !(spec.unpack || looks_zip || looks_tar) {
        if raw_path.is_none() {
            let _ = std::fs::remove_file(&tmp);
        }
        return Ok(());
    }

    let archive_path = raw_path.clone().unwrap_or_else(|| tmp.clone());
    let extracted = if looks_zip {
        extract_zip(&archive_path, target)
    } else if looks_tar {
        extract_tar(
            &archive_path,
            target,
            looks_like_gzip(&spec.url, spec.dest.as_deref()),
        )
    } else {
        extract_autodetect(&archive_path, target)
    };
    if raw_path.is_none() {
        let _ = std::fs::remove_file(&tmp);
    }
    extracted?;

    flatten_single_dir(target);
    Ok(())
}

fn looks_like_zip(url: &str, dest: Option<&str>) -> bool {
    let u = url.to_ascii_lowercase();
    let d = dest.unwrap_or("").to_ascii_lowercase();
    u.ends_with(".zip") || d.ends_with(".zip")
}

fn looks_like_tar(url: &str, dest: Option<&str>) -> bool {
    let u = url.to_ascii_lowercase();
    let d = dest.unwrap_or("").to_ascii_lowercase();
    [".tar", ".tar.gz", ".tgz"]
        .iter()
        .any(|s| u.ends_with(s) || d.ends_with(s))
}

fn looks_like_gzip(url: &str, dest: Option<&str>) -> bool {
    let u = url.to_ascii_lowercase();
    let d = dest.unwrap_or("").to_ascii_lowercase();
    [".tar.gz", ".tgz"]
        .iter()
        .any(|s| u.ends_with(s) || d.ends_with(s))
}

/// Flagged for unpack but the extension tells us nothing: try zip first,
/// then gzipped tar, then plain tar. A traversal violation from any attempt
/// is surfaced as-is, never masked by the fallback.
fn extract_autodetect(path: &Path, target: &Path) -> Result<(), ArchiveFetchError> {
    match extract_zip(path, target) {
        Ok(()) => return Ok(()),
        Err(err @ ArchiveFetchError::UnsafePath { .. }) => return Err(err),
        Err(_) => {}
    }
    match extract_tar(path, target, true) {
        Ok(()) => return Ok(()),
        Err(err @ ArchiveFetchError::UnsafePath { .. }) => return Err(err),
        Err(_) => {}
    }
    extract_tar(path, target, false).map_err(|e| match e {
        err @ ArchiveFetchError::UnsafePath { .. } => err,
        other => ArchiveFetchError::UnknownFormat {
            detail: other.to_string(),
        },
    })
}

fn extract_zip(path: &Path, target: &Path) -> Result<(), ArchiveFetchError> {
    let f = File::open(path).map_err(|e| io_err(format!("open {}", path.display()), &e))?;
    let mut archive = zip::ZipArchive::new(f).map_err(|e| ArchiveFetchError::UnknownFormat {
        detail: format!("bad zip file: {e}"),
    })?;
    for i in 0..archive.len() {
        let mut file = archive
            .by_index(i)
            .map_err(|e| ArchiveFetchError::UnknownFormat {
                detail: format!("zip entry {i}: {e}"),
            })?;
        let name = file.name().to_string();
        let rel = sanitize_rel_path(Path::new(&name))?;
        let out_path = target.join(rel);
        if file.is_dir() {
            std::fs::create_dir_all(&out_path)
                .map_err(|e| io_err(format!("create {}", out_path.display()), &e))?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| io_err(format!("create {}", parent.display()), &e))?;
        }
        let mut out = File::create(&out_path)
            .map_err(|e| io_err(format!("create {}", out_path.display()), &e))?;
        std::io::copy(&mut file, &mut out)
            .map_err(|e| io_err(format!("write {}", out_path.display()), &e))?;
    }
    Ok(())
}

fn extract_tar(path: &Path, target: &Path, gz: bool) -> Result<(), ArchiveFetchError> {
    let f = File::open(path).map_err(|e| io_err(format!("open {}", path.display()), &e))?;
    let reader: Box<dyn std::io::Read> = if gz {
        Box::new(flate2::read::GzDecoder::new(f))
    } else {
        Box::new(f)
    };
    let mut archive = tar::Archive::new(reader);
    let entries = archive
        .entries()
        .map_err(|e| ArchiveFetchError::UnknownFormat {
            detail: format!("bad tar file: {e}"),
        })?;
    for entry in entries {
        let mut entry = entry.map_err(|e| ArchiveFetchError::UnknownFormat {
            detail: format!("bad tar entry: {e}"),
        })?;
        let entry_path = entry
            .path()
            .map_err(|e| ArchiveFetchError::UnknownFormat {
                detail: format!("bad tar entry path: {e}"),
            })?
            .into_owned();
        let rel = sanitize_rel_path(&entry_path)?;
        let entry_type = entry.header().entry_type();
        let out_path = target.join(rel);
        if entry_type.is_dir() {
            std::fs::create_dir_all(&out_path)
                .map_err(|e| io_err(format!("create {}", out_path.display()), &e))?;
            continue;
        }
        // links and device nodes can point outside the target; refuse them
        if !entry_type.is_file() {
            return Err(ArchiveFetchError::UnsafePath {
                entry: entry_path.display().to_string(),
            });
        }
        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| io_err(format!("create {}", parent.display()), &e))?;
        }
        let mut out = File::create(&out_path)
            .map_err(|e| io_err(format!("create {}", out_path.display()), &e))?;
        std::io::copy(&mut entry, &mut out)
            .map_err(|e| io_err(format!("write {}", out_path.display()), &e))?;
    }
    Ok(())
}

fn sanitize_rel_path(path: &Path) -> Result<PathBuf, ArchiveFetchError> {
    let mut out = PathBuf::new();
    for c in path.components() {
        match c {
            Component::Prefix(_) | Component::RootDir | Component::ParentDir => {
                return Err(ArchiveFetchError::UnsafePath {
                    entry: path.display().to_string(),
                })
            }
            Component::CurDir => {}
            Component::Normal(p) => out.push(p),
        }
    }
    Ok(out)
}

fn rename_overwrite_file(src: &Path, dst: &Path) -> Result<(), ArchiveFetchError> {
    if dst.exists() && dst.is_dir() {
        return Err(ArchiveFetchError::UnsafePath {
            entry: dst.display().to_string(),
        });
    }
    #[cfg(windows)]
    {
        if dst.exists() {
            std::fs::remove_file(dst)
                .map_err(|e| io_err(format!("remove {}", dst.display()), &e))?;
        }
    }
    std::fs::rename(src, dst).map_err(|e| {
        io_err(
            format!("rename {} -> {}", src.display(), dst.display()),
            &e,
        )
    })
}

/// Lift the contents of a lone top-level directory up into the target,
/// skipping names that already exist. Source-hosting archive exports wrap
/// everything in a `name-version/` folder; this undoes that. Best-effort.
fn flatten_single_dir(target: &Path) {
    let Ok(rd) = std::fs::read_dir(target) else {
        return;
    };
    let mut dirs = Vec::new();
    for entry in rd.flatten() {
        if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            dirs.push(entry.path());
        }
    }
    if dirs.len() != 1 {
        return;
    }
    let sub = &dirs[0];
    let Ok(children) = std::fs::read_dir(sub) else {
        return;
    };
    for child in children.flatten() {
        let dest = target.join(child.file_name());
        if dest.exists() {
            continue;
        }
        let _ = std::fs::rename(child.path(), &dest);
    }
    let _ = std::fs::remove_dir(sub);
}

fn hex_lower(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        s.push_str(&format!("{:02x}", b));
    }
    s
}
