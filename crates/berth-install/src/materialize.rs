use std::path::{Component, Path, PathBuf};

use base64::Engine as _;
use serde::Serialize;

use berth_fetch::{
    fetch_git_artifact, fetch_http_artifact, ArchiveFetchError, GitFetchError, GitFetchOptions,
    HttpFetchOptions,
};

use crate::plan::{ArtifactSpec, InstallPlan, PlanFile};
use crate::runner::{resolve_runner, RunnerResolveError};

/// Per-step counts for one materialize call. Returned even on partial
/// failure (inside [`MaterializeError`]) so callers can see how far the
/// install got.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BuildReport {
    pub files_written: usize,
    pub artifacts_fetched: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runner_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

#[derive(Debug)]
pub enum StepError {
    UnsafeFilePath { path: String },
    BadContent { path: String, detail: String },
    FileWrite { path: PathBuf, detail: String },
    Archive(ArchiveFetchError),
    Git(GitFetchError),
    Runner(RunnerResolveError),
    Io { what: String, detail: String },
}

impl std::fmt::Display for StepError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnsafeFilePath { path } => {
                write!(f, "refusing to write file outside target: {path:?}")
            }
            Self::BadContent { path, detail } => {
                write!(f, "bad inline content for {path:?}: {detail}")
            }
            Self::FileWrite { path, detail } => {
                write!(f, "write {}: {detail}", path.display())
            }
            Self::Archive(err) => err.fmt(f),
            Self::Git(err) => err.fmt(f),
            Self::Runner(err) => err.fmt(f),
            Self::Io { what, detail } => write!(f, "{what}: {detail}"),
        }
    }
}

#[derive(Debug)]
pub struct MaterializeError {
    pub report: BuildReport,
    pub step: StepError,
}

impl std::fmt::Display for MaterializeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} (after {} files, {} artifacts)",
            self.step, self.report.files_written, self.report.artifacts_fetched
        )
    }
}

impl std::error::Error for MaterializeError {}

#[derive(Debug, Clone, Default)]
pub struct MaterializeOptions {
    pub http: HttpFetchOptions,
    pub git: GitFetchOptions,
}

impl MaterializeOptions {
    pub fn from_env() -> Self {
        Self {
            http: HttpFetchOptions::from_env(),
            git: GitFetchOptions::from_env(),
        }
    }
}

/// Turn an install plan into a populated target directory with a finalized
/// runner descriptor.
///
/// Inline files are written first, then artifacts are fetched in declared
/// order, then the runner descriptor is resolved and persisted. The first
/// failing step aborts the rest; its error is surfaced verbatim together
/// with the partial report.
pub fn materialize(
    plan: &InstallPlan,
    target: &Path,
    opts: &MaterializeOptions,
) -> Result<BuildReport, MaterializeError> {
    let mut report = BuildReport::default();

    if let Err(e) = std::fs::create_dir_all(target) {
        return Err(MaterializeError {
            report,
            step: StepError::Io {
                what: format!("create target dir {}", target.display()),
                detail: e.to_string(),
            },
        });
    }

    for file in &plan.files {
        match write_plan_file(file, target) {
            Ok(()) => report.files_written += 1,
            Err(step) => return Err(MaterializeError { report, step }),
        }
    }

    for artifact in &plan.artifacts {
        let fetched = match artifact {
            ArtifactSpec::Http(spec) => fetch_http_artifact(spec, target, &opts.http)
                .map(|()| Vec::new())
                .map_err(StepError::Archive),
            ArtifactSpec::Git { spec } => {
                fetch_git_artifact(spec, target, &opts.git).map_err(StepError::Git)
            }
        };
        match fetched {
            Ok(warnings) => {
                report.artifacts_fetched += 1;
                report.warnings.extend(warnings);
            }
            Err(step) => return Err(MaterializeError { report, step }),
        }
    }

    match resolve_runner(target, plan.runner.as_ref(), plan.runner_file.as_deref()) {
        Ok(resolved) => report.runner_path = Some(resolved.path),
        Err(err) => {
            return Err(MaterializeError {
                report,
                step: StepError::Runner(err),
            })
        }
    }

    Ok(report)
}

fn write_plan_file(file: &PlanFile, target: &Path) -> Result<(), StepError> {
    let rel = safe_rel_path(&file.path).ok_or_else(|| StepError::UnsafeFilePath {
        path: file.path.clone(),
    })?;
    let path = target.join(rel);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| StepError::FileWrite {
            path: path.clone(),
            detail: e.to_string(),
        })?;
    }

    let bytes: Vec<u8> = if let Some(b64) = file.content_b64.as_deref() {
        base64::engine::general_purpose::STANDARD
            .decode(b64.trim())
            .map_err(|e| StepError::BadContent {
                path: file.path.clone(),
                detail: format!("invalid base64: {e}"),
            })?
    } else if let Some(text) = file.content.as_deref() {
        text.as_bytes().to_vec()
    } else {
        Vec::new()
    };

    std::fs::write(&path, &bytes).map_err(|e| StepError::FileWrite {
        path: path.clone(),
        detail: e.to_string(),
    })
}

fn safe_rel_path(raw: &str) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for c in Path::new(raw).components() {
        match c {
            Component::Normal(p) => out.push(p),
            Component::CurDir => {}
            _ => return None,
        }
    }
    if out.as_os_str().is_empty() {
        None
    } else {
        Some(out)
    }
}
