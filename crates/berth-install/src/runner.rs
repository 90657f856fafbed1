use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Canonical runner descriptor file name inside a materialized target.
pub const RUNNER_FILE: &str = "runner.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunnerKind {
    Python,
    Node,
}

impl RunnerKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Python => "python",
            Self::Node => "node",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PythonRunner {
    #[serde(default = "default_venv")]
    pub venv: String,
}

fn default_venv() -> String {
    ".venv".to_string()
}

impl Default for PythonRunner {
    fn default() -> Self {
        Self {
            venv: default_venv(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeRunner {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package_manager: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub install_args: Vec<String>,
}

/// How to execute a materialized component: runtime kind, entry point, and
/// kind-specific configuration. Persisted to `runner.json` at install time
/// and read back at every start.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerDescriptor {
    #[serde(rename = "type")]
    pub kind: RunnerKind,
    pub entry: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub python: Option<PythonRunner>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<NodeRunner>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

impl RunnerDescriptor {
    pub fn venv_dir(&self) -> &str {
        self.python
            .as_ref()
            .map(|p| p.venv.as_str())
            .unwrap_or(".venv")
    }

    fn schema_valid(&self) -> bool {
        !self.entry.trim().is_empty()
    }
}

#[derive(Debug)]
pub enum RunnerResolveError {
    /// No inline descriptor, no usable runner file, and nothing to infer
    /// from: the component cannot be started.
    Unresolvable { target: PathBuf },
    Invalid { path: PathBuf, detail: String },
    Io { what: String, detail: String },
}

impl std::fmt::Display for RunnerResolveError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unresolvable { target } => write!(
                f,
                "no usable runner descriptor in {} and none could be inferred",
                target.display()
            ),
            Self::Invalid { path, detail } => {
                write!(f, "invalid runner descriptor {}: {detail}", path.display())
            }
            Self::Io { what, detail } => write!(f, "{what}: {detail}"),
        }
    }
}

impl std::error::Error for RunnerResolveError {}

#[derive(Debug, Clone)]
pub struct ResolvedRunner {
    pub descriptor: RunnerDescriptor,
    pub path: PathBuf,
    pub inferred: bool,
}

/// Finalize the runner descriptor for a materialized target.
///
/// Precedence: a schema-valid inline descriptor, then an existing runner
/// file (the plan may name a non-standard one, which is then mirrored to
/// `runner.json`), then inference from conventional entry files.
pub fn resolve_runner(
    target: &Path,
    inline: Option<&serde_json::Value>,
    runner_file: Option<&str>,
) -> Result<ResolvedRunner, RunnerResolveError> {
    if let Some(value) = inline {
        if let Some(descriptor) = descriptor_from_value(value) {
            let path = target.join(RUNNER_FILE);
            write_runner(&descriptor, &path)?;
            return Ok(ResolvedRunner {
                descriptor,
                path,
                inferred: false,
            });
        }
    }

    let file_name = runner_file.unwrap_or(RUNNER_FILE);
    let existing = target.join(file_name);
    if existing.is_file() {
        if let Ok(descriptor) = load_runner(&existing) {
            if file_name != RUNNER_FILE {
                write_runner(&descriptor, &target.join(RUNNER_FILE))?;
            }
            return Ok(ResolvedRunner {
                descriptor,
                path: existing,
                inferred: false,
            });
        }
    }

    if let Some(descriptor) = infer_runner(target) {
        let path = target.join(RUNNER_FILE);
        write_runner(&descriptor, &path)?;
        return Ok(ResolvedRunner {
            descriptor,
            path,
            inferred: true,
        });
    }

    Err(RunnerResolveError::Unresolvable {
        target: target.to_path_buf(),
    })
}

pub fn load_runner(path: &Path) -> Result<RunnerDescriptor, RunnerResolveError> {
    let bytes = std::fs::read(path).map_err(|e| RunnerResolveError::Io {
        what: format!("read {}", path.display()),
        detail: e.to_string(),
    })?;
    let descriptor: RunnerDescriptor =
        serde_json::from_slice(&bytes).map_err(|e| RunnerResolveError::Invalid {
            path: path.to_path_buf(),
            detail: e.to_string(),
        })?;
    if !descriptor.schema_valid() {
        return Err(RunnerResolveError::Invalid {
            path: path.to_path_buf(),
            detail: "missing required entry".to_string(),
        });
    }
    Ok(descriptor)
}

fn descriptor_from_value(value: &serde_json::Value) -> Option<RunnerDescriptor> {
    let descriptor: RunnerDescriptor = serde_json::from_value(value.clone()).ok()?;
    descriptor.schema_valid().then_some(descriptor)
}

fn infer_runner(target: &Path) -> Option<RunnerDescriptor> {
    if target.join("server.py").is_file() {
        return Some(RunnerDescriptor {
            kind: RunnerKind::Python,
            entry: "server.py".to_string(),
            python: Some(PythonRunner::default()),
            node: None,
            env: BTreeMap::new(),
        });
    }
    let has_server_js = target.join("server.js").is_file();
    if has_server_js || target.join("package.json").is_file() {
        return Some(RunnerDescriptor {
            kind: RunnerKind::Node,
            entry: if has_server_js {
                "server.js".to_string()
            } else {
                "index.js".to_string()
            },
            python: None,
            node: Some(NodeRunner::default()),
            env: BTreeMap::new(),
        });
    }
    None
}

fn write_runner(descriptor: &RunnerDescriptor, path: &Path) -> Result<(), RunnerResolveError> {
    let mut bytes = serde_json::to_vec_pretty(descriptor).map_err(|e| RunnerResolveError::Io {
        what: format!("serialize runner for {}", path.display()),
        detail: e.to_string(),
    })?;
    bytes.push(b'\n');
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, &bytes).map_err(|e| RunnerResolveError::Io {
        what: format!("write {}", tmp.display()),
        detail: e.to_string(),
    })?;
    std::fs::rename(&tmp, path).map_err(|e| RunnerResolveError::Io {
        what: format!("rename {} -> {}", tmp.display(), path.display()),
        detail: e.to_string(),
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_roundtrips_with_type_field() {
        let json = serde_json::json!({
            "type": "python",
            "entry": "server.py",
            "python": {"venv": ".venv"}
        });
        let descriptor: RunnerDescriptor = serde_json::from_value(json).unwrap();
        assert_eq!(descriptor.kind, RunnerKind::Python);
        assert_eq!(descriptor.venv_dir(), ".venv");
        let back = serde_json::to_value(&descriptor).unwrap();
        assert_eq!(back["type"], "python");
    }

    #[test]
    fn missing_entry_is_not_schema_valid() {
        let json = serde_json::json!({"type": "python", "entry": "  "});
        assert!(descriptor_from_value(&json).is_none());
    }

    #[test]
    fn unknown_kind_is_not_schema_valid() {
        let json = serde_json::json!({"type": "ruby", "entry": "server.rb"});
        assert!(descriptor_from_value(&json).is_none());
    }
}
