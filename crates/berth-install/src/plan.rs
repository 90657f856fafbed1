use serde::{Deserialize, Serialize};

use berth_fetch::{GitArtifact, HttpArtifact};

/// The catalog's declarative description of what to write and fetch. Treated
/// as already-validated input; producing it is someone else's job.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct InstallPlan {
    #[serde(default)]
    pub files: Vec<PlanFile>,
    #[serde(default)]
    pub artifacts: Vec<ArtifactSpec>,
    /// Inline runner descriptor. Kept as raw JSON: an invalid inline
    /// descriptor falls back to discovery and inference instead of failing
    /// the whole plan parse.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runner: Option<serde_json::Value>,
    /// Non-standard runner file name to look for inside the target.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runner_file: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PlanFile {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_b64: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ArtifactSpec {
    Http(HttpArtifact),
    Git { spec: GitArtifact },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_http_artifact() {
        let plan: InstallPlan = serde_json::from_value(serde_json::json!({
            "artifacts": [
                {"kind": "http", "url": "https://host/x.zip", "sha256": "ab", "unpack": true}
            ]
        }))
        .unwrap();
        match &plan.artifacts[0] {
            ArtifactSpec::Http(spec) => {
                assert_eq!(spec.url, "https://host/x.zip");
                assert_eq!(spec.sha256.as_deref(), Some("ab"));
                assert!(spec.unpack);
                assert!(spec.dest.is_none());
            }
            other => panic!("expected http artifact, got {other:?}"),
        }
    }

    #[test]
    fn parses_git_artifact_with_defaults() {
        let plan: InstallPlan = serde_json::from_value(serde_json::json!({
            "artifacts": [
                {"kind": "git", "spec": {"repo": "https://github.com/a/b.git", "ref": "v1.0"}}
            ]
        }))
        .unwrap();
        match &plan.artifacts[0] {
            ArtifactSpec::Git { spec } => {
                assert_eq!(spec.repo, "https://github.com/a/b.git");
                assert_eq!(spec.git_ref, "v1.0");
                assert_eq!(spec.depth, 1);
                assert!(spec.strip_vcs);
                assert!(!spec.recurse_submodules);
                assert!(!spec.lfs);
            }
            other => panic!("expected git artifact, got {other:?}"),
        }
    }

    #[test]
    fn empty_plan_parses() {
        let plan: InstallPlan = serde_json::from_value(serde_json::json!({})).unwrap();
        assert!(plan.files.is_empty());
        assert!(plan.artifacts.is_empty());
        assert!(plan.runner.is_none());
    }
}
