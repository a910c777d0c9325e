//! Workflow document loading

use anyhow::{Context, Result};
use std::path::Path;
use tracing::{debug, warn};
use weft_workflow::WorkflowConfig;

/// Parse one workflow document; the extension picks YAML or JSON
pub fn load_document(path: &Path) -> Result<WorkflowConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let workflow = match path.extension().and_then(|e| e.to_str()) {
        Some("json") => serde_json::from_str(&raw)
            .with_context(|| format!("Invalid workflow JSON in {}", path.display()))?,
        _ => serde_yaml::from_str(&raw)
            .with_context(|| format!("Invalid workflow YAML in {}", path.display()))?,
    };
    Ok(workflow)
}

/// Load every `*.yaml`, `*.yml` and `*.json` document in a directory,
/// sorted by file name. A missing directory yields no workflows.
pub fn load_dir(dir: &Path) -> Result<Vec<WorkflowConfig>> {
    if !dir.exists() {
        warn!(path = %dir.display(), "Workflow directory does not exist");
        return Ok(Vec::new());
    }

    let mut paths = Vec::new();
    for entry in std::fs::read_dir(dir).with_context(|| format!("Failed to list {}", dir.display()))? {
        let path = entry?.path();
        let is_document = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yaml") | Some("yml") | Some("json")
        );
        if path.is_file() && is_document {
            paths.push(path);
        }
    }
    paths.sort();

    let mut workflows = Vec::with_capacity(paths.len());
    for path in paths {
        let workflow = load_document(&path)?;
        debug!(path = %path.display(), workflow_id = %workflow.id, "Loaded workflow document");
        workflows.push(workflow);
    }
    Ok(workflows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn scratch_dir(name: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("weft-loader-{}-{}", name, std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_load_yaml_and_json_documents() {
        let dir = scratch_dir("mixed");
        fs::write(
            dir.join("b.yaml"),
            "id: beta\ntasks:\n  - { id: t, type: basic, tool: echo }\n",
        )
        .unwrap();
        fs::write(
            dir.join("a.json"),
            r#"{"id":"alpha","tasks":[{"id":"t","type":"basic","agent":"writer","action":"draft"}]}"#,
        )
        .unwrap();
        fs::write(dir.join("notes.txt"), "ignored").unwrap();

        let workflows = load_dir(&dir).unwrap();
        let ids: Vec<_> = workflows.iter().map(|w| w.id.as_str()).collect();
        assert_eq!(ids, vec!["alpha", "beta"]);

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_invalid_document_reports_path() {
        let dir = scratch_dir("invalid");
        fs::write(dir.join("broken.yaml"), "id: [unterminated").unwrap();

        let err = load_dir(&dir).unwrap_err();
        assert!(format!("{:#}", err).contains("broken.yaml"));

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_missing_directory_is_empty() {
        let workflows = load_dir(Path::new("/nonexistent/weft/workflows")).unwrap();
        assert!(workflows.is_empty());
    }
}
