use anyhow::{Context, Result, bail};
use std::{fs, path::Path};
use tracing::info;

use crate::dialog::{Flow, registry::FLOW_EXTENSIONS, script::ScriptHost};

/// Validate that the provided file is a valid YAML or JSON flow definition.
/// Targets in other flows of the bot are only checked when the bot is loaded.
pub fn validate_flow_file(flow_file: &Path) -> Result<Flow> {
    if !flow_file.exists() {
        bail!("File does not exist: {}", flow_file.display());
    }
    let flow = Flow::load_from_file(flow_file)?;
    flow.validate(&ScriptHost::new())
        .with_context(|| format!("Invalid flow in {}", flow_file.display()))?;
    info!(flow = %flow.name, nodes = flow.nodes.len(), "valid flow: {}", flow_file.display());
    Ok(flow)
}

/// Validate a flow file and copy it into `<flows_dir>/<bot_id>/`. A running
/// instance watching `flows_dir` picks it up.
pub fn deploy_flow_file(flow_file: &Path, flows_dir: &Path, bot_id: &str) -> Result<()> {
    validate_flow_file(flow_file)?;

    let Some(file_name) = flow_file.file_name() else {
        bail!("Not a file: {}", flow_file.display());
    };
    let dest_folder = flows_dir.join(bot_id);
    fs::create_dir_all(&dest_folder)
        .with_context(|| format!("Failed to create {}", dest_folder.display()))?;
    let dest = dest_folder.join(file_name);
    fs::copy(flow_file, &dest)
        .with_context(|| format!("Failed to copy {} to {}", flow_file.display(), dest.display()))?;

    info!(bot_id, "deployed {} to {}", flow_file.display(), dest.display());
    Ok(())
}

/// Every flow file of a bot, sorted.
pub fn list_flow_files(flows_dir: &Path, bot_id: &str) -> Result<Vec<String>> {
    let dir = flows_dir.join(bot_id);
    let mut names = Vec::new();
    for entry in fs::read_dir(&dir).with_context(|| format!("Failed to read {}", dir.display()))? {
        let path = entry?.path();
        let relevant = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| FLOW_EXTENSIONS.contains(&e));
        if relevant {
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                names.push(name.to_string());
            }
        }
    }
    names.sort();
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID: &str = r#"{
        "start_node": "start",
        "nodes": { "start": { "next": [ { "node": "start", "condition": "event.payload.text == \"again\"" } ] } }
    }"#;

    #[test]
    fn test_validate_and_deploy() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("support.json");
        fs::write(&file, VALID).unwrap();

        let flow = validate_flow_file(&file).unwrap();
        assert_eq!(flow.name, "support");

        let flows_dir = tmp.path().join("flows");
        deploy_flow_file(&file, &flows_dir, "demo").unwrap();
        assert_eq!(list_flow_files(&flows_dir, "demo").unwrap(), vec!["support.json"]);
    }

    #[test]
    fn test_invalid_flow_is_not_deployed() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("broken.json");
        fs::write(&file, r#"{"start_node": "missing", "nodes": {}}"#).unwrap();

        let flows_dir = tmp.path().join("flows");
        assert!(deploy_flow_file(&file, &flows_dir, "demo").is_err());
        assert!(!flows_dir.join("demo").exists());
        assert!(validate_flow_file(&tmp.path().join("nope.json")).is_err());
    }
}
