//! Shared fixtures for unit tests.

use serde_json::json;
use tempfile::TempDir;

use crate::project::Project;

/// Write a project with one local source file per element and load it.
///
/// Each entry is `(name, depends, commands)`; the element gets a single
/// source `<name>.src` containing `content of <name>`.
pub(crate) fn demo_project(specs: &[(&str, &[&str], &[&str])]) -> (TempDir, Project) {
    let dir = tempfile::tempdir().unwrap();

    let elements: Vec<_> = specs
        .iter()
        .map(|(name, depends, commands)| {
            std::fs::write(
                dir.path().join(format!("{name}.src")),
                format!("content of {name}"),
            )
            .unwrap();
            json!({
                "name": name,
                "sources": [{"path": format!("{name}.src")}],
                "depends": depends,
                "commands": commands,
            })
        })
        .collect();

    let config = json!({
        "name": "demo",
        "remote": "remote",
        "elements": elements,
    });
    std::fs::write(
        dir.path().join("project.json"),
        serde_json::to_string_pretty(&config).unwrap(),
    )
    .unwrap();

    let project = Project::load(dir.path()).unwrap();
    (dir, project)
}

/// A project with a single element that has no sources at all.
pub(crate) fn sourceless_project(name: &str) -> (TempDir, Project) {
    let dir = tempfile::tempdir().unwrap();
    let config = json!({
        "name": "demo",
        "elements": [{"name": name}],
    });
    std::fs::write(
        dir.path().join("project.json"),
        serde_json::to_string_pretty(&config).unwrap(),
    )
    .unwrap();
    let project = Project::load(dir.path()).unwrap();
    (dir, project)
}
