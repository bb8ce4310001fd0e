//! Full command-line sessions against the real binary.

#![allow(unused_crate_dependencies)]

use std::process::Command;

use serde_json::json;
use tempfile::TempDir;

fn mason(dir: &TempDir, args: &[&str]) -> std::process::Output {
    Command::new(env!("CARGO_BIN_EXE_mason"))
        .arg("--project")
        .arg(dir.path())
        .args(args)
        .output()
        .expect("run mason")
}

fn write_demo(dir: &TempDir) {
    std::fs::write(dir.path().join("greeting.src"), "hello from mason\n").unwrap();
    let config = json!({
        "name": "demo",
        "remote": "remote",
        "elements": [
            {
                "name": "greeting",
                "sources": [{"path": "greeting.src"}],
                "commands": ["cp greeting.src $MASON_OUTPUT/greeting"],
            },
            {
                "name": "shout",
                "sources": [{"path": "greeting.src"}],
                "depends": ["greeting"],
                "commands": ["tr a-z A-Z < greeting.src > $MASON_OUTPUT/shout"],
            },
        ],
    });
    std::fs::write(
        dir.path().join("project.json"),
        serde_json::to_string_pretty(&config).unwrap(),
    )
    .unwrap();
}

#[test]
fn build_with_tracking_produces_artifacts_and_pushes_them() {
    let dir = tempfile::tempdir().unwrap();
    write_demo(&dir);

    let output = mason(&dir, &["build", "--track"]);
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(output.status.success(), "build failed:\n{stderr}");
    assert!(stderr.contains("Built: 2 processed"), "summary in:\n{stderr}");

    // Tracking rewrote the project file with resolved refs.
    let raw = std::fs::read_to_string(dir.path().join("project.json")).unwrap();
    let config: serde_json::Value = serde_json::from_str(&raw).unwrap();
    assert!(config["elements"][0]["sources"][0]["ref"].is_string());

    // Artifacts were pushed to the configured remote directory.
    let pushed = dir.path().join("remote").read_dir().unwrap().count();
    assert_eq!(pushed, 2);

    // A second build has nothing left to do.
    let output = mason(&dir, &["build"]);
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(output.status.success(), "rebuild failed:\n{stderr}");
    assert!(stderr.contains("Built: 0 processed, 2 skipped"), "summary in:\n{stderr}");
}

#[test]
fn checkout_copies_the_built_artifact() {
    let dir = tempfile::tempdir().unwrap();
    write_demo(&dir);

    assert!(mason(&dir, &["build", "--track"]).status.success());

    let target = dir.path().join("out");
    let output = mason(&dir, &["checkout", "shout", target.to_str().unwrap()]);
    assert!(output.status.success());
    let shout = std::fs::read_to_string(target.join("shout")).unwrap();
    assert_eq!(shout.trim(), "HELLO FROM MASON");

    // A non-empty directory is refused without --force.
    let output = mason(&dir, &["checkout", "shout", target.to_str().unwrap()]);
    assert!(!output.status.success());
}

#[test]
fn failing_builds_exit_nonzero_and_name_the_culprit() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("src.src"), "data").unwrap();
    let config = json!({
        "name": "demo",
        "elements": [{
            "name": "doomed",
            "sources": [{"path": "src.src"}],
            "commands": ["echo nope >&2; exit 4"],
        }],
    });
    std::fs::write(
        dir.path().join("project.json"),
        serde_json::to_string_pretty(&config).unwrap(),
    )
    .unwrap();

    let output = mason(&dir, &["build", "--track"]);
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(!output.status.success());
    assert!(stderr.contains("failed: doomed"), "culprit named in:\n{stderr}");
}

#[test]
fn fetch_without_tracking_requires_consistency() {
    let dir = tempfile::tempdir().unwrap();
    write_demo(&dir);

    let output = mason(&dir, &["fetch"]);
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(!output.status.success());
    assert!(stderr.contains("track these elements first"), "got:\n{stderr}");
}

#[test]
fn show_lists_element_states() {
    let dir = tempfile::tempdir().unwrap();
    write_demo(&dir);

    let output = mason(&dir, &["show"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("greeting"));
    assert!(stdout.contains("inconsistent"));
}
