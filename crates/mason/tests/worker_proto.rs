//! Protocol-level tests against a real worker process: feed it a request
//! frame on stdin, decode the envelope stream from stdout, check the exit
//! code.

#![allow(unused_crate_dependencies)]

use std::process::{Child, Command, Stdio};

use serde_json::{Value, json};

use mason_core::error::ErrorDomain;
use mason_core::message::MessageKind;
use mason_sched::envelope::{Envelope, read_frame, write_frame};
use mason_sched::WorkerRequest;

fn spawn_worker() -> Child {
    Command::new(env!("CARGO_BIN_EXE_mason"))
        .arg("worker")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn worker")
}

fn dirs(root: &std::path::Path) -> Value {
    json!({
        "sources": root.join("sources"),
        "artifacts": root.join("artifacts"),
        "build": root.join("build"),
        "logs": root.join("logs"),
    })
}

fn run_worker(request: &WorkerRequest) -> (Vec<Envelope>, i32) {
    let mut child = spawn_worker();
    {
        let mut stdin = child.stdin.take().unwrap();
        write_frame(&mut stdin, request).unwrap();
    }
    let mut stdout = child.stdout.take().unwrap();
    let mut envelopes = Vec::new();
    while let Some(envelope) = read_frame::<_, Envelope>(&mut stdout).unwrap() {
        envelopes.push(envelope);
    }
    let status = child.wait().unwrap();
    (envelopes, status.code().unwrap_or(-1))
}

fn message_kinds(envelopes: &[Envelope]) -> Vec<MessageKind> {
    envelopes
        .iter()
        .filter_map(|envelope| match envelope {
            Envelope::Message { message } => Some(message.kind),
            _ => None,
        })
        .collect()
}

#[test]
fn successful_track_streams_result_and_exits_zero() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("main.c");
    std::fs::write(&source, b"int main() {}\n").unwrap();

    let request = WorkerRequest {
        action: "track".into(),
        item_id: 1,
        item_name: "app".into(),
        tries: 1,
        max_retries: 0,
        silent: false,
        log_dir: Some(dir.path().join("logs")),
        payload: json!({
            "name": "app",
            "sources": [{"path": source}],
            "commands": [],
            "dirs": dirs(dir.path()),
        }),
    };

    let (envelopes, code) = run_worker(&request);
    assert_eq!(code, 0);

    let results: Vec<&Value> = envelopes
        .iter()
        .filter_map(|envelope| match envelope {
            Envelope::Result { value } => Some(value),
            _ => None,
        })
        .collect();
    assert_eq!(results.len(), 1, "exactly one result envelope");
    assert!(results[0][0]["ref"].is_string());

    let kinds = message_kinds(&envelopes);
    assert_eq!(kinds.first(), Some(&MessageKind::Start));
    assert_eq!(kinds.last(), Some(&MessageKind::Success));

    // Messages are tagged and a per-action log file was written.
    for envelope in &envelopes {
        if let Envelope::Message { message } = envelope {
            assert_eq!(message.task_id, Some(1));
            assert_eq!(message.action.as_deref(), Some("track"));
        }
    }
    let log_dir = dir.path().join("logs").join("app");
    assert!(log_dir.read_dir().unwrap().next().is_some(), "log file exists");
}

#[test]
fn domain_failure_reports_error_envelope_and_exits_nonzero() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("main.c");
    std::fs::write(&source, b"int main() {}\n").unwrap();

    // Fetching an untracked source is a recognized domain failure.
    let request = WorkerRequest {
        action: "fetch".into(),
        item_id: 2,
        item_name: "app".into(),
        tries: 1,
        max_retries: 0,
        silent: false,
        log_dir: None,
        payload: json!({
            "name": "app",
            "sources": [{"path": source}],
            "commands": [],
            "dirs": dirs(dir.path()),
        }),
    };

    let (envelopes, code) = run_worker(&request);
    assert_eq!(code, 1);

    let errors: Vec<_> = envelopes
        .iter()
        .filter_map(|envelope| match envelope {
            Envelope::Error { domain, reason } => Some((*domain, reason.clone())),
            _ => None,
        })
        .collect();
    assert_eq!(errors, vec![(ErrorDomain::Source, Some("inconsistent".into()))]);

    assert!(
        !envelopes.iter().any(|e| matches!(e, Envelope::Result { .. })),
        "failed workers send no result"
    );
    assert!(message_kinds(&envelopes).contains(&MessageKind::Fail));
}

#[test]
fn failures_with_retries_left_display_as_warnings() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("main.c");
    std::fs::write(&source, b"int main() {}\n").unwrap();

    let request = WorkerRequest {
        action: "fetch".into(),
        item_id: 3,
        item_name: "app".into(),
        tries: 1,
        max_retries: 2,
        silent: false,
        log_dir: None,
        payload: json!({
            "name": "app",
            "sources": [{"path": source}],
            "commands": [],
            "dirs": dirs(dir.path()),
        }),
    };

    let (envelopes, code) = run_worker(&request);
    assert_eq!(code, 1);
    let kinds = message_kinds(&envelopes);
    assert!(kinds.contains(&MessageKind::Warn), "downgraded failure: {kinds:?}");
    assert!(!kinds.contains(&MessageKind::Fail));
}

#[test]
fn silent_workers_forward_only_unconditional_messages() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("main.c");
    std::fs::write(&source, b"int main() {}\n").unwrap();

    let request = WorkerRequest {
        action: "track".into(),
        item_id: 4,
        item_name: "app".into(),
        tries: 1,
        max_retries: 0,
        silent: true,
        log_dir: None,
        payload: json!({
            "name": "app",
            "sources": [{"path": source}],
            "commands": [],
            "dirs": dirs(dir.path()),
        }),
    };

    let (envelopes, code) = run_worker(&request);
    assert_eq!(code, 0);
    assert!(message_kinds(&envelopes).is_empty(), "status chatter withheld");
    assert!(envelopes.iter().any(|e| matches!(e, Envelope::Result { .. })));
}

#[test]
fn unknown_actions_are_worker_domain_errors() {
    let dir = tempfile::tempdir().unwrap();
    let request = WorkerRequest {
        action: "frobnicate".into(),
        item_id: 5,
        item_name: "app".into(),
        tries: 1,
        max_retries: 0,
        silent: false,
        log_dir: None,
        payload: json!({
            "name": "app",
            "sources": [],
            "commands": [],
            "dirs": dirs(dir.path()),
        }),
    };

    let (envelopes, code) = run_worker(&request);
    assert_eq!(code, 1);
    assert!(envelopes.iter().any(|envelope| matches!(
        envelope,
        Envelope::Error { domain: ErrorDomain::Worker, reason: Some(reason) } if reason == "unknown-action"
    )));
}

#[test]
fn workspace_envelope_is_sent_even_on_failure() {
    let dir = tempfile::tempdir().unwrap();
    let workspace = dir.path().join("ws");
    std::fs::create_dir_all(&workspace).unwrap();

    // A build with no cache key fails before running anything, but the
    // workspace descriptor still travels back.
    let request = WorkerRequest {
        action: "build".into(),
        item_id: 6,
        item_name: "app".into(),
        tries: 1,
        max_retries: 0,
        silent: false,
        log_dir: None,
        payload: json!({
            "name": "app",
            "sources": [],
            "commands": [],
            "workspace": {"path": workspace, "prepared": false},
            "dirs": dirs(dir.path()),
        }),
    };

    let (envelopes, code) = run_worker(&request);
    assert_eq!(code, 1);
    assert!(envelopes.iter().any(|envelope| matches!(
        envelope,
        Envelope::Workspace { value } if value["path"].as_str().is_some()
    )));
}
