//! The actions that run inside worker processes.
//!
//! Everything here operates on an [`ElementPayload`], a serialized copy of
//! the element, and on the project directories named inside it. No parent
//! state is ever touched from this module.

use std::fs;
use std::io;
use std::path::Path;
use std::process::{self, Command};

use serde_json::{Value, json};

use mason_core::context::Context;
use mason_core::error::{DomainError, ErrorDomain};
use mason_core::item::Workspace;
use mason_core::message::{Message, MessageKind};
use mason_sched::ActionRunner;

use crate::element::{ElementPayload, WORKSPACE_MARKER, content_ref};

/// Entrypoint of the hidden `mason worker` subcommand.
pub fn run_worker_process() -> ! {
    mason_sched::worker_main(&ElementRunner)
}

/// Dispatches the queue actions onto element payloads.
pub struct ElementRunner;

impl ActionRunner for ElementRunner {
    fn run(
        &self,
        action: &str,
        payload: &Value,
        context: &Context,
    ) -> Result<Option<Value>, DomainError> {
        let element: ElementPayload = serde_json::from_value(payload.clone()).map_err(|err| {
            DomainError::new(ErrorDomain::Worker, format!("malformed element payload: {err}"))
                .with_reason("bad-payload")
        })?;
        match action {
            "track" => track(&element, context),
            "fetch" => fetch(&element, context),
            "build" => build(&element, context),
            "pull" => pull(&element, context),
            "push" => push(&element, context),
            other => Err(DomainError::new(
                ErrorDomain::Worker,
                format!("unknown action: {other}"),
            )
            .with_reason("unknown-action")),
        }
    }

    fn workspace(&self, payload: &Value) -> Option<Value> {
        let element: ElementPayload = serde_json::from_value(payload.clone()).ok()?;
        let workspace = element.workspace?;
        // Prefer the marker a build (this one or an earlier one) left in the
        // workspace directory; it carries the prepared/last-successful state.
        let descriptor = fs::read_to_string(workspace.path.join(WORKSPACE_MARKER))
            .ok()
            .and_then(|raw| serde_json::from_str::<Workspace>(&raw).ok())
            .unwrap_or(workspace);
        serde_json::to_value(descriptor).ok()
    }
}

/// Re-hash every source file, producing a fresh ref per source.
fn track(element: &ElementPayload, context: &Context) -> Result<Option<Value>, DomainError> {
    let mut refs = Vec::with_capacity(element.sources.len());
    for source in &element.sources {
        let data = fs::read(&source.path).map_err(|err| {
            DomainError::new(
                ErrorDomain::Source,
                format!("cannot read source {}: {err}", source.path.display()),
            )
            .with_reason("missing-source")
        })?;
        let new_ref = content_ref(&data);
        context.emit(Message::new(
            MessageKind::Status,
            format!("{} tracked to {}", source.path.display(), short(&new_ref)),
        ));
        refs.push(json!({"path": source.path, "ref": new_ref}));
    }
    Ok(Some(Value::Array(refs)))
}

/// Import every source into the content-addressed sources directory.
fn fetch(element: &ElementPayload, context: &Context) -> Result<Option<Value>, DomainError> {
    let mut fetched = 0usize;
    for source in &element.sources {
        let Some(source_ref) = &source.source_ref else {
            return Err(DomainError::new(
                ErrorDomain::Source,
                format!("{} has no ref, track it first", source.path.display()),
            )
            .with_reason("inconsistent"));
        };
        let dest = element.dirs.sources.join(source_ref);
        if dest.exists() {
            continue;
        }

        let data = fs::read(&source.path).map_err(|err| {
            DomainError::new(
                ErrorDomain::Source,
                format!("cannot read source {}: {err}", source.path.display()),
            )
            .with_reason("missing-source")
        })?;
        if content_ref(&data) != *source_ref {
            return Err(DomainError::new(
                ErrorDomain::Source,
                format!(
                    "{} does not match its tracked ref {}",
                    source.path.display(),
                    short(source_ref)
                ),
            )
            .with_reason("ref-mismatch"));
        }

        fs::create_dir_all(&element.dirs.sources)
            .map_err(|err| source_io("create sources directory", err))?;
        let tmp = element
            .dirs
            .sources
            .join(format!("{source_ref}.tmp.{}", process::id()));
        fs::write(&tmp, &data).map_err(|err| source_io("stage source", err))?;
        fs::rename(&tmp, &dest).map_err(|err| source_io("commit source", err))?;
        fetched += 1;
        context.emit(Message::new(
            MessageKind::Status,
            format!("fetched {}", source.path.display()),
        ));
    }
    Ok(Some(json!({ "fetched": fetched })))
}

/// Stage sources (or the open workspace), run the build commands, and commit
/// the output tree to the local artifact cache under the cache key.
fn build(element: &ElementPayload, context: &Context) -> Result<Option<Value>, DomainError> {
    let key = element.cache_key.clone().ok_or_else(|| {
        DomainError::new(ErrorDomain::Artifact, "cache key is not resolved")
            .with_reason("no-cache-key")
    })?;

    let stage = element
        .dirs
        .build
        .join(format!("{}-{}", element.name, process::id()));
    let output_dir = stage.join("install");
    fs::create_dir_all(&output_dir).map_err(|err| sandbox_io("create build directory", err))?;

    if let Some(workspace) = element.workspace.as_ref().filter(|ws| ws.path.exists()) {
        context.emit(Message::new(
            MessageKind::Status,
            format!("staging workspace {}", workspace.path.display()),
        ));
        copy_tree(&workspace.path, &stage).map_err(|err| sandbox_io("stage workspace", err))?;
    } else {
        for source in &element.sources {
            let source_ref = source.source_ref.as_ref().ok_or_else(|| {
                DomainError::new(
                    ErrorDomain::Source,
                    format!("{} has no ref, track it first", source.path.display()),
                )
                .with_reason("inconsistent")
            })?;
            let cached = element.dirs.sources.join(source_ref);
            let file_name = source.path.file_name().ok_or_else(|| {
                DomainError::new(
                    ErrorDomain::Source,
                    format!("source has no file name: {}", source.path.display()),
                )
            })?;
            fs::copy(&cached, stage.join(file_name)).map_err(|err| {
                DomainError::new(
                    ErrorDomain::Source,
                    format!("{} is not fetched: {err}", source.path.display()),
                )
                .with_reason("not-fetched")
            })?;
        }
    }

    for command in &element.commands {
        context.emit(Message::new(MessageKind::Status, format!("Running: {command}")));
        let output = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&stage)
            .env("MASON_OUTPUT", &output_dir)
            .env("MASON_ELEMENT", &element.name)
            .output()
            .map_err(|err| sandbox_io("run command", err))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stdout.trim().is_empty() || !stderr.trim().is_empty() {
            let mut detail = String::new();
            detail.push_str(stdout.trim_end());
            if !stderr.trim().is_empty() {
                if !detail.is_empty() {
                    detail.push('\n');
                }
                detail.push_str(stderr.trim_end());
            }
            context.emit(Message::new(MessageKind::Log, command.clone()).with_detail(detail));
        }

        if !output.status.success() {
            let _ = fs::remove_dir_all(&stage);
            return Err(DomainError::new(
                ErrorDomain::Sandbox,
                format!("command failed: {command}"),
            )
            .with_reason("command-failed")
            .with_detail(tail(&stderr, 20)));
        }
    }

    commit_tree(&output_dir, &element.dirs.artifacts, &key)
        .map_err(|err| artifact_io("commit artifact", err))?;
    let _ = fs::remove_dir_all(&stage);

    if let Some(workspace) = &element.workspace {
        let descriptor = Workspace {
            path: workspace.path.clone(),
            prepared: true,
            last_successful: Some(key.clone()),
        };
        if let Ok(raw) = serde_json::to_string_pretty(&descriptor) {
            let _ = fs::write(workspace.path.join(WORKSPACE_MARKER), raw);
        }
    }

    Ok(Some(json!({ "artifact": key })))
}

/// Copy the artifact for this element's cache key out of the remote cache.
fn pull(element: &ElementPayload, context: &Context) -> Result<Option<Value>, DomainError> {
    let key = element.cache_key.clone().ok_or_else(|| {
        DomainError::new(ErrorDomain::Artifact, "cache key is not resolved")
            .with_reason("no-cache-key")
    })?;
    let remote = element.dirs.remote.as_ref().ok_or_else(|| {
        DomainError::new(ErrorDomain::Artifact, "no remote cache configured")
            .with_reason("no-remote")
    })?;

    let source = remote.join(&key);
    if !source.is_dir() {
        return Err(DomainError::new(
            ErrorDomain::Artifact,
            format!("artifact {} is not in the remote cache", short(&key)),
        )
        .with_reason("not-in-remote"));
    }
    commit_tree(&source, &element.dirs.artifacts, &key)
        .map_err(|err| artifact_io("pull artifact", err))?;
    context.emit(Message::new(
        MessageKind::Info,
        format!("Pulled artifact {}", short(&key)),
    ));
    Ok(Some(json!({ "artifact": key })))
}

/// Copy this element's local artifact into the remote cache.
fn push(element: &ElementPayload, context: &Context) -> Result<Option<Value>, DomainError> {
    let key = element.cache_key.clone().ok_or_else(|| {
        DomainError::new(ErrorDomain::Artifact, "cache key is not resolved")
            .with_reason("no-cache-key")
    })?;
    let remote = element.dirs.remote.as_ref().ok_or_else(|| {
        DomainError::new(ErrorDomain::Artifact, "no remote cache configured")
            .with_reason("no-remote")
    })?;

    let source = element.dirs.artifacts.join(&key);
    if !source.is_dir() {
        return Err(DomainError::new(
            ErrorDomain::Artifact,
            format!("artifact {} is not built", short(&key)),
        )
        .with_reason("not-built"));
    }
    commit_tree(&source, remote, &key).map_err(|err| artifact_io("push artifact", err))?;
    context.emit(Message::new(
        MessageKind::Info,
        format!("Pushed artifact {}", short(&key)),
    ));
    Ok(Some(json!({ "artifact": key })))
}

/// Recursively copy a directory tree.
pub(crate) fn copy_tree(src: &Path, dst: &Path) -> io::Result<()> {
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_tree(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Copy `src` into `cache/<key>`, atomically and idempotently: concurrent
/// committers of the same key race on a rename and both win.
fn commit_tree(src: &Path, cache: &Path, key: &str) -> io::Result<()> {
    let dest = cache.join(key);
    if dest.is_dir() {
        return Ok(());
    }
    fs::create_dir_all(cache)?;
    let tmp = cache.join(format!("{key}.tmp.{}", process::id()));
    copy_tree(src, &tmp)?;
    match fs::rename(&tmp, &dest) {
        Ok(()) => Ok(()),
        Err(err) => {
            let _ = fs::remove_dir_all(&tmp);
            if dest.is_dir() { Ok(()) } else { Err(err) }
        }
    }
}

fn short(key: &str) -> &str {
    &key[..key.len().min(12)]
}

fn tail(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.trim_end().lines().collect();
    let start = all.len().saturating_sub(lines);
    all[start..].join("\n")
}

fn source_io(what: &str, err: io::Error) -> DomainError {
    DomainError::new(ErrorDomain::Source, format!("{what}: {err}")).with_reason("io")
}

fn sandbox_io(what: &str, err: io::Error) -> DomainError {
    DomainError::new(ErrorDomain::Sandbox, format!("{what}: {err}")).with_reason("io")
}

fn artifact_io(what: &str, err: io::Error) -> DomainError {
    DomainError::new(ErrorDomain::Artifact, format!("{what}: {err}")).with_reason("io")
}
