//! Elements: the concrete work items flowing through the pipeline.
//!
//! An [`Element`] is a cheap cloneable handle; its mutable state (source
//! refs, cache flags, workspace descriptor) lives behind a mutex and is only
//! ever modified in the parent process. Workers receive a serialized
//! [`ElementPayload`] copy.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use mason_core::item::{Consistency, Workspace};
use mason_sched::WorkItem;

use crate::project::{ElementConfig, ProjectDirs};

/// Marker file a build drops inside an open workspace to persist its
/// descriptor across sessions.
pub const WORKSPACE_MARKER: &str = ".mason-workspace.json";

/// Dependency scope, deciding which sessions an edge participates in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    /// Needed both to build and to run the dependent.
    #[default]
    All,
    /// Only needed while building.
    Build,
    /// Only needed at runtime (checkout).
    Run,
}

impl Scope {
    /// Whether a plan requested at `self` follows an edge marked `edge`.
    pub fn includes(self, edge: Scope) -> bool {
        match self {
            Scope::All => true,
            _ => edge == Scope::All || edge == self,
        }
    }
}

#[derive(Debug, Clone)]
struct SourceState {
    rel_path: PathBuf,
    abs_path: PathBuf,
    source_ref: Option<String>,
    cached: bool,
}

#[derive(Debug, Default)]
struct ElementState {
    sources: Vec<SourceState>,
    artifact_cached: bool,
    workspace: Option<Workspace>,
}

#[derive(Debug)]
struct ElementInner {
    id: u64,
    name: String,
    commands: Vec<String>,
    dependencies: Mutex<Vec<(Element, Scope)>>,
    state: Mutex<ElementState>,
}

/// Shared handle to one configured element.
#[derive(Debug, Clone)]
pub struct Element {
    inner: Arc<ElementInner>,
}

impl Element {
    pub(crate) fn new(
        id: u64,
        config: &ElementConfig,
        root: &Path,
        workspace: Option<PathBuf>,
    ) -> Element {
        let sources = config
            .sources
            .iter()
            .map(|source| SourceState {
                rel_path: source.path.clone(),
                abs_path: root.join(&source.path),
                source_ref: source.source_ref.clone(),
                cached: false,
            })
            .collect();

        let workspace = workspace.map(|path| {
            // Recover the descriptor a previous build left behind.
            match std::fs::read_to_string(path.join(WORKSPACE_MARKER)) {
                Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|_| Workspace::new(&path)),
                Err(_) => Workspace::new(&path),
            }
        });

        Element {
            inner: Arc::new(ElementInner {
                id,
                name: config.name.clone(),
                commands: config.commands.clone(),
                dependencies: Mutex::new(Vec::new()),
                state: Mutex::new(ElementState {
                    sources,
                    artifact_cached: false,
                    workspace,
                }),
            }),
        }
    }

    pub(crate) fn set_dependencies(&self, dependencies: Vec<(Element, Scope)>) {
        *self.inner.dependencies.lock().unwrap() = dependencies;
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn dependencies(&self) -> Vec<(Element, Scope)> {
        self.inner.dependencies.lock().unwrap().clone()
    }

    pub fn has_sources(&self) -> bool {
        !self.inner.state.lock().unwrap().sources.is_empty()
    }

    /// The element's consistency given its current source state.
    pub fn consistency(&self) -> Consistency {
        let state = self.inner.state.lock().unwrap();
        if state.sources.is_empty() {
            return Consistency::Cached;
        }
        if state.sources.iter().any(|source| source.source_ref.is_none()) {
            return Consistency::Inconsistent;
        }
        if state.sources.iter().all(|source| source.cached) {
            Consistency::Cached
        } else {
            Consistency::Resolved
        }
    }

    pub fn source_refs(&self) -> Vec<Option<String>> {
        self.inner
            .state
            .lock()
            .unwrap()
            .sources
            .iter()
            .map(|source| source.source_ref.clone())
            .collect()
    }

    /// Install newly tracked refs. Returns whether anything changed.
    pub fn apply_refs(&self, refs: Vec<Option<String>>) -> bool {
        let mut state = self.inner.state.lock().unwrap();
        let mut changed = false;
        for (source, source_ref) in state.sources.iter_mut().zip(refs) {
            if source.source_ref != source_ref {
                source.source_ref = source_ref;
                source.cached = false;
                changed = true;
            }
        }
        if changed {
            // The cache key moved with the refs; any artifact flag refers to
            // the old key.
            state.artifact_cached = false;
        }
        changed
    }

    /// Re-derive which sources are present in the local source cache.
    pub fn refresh_cached_sources(&self, sources_dir: &Path) {
        let mut state = self.inner.state.lock().unwrap();
        for source in state.sources.iter_mut() {
            source.cached = match &source.source_ref {
                Some(source_ref) => sources_dir.join(source_ref).exists(),
                None => false,
            };
        }
    }

    pub fn mark_sources_cached(&self) {
        let mut state = self.inner.state.lock().unwrap();
        for source in state.sources.iter_mut() {
            source.cached = true;
        }
    }

    /// Re-derive whether the artifact for the current cache key exists.
    pub fn refresh_cached_artifact(&self, artifacts_dir: &Path) {
        let cached = self
            .cache_key()
            .map(|key| artifacts_dir.join(key).exists())
            .unwrap_or(false);
        self.inner.state.lock().unwrap().artifact_cached = cached;
    }

    pub fn artifact_cached(&self) -> bool {
        self.inner.state.lock().unwrap().artifact_cached
    }

    pub fn set_artifact_cached(&self, cached: bool) {
        self.inner.state.lock().unwrap().artifact_cached = cached;
    }

    /// Whether every build-visible dependency has its artifact available.
    pub fn dependencies_built(&self) -> bool {
        self.dependencies()
            .iter()
            .filter(|(_, scope)| Scope::Build.includes(*scope))
            .all(|(dep, _)| dep.artifact_cached())
    }

    /// Content-addressed cache key: element name, source refs, build
    /// commands and the keys of build-visible dependencies. `None` until
    /// every contributing ref is resolved.
    pub fn cache_key(&self) -> Option<String> {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.inner.name.as_bytes());
        hasher.update(b"\0");

        {
            let state = self.inner.state.lock().unwrap();
            for source in &state.sources {
                let source_ref = source.source_ref.as_ref()?;
                hasher.update(source.rel_path.to_string_lossy().as_bytes());
                hasher.update(b"=");
                hasher.update(source_ref.as_bytes());
                hasher.update(b"\0");
            }
        }
        for command in &self.inner.commands {
            hasher.update(command.as_bytes());
            hasher.update(b"\0");
        }
        for (dep, scope) in self.dependencies() {
            if Scope::Build.includes(scope) {
                hasher.update(dep.name().as_bytes());
                hasher.update(b"=");
                hasher.update(dep.cache_key()?.as_bytes());
                hasher.update(b"\0");
            }
        }

        Some(hasher.finalize().to_hex().to_string())
    }

    pub fn workspace(&self) -> Option<Workspace> {
        self.inner.state.lock().unwrap().workspace.clone()
    }

    /// Serialized copy handed to a worker.
    pub fn payload(&self, dirs: &ProjectDirs) -> ElementPayload {
        let (sources, workspace) = {
            let state = self.inner.state.lock().unwrap();
            let sources = state
                .sources
                .iter()
                .map(|source| SourcePayload {
                    path: source.abs_path.clone(),
                    source_ref: source.source_ref.clone(),
                })
                .collect();
            (sources, state.workspace.clone())
        };
        ElementPayload {
            name: self.inner.name.clone(),
            sources,
            commands: self.inner.commands.clone(),
            cache_key: self.cache_key(),
            workspace,
            dirs: dirs.clone(),
        }
    }
}

impl WorkItem for Element {
    fn id(&self) -> u64 {
        self.inner.id
    }

    fn name(&self) -> &str {
        &self.inner.name
    }

    fn apply_workspace(&self, workspace: &Value) {
        if let Ok(descriptor) = serde_json::from_value::<Workspace>(workspace.clone()) {
            self.inner.state.lock().unwrap().workspace = Some(descriptor);
        }
    }
}

/// Compute the content ref of a source file's bytes.
pub fn content_ref(data: &[u8]) -> String {
    blake3::hash(data).to_hex().to_string()
}

/// The serialized element copy a worker operates on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElementPayload {
    pub name: String,
    pub sources: Vec<SourcePayload>,
    pub commands: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace: Option<Workspace>,
    pub dirs: ProjectDirs,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourcePayload {
    /// Absolute path of the source file in the project.
    pub path: PathBuf,
    #[serde(default, rename = "ref", skip_serializing_if = "Option::is_none")]
    pub source_ref: Option<String>,
}

#[cfg(test)]
mod tests {
    use mason_core::item::Consistency;

    use super::{Scope, content_ref};
    use crate::testutil::demo_project;

    #[test]
    fn consistency_follows_refs_and_cache_state() {
        let (_dir, project) = demo_project(&[("base", &[], &[])]);
        let element = project.element("base").unwrap();

        assert_eq!(element.consistency(), Consistency::Inconsistent);

        element.apply_refs(vec![Some(content_ref(b"content of base"))]);
        assert_eq!(element.consistency(), Consistency::Resolved);

        element.mark_sources_cached();
        assert_eq!(element.consistency(), Consistency::Cached);
    }

    #[test]
    fn cache_keys_need_every_contributing_ref() {
        let (_dir, project) = demo_project(&[
            ("base", &[], &["true"]),
            ("app", &["base"], &["true"]),
        ]);
        let base = project.element("base").unwrap();
        let app = project.element("app").unwrap();

        assert!(app.cache_key().is_none(), "unresolved refs yield no key");

        base.apply_refs(vec![Some("r1".to_string())]);
        assert!(app.cache_key().is_none(), "own sources still unresolved");

        app.apply_refs(vec![Some("r2".to_string())]);
        let key = app.cache_key().expect("all refs resolved");

        // A dependency ref change ripples into the dependent's key.
        base.apply_refs(vec![Some("r3".to_string())]);
        assert_ne!(app.cache_key().unwrap(), key);
    }

    #[test]
    fn scope_edges() {
        assert!(Scope::All.includes(Scope::Run));
        assert!(Scope::Build.includes(Scope::All));
        assert!(Scope::Build.includes(Scope::Build));
        assert!(!Scope::Build.includes(Scope::Run));
        assert!(!Scope::Run.includes(Scope::Build));
    }
}
