//! The project model: `project.json` and the directories derived from it.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::Context as _;
use serde::{Deserialize, Serialize};

use crate::element::{Element, Scope};

pub const PROJECT_FILE: &str = "project.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectConfig {
    pub name: String,
    #[serde(default)]
    pub directories: DirectoriesConfig,
    /// Optional "remote" artifact cache. A plain directory here stands in for
    /// a real cache service; its presence enables the pull and push stages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote: Option<PathBuf>,
    pub elements: Vec<ElementConfig>,
    /// Open workspaces, element name → directory.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub workspaces: BTreeMap<String, PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectoriesConfig {
    #[serde(default = "default_sources_dir")]
    pub sources: PathBuf,
    #[serde(default = "default_artifacts_dir")]
    pub artifacts: PathBuf,
    #[serde(default = "default_build_dir")]
    pub build: PathBuf,
    #[serde(default = "default_logs_dir")]
    pub logs: PathBuf,
}

impl Default for DirectoriesConfig {
    fn default() -> Self {
        DirectoriesConfig {
            sources: default_sources_dir(),
            artifacts: default_artifacts_dir(),
            build: default_build_dir(),
            logs: default_logs_dir(),
        }
    }
}

fn default_sources_dir() -> PathBuf {
    PathBuf::from(".mason/sources")
}

fn default_artifacts_dir() -> PathBuf {
    PathBuf::from(".mason/artifacts")
}

fn default_build_dir() -> PathBuf {
    PathBuf::from(".mason/build")
}

fn default_logs_dir() -> PathBuf {
    PathBuf::from(".mason/logs")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElementConfig {
    pub name: String,
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
    #[serde(default)]
    pub depends: Vec<DependencyConfig>,
    #[serde(default)]
    pub commands: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Source file, relative to the project root.
    pub path: PathBuf,
    /// Pinned content ref; written back by tracking.
    #[serde(default, rename = "ref", skip_serializing_if = "Option::is_none")]
    pub source_ref: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DependencyConfig {
    /// Shorthand: a bare element name, implying scope "all".
    Name(String),
    /// Full form with an explicit scope.
    Full {
        name: String,
        #[serde(default)]
        scope: Scope,
    },
}

impl DependencyConfig {
    pub fn name(&self) -> &str {
        match self {
            DependencyConfig::Name(name) => name,
            DependencyConfig::Full { name, .. } => name,
        }
    }

    pub fn scope(&self) -> Scope {
        match self {
            DependencyConfig::Name(_) => Scope::All,
            DependencyConfig::Full { scope, .. } => *scope,
        }
    }
}

/// Absolute per-project directories shared with workers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectDirs {
    pub sources: PathBuf,
    pub artifacts: PathBuf,
    pub build: PathBuf,
    pub logs: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote: Option<PathBuf>,
}

#[derive(Debug)]
struct ProjectInner {
    root: PathBuf,
    file: PathBuf,
    dirs: ProjectDirs,
    config: Mutex<ProjectConfig>,
    elements: Vec<Element>,
    by_name: HashMap<String, usize>,
}

/// A loaded project: the parsed config plus one [`Element`] handle per
/// configured element, with dependencies resolved.
#[derive(Debug, Clone)]
pub struct Project {
    inner: Arc<ProjectInner>,
}

impl Project {
    /// Load `project.json` from `root`, resolve element dependencies and
    /// recover cached-source state from the sources directory.
    pub fn load(root: &Path) -> anyhow::Result<Project> {
        let root = root
            .canonicalize()
            .with_context(|| format!("no such project directory: {}", root.display()))?;
        let file = root.join(PROJECT_FILE);
        let raw = std::fs::read_to_string(&file)
            .with_context(|| format!("cannot read {}", file.display()))?;
        let config: ProjectConfig = serde_json::from_str(&raw)
            .with_context(|| format!("cannot parse {}", file.display()))?;

        let dirs = ProjectDirs {
            sources: root.join(&config.directories.sources),
            artifacts: root.join(&config.directories.artifacts),
            build: root.join(&config.directories.build),
            logs: root.join(&config.directories.logs),
            remote: config.remote.as_ref().map(|remote| root.join(remote)),
        };

        let mut by_name = HashMap::new();
        for (index, element) in config.elements.iter().enumerate() {
            if by_name.insert(element.name.clone(), index).is_some() {
                anyhow::bail!("duplicate element name: {}", element.name);
            }
        }

        let elements: Vec<Element> = config
            .elements
            .iter()
            .enumerate()
            .map(|(index, element)| {
                let workspace = config.workspaces.get(&element.name).map(|dir| root.join(dir));
                Element::new(index as u64 + 1, element, &root, workspace)
            })
            .collect();

        // Wire dependency handles; missing names are a config error.
        for (index, element_config) in config.elements.iter().enumerate() {
            let mut deps = Vec::with_capacity(element_config.depends.len());
            for dep in &element_config.depends {
                let dep_index = *by_name.get(dep.name()).ok_or_else(|| {
                    anyhow::anyhow!(
                        "element {} depends on unknown element {}",
                        element_config.name,
                        dep.name()
                    )
                })?;
                deps.push((elements[dep_index].clone(), dep.scope()));
            }
            elements[index].set_dependencies(deps);
        }

        // Reject dependency cycles up front; cache keys recurse through
        // dependencies and rely on the graph being a DAG.
        let mut marks = HashMap::new();
        let mut order = Vec::new();
        for element in &elements {
            visit(element, Scope::All, &mut marks, &mut order)?;
        }

        let project = Project {
            inner: Arc::new(ProjectInner {
                root,
                file,
                dirs,
                config: Mutex::new(config),
                elements,
                by_name,
            }),
        };

        for element in project.elements() {
            element.refresh_cached_sources(&project.inner.dirs.sources);
            element.refresh_cached_artifact(&project.inner.dirs.artifacts);
        }

        Ok(project)
    }

    pub fn name(&self) -> String {
        self.inner.config.lock().unwrap().name.clone()
    }

    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    pub fn dirs(&self) -> &ProjectDirs {
        &self.inner.dirs
    }

    /// Whether artifacts can be pulled from a remote cache.
    pub fn has_fetch_remotes(&self) -> bool {
        self.inner.dirs.remote.is_some()
    }

    /// Whether artifacts can be pushed to a remote cache.
    pub fn has_push_remotes(&self) -> bool {
        self.inner.dirs.remote.is_some()
    }

    pub fn elements(&self) -> &[Element] {
        &self.inner.elements
    }

    pub fn element(&self, name: &str) -> Option<&Element> {
        self.inner
            .by_name
            .get(name)
            .map(|&index| &self.inner.elements[index])
    }

    /// Dependency-ordered plan rooted at `targets` (all elements when empty),
    /// following edges visible in `scope`. Rejects dependency cycles.
    pub fn plan(&self, targets: &[String], scope: Scope) -> anyhow::Result<Vec<Element>> {
        let roots: Vec<&Element> = if targets.is_empty() {
            self.elements().iter().collect()
        } else {
            targets
                .iter()
                .map(|name| {
                    self.element(name)
                        .ok_or_else(|| anyhow::anyhow!("no such element: {name}"))
                })
                .collect::<anyhow::Result<_>>()?
        };

        let mut order = Vec::new();
        let mut marks: HashMap<u64, VisitMark> = HashMap::new();
        for root in roots {
            visit(root, scope, &mut marks, &mut order)?;
        }
        Ok(order)
    }

    /// Write an element's resolved source refs back into `project.json`.
    ///
    /// Runs in the parent from the track queue's done hook; the file is
    /// rewritten atomically.
    pub fn save_refs(&self, element: &Element) -> anyhow::Result<()> {
        let mut config = self.inner.config.lock().unwrap();
        let entry = config
            .elements
            .iter_mut()
            .find(|entry| entry.name == element.name())
            .ok_or_else(|| anyhow::anyhow!("unknown element: {}", element.name()))?;
        let refs = element.source_refs();
        if entry.sources.len() != refs.len() {
            anyhow::bail!("source list changed for {} during the session", element.name());
        }
        for (source, source_ref) in entry.sources.iter_mut().zip(refs) {
            source.source_ref = source_ref;
        }
        save_atomic(&self.inner.file, &config)
    }
}

#[derive(Clone, Copy, PartialEq)]
enum VisitMark {
    InProgress,
    Done,
}

fn visit(
    element: &Element,
    scope: Scope,
    marks: &mut HashMap<u64, VisitMark>,
    order: &mut Vec<Element>,
) -> anyhow::Result<()> {
    match marks.get(&element.id()) {
        Some(VisitMark::Done) => return Ok(()),
        Some(VisitMark::InProgress) => {
            anyhow::bail!("circular dependency involving element {}", element.name())
        }
        None => {}
    }
    marks.insert(element.id(), VisitMark::InProgress);
    for (dep, dep_scope) in element.dependencies() {
        if scope.includes(dep_scope) {
            visit(&dep, scope, marks, order)?;
        }
    }
    marks.insert(element.id(), VisitMark::Done);
    order.push(element.clone());
    Ok(())
}

fn save_atomic(path: &Path, config: &ProjectConfig) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(config)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::element::Scope;
    use crate::testutil::demo_project;

    #[test]
    fn plan_orders_dependencies_before_dependents() {
        let (_dir, project) = demo_project(&[
            ("base", &[], &["echo base > $MASON_OUTPUT/base"]),
            ("lib", &["base"], &["echo lib > $MASON_OUTPUT/lib"]),
            ("app", &["lib"], &["echo app > $MASON_OUTPUT/app"]),
        ]);

        let plan = project.plan(&["app".to_string()], Scope::All).unwrap();
        let names: Vec<&str> = plan.iter().map(|element| element.name()).collect();
        assert_eq!(names, vec!["base", "lib", "app"]);
    }

    #[test]
    fn load_rejects_dependency_cycles() {
        let dir = tempfile::tempdir().unwrap();
        let config = serde_json::json!({
            "name": "cyclic",
            "elements": [
                {"name": "a", "depends": ["b"]},
                {"name": "b", "depends": ["a"]},
            ],
        });
        std::fs::write(
            dir.path().join("project.json"),
            serde_json::to_string_pretty(&config).unwrap(),
        )
        .unwrap();

        let err = crate::project::Project::load(dir.path()).unwrap_err();
        assert!(err.to_string().contains("circular dependency"));
    }

    #[test]
    fn refs_round_trip_through_the_project_file() {
        let (dir, project) = demo_project(&[("base", &[], &[])]);
        let element = project.element("base").unwrap().clone();
        element.apply_refs(vec![Some("abc123".to_string())]);
        project.save_refs(&element).unwrap();

        let reloaded = crate::project::Project::load(dir.path()).unwrap();
        let refs = reloaded.element("base").unwrap().source_refs();
        assert_eq!(refs, vec![Some("abc123".to_string())]);
    }
}
