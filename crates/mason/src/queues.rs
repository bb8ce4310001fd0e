//! The concrete pipeline stages.
//!
//! Each stage implements [`QueueBehavior`] for [`Element`]: readiness from
//! the element's parent-side state, the serialized payload workers run on,
//! and the done hook mutating element (and project) state back in the parent.

use serde_json::Value;

use mason_core::error::{DomainError, ErrorDomain};
use mason_core::item::Consistency;
use mason_sched::{QueueBehavior, QueueStatus, ResourceClass};

use crate::element::Element;
use crate::project::Project;

/// Tracks sources: re-resolves every source ref.
pub struct TrackQueue {
    project: Project,
}

impl TrackQueue {
    pub fn new(project: &Project) -> TrackQueue {
        TrackQueue {
            project: project.clone(),
        }
    }
}

impl QueueBehavior<Element> for TrackQueue {
    fn action_name(&self) -> &'static str {
        "Track"
    }

    fn complete_name(&self) -> &'static str {
        "Tracked"
    }

    fn resource(&self) -> ResourceClass {
        ResourceClass::Fetch
    }

    fn status(&self, element: &Element) -> QueueStatus {
        // Elements without sources have nothing to track.
        if !element.has_sources() {
            return QueueStatus::Skip;
        }
        QueueStatus::Ready
    }

    fn payload(&self, element: &Element) -> Value {
        serde_json::to_value(element.payload(self.project.dirs())).unwrap_or(Value::Null)
    }

    fn done(
        &self,
        element: &Element,
        result: Option<&Value>,
        success: bool,
    ) -> Result<bool, DomainError> {
        if !success {
            return Ok(false);
        }
        let Some(Value::Array(entries)) = result else {
            return Ok(true);
        };

        let refs = entries
            .iter()
            .map(|entry| entry["ref"].as_str().map(str::to_string))
            .collect();
        element.apply_refs(refs);
        element.refresh_cached_sources(&self.project.dirs().sources);
        element.refresh_cached_artifact(&self.project.dirs().artifacts);

        // Persist the new refs in the project file, one element at a time as
        // they complete. A failure here poisons the whole session.
        self.project.save_refs(element).map_err(|err| {
            DomainError::new(
                ErrorDomain::Project,
                format!("failed to update project file: {err:#}"),
            )
            .with_reason("save-refs")
        })?;
        Ok(true)
    }
}

/// Imports sources into the local source cache.
pub struct FetchQueue {
    project: Project,
    retries: u32,
}

impl FetchQueue {
    pub fn new(project: &Project, retries: u32) -> FetchQueue {
        FetchQueue {
            project: project.clone(),
            retries,
        }
    }
}

impl QueueBehavior<Element> for FetchQueue {
    fn action_name(&self) -> &'static str {
        "Fetch"
    }

    fn complete_name(&self) -> &'static str {
        "Fetched"
    }

    fn resource(&self) -> ResourceClass {
        ResourceClass::Fetch
    }

    fn max_retries(&self) -> u32 {
        self.retries
    }

    fn status(&self, element: &Element) -> QueueStatus {
        if element.artifact_cached() {
            // A pulled artifact makes the sources unnecessary.
            return QueueStatus::Skip;
        }
        match element.consistency() {
            Consistency::Inconsistent => QueueStatus::Wait,
            Consistency::Resolved => QueueStatus::Ready,
            Consistency::Cached => QueueStatus::Skip,
        }
    }

    fn payload(&self, element: &Element) -> Value {
        serde_json::to_value(element.payload(self.project.dirs())).unwrap_or(Value::Null)
    }

    fn done(
        &self,
        element: &Element,
        _result: Option<&Value>,
        success: bool,
    ) -> Result<bool, DomainError> {
        if !success {
            return Ok(false);
        }
        element.mark_sources_cached();
        Ok(true)
    }
}

/// Assembles elements in a scratch directory.
pub struct BuildQueue {
    project: Project,
    retries: u32,
}

impl BuildQueue {
    pub fn new(project: &Project, retries: u32) -> BuildQueue {
        BuildQueue {
            project: project.clone(),
            retries,
        }
    }
}

impl QueueBehavior<Element> for BuildQueue {
    fn action_name(&self) -> &'static str {
        "Build"
    }

    fn complete_name(&self) -> &'static str {
        "Built"
    }

    fn resource(&self) -> ResourceClass {
        ResourceClass::Build
    }

    fn max_retries(&self) -> u32 {
        self.retries
    }

    fn status(&self, element: &Element) -> QueueStatus {
        if element.artifact_cached() {
            return QueueStatus::Skip;
        }
        if element.consistency() != Consistency::Cached {
            return QueueStatus::Wait;
        }
        if !element.dependencies_built() {
            return QueueStatus::Wait;
        }
        QueueStatus::Ready
    }

    fn payload(&self, element: &Element) -> Value {
        serde_json::to_value(element.payload(self.project.dirs())).unwrap_or(Value::Null)
    }

    fn done(
        &self,
        element: &Element,
        _result: Option<&Value>,
        success: bool,
    ) -> Result<bool, DomainError> {
        if !success {
            return Ok(false);
        }
        element.set_artifact_cached(true);
        Ok(true)
    }
}

/// Pulls ready-made artifacts from the remote cache.
pub struct PullQueue {
    project: Project,
    retries: u32,
}

impl PullQueue {
    pub fn new(project: &Project, retries: u32) -> PullQueue {
        PullQueue {
            project: project.clone(),
            retries,
        }
    }
}

impl QueueBehavior<Element> for PullQueue {
    fn action_name(&self) -> &'static str {
        "Pull"
    }

    fn complete_name(&self) -> &'static str {
        "Pulled"
    }

    fn resource(&self) -> ResourceClass {
        ResourceClass::Fetch
    }

    fn max_retries(&self) -> u32 {
        self.retries
    }

    fn status(&self, element: &Element) -> QueueStatus {
        if element.artifact_cached() {
            return QueueStatus::Skip;
        }
        let Some(key) = element.cache_key() else {
            // Refs (own or a dependency's) still unresolved; a tracking stage
            // ahead of us will settle them.
            return QueueStatus::Wait;
        };
        match &self.project.dirs().remote {
            Some(remote) if remote.join(key).is_dir() => QueueStatus::Ready,
            _ => QueueStatus::Skip,
        }
    }

    fn payload(&self, element: &Element) -> Value {
        serde_json::to_value(element.payload(self.project.dirs())).unwrap_or(Value::Null)
    }

    fn done(
        &self,
        element: &Element,
        _result: Option<&Value>,
        success: bool,
    ) -> Result<bool, DomainError> {
        if !success {
            return Ok(false);
        }
        element.set_artifact_cached(true);
        Ok(true)
    }
}

/// Uploads locally built artifacts to the remote cache.
pub struct PushQueue {
    project: Project,
    retries: u32,
}

impl PushQueue {
    pub fn new(project: &Project, retries: u32) -> PushQueue {
        PushQueue {
            project: project.clone(),
            retries,
        }
    }
}

impl QueueBehavior<Element> for PushQueue {
    fn action_name(&self) -> &'static str {
        "Push"
    }

    fn complete_name(&self) -> &'static str {
        "Pushed"
    }

    fn resource(&self) -> ResourceClass {
        ResourceClass::Push
    }

    fn max_retries(&self) -> u32 {
        self.retries
    }

    fn status(&self, element: &Element) -> QueueStatus {
        if !element.artifact_cached() {
            return QueueStatus::Skip;
        }
        match (element.cache_key(), &self.project.dirs().remote) {
            (Some(ref key), Some(remote)) if !remote.join(key).is_dir() => QueueStatus::Ready,
            _ => QueueStatus::Skip,
        }
    }

    fn payload(&self, element: &Element) -> Value {
        serde_json::to_value(element.payload(self.project.dirs())).unwrap_or(Value::Null)
    }

    fn done(
        &self,
        _element: &Element,
        _result: Option<&Value>,
        success: bool,
    ) -> Result<bool, DomainError> {
        Ok(success)
    }
}
