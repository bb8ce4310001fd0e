use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// How settled an element's sources are.
///
/// The states are ordered: `Inconsistent < Resolved < Cached`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Consistency {
    /// At least one source has no resolved ref; tracking is required.
    Inconsistent,
    /// All refs are known but not every source is in the local source cache.
    Resolved,
    /// Every source is available locally; the element can be staged.
    Cached,
}

/// Descriptor of an open workspace, as reported back by workers.
///
/// The descriptor crosses the process boundary on every job (even failed
/// ones) so that state recorded during a build, such as the prepared marker
/// and the last successful build key, survives in the parent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workspace {
    /// Directory the workspace is open at.
    pub path: PathBuf,
    /// Whether the workspace has been prepared by a build at least once.
    #[serde(default)]
    pub prepared: bool,
    /// Cache key of the last successful build out of this workspace.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_successful: Option<String>,
}

impl Workspace {
    /// A fresh descriptor for a workspace rooted at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Workspace {
            path: path.into(),
            prepared: false,
            last_successful: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Consistency;

    #[test]
    fn consistency_orders_from_inconsistent_to_cached() {
        assert!(Consistency::Inconsistent < Consistency::Resolved);
        assert!(Consistency::Resolved < Consistency::Cached);
    }
}
