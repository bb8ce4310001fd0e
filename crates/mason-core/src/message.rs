use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Classification of a [`Message`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// Developer chatter, hidden unless verbose.
    Debug,
    /// Transient scheduler state ("Build suspending", ...).
    Status,
    /// Informative output for the user.
    Info,
    /// A warning; the session continues.
    Warn,
    /// A handled error.
    Error,
    /// An unhandled error: a bug in mason or a plugin.
    Bug,
    /// Raw log output, only ever written to log files.
    Log,
    /// An action started on an element.
    Start,
    /// An action finished successfully.
    Success,
    /// An action failed.
    Fail,
}

impl MessageKind {
    /// Whether messages of this kind bypass the silent-messages switch.
    pub fn is_unconditional(self) -> bool {
        matches!(
            self,
            MessageKind::Info
                | MessageKind::Warn
                | MessageKind::Error
                | MessageKind::Bug
                | MessageKind::Fail
        )
    }

    /// Fixed-width label used in log files and the front-end.
    pub fn label(self) -> &'static str {
        match self {
            MessageKind::Debug => "DEBUG",
            MessageKind::Status => "STATUS",
            MessageKind::Info => "INFO",
            MessageKind::Warn => "WARN",
            MessageKind::Error => "ERROR",
            MessageKind::Bug => "BUG",
            MessageKind::Log => "LOG",
            MessageKind::Start => "START",
            MessageKind::Success => "SUCCESS",
            MessageKind::Fail => "FAIL",
        }
    }
}

/// A structured log/status record flowing through the [`Context`] bus.
///
/// Messages emitted inside a worker are tagged with the element id and the
/// action name before being forwarded to the parent process.
///
/// [`Context`]: crate::Context
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Id of the element this message concerns, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<u64>,
    /// Name of that element, for display.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_name: Option<String>,
    /// Message classification.
    pub kind: MessageKind,
    /// One-line message text.
    pub text: String,
    /// Optional multi-line detail block.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// The queue action this message was emitted under ("Track", "Build", ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    /// Active wall-clock time of the action, for `Success`/`Fail` messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elapsed: Option<Duration>,
    /// Log file the action writes to, for `Start` messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logfile: Option<PathBuf>,
}

impl Message {
    /// Create a message with just a kind and text.
    pub fn new(kind: MessageKind, text: impl Into<String>) -> Self {
        Message {
            task_id: None,
            task_name: None,
            kind,
            text: text.into(),
            detail: None,
            action: None,
            elapsed: None,
            logfile: None,
        }
    }

    /// Attach the element id.
    pub fn for_task(mut self, task_id: u64) -> Self {
        self.task_id = Some(task_id);
        self
    }

    /// Attach the element id and display name.
    pub fn for_item(mut self, task_id: u64, name: &str) -> Self {
        self.task_id = Some(task_id);
        self.task_name = Some(name.to_string());
        self
    }

    /// Attach a detail block.
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// Attach the active elapsed time.
    pub fn with_elapsed(mut self, elapsed: Duration) -> Self {
        self.elapsed = Some(elapsed);
        self
    }
}
