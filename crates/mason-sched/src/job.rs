//! Parent-side job handles.
//!
//! A [`Job`] governs one element's passage through one queue: it spawns the
//! worker process, drains its envelope channel, relays suspend/terminate
//! signals, and decides on retries when the worker exits nonzero.

use std::io;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};

use nix::sys::signal::Signal;
use nix::unistd::Pid;
use serde_json::Value;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;

use mason_core::context::Context;
use mason_core::error::ErrorDomain;
use mason_core::message::{Message, MessageKind};

use crate::envelope::{Envelope, WorkerRequest, encode_frame, read_frame_async};
use crate::signals;

/// A unit of work flowing through the pipeline, as the scheduler sees it.
///
/// Implementations are cheap cloneable handles (`Arc`-backed); the mutable
/// state behind them is only ever touched in the parent process. Workers
/// operate on serialized copies.
pub trait WorkItem: Clone + Send + Sync + 'static {
    /// Stable unique id for the run, used to tag cross-process messages.
    fn id(&self) -> u64;

    /// Display name.
    fn name(&self) -> &str;

    /// Apply a workspace descriptor reported back by a worker.
    fn apply_workspace(&self, workspace: &Value);
}

/// How to start a worker process.
#[derive(Debug, Clone)]
pub struct WorkerLauncher {
    /// Worker executable.
    pub program: PathBuf,
    /// Arguments selecting the worker entrypoint.
    pub args: Vec<String>,
}

impl WorkerLauncher {
    /// Re-execute the current binary with the hidden `worker` subcommand.
    pub fn current_exe() -> io::Result<WorkerLauncher> {
        Ok(WorkerLauncher {
            program: std::env::current_exe()?,
            args: vec!["worker".to_string()],
        })
    }

    /// Launch `program` with the given selector arguments.
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> WorkerLauncher {
        WorkerLauncher {
            program: program.into(),
            args,
        }
    }
}

pub(crate) type JobId = u64;

/// What a job's listener task reports back into the scheduler loop.
pub(crate) enum JobEvent {
    /// One decoded envelope, in channel order.
    Envelope { job: JobId, envelope: Envelope },
    /// The worker exited (or the wait itself failed).
    Exited {
        job: JobId,
        status: io::Result<ExitStatus>,
    },
}

/// Everything a job needs from the scheduler to start a worker.
pub(crate) struct SpawnContext {
    pub(crate) launcher: WorkerLauncher,
    pub(crate) event_tx: mpsc::UnboundedSender<JobEvent>,
    pub(crate) log_dir: Option<PathBuf>,
    pub(crate) silent: bool,
}

pub(crate) struct Job<I: WorkItem> {
    pub(crate) id: JobId,
    pub(crate) queue_index: usize,
    pub(crate) item: I,
    action: &'static str,
    payload: Value,
    max_retries: u32,
    tries: u32,
    pid: Option<Pid>,
    listening: bool,
    suspended: bool,
    /// Whether the current attempt reported a recognized domain error.
    /// Bugs and transport deaths leave this unset and are never retried.
    domain_failed: bool,
    pub(crate) result: Option<Value>,
    pub(crate) workspace: Option<Value>,
}

impl<I: WorkItem> Job<I> {
    pub(crate) fn new(
        id: JobId,
        queue_index: usize,
        item: I,
        action: &'static str,
        payload: Value,
        max_retries: u32,
    ) -> Job<I> {
        Job {
            id,
            queue_index,
            item,
            action,
            payload,
            max_retries,
            tries: 0,
            pid: None,
            listening: false,
            suspended: false,
            domain_failed: false,
            result: None,
            workspace: None,
        }
    }

    pub(crate) fn action(&self) -> &'static str {
        self.action
    }

    /// Start a fresh worker for this job.
    ///
    /// SIGINT is blocked while the child is constructed so the worker inherits
    /// a blocked interrupt mask; only the parent handles interrupts. The
    /// spawned listener task forwards envelopes and finally the exit status
    /// into the scheduler's event channel, preserving per-channel order.
    pub(crate) fn spawn(&mut self, ctx: &SpawnContext) -> io::Result<()> {
        self.tries += 1;

        let request = WorkerRequest {
            action: self.action.to_ascii_lowercase(),
            item_id: self.item.id(),
            item_name: self.item.name().to_string(),
            tries: self.tries,
            max_retries: self.max_retries,
            silent: ctx.silent,
            log_dir: ctx.log_dir.clone(),
            payload: self.payload.clone(),
        };
        let frame = encode_frame(&request)?;

        let mut command = Command::new(&ctx.launcher.program);
        command
            .args(&ctx.launcher.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());

        // The standard library resets the child's signal mask before exec, so
        // re-block SIGINT from inside the child: the parent alone handles
        // interrupts. Only async-signal-safe calls are allowed here.
        unsafe {
            command.pre_exec(|| {
                let mut set = std::mem::zeroed::<libc::sigset_t>();
                libc::sigemptyset(&mut set);
                libc::sigaddset(&mut set, libc::SIGINT);
                libc::sigprocmask(libc::SIG_BLOCK, &set, std::ptr::null_mut());
                Ok(())
            });
        }

        let mut child = {
            let _masked = signals::blocked(&[Signal::SIGINT])?;
            command.spawn()?
        };

        self.pid = child.id().map(|pid| Pid::from_raw(pid as i32));
        self.listening = true;
        self.suspended = false;
        self.domain_failed = false;

        let job = self.id;
        let event_tx = ctx.event_tx.clone();
        tokio::spawn(async move {
            if let Some(mut stdin) = child.stdin.take() {
                let _ = stdin.write_all(&frame).await;
                let _ = stdin.shutdown().await;
            }

            if let Some(stdout) = child.stdout.take() {
                let mut reader = BufReader::new(stdout);
                loop {
                    match read_frame_async::<_, Envelope>(&mut reader).await {
                        Ok(Some(envelope)) => {
                            if event_tx.send(JobEvent::Envelope { job, envelope }).is_err() {
                                break;
                            }
                        }
                        Ok(None) | Err(_) => break,
                    }
                }
            }

            let status = child.wait().await;
            let _ = event_tx.send(JobEvent::Exited { job, status });
        });

        Ok(())
    }

    /// Dispatch one envelope received from the worker.
    pub(crate) fn process_envelope(
        &mut self,
        envelope: Envelope,
        context: &Context,
        last_task_error: &mut Option<(ErrorDomain, Option<String>)>,
    ) {
        if !self.listening {
            return;
        }
        match envelope {
            Envelope::Message { message } => context.emit(message),
            Envelope::Error { domain, reason } => {
                self.domain_failed = true;
                *last_task_error = Some((domain, reason));
            }
            Envelope::Result { value } => {
                debug_assert!(self.result.is_none(), "worker delivered a second result");
                self.result = Some(value);
            }
            Envelope::Workspace { value } => {
                self.workspace = Some(value);
            }
        }
    }

    /// Stop the worker via SIGTSTP. Returns whether a stop signal went out;
    /// the caller records one expected suspend echo per successful send.
    pub(crate) fn suspend(&mut self, context: &Context) -> bool {
        if self.suspended {
            return false;
        }
        let Some(pid) = self.pid else { return false };
        self.message(context, MessageKind::Status, format!("{} suspending", self.action));
        match signals::send(pid, Signal::SIGTSTP) {
            Ok(true) => {
                self.suspended = true;
                true
            }
            // Already exited; the reap will arrive shortly.
            Ok(false) | Err(_) => false,
        }
    }

    /// Continue a suspended worker.
    pub(crate) fn resume(&mut self, context: &Context, silent: bool) {
        if !self.suspended {
            return;
        }
        if !silent {
            self.message(context, MessageKind::Status, format!("{} resuming", self.action));
        }
        if let Some(pid) = self.pid {
            let _ = signals::send(pid, Signal::SIGCONT);
        }
        self.suspended = false;
    }

    /// Ask the worker to terminate. The channel is no longer drained; any
    /// envelopes still in flight are discarded.
    pub(crate) fn terminate(&mut self, context: &Context) {
        self.resume(context, true);
        self.message(context, MessageKind::Status, format!("{} terminating", self.action));
        self.listening = false;
        if let Some(pid) = self.pid {
            let _ = signals::send(pid, Signal::SIGTERM);
        }
    }

    /// Escalate: SIGKILL the worker's whole process group.
    pub(crate) fn kill(&mut self, context: &Context) {
        self.message(
            context,
            MessageKind::Warn,
            format!("{} did not terminate gracefully, killing", self.action),
        );
        if let Some(pid) = self.pid {
            let _ = signals::kill_process_group(pid);
        }
    }

    /// Whether a failed attempt warrants a fresh worker. Only recognized
    /// domain failures are retried; a worker that crashed without reporting
    /// one (a bug, a kill, a dead channel) fails the job outright.
    pub(crate) fn should_retry(&self, success: bool, halted: bool) -> bool {
        !success && !halted && self.domain_failed && self.tries <= self.max_retries
    }

    fn message(&self, context: &Context, kind: MessageKind, text: String) {
        context.emit(Message::new(kind, text).for_item(self.item.id(), self.item.name()));
    }
}
