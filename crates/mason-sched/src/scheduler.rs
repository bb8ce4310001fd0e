//! The scheduler: an ordered pipeline of queues, a pool of concurrency
//! tokens, and one cooperative event loop integrating worker events with OS
//! signals.
//!
//! The parent never blocks on CPU-bound work; all parallelism lives in worker
//! processes. Elements completing in queue `i` are forwarded to queue `i+1`,
//! and the run ends when no job is in flight and no queue can progress.

use std::collections::HashMap;
use std::pin::Pin;
use std::process::ExitStatus;
use std::time::{Duration, Instant};

use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::mpsc;
use tokio::time::Sleep;

use mason_core::context::Context;
use mason_core::error::ErrorDomain;
use mason_core::message::{Message, MessageKind};

use crate::job::{Job, JobEvent, JobId, SpawnContext, WorkItem, WorkerLauncher};
use crate::queue::{Queue, QueueAction, QueueSummary};
use crate::tokens::TokenPool;

/// Terminal state of a scheduler run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedStatus {
    /// Every element concluded and none failed.
    Success,
    /// At least one element failed, or a queue hook raised.
    Error,
    /// The run was interrupted or terminated before completion.
    Terminated,
}

/// What to do when an element fails for good.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Keep scheduling the remaining elements; report `Error` at the end.
    Continue,
    /// Stop dispatching new work, drain in-flight jobs, exit with `Error`.
    Quit,
}

/// Scheduler construction parameters.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Token capacity for the Fetch class (track/fetch/pull).
    pub fetchers: usize,
    /// Token capacity for the Build class.
    pub builders: usize,
    /// Token capacity for the Push class.
    pub pushers: usize,
    /// Failure policy.
    pub on_error: ErrorAction,
    /// Grace period between SIGTERM and the process-group kill.
    pub termination_grace: Duration,
    /// Directory worker log files are written under.
    pub log_dir: Option<std::path::PathBuf>,
    /// Withhold non-unconditional messages from the front-end.
    pub silent_messages: bool,
    /// How worker processes are started.
    pub launcher: WorkerLauncher,
}

impl SchedulerConfig {
    /// Defaults: builders = core count, a small constant for the network
    /// classes, quit on error, five seconds of termination grace.
    pub fn new(launcher: WorkerLauncher) -> SchedulerConfig {
        SchedulerConfig {
            fetchers: 10,
            builders: std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1),
            pushers: 4,
            on_error: ErrorAction::Quit,
            termination_grace: Duration::from_secs(5),
            log_dir: None,
            silent_messages: false,
            launcher,
        }
    }
}

/// Result of a scheduler run.
#[derive(Debug)]
pub struct RunOutcome {
    /// Wall-clock duration of the run.
    pub elapsed: Duration,
    /// Terminal status.
    pub status: SchedStatus,
    /// `(domain, reason)` of the most recent worker domain failure, for
    /// diagnostics and tests.
    pub last_task_error: Option<(ErrorDomain, Option<String>)>,
    /// Per-stage counters in pipeline order.
    pub queues: Vec<QueueSummary>,
}

enum HandleRequest {
    Interrupt,
    Terminate,
    Suspend,
    Resume,
}

/// Cloneable handle injecting the same transitions the OS signals drive.
#[derive(Clone)]
pub struct SchedulerHandle {
    tx: mpsc::UnboundedSender<HandleRequest>,
}

impl SchedulerHandle {
    /// Equivalent to one SIGINT: stop dispatching, let in-flight jobs finish.
    /// A second call terminates in-flight jobs.
    pub fn interrupt(&self) {
        let _ = self.tx.send(HandleRequest::Interrupt);
    }

    /// Equivalent to SIGTERM: terminate all in-flight jobs, escalating to a
    /// process-group kill after the grace period.
    pub fn terminate(&self) {
        let _ = self.tx.send(HandleRequest::Terminate);
    }

    /// Equivalent to SIGTSTP from the controlling terminal.
    pub fn suspend(&self) {
        let _ = self.tx.send(HandleRequest::Suspend);
    }

    /// Equivalent to SIGCONT.
    pub fn resume(&self) {
        let _ = self.tx.send(HandleRequest::Resume);
    }
}

/// The scheduler. Construct once per session, then [`run`](Scheduler::run)
/// a pipeline of queues to completion.
pub struct Scheduler<I: WorkItem> {
    context: Context,
    config: SchedulerConfig,
    handle_tx: mpsc::UnboundedSender<HandleRequest>,
    handle_rx: mpsc::UnboundedReceiver<HandleRequest>,
    _marker: std::marker::PhantomData<I>,
}

impl<I: WorkItem> Scheduler<I> {
    /// Create a scheduler emitting messages through `context`.
    pub fn new(context: Context, config: SchedulerConfig) -> Scheduler<I> {
        let (handle_tx, handle_rx) = mpsc::unbounded_channel();
        Scheduler {
            context,
            config,
            handle_tx,
            handle_rx,
            _marker: std::marker::PhantomData,
        }
    }

    /// A handle for injecting interrupt/terminate/suspend/resume.
    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle {
            tx: self.handle_tx.clone(),
        }
    }

    /// Run `queues` as an ordered pipeline until terminal.
    ///
    /// Callers enqueue the initial elements into the queues before calling.
    /// Returns counters, the last task error, and the elapsed time alongside
    /// the terminal status.
    pub async fn run(self, queues: Vec<Queue<I>>) -> anyhow::Result<RunOutcome> {
        let started = Instant::now();

        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigtstp = signal(SignalKind::from_raw(libc::SIGTSTP))?;
        let mut sigcont = signal(SignalKind::from_raw(libc::SIGCONT))?;

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let tokens = TokenPool::new(self.config.fetchers, self.config.builders, self.config.pushers);
        let spawn_ctx = SpawnContext {
            launcher: self.config.launcher.clone(),
            event_tx,
            log_dir: self.config.log_dir.clone(),
            silent: self.config.silent_messages,
        };

        let mut rt = SchedRuntime {
            context: self.context.clone(),
            on_error: self.config.on_error,
            termination_grace: self.config.termination_grace,
            spawn_ctx,
            queues,
            tokens,
            jobs: HashMap::new(),
            event_rx,
            handle_rx: self.handle_rx,
            next_job_id: 0,
            stopping: false,
            interrupted: false,
            terminated: false,
            suspended: false,
            fatal: false,
            internal_stops: 0,
            kill_deadline: None,
            last_task_error: None,
        };

        rt.sched();

        loop {
            if rt.jobs.is_empty() {
                if rt.stopping || rt.terminated {
                    break;
                }
                rt.sched();
                if rt.jobs.is_empty() {
                    break;
                }
            }

            tokio::select! {
                event = rt.event_rx.recv() => {
                    if let Some(event) = event {
                        rt.handle_event(event);
                    }
                }
                request = rt.handle_rx.recv() => {
                    match request {
                        Some(HandleRequest::Interrupt) => rt.interrupt(),
                        Some(HandleRequest::Terminate) => rt.terminate_jobs(),
                        Some(HandleRequest::Suspend) => rt.suspend_event(),
                        Some(HandleRequest::Resume) => rt.resume_event(),
                        None => {}
                    }
                }
                _ = sigint.recv() => rt.interrupt(),
                _ = sigterm.recv() => rt.terminate_jobs(),
                _ = sigtstp.recv() => rt.suspend_event(),
                _ = sigcont.recv() => rt.resume_event(),
                _ = async {
                    match rt.kill_deadline.as_mut() {
                        Some(deadline) => deadline.as_mut().await,
                        None => std::future::pending::<()>().await,
                    }
                } => {
                    rt.kill_stragglers();
                }
            }
        }

        let status = if rt.terminated || rt.interrupted {
            SchedStatus::Terminated
        } else if rt.fatal || rt.queues.iter().any(|queue| !queue.failed().is_empty()) {
            SchedStatus::Error
        } else {
            SchedStatus::Success
        };

        Ok(RunOutcome {
            elapsed: started.elapsed(),
            status,
            last_task_error: rt.last_task_error,
            queues: rt.queues.iter().map(Queue::summary).collect(),
        })
    }
}

struct SchedRuntime<I: WorkItem> {
    context: Context,
    on_error: ErrorAction,
    termination_grace: Duration,
    spawn_ctx: SpawnContext,

    queues: Vec<Queue<I>>,
    tokens: TokenPool,
    jobs: HashMap<JobId, Job<I>>,
    event_rx: mpsc::UnboundedReceiver<JobEvent>,
    handle_rx: mpsc::UnboundedReceiver<HandleRequest>,
    next_job_id: JobId,

    stopping: bool,
    interrupted: bool,
    terminated: bool,
    suspended: bool,
    fatal: bool,
    internal_stops: u32,
    kill_deadline: Option<Pin<Box<Sleep>>>,
    last_task_error: Option<(ErrorDomain, Option<String>)>,
}

impl<I: WorkItem> SchedRuntime<I> {
    /// Walk the pipeline end-to-end and dispatch everything dispatchable.
    fn sched(&mut self) {
        if self.stopping || self.suspended {
            return;
        }
        for index in 0..self.queues.len() {
            let actions = self.queues[index].dispatch(&mut self.tokens);
            for action in actions {
                match action {
                    QueueAction::Skipped(item) => self.advance(index, item),
                    QueueAction::Spawn(item) => self.spawn_job(index, item),
                }
            }
        }
    }

    fn advance(&mut self, index: usize, item: I) {
        if index + 1 < self.queues.len() {
            self.queues[index + 1].enqueue([item]);
        }
    }

    fn spawn_job(&mut self, index: usize, item: I) {
        let (action, payload, max_retries) = {
            let behavior = self.queues[index].behavior();
            (behavior.action_name(), behavior.payload(&item), behavior.max_retries())
        };

        self.next_job_id += 1;
        let mut job = Job::new(self.next_job_id, index, item, action, payload, max_retries);

        if let Err(err) = job.spawn(&self.spawn_ctx) {
            self.context.emit(
                Message::new(
                    MessageKind::Error,
                    format!("{}: failed to start worker: {err}", job.item.name()),
                )
                .for_task(job.item.id()),
            );
            self.complete_job(job, false);
            return;
        }
        self.jobs.insert(job.id, job);
    }

    fn handle_event(&mut self, event: JobEvent) {
        match event {
            JobEvent::Envelope { job, envelope } => {
                if let Some(job) = self.jobs.get_mut(&job) {
                    job.process_envelope(envelope, &self.context, &mut self.last_task_error);
                }
            }
            JobEvent::Exited { job, status } => self.job_exited(job, status),
        }
    }

    fn job_exited(&mut self, id: JobId, status: std::io::Result<ExitStatus>) {
        let Some(mut job) = self.jobs.remove(&id) else {
            return;
        };
        let success = matches!(&status, Ok(status) if status.code() == Some(0));

        let halted = self.terminated || self.stopping;
        if job.should_retry(success, halted) {
            match job.spawn(&self.spawn_ctx) {
                Ok(()) => {
                    self.jobs.insert(id, job);
                    return;
                }
                Err(err) => {
                    self.context.emit(
                        Message::new(
                            MessageKind::Error,
                            format!("{}: failed to restart worker: {err}", job.item.name()),
                        )
                        .for_task(job.item.id()),
                    );
                }
            }
        }

        self.complete_job(job, success);
        self.sched();
    }

    /// Final completion: release the token held since dispatch, apply the
    /// reported workspace, run the queue's done hook, and forward the element
    /// down the pipeline when warranted.
    fn complete_job(&mut self, job: Job<I>, success: bool) {
        let index = job.queue_index;
        self.tokens.release(self.queues[index].resource());

        if let Some(workspace) = &job.workspace {
            job.item.apply_workspace(workspace);
        }

        match self.queues[index].finalize(&job.item, success, job.result.as_ref()) {
            Ok(advance) => {
                if success && advance {
                    self.advance(index, job.item.clone());
                }
                if !success && self.on_error == ErrorAction::Quit && !self.terminated {
                    self.fatal = true;
                    self.stopping = true;
                }
            }
            Err(err) => {
                let mut message = Message::new(
                    MessageKind::Error,
                    format!("{} ({}): {}", job.item.name(), job.action(), err),
                )
                .for_task(job.item.id());
                message.detail = err.detail.clone();
                self.context.emit(message);
                self.fatal = true;
                self.stopping = true;
            }
        }
    }

    fn interrupt(&mut self) {
        if self.terminated {
            return;
        }
        if !self.interrupted {
            self.interrupted = true;
            self.stopping = true;
            self.context.emit(Message::new(
                MessageKind::Status,
                "Interrupted: waiting for ongoing jobs, interrupt again to terminate them",
            ));
        } else {
            self.terminate_jobs();
        }
    }

    fn terminate_jobs(&mut self) {
        if self.terminated {
            return;
        }
        self.terminated = true;
        self.stopping = true;
        for job in self.jobs.values_mut() {
            job.terminate(&self.context);
        }
        if !self.jobs.is_empty() && self.kill_deadline.is_none() {
            self.kill_deadline = Some(Box::pin(tokio::time::sleep(self.termination_grace)));
        }
    }

    fn kill_stragglers(&mut self) {
        self.kill_deadline = None;
        for job in self.jobs.values_mut() {
            job.kill(&self.context);
        }
    }

    /// Inbound suspend event, either from the user's terminal or echoed back
    /// by the OS for a SIGTSTP we sent to a child. Each self-initiated
    /// suspend is absorbed exactly once; the counter never goes negative.
    fn suspend_event(&mut self) {
        if self.internal_stops > 0 {
            self.internal_stops -= 1;
            return;
        }
        if self.suspended {
            return;
        }
        self.suspended = true;
        let mut sent = 0;
        for job in self.jobs.values_mut() {
            if job.suspend(&self.context) {
                sent += 1;
            }
        }
        self.internal_stops += sent;
    }

    fn resume_event(&mut self) {
        if !self.suspended {
            return;
        }
        for job in self.jobs.values_mut() {
            job.resume(&self.context, false);
        }
        self.suspended = false;
        self.sched();
    }
}
