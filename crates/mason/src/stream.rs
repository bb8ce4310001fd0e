//! The top-level calling interface: assembles pipelines per session kind and
//! runs them on the scheduler.

use std::path::Path;

use mason_core::context::Context;
use mason_core::item::Consistency;
use mason_sched::{Queue, RunOutcome, SchedStatus, Scheduler, SchedulerConfig};

use crate::actions::copy_tree;
use crate::element::{Element, Scope};
use crate::project::Project;
use crate::queues::{BuildQueue, FetchQueue, PullQueue, PushQueue, TrackQueue};

/// A session that ran to the end but did not succeed.
///
/// The scheduler outcome (counters, last task error, elapsed time) rides
/// along so callers can still render the session summary; fish it back out
/// with `downcast_ref` on the anyhow error.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    /// At least one element failed, or a queue hook raised.
    #[error("session failed")]
    Failed(RunOutcome),
    /// The session was interrupted or terminated before completion.
    #[error("session terminated")]
    Terminated(RunOutcome),
}

impl StreamError {
    /// The outcome of the failed session.
    pub fn outcome(&self) -> &RunOutcome {
        match self {
            StreamError::Failed(outcome) => outcome,
            StreamError::Terminated(outcome) => outcome,
        }
    }
}

/// One session over a loaded project.
pub struct Stream {
    project: Project,
    context: Context,
    config: SchedulerConfig,
    retries: u32,
}

impl Stream {
    pub fn new(project: Project, context: Context, config: SchedulerConfig, retries: u32) -> Stream {
        Stream {
            project,
            context,
            config,
            retries,
        }
    }

    /// Track the sources of all the elements in the plan. Project files are
    /// rewritten inline as refs resolve.
    pub async fn track(&self, targets: &[String]) -> anyhow::Result<RunOutcome> {
        let plan = self.project.plan(targets, Scope::All)?;
        let mut track = Queue::new(TrackQueue::new(&self.project));
        track.enqueue(plan);
        self.run(vec![track]).await
    }

    /// Fetch sources, optionally tracking first.
    pub async fn fetch(&self, targets: &[String], track_first: bool) -> anyhow::Result<RunOutcome> {
        let plan = self.project.plan(targets, Scope::All)?;
        let mut queues = Vec::new();
        if track_first {
            queues.push(Queue::new(TrackQueue::new(&self.project)));
        } else {
            assert_consistent(&plan)?;
        }
        queues.push(Queue::new(FetchQueue::new(&self.project, self.retries)));
        queues[0].enqueue(plan);
        self.run(queues).await
    }

    /// Build the plan: track? → pull? → fetch → build → push?.
    ///
    /// The pull stage is only installed when the artifact cache can fetch,
    /// push only when it can push.
    pub async fn build(&self, targets: &[String], track_first: bool) -> anyhow::Result<RunOutcome> {
        let plan = self.project.plan(targets, Scope::All)?;
        let mut queues = Vec::new();
        if track_first {
            queues.push(Queue::new(TrackQueue::new(&self.project)));
        } else {
            assert_consistent(&plan)?;
        }
        if self.project.has_fetch_remotes() {
            queues.push(Queue::new(PullQueue::new(&self.project, self.retries)));
        }
        queues.push(Queue::new(FetchQueue::new(&self.project, self.retries)));
        queues.push(Queue::new(BuildQueue::new(&self.project, 0)));
        if self.project.has_push_remotes() {
            queues.push(Queue::new(PushQueue::new(&self.project, self.retries)));
        }
        queues[0].enqueue(plan);
        self.run(queues).await
    }

    /// Pull artifacts for the plan from the remote cache.
    pub async fn pull(&self, targets: &[String]) -> anyhow::Result<RunOutcome> {
        if !self.project.has_fetch_remotes() {
            anyhow::bail!("no artifact cache available for pulling artifacts");
        }
        let plan = self.project.plan(targets, Scope::All)?;
        assert_consistent(&plan)?;
        let mut pull = Queue::new(PullQueue::new(&self.project, self.retries));
        pull.enqueue(plan);
        self.run(vec![pull]).await
    }

    /// Push built artifacts for the plan to the remote cache.
    pub async fn push(&self, targets: &[String]) -> anyhow::Result<RunOutcome> {
        if !self.project.has_push_remotes() {
            anyhow::bail!("no artifact cache available for pushing artifacts");
        }
        let plan = self.project.plan(targets, Scope::All)?;
        assert_consistent(&plan)?;
        let mut push = Queue::new(PushQueue::new(&self.project, self.retries));
        push.enqueue(plan);
        self.run(vec![push]).await
    }

    /// Copy a built artifact out of the local cache into `directory`.
    pub fn checkout(&self, target: &str, directory: &Path, force: bool) -> anyhow::Result<()> {
        let element = self
            .project
            .element(target)
            .ok_or_else(|| anyhow::anyhow!("no such element: {target}"))?;
        let key = element
            .cache_key()
            .ok_or_else(|| anyhow::anyhow!("{target} is inconsistent, track it first"))?;
        let artifact = self.project.dirs().artifacts.join(&key);
        if !artifact.is_dir() {
            anyhow::bail!("{target} is not built");
        }

        std::fs::create_dir_all(directory)?;
        if !force && directory.read_dir()?.next().is_some() {
            anyhow::bail!("checkout directory is not empty: {}", directory.display());
        }
        copy_tree(&artifact, directory)?;
        Ok(())
    }

    async fn run(&self, queues: Vec<Queue<Element>>) -> anyhow::Result<RunOutcome> {
        let scheduler: Scheduler<Element> =
            Scheduler::new(self.context.clone(), self.config.clone());
        let outcome = scheduler.run(queues).await?;
        match outcome.status {
            SchedStatus::Success => Ok(outcome),
            SchedStatus::Error => Err(StreamError::Failed(outcome).into()),
            SchedStatus::Terminated => Err(StreamError::Terminated(outcome).into()),
        }
    }
}

fn assert_consistent(plan: &[Element]) -> anyhow::Result<()> {
    let inconsistent: Vec<&str> = plan
        .iter()
        .filter(|element| element.consistency() == Consistency::Inconsistent)
        .map(Element::name)
        .collect();
    if !inconsistent.is_empty() {
        anyhow::bail!(
            "inconsistent pipeline, track these elements first: {}",
            inconsistent.join(", ")
        );
    }
    Ok(())
}
