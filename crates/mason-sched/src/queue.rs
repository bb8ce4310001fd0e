//! The queue framework.
//!
//! A [`Queue`] is one pipeline stage: a FIFO of elements plus a
//! [`QueueBehavior`] describing what the stage does. Behaviors decide
//! readiness, produce the serialized payload a worker runs on, and
//! post-process results in the parent.

use std::collections::{HashSet, VecDeque};

use serde_json::Value;

use mason_core::error::DomainError;

use crate::job::WorkItem;
use crate::tokens::{ResourceClass, TokenPool};

/// Readiness of one element in a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueStatus {
    /// Dispatch a worker now (given a free token).
    Ready,
    /// Not consumable yet; re-evaluated after every state change.
    Wait,
    /// Nothing to do: finalize immediately with synthetic success, without
    /// spawning a worker or consuming a token.
    Skip,
}

/// Per-stage behavior hooks.
///
/// `payload` is the only data a worker sees; `done` is the only place element
/// state is mutated, and it runs in the parent.
pub trait QueueBehavior<I: WorkItem>: Send {
    /// User-visible action name ("Track", "Build", ...).
    fn action_name(&self) -> &'static str;

    /// Past-tense name for summaries ("Tracked", "Built", ...).
    fn complete_name(&self) -> &'static str;

    /// Which token class workers of this queue consume.
    fn resource(&self) -> ResourceClass;

    /// Automatic retry budget for failed workers.
    fn max_retries(&self) -> u32 {
        0
    }

    /// Readiness decision for `item` given its current state.
    fn status(&self, item: &I) -> QueueStatus;

    /// Serialized copy of `item` for the worker to operate on.
    fn payload(&self, item: &I) -> Value;

    /// Parent-side post-processing once the job concluded. Returns whether
    /// the element should continue down the pipeline; an `Err` is fatal to
    /// the whole scheduler.
    fn done(&self, item: &I, result: Option<&Value>, success: bool) -> Result<bool, DomainError>;
}

/// What a dispatch pass asks the scheduler to do for one element.
pub(crate) enum QueueAction<I> {
    /// Reserve done; construct and spawn a job.
    Spawn(I),
    /// Skipped: already finalized, forward to the next stage.
    Skipped(I),
}

/// Counters of a finished (or running) queue, for session summaries.
#[derive(Debug, Clone)]
pub struct QueueSummary {
    /// Action name of the stage.
    pub action: &'static str,
    /// Past-tense name of the stage.
    pub complete: &'static str,
    /// Elements processed by a worker.
    pub processed: usize,
    /// Elements skipped (no work needed).
    pub skipped: usize,
    /// Names of elements that failed, in completion order.
    pub failed: Vec<String>,
}

/// One pipeline stage's FIFO plus its behavior.
pub struct Queue<I: WorkItem> {
    behavior: Box<dyn QueueBehavior<I>>,
    ready: VecDeque<I>,
    processing: HashSet<u64>,
    done: Vec<(I, bool)>,
    processed: usize,
    skipped: usize,
    failed: Vec<String>,
}

impl<I: WorkItem> Queue<I> {
    /// Wrap a behavior into a queue with empty state.
    pub fn new(behavior: impl QueueBehavior<I> + 'static) -> Queue<I> {
        Queue {
            behavior: Box::new(behavior),
            ready: VecDeque::new(),
            processing: HashSet::new(),
            done: Vec::new(),
            processed: 0,
            skipped: 0,
            failed: Vec::new(),
        }
    }

    /// Append elements to the stage FIFO.
    pub fn enqueue(&mut self, items: impl IntoIterator<Item = I>) {
        self.ready.extend(items);
    }

    /// The stage's action name.
    pub fn action_name(&self) -> &'static str {
        self.behavior.action_name()
    }

    /// The stage's token class.
    pub fn resource(&self) -> ResourceClass {
        self.behavior.resource()
    }

    pub(crate) fn behavior(&self) -> &dyn QueueBehavior<I> {
        &*self.behavior
    }

    /// One FIFO pass over the ready list.
    ///
    /// Skips are greedy and token-free; waiting elements stay in place in
    /// their original order; ready elements are dispatched as long as tokens
    /// of this queue's class hold out.
    pub(crate) fn dispatch(&mut self, tokens: &mut TokenPool) -> Vec<QueueAction<I>> {
        let mut actions = Vec::new();
        let mut leftover = VecDeque::with_capacity(self.ready.len());

        while let Some(item) = self.ready.pop_front() {
            match self.behavior.status(&item) {
                QueueStatus::Skip => {
                    self.skipped += 1;
                    self.done.push((item.clone(), true));
                    actions.push(QueueAction::Skipped(item));
                }
                QueueStatus::Wait => leftover.push_back(item),
                QueueStatus::Ready => {
                    if tokens.reserve(self.behavior.resource()) {
                        self.processing.insert(item.id());
                        actions.push(QueueAction::Spawn(item));
                    } else {
                        leftover.push_back(item);
                    }
                }
            }
        }

        self.ready = leftover;
        actions
    }

    /// Conclude one element after its job finished (or was skipped past).
    ///
    /// Returns whether the element advances to the next stage. Successful
    /// elements whose `done` hook reports "no change" are counted as skipped
    /// and dropped from the pipeline.
    pub(crate) fn finalize(
        &mut self,
        item: &I,
        success: bool,
        result: Option<&Value>,
    ) -> Result<bool, DomainError> {
        self.processing.remove(&item.id());

        let keep = match self.behavior.done(item, result, success) {
            Ok(keep) => keep,
            Err(err) => {
                self.failed.push(item.name().to_string());
                self.done.push((item.clone(), false));
                return Err(err);
            }
        };

        if !success {
            self.failed.push(item.name().to_string());
            self.done.push((item.clone(), false));
            return Ok(false);
        }

        if keep {
            self.processed += 1;
        } else {
            self.skipped += 1;
        }
        self.done.push((item.clone(), true));
        Ok(keep)
    }

    /// Number of elements currently being processed by workers.
    pub fn active(&self) -> usize {
        self.processing.len()
    }

    /// Whether elements are still waiting in the ready FIFO.
    pub fn has_backlog(&self) -> bool {
        !self.ready.is_empty()
    }

    /// Names of elements that failed in this queue.
    pub fn failed(&self) -> &[String] {
        &self.failed
    }

    /// Snapshot the stage counters.
    pub fn summary(&self) -> QueueSummary {
        QueueSummary {
            action: self.behavior.action_name(),
            complete: self.behavior.complete_name(),
            processed: self.processed,
            skipped: self.skipped,
            failed: self.failed.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    use serde_json::{Value, json};

    use mason_core::error::{DomainError, ErrorDomain};

    use super::{Queue, QueueAction, QueueBehavior, QueueStatus};
    use crate::job::WorkItem;
    use crate::tokens::{ResourceClass, TokenPool};

    #[derive(Clone)]
    struct TestItem {
        id: u64,
        name: Arc<String>,
    }

    impl TestItem {
        fn new(id: u64, name: &str) -> TestItem {
            TestItem {
                id,
                name: Arc::new(name.to_string()),
            }
        }
    }

    impl WorkItem for TestItem {
        fn id(&self) -> u64 {
            self.id
        }

        fn name(&self) -> &str {
            &self.name
        }

        fn apply_workspace(&self, _workspace: &Value) {}
    }

    struct TestBehavior {
        statuses: Arc<Mutex<HashMap<u64, QueueStatus>>>,
        done_fails_for: Option<u64>,
        keep_for_all: bool,
    }

    impl TestBehavior {
        fn ready_all() -> TestBehavior {
            TestBehavior {
                statuses: Arc::new(Mutex::new(HashMap::new())),
                done_fails_for: None,
                keep_for_all: true,
            }
        }
    }

    impl QueueBehavior<TestItem> for TestBehavior {
        fn action_name(&self) -> &'static str {
            "Test"
        }

        fn complete_name(&self) -> &'static str {
            "Tested"
        }

        fn resource(&self) -> ResourceClass {
            ResourceClass::Build
        }

        fn status(&self, item: &TestItem) -> QueueStatus {
            *self
                .statuses
                .lock()
                .unwrap()
                .get(&item.id)
                .unwrap_or(&QueueStatus::Ready)
        }

        fn payload(&self, item: &TestItem) -> Value {
            json!({"id": item.id})
        }

        fn done(
            &self,
            item: &TestItem,
            _result: Option<&Value>,
            _success: bool,
        ) -> Result<bool, DomainError> {
            if self.done_fails_for == Some(item.id) {
                return Err(DomainError::new(ErrorDomain::Project, "cannot save refs"));
            }
            Ok(self.keep_for_all)
        }
    }

    fn spawned_ids(actions: &[QueueAction<TestItem>]) -> Vec<u64> {
        actions
            .iter()
            .filter_map(|action| match action {
                QueueAction::Spawn(item) => Some(item.id),
                QueueAction::Skipped(_) => None,
            })
            .collect()
    }

    #[test]
    fn dispatch_is_fifo_and_bounded_by_tokens() {
        let mut queue = Queue::new(TestBehavior::ready_all());
        queue.enqueue((1..=5).map(|id| TestItem::new(id, &format!("e{id}"))));

        let mut tokens = TokenPool::new(1, 2, 1);
        let actions = queue.dispatch(&mut tokens);
        assert_eq!(spawned_ids(&actions), vec![1, 2]);
        assert_eq!(queue.active(), 2);
        assert!(queue.has_backlog());

        // No tokens left: a second pass dispatches nothing and keeps order.
        let actions = queue.dispatch(&mut tokens);
        assert!(actions.is_empty());

        tokens.release(ResourceClass::Build);
        let actions = queue.dispatch(&mut tokens);
        assert_eq!(spawned_ids(&actions), vec![3]);
    }

    #[test]
    fn skip_is_greedy_and_needs_no_token() {
        let behavior = TestBehavior::ready_all();
        behavior.statuses.lock().unwrap().insert(1, QueueStatus::Skip);
        behavior.statuses.lock().unwrap().insert(2, QueueStatus::Wait);
        let mut queue = Queue::new(behavior);
        queue.enqueue(vec![
            TestItem::new(1, "skipped"),
            TestItem::new(2, "waiting"),
            TestItem::new(3, "ready"),
        ]);

        // Zero free tokens of any class.
        let mut tokens = TokenPool::new(1, 1, 1);
        assert!(tokens.reserve(ResourceClass::Build));

        let actions = queue.dispatch(&mut tokens);
        assert_eq!(actions.len(), 1);
        assert!(matches!(&actions[0], QueueAction::Skipped(item) if item.id == 1));
        assert_eq!(queue.summary().skipped, 1);

        // The waiting and ready elements are still queued, in order.
        assert!(queue.has_backlog());
        tokens.release(ResourceClass::Build);
        let actions = queue.dispatch(&mut tokens);
        assert_eq!(spawned_ids(&actions), vec![3]);
    }

    #[test]
    fn finalize_counts_processed_skipped_and_failed() {
        let mut queue = Queue::new(TestBehavior::ready_all());
        let mut tokens = TokenPool::new(1, 4, 1);
        queue.enqueue((1..=3).map(|id| TestItem::new(id, &format!("e{id}"))));
        let actions = queue.dispatch(&mut tokens);
        assert_eq!(spawned_ids(&actions), vec![1, 2, 3]);

        let item1 = TestItem::new(1, "e1");
        assert!(queue.finalize(&item1, true, Some(&json!("ok"))).unwrap());

        let item2 = TestItem::new(2, "e2");
        assert!(!queue.finalize(&item2, false, None).unwrap());

        let item3 = TestItem::new(3, "e3");
        assert!(queue.finalize(&item3, true, None).unwrap());

        let summary = queue.summary();
        assert_eq!(summary.processed, 2);
        assert_eq!(summary.failed, vec!["e2".to_string()]);
        assert_eq!(queue.active(), 0);
    }

    #[test]
    fn no_change_results_count_as_skipped_and_drop_out() {
        let behavior = TestBehavior {
            statuses: Arc::new(Mutex::new(HashMap::new())),
            done_fails_for: None,
            keep_for_all: false,
        };
        let mut queue = Queue::new(behavior);
        let mut tokens = TokenPool::new(1, 1, 1);
        queue.enqueue(vec![TestItem::new(1, "e1")]);
        queue.dispatch(&mut tokens);

        let advance = queue.finalize(&TestItem::new(1, "e1"), true, None).unwrap();
        assert!(!advance);
        assert_eq!(queue.summary().skipped, 1);
        assert_eq!(queue.summary().processed, 0);
    }

    #[test]
    fn done_hook_failure_is_surfaced() {
        let behavior = TestBehavior {
            statuses: Arc::new(Mutex::new(HashMap::new())),
            done_fails_for: Some(1),
            keep_for_all: true,
        };
        let mut queue = Queue::new(behavior);
        let mut tokens = TokenPool::new(1, 1, 1);
        queue.enqueue(vec![TestItem::new(1, "e1")]);
        queue.dispatch(&mut tokens);

        let err = queue.finalize(&TestItem::new(1, "e1"), true, None).unwrap_err();
        assert_eq!(err.domain, ErrorDomain::Project);
        assert_eq!(queue.failed(), &["e1".to_string()]);
    }

    #[test]
    fn an_item_is_in_exactly_one_place() {
        let mut queue = Queue::new(TestBehavior::ready_all());
        let mut tokens = TokenPool::new(1, 1, 1);
        queue.enqueue(vec![TestItem::new(1, "e1"), TestItem::new(2, "e2")]);

        let actions = queue.dispatch(&mut tokens);
        assert_eq!(spawned_ids(&actions), vec![1]);

        // Item 1 is processing; item 2 still ready; nothing done.
        assert_eq!(queue.active(), 1);
        assert!(queue.has_backlog());

        queue.finalize(&TestItem::new(1, "e1"), true, None).unwrap();
        assert_eq!(queue.active(), 0);
        assert_eq!(queue.done.len(), 1);
    }
}
