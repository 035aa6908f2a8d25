//! The concurrent refresh loop: repeatedly scan for newly-ready tasks,
//! dispatch as many as slots and collision checks allow, drain worker
//! status messages, and sleep with exponential backoff before trying
//! again. Runs until every task reachable from the requested targets has
//! reached a terminal status, or a hard failure aborts the run.

use crate::{
    channel::{self, Message, MessageReceiver, MessageSender},
    error::EngineError,
    task::{TaskContext, TaskKind, TaskStatus},
    worker::{self, WorkerHandle, WorkerHandler},
    workflow::Workflow,
};
use std::{
    collections::{BTreeMap, BTreeSet, VecDeque},
    panic::AssertUnwindSafe,
    sync::{atomic::AtomicBool, Arc},
    time::Duration,
};
use taskgraph_uri::Uri;

const MAX_BACKOFF_SECS: f64 = 1.0;
const BACKOFF_STEP_SECS: f64 = 0.1;
const WORKER_JOIN_TIMEOUT: Duration = Duration::from_secs(10);
const EMERGENCY_SWEEP_TIMEOUT: Duration = Duration::from_secs(2);
const EMERGENCY_MAX_SWEEPS: u32 = 5;
const OUTPUT_COLLISION_CHECK_BOUND: usize = 100;

/// Returned only when every task in the target closure reached `Done`; any
/// failure surfaces as an [`EngineError`] instead (`TaskFailure` if the run
/// aborted promptly, `LateTaskFailure` if it was allowed to finish first).
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    pub done: BTreeSet<Uri>,
}

#[derive(Debug, Clone)]
pub struct Progress {
    pub total: usize,
    pub done: usize,
    pub failed: usize,
    pub submitted: usize,
    pub ready: usize,
}

pub struct Scheduler {
    workflow: Workflow,
    handlers: BTreeMap<&'static str, Box<dyn WorkerHandler>>,
    max_concurrency: u32,
    total_slots: u32,
    exit_on_failure: bool,
    shutdown: Arc<AtomicBool>,
    on_tick: Option<Box<dyn FnMut(&Progress) + Send>>,
}

fn handler_key(kind: TaskKind) -> &'static str {
    match kind {
        TaskKind::Thread => "thread",
        TaskKind::Process => "process",
    }
}

impl Scheduler {
    /// `max_concurrency` and `total_slots` are independent admission caps:
    /// the former bounds how many workers may be alive at once, the latter
    /// bounds the summed `slots` of simultaneously submitted tasks. A task
    /// can be blocked by either without the other being exhausted.
    pub fn new(workflow: Workflow, max_concurrency: u32, total_slots: u32, exit_on_failure: bool) -> Self {
        Scheduler {
            workflow,
            handlers: BTreeMap::new(),
            max_concurrency,
            total_slots,
            exit_on_failure,
            shutdown: Arc::new(AtomicBool::new(false)),
            on_tick: None,
        }
    }

    pub fn with_handler(mut self, handler: Box<dyn WorkerHandler>) -> Self {
        self.handlers.insert(handler_key(handler.kind()), handler);
        self
    }

    pub fn with_progress_callback(mut self, callback: impl FnMut(&Progress) + Send + 'static) -> Self {
        self.on_tick = Some(Box::new(callback));
        self
    }

    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    /// Runs the refresh loop to completion for `targets`, catching any
    /// panic inside the loop itself (as opposed to inside a task body,
    /// which is already contained by the worker handlers) and reporting it
    /// as a crashed scheduler rather than unwinding into the caller.
    pub fn run(&mut self, targets: &[Uri]) -> Result<RunReport, EngineError> {
        match std::panic::catch_unwind(AssertUnwindSafe(|| self.run_inner(targets))) {
            Ok(result) => result,
            Err(payload) => {
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic payload".to_string());
                Err(EngineError::SchedulerCrashed(anyhow::anyhow!(message)))
            }
        }
    }

    fn run_inner(&mut self, targets: &[Uri]) -> Result<RunReport, EngineError> {
        self.workflow.build()?;

        let closure = if targets.is_empty() {
            self.workflow.tasks().map(|(uri, _)| uri.clone()).collect()
        } else {
            let mut closure = BTreeSet::new();
            for target in targets {
                if self.workflow.task(target).is_none() {
                    return Err(EngineError::UnknownTarget(target.as_str().to_owned()));
                }
                closure.extend(self.workflow.dag().transitive_prereqs(target)?);
            }
            closure
        };

        // Raised synchronously, before any worker starts: the DAG crate's
        // topological sort is also the engine's cycle check.
        self.workflow.dag().topological_sort(&closure)?;

        let mut status: BTreeMap<Uri, TaskStatus> = BTreeMap::new();
        for uri in &closure {
            let task = self.workflow.task(uri).expect("uri came from the workflow's own dag");
            if task.slots() > self.total_slots {
                return Err(EngineError::SlotOverflow {
                    uri: uri.as_str().to_owned(),
                    slots: task.slots(),
                    max_slots: self.total_slots,
                });
            }
            if !self.handlers.contains_key(handler_key(task.kind())) {
                return Err(EngineError::UnsupportedTaskKind(uri.as_str().to_owned(), task.kind()));
            }
            status.insert(uri.clone(), task.initial_status());
        }

        let (sender, receiver) = channel::channel();
        let mut workers: BTreeMap<Uri, WorkerHandle> = BTreeMap::new();
        let mut active_outputs: BTreeMap<Uri, Uri> = BTreeMap::new();
        let mut active_mutables: BTreeSet<Uri> = BTreeSet::new();
        let mut pending: VecDeque<Uri> = VecDeque::new();
        let mut used_slots: u32 = 0;
        let mut alive: u32 = 0;
        let mut backoff = 0.0f64;
        let mut succeeded: u32 = 0;
        let mut failed: u32 = 0;
        let mut iteration: u64 = 0;

        let result = loop {
            iteration += 1;
            if let Some(err) = self.scan(
                &closure,
                &mut status,
                &mut pending,
                &mut active_outputs,
                &mut active_mutables,
            ) {
                break Err(err);
            }

            self.dispatch(
                &mut status,
                &mut workers,
                &mut pending,
                &mut used_slots,
                &mut alive,
                &sender,
            );

            let drained = self.drain(
                &receiver,
                &mut status,
                &mut workers,
                &mut active_outputs,
                &mut active_mutables,
                &mut used_slots,
                &mut alive,
            );
            succeeded += drained.newly_succeeded;
            failed += drained.newly_failed;

            if let Some(tick) = &mut self.on_tick {
                tick(&Self::progress(&closure, &status));
            }

            if (iteration - 1) & iteration == 0 {
                tracing::info!(iteration, sleep = backoff, succeeded, failed, "tick");
            }

            if failed > 0 && (self.exit_on_failure || succeeded == 0) {
                break Err(EngineError::TaskFailure { failed, succeeded });
            }

            let all_terminal = closure
                .iter()
                .all(|uri| status.get(uri).map(|s| s.is_terminal()).unwrap_or(false));
            if all_terminal {
                break if failed > 0 {
                    Err(EngineError::LateTaskFailure { failed, succeeded })
                } else {
                    Ok(())
                };
            }

            if drained.any_message {
                backoff = 0.0;
            } else {
                std::thread::sleep(Duration::from_secs_f64(backoff));
                backoff = (backoff + BACKOFF_STEP_SECS).min(MAX_BACKOFF_SECS);
            }
        };

        if result.is_err() {
            self.emergency_shutdown(&mut workers);
        }
        result?;

        Ok(RunReport {
            done: closure
                .into_iter()
                .filter(|uri| status.get(uri) == Some(&TaskStatus::Done))
                .collect(),
        })
    }

    /// Admission: for every `Initialized` task whose prereqs are all `Done`,
    /// either short-circuit it to `Done` (already satisfied), delay it
    /// (mutable collision with another in-flight task), hard-fail the whole
    /// run (output collision — two tasks producing the same artifact
    /// concurrently is never legal), or mark it `Ready` and append it to the
    /// back of `pending`. Collision bookkeeping (`active_outputs`,
    /// `active_mutables`) is claimed here, at the Ready transition, not at
    /// dispatch — dispatch may be deferred by slots/concurrency for many
    /// ticks, and a collision must be caught the moment two tasks become
    /// eligible, not whenever they happen to get a worker.
    fn scan(
        &self,
        closure: &BTreeSet<Uri>,
        status: &mut BTreeMap<Uri, TaskStatus>,
        pending: &mut VecDeque<Uri>,
        active_outputs: &mut BTreeMap<Uri, Uri>,
        active_mutables: &mut BTreeSet<Uri>,
    ) -> Option<EngineError> {
        taskgraph_metrics::scoped_metric!(taskgraph_metrics::MetricKind::Scan);
        for uri in closure {
            if status.get(uri) != Some(&TaskStatus::Initialized) {
                continue;
            }
            let task = self.workflow.task(uri).expect("uri tracked in closure");
            let prereqs_done = self
                .workflow
                .dag()
                .transitive_prereqs(uri)
                .map(|preds| {
                    preds
                        .iter()
                        .filter(|p| *p != uri)
                        .all(|p| status.get(p) == Some(&TaskStatus::Done))
                })
                .unwrap_or(false);
            if !prereqs_done {
                continue;
            }

            if task.mutables().iter().any(|m| active_mutables.contains(m)) {
                tracing::debug!(task = %uri, "delaying: mutable in use by another task");
                continue;
            }
            if active_outputs.len() < OUTPUT_COLLISION_CHECK_BOUND {
                if let Some((output, owner)) = task
                    .outputs()
                    .iter()
                    .find_map(|o| active_outputs.get(o).map(|owner| (o.clone(), owner.clone())))
                {
                    return Some(EngineError::OutputCollision {
                        output: output.as_str().to_owned(),
                        first: owner.as_str().to_owned(),
                        second: uri.as_str().to_owned(),
                    });
                }
            }

            if task.is_satisfied() {
                task.finalize();
                status.insert(uri.clone(), TaskStatus::Done);
                tracing::debug!(task = %uri, "skipping already-satisfied task");
            } else {
                status.insert(uri.clone(), TaskStatus::Ready);
                pending.push_back(uri.clone());
                for output in task.outputs() {
                    active_outputs.insert(output.clone(), uri.clone());
                }
                active_mutables.extend(task.mutables().iter().cloned());
            }
        }
        None
    }

    /// Drains `pending` in FIFO order (the order tasks first became
    /// `Ready`), stopping at the first task that does not fit the
    /// remaining slots or concurrency budget. Skipping past it in favor of
    /// a smaller task behind it would starve large tasks indefinitely
    /// under a steady stream of small ones, so the head blocks the queue
    /// rather than being passed over.
    fn dispatch(
        &self,
        status: &mut BTreeMap<Uri, TaskStatus>,
        workers: &mut BTreeMap<Uri, WorkerHandle>,
        pending: &mut VecDeque<Uri>,
        used_slots: &mut u32,
        alive: &mut u32,
        sender: &MessageSender,
    ) {
        taskgraph_metrics::scoped_metric!(taskgraph_metrics::MetricKind::Dispatch);
        while let Some(uri) = pending.front() {
            let task = self.workflow.task(uri).expect("uri tracked in closure");

            let free_slots = self.total_slots.saturating_sub(*used_slots);
            if free_slots < task.slots() || *alive >= self.max_concurrency {
                break;
            }

            // Unreachable in practice: task/handler kind compatibility is
            // validated for the whole closure before the loop starts.
            let handler = match self.handlers.get(handler_key(task.kind())) {
                Some(handler) => handler,
                None => break,
            };

            let uri = pending.pop_front().expect("just peeked via front()");
            let task = self.workflow.task(&uri).expect("uri tracked in closure");
            let ctx = TaskContext {
                uri: uri.clone(),
                sender: sender.clone(),
                shutdown: self.shutdown.clone(),
            };
            tracing::info!(task = %uri, "dispatching task");
            let handle = handler.spawn(task, ctx);
            workers.insert(uri.clone(), handle);
            *used_slots += task.slots();
            *alive += 1;
            status.insert(uri, TaskStatus::Submitted);
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn drain(
        &self,
        receiver: &MessageReceiver,
        status: &mut BTreeMap<Uri, TaskStatus>,
        workers: &mut BTreeMap<Uri, WorkerHandle>,
        active_outputs: &mut BTreeMap<Uri, Uri>,
        active_mutables: &mut BTreeSet<Uri>,
        used_slots: &mut u32,
        alive: &mut u32,
    ) -> DrainOutcome {
        taskgraph_metrics::scoped_metric!(taskgraph_metrics::MetricKind::Drain);
        let mut outcome = DrainOutcome::default();
        while let Some((uri, message)) = receiver.try_recv() {
            outcome.any_message = true;
            match message {
                Message::Started(true) => {
                    tracing::debug!(task = %uri, "worker started");
                }
                Message::Started(false) => {
                    tracing::warn!(task = %uri, "worker reported start for a task the scheduler never dispatched");
                }
                Message::Other(note) => {
                    tracing::debug!(task = %uri, note = %note, "worker message");
                }
                Message::Done | Message::Fail => {
                    let task = self.workflow.task(&uri);
                    if let Some(handle) = workers.remove(&uri) {
                        worker::join_all([&handle], WORKER_JOIN_TIMEOUT);
                    }
                    *alive = alive.saturating_sub(1);
                    if let Some(task) = task {
                        *used_slots = used_slots.saturating_sub(task.slots());
                        for output in task.outputs() {
                            active_outputs.remove(output);
                        }
                        for mutable in task.mutables() {
                            active_mutables.remove(mutable);
                        }
                        // finalize() runs on both terminal transitions: it is
                        // the task's one-shot completion hook, not a
                        // success-only callback.
                        task.finalize();
                    }
                    let new_status = if matches!(message, Message::Done) {
                        outcome.newly_succeeded += 1;
                        TaskStatus::Done
                    } else {
                        outcome.newly_failed += 1;
                        TaskStatus::Fail
                    };
                    tracing::info!(task = %uri, status = ?new_status, "task finished");
                    status.insert(uri, new_status);
                }
            }
        }
        outcome
    }

    fn emergency_shutdown(&self, workers: &mut BTreeMap<Uri, WorkerHandle>) {
        tracing::warn!("entering emergency shutdown");
        self.shutdown.store(true, std::sync::atomic::Ordering::SeqCst);
        worker::notify_terminate(workers.values());
        for _ in 0..EMERGENCY_MAX_SWEEPS {
            worker::join_all(workers.values(), EMERGENCY_SWEEP_TIMEOUT);
            if worker::alive_count(workers.values()) == 0 {
                break;
            }
        }
        if worker::alive_count(workers.values()) > 0 {
            tracing::error!("workers still alive after emergency shutdown sweeps; abandoning them");
        }
        workers.clear();
    }

    fn progress(closure: &BTreeSet<Uri>, status: &BTreeMap<Uri, TaskStatus>) -> Progress {
        let mut progress = Progress {
            total: closure.len(),
            done: 0,
            failed: 0,
            submitted: 0,
            ready: 0,
        };
        for uri in closure {
            match status.get(uri) {
                Some(TaskStatus::Done) => progress.done += 1,
                Some(TaskStatus::Fail) => progress.failed += 1,
                Some(TaskStatus::Submitted) => progress.submitted += 1,
                Some(TaskStatus::Ready) => progress.ready += 1,
                _ => {}
            }
        }
        progress
    }
}

#[derive(Default)]
struct DrainOutcome {
    any_message: bool,
    newly_succeeded: u32,
    newly_failed: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{task::Task, worker::ThreadHandler};
    use std::sync::{Arc, Mutex};

    fn scheduler(workflow: Workflow, slots: u32, exit_on_failure: bool) -> Scheduler {
        Scheduler::new(workflow, slots, slots, exit_on_failure).with_handler(Box::new(ThreadHandler::new()))
    }

    #[test]
    fn diamond_runs_prereqs_before_dependents() {
        let order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));

        let record = |name: &'static str, order: Arc<Mutex<Vec<&'static str>>>| {
            move |_ctx: &TaskContext| {
                order.lock().unwrap().push(name);
                true
            }
        };

        let mut workflow = Workflow::new();
        workflow
            .add_task(
                Task::thread(Uri::task("a"), record("a", order.clone()))
                    .outputs(vec![Uri::file("/a.out")])
                    .build(),
            )
            .unwrap();
        workflow
            .add_task(
                Task::thread(Uri::task("b"), record("b", order.clone()))
                    .inputs(vec![Uri::file("/a.out")])
                    .outputs(vec![Uri::file("/b.out")])
                    .build(),
            )
            .unwrap();
        workflow
            .add_task(
                Task::thread(Uri::task("c"), record("c", order.clone()))
                    .inputs(vec![Uri::file("/a.out")])
                    .outputs(vec![Uri::file("/c.out")])
                    .build(),
            )
            .unwrap();
        workflow
            .add_task(
                Task::thread(Uri::task("d"), record("d", order.clone()))
                    .inputs(vec![Uri::file("/b.out"), Uri::file("/c.out")])
                    .build(),
            )
            .unwrap();

        let mut sched = scheduler(workflow, 4, true);
        let report = sched.run(&[Uri::task("d")]).unwrap();
        assert_eq!(report.done.len(), 4);

        let order = order.lock().unwrap();
        let pos = |n: &str| order.iter().position(|x| *x == n).unwrap();
        assert!(pos("a") < pos("b"));
        assert!(pos("a") < pos("c"));
        assert!(pos("b") < pos("d"));
        assert!(pos("c") < pos("d"));
    }

    #[test]
    fn satisfied_task_is_skipped_without_running() {
        let ran = Arc::new(Mutex::new(false));
        let ran_in_body = ran.clone();
        let mut workflow = Workflow::new();
        workflow
            .add_task(
                Task::thread(Uri::task("a"), move |_ctx| {
                    *ran_in_body.lock().unwrap() = true;
                    true
                })
                .is_satisfied(|| true)
                .build(),
            )
            .unwrap();

        let mut sched = scheduler(workflow, 2, true);
        let report = sched.run(&[Uri::task("a")]).unwrap();
        assert!(report.done.contains(&Uri::task("a")));
        assert!(!*ran.lock().unwrap());
    }

    #[test]
    fn failing_task_lets_independent_branch_finish_before_the_late_failure_is_raised() {
        let mut workflow = Workflow::new();
        workflow
            .add_task(
                Task::thread(Uri::task("broken"), |_ctx| {
                    std::thread::sleep(Duration::from_millis(150));
                    false
                })
                .build(),
            )
            .unwrap();
        workflow
            .add_task(Task::thread(Uri::task("fine"), |_ctx| true).build())
            .unwrap();

        let mut sched = scheduler(workflow, 4, false);
        let err = sched
            .run(&[Uri::task("broken"), Uri::task("fine")])
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::LateTaskFailure {
                failed: 1,
                succeeded: 1
            }
        ));
    }

    #[test]
    fn two_tasks_claiming_the_same_output_is_a_hard_error() {
        let mut workflow = Workflow::new();
        workflow
            .add_task(
                Task::thread(Uri::task("a"), |_ctx| {
                    std::thread::sleep(Duration::from_millis(200));
                    true
                })
                .outputs(vec![Uri::file("/shared.out")])
                .build(),
            )
            .unwrap();
        workflow
            .add_task(
                Task::thread(Uri::task("b"), |_ctx| {
                    std::thread::sleep(Duration::from_millis(200));
                    true
                })
                .outputs(vec![Uri::file("/shared.out")])
                .build(),
            )
            .unwrap();

        let mut sched = scheduler(workflow, 4, true);
        let err = sched.run(&[Uri::task("a"), Uri::task("b")]).unwrap_err();
        assert!(matches!(err, EngineError::OutputCollision { .. }));
    }

    #[test]
    fn mutable_collision_delays_rather_than_errors() {
        let mut workflow = Workflow::new();
        let shared = Uri::state("lock");
        workflow
            .add_task(
                Task::thread(Uri::task("a"), |_ctx| {
                    std::thread::sleep(Duration::from_millis(100));
                    true
                })
                .mutables(vec![shared.clone()])
                .build(),
            )
            .unwrap();
        workflow
            .add_task(
                Task::thread(Uri::task("b"), |_ctx| true)
                    .mutables(vec![shared])
                    .build(),
            )
            .unwrap();

        let mut sched = scheduler(workflow, 4, true);
        let report = sched.run(&[Uri::task("a"), Uri::task("b")]).unwrap();
        assert_eq!(report.done.len(), 2);
    }
}
