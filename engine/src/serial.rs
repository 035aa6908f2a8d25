//! The `--serial` / "none" worker substrate: no threads, no processes, no
//! refresh loop. Tasks run one at a time, strictly in topological order,
//! on the calling thread. Useful for debugging a workflow or running it
//! somewhere spawning threads is undesirable.

use crate::{
    channel,
    error::EngineError,
    scheduler::RunReport,
    task::{TaskContext, TaskKind, TaskStatus},
    workflow::Workflow,
};
use std::{
    collections::BTreeSet,
    panic::AssertUnwindSafe,
    process::Command,
    sync::{atomic::AtomicBool, Arc},
};
use taskgraph_uri::Uri;

pub fn run_serial(
    workflow: &mut Workflow,
    targets: &[Uri],
    exit_on_failure: bool,
) -> Result<RunReport, EngineError> {
    workflow.build()?;

    let closure = if targets.is_empty() {
        workflow.tasks().map(|(uri, _)| uri.clone()).collect()
    } else {
        let mut closure = BTreeSet::new();
        for target in targets {
            if workflow.task(target).is_none() {
                return Err(EngineError::UnknownTarget(target.as_str().to_owned()));
            }
            closure.extend(workflow.dag().transitive_prereqs(target)?);
        }
        closure
    };
    let order = workflow.dag().topological_sort(&closure)?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let (sender, _receiver) = channel::channel();
    let mut done: BTreeSet<Uri> = BTreeSet::new();
    let mut blocked: BTreeSet<Uri> = BTreeSet::new();
    let mut succeeded: u32 = 0;
    let mut failed: u32 = 0;

    for uri in order {
        let task = workflow.task(&uri).expect("uri came from the workflow's own dag");

        if task.initial_status() == TaskStatus::Done {
            done.insert(uri);
            continue;
        }
        if task.initial_status() == TaskStatus::Fail {
            blocked.insert(uri);
            continue;
        }

        let any_prereq_failed = workflow
            .dag()
            .transitive_prereqs(&uri)
            .map(|preds| preds.iter().any(|p| p != &uri && blocked.contains(p)))
            .unwrap_or(false);
        if any_prereq_failed {
            blocked.insert(uri);
            continue;
        }

        if task.is_satisfied() {
            task.finalize();
            done.insert(uri);
            continue;
        }

        let ctx = TaskContext {
            uri: uri.clone(),
            sender: sender.clone(),
            shutdown: shutdown.clone(),
        };
        tracing::info!(task = %uri, "running task serially");
        let ok = match task.kind() {
            TaskKind::Thread => {
                let body = task
                    .thread_body()
                    .expect("thread-kind task always has a thread body");
                std::panic::catch_unwind(AssertUnwindSafe(|| (*body)(&ctx))).unwrap_or(false)
            }
            TaskKind::Process => {
                let command = task
                    .command_body()
                    .expect("process-kind task always has a command body");
                Command::new("/bin/sh")
                    .arg("-c")
                    .arg(command)
                    .status()
                    .map(|status| status.success())
                    .unwrap_or(false)
            }
        };

        task.finalize();
        if ok {
            done.insert(uri);
            succeeded += 1;
        } else {
            tracing::warn!(task = %uri, "task failed");
            blocked.insert(uri);
            failed += 1;
            if exit_on_failure {
                break;
            }
        }
    }

    if failed > 0 {
        return Err(if exit_on_failure {
            EngineError::TaskFailure { failed, succeeded }
        } else {
            EngineError::LateTaskFailure { failed, succeeded }
        });
    }

    Ok(RunReport { done })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Task;
    use std::sync::Mutex;

    #[test]
    fn runs_prereqs_before_dependents_in_order() {
        let order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
        let mut workflow = Workflow::new();
        let record = |name: &'static str, order: Arc<Mutex<Vec<&'static str>>>| {
            move |_ctx: &TaskContext| {
                order.lock().unwrap().push(name);
                true
            }
        };
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
                    .build(),
            )
            .unwrap();

        let report = run_serial(&mut workflow, &[Uri::task("b")], true).unwrap();
        assert_eq!(report.done.len(), 2);
        let order = order.lock().unwrap();
        assert_eq!(&*order, &["a", "b"]);
    }

    #[test]
    fn failed_prereq_fails_dependent_without_running_it() {
        let ran = Arc::new(Mutex::new(false));
        let ran_in_body = ran.clone();
        let mut workflow = Workflow::new();
        workflow
            .add_task(
                Task::thread(Uri::task("a"), |_ctx| false)
                    .outputs(vec![Uri::file("/a.out")])
                    .build(),
            )
            .unwrap();
        workflow
            .add_task(
                Task::thread(Uri::task("b"), move |_ctx| {
                    *ran_in_body.lock().unwrap() = true;
                    true
                })
                .inputs(vec![Uri::file("/a.out")])
                .build(),
            )
            .unwrap();

        let err = run_serial(&mut workflow, &[Uri::task("b")], false).unwrap_err();
        assert!(matches!(
            err,
            EngineError::LateTaskFailure {
                failed: 1,
                succeeded: 0
            }
        ));
        assert!(!*ran.lock().unwrap());
    }
}
