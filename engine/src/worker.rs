//! Worker substrates. A handler turns a [`Task`] into a running
//! [`WorkerHandle`]; the scheduler never spawns a thread or process
//! directly, only through whichever handler the run was configured with.
//!
//! `create` and `start` are one call here (`spawn`): `std::thread::spawn`
//! starts running the moment it is created, so a separate "start the
//! handle" step would only add a parked thread waiting on a barrier for no
//! benefit.

use crate::{
    channel::{Message, MessageSender},
    task::{Task, TaskContext, TaskKind},
};
use std::{
    process::{Child, Command},
    sync::{Arc, Mutex},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};
use taskgraph_uri::Uri;

pub struct WorkerHandle {
    join: JoinHandle<()>,
    child: Option<Arc<Mutex<Option<Child>>>>,
}

impl WorkerHandle {
    pub fn is_alive(&self) -> bool {
        !self.join.is_finished()
    }
}

pub trait WorkerHandler: Send + Sync {
    fn kind(&self) -> TaskKind;
    fn spawn(&self, task: &Task, ctx: TaskContext) -> WorkerHandle;
}

/// Runs thread-kind tasks on freshly spawned OS threads. There is no pool
/// to size: slot accounting happens in the scheduler before dispatch, so
/// every dispatched task simply gets a thread of its own.
pub struct ThreadHandler;

impl ThreadHandler {
    pub fn new() -> Self {
        ThreadHandler
    }
}

impl Default for ThreadHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerHandler for ThreadHandler {
    fn kind(&self) -> TaskKind {
        TaskKind::Thread
    }

    fn spawn(&self, task: &Task, ctx: TaskContext) -> WorkerHandle {
        let body = task
            .thread_body()
            .expect("scheduler only dispatches thread-kind tasks to ThreadHandler");
        let uri = ctx.uri.clone();
        let sender = ctx.sender.clone();

        let join = thread::Builder::new()
            .name(uri.as_str().to_owned())
            .spawn(move || {
                let panic_sender = sender.clone();
                let panic_uri = uri.clone();
                scopeguard::defer_on_unwind! {
                    panic_sender.send(panic_uri, Message::Fail);
                }
                let ok = (*body)(&ctx);
                sender.send(uri, if ok { Message::Done } else { Message::Fail });
            })
            .expect("failed to spawn worker thread");

        WorkerHandle { join, child: None }
    }
}

/// Runs process-kind tasks as a shell command in a child process. The
/// managing thread polls the child non-blockingly so `notify_terminate`
/// can reach in and kill it without racing a blocking `wait`.
pub struct ProcessHandler;

impl ProcessHandler {
    pub fn new() -> Self {
        ProcessHandler
    }
}

impl Default for ProcessHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerHandler for ProcessHandler {
    fn kind(&self) -> TaskKind {
        TaskKind::Process
    }

    fn spawn(&self, task: &Task, ctx: TaskContext) -> WorkerHandle {
        let command = task
            .command_body()
            .expect("scheduler only dispatches process-kind tasks to ProcessHandler")
            .to_owned();
        let uri = ctx.uri.clone();
        let sender = ctx.sender.clone();
        let slot: Arc<Mutex<Option<Child>>> = Arc::new(Mutex::new(None));
        let slot_for_thread = slot.clone();

        let join = thread::Builder::new()
            .name(uri.as_str().to_owned())
            .spawn(move || {
                let spawned = Command::new("/bin/sh").arg("-c").arg(&command).spawn();
                let child = match spawned {
                    Ok(child) => child,
                    Err(_) => {
                        sender.send(uri, Message::Fail);
                        return;
                    }
                };
                *slot_for_thread.lock().unwrap() = Some(child);

                let status = loop {
                    thread::sleep(Duration::from_millis(20));
                    let mut guard = slot_for_thread.lock().unwrap();
                    let exited = guard.as_mut().and_then(|c| c.try_wait().ok()).flatten();
                    if let Some(status) = exited {
                        break status;
                    }
                };
                sender.send(uri, if status.success() { Message::Done } else { Message::Fail });
            })
            .expect("failed to spawn worker thread");

        WorkerHandle {
            join,
            child: Some(slot),
        }
    }
}

pub fn alive_count<'a>(handles: impl IntoIterator<Item = &'a WorkerHandle>) -> usize {
    handles.into_iter().filter(|h| h.is_alive()).count()
}

/// Waits up to `timeout`, polling, for every handle to finish. Handles
/// still alive when the timeout elapses are left as-is; dropping a
/// [`WorkerHandle`] detaches its thread rather than blocking on it.
pub fn join_all<'a>(handles: impl IntoIterator<Item = &'a WorkerHandle>, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    for handle in handles {
        while handle.is_alive() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
    }
}

/// Best-effort forcible termination: kills child processes outright.
/// Thread-kind workers have no external termination mechanism; they are
/// expected to poll [`TaskContext::is_shutting_down`] and return.
pub fn notify_terminate<'a>(handles: impl IntoIterator<Item = &'a WorkerHandle>) {
    for handle in handles {
        if let Some(slot) = &handle.child {
            if let Some(child) = slot.lock().unwrap().as_mut() {
                let _ = child.kill();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::channel;
    use std::sync::atomic::AtomicBool;

    fn ctx_for(uri: Uri, sender: MessageSender) -> TaskContext {
        TaskContext {
            uri,
            sender,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    #[test]
    fn thread_handler_reports_done_on_success() {
        let (tx, rx) = channel();
        let uri = Uri::task("a");
        let task = Task::thread(uri.clone(), |_ctx| true).build();
        let handle = ThreadHandler::new().spawn(&task, ctx_for(uri.clone(), tx));
        join_all([&handle], Duration::from_secs(2));
        assert_eq!(rx.try_recv(), Some((uri, Message::Done)));
    }

    #[test]
    fn thread_handler_reports_fail_on_panic() {
        let (tx, rx) = channel();
        let uri = Uri::task("a");
        let task = Task::thread(uri.clone(), |_ctx| panic!("boom")).build();
        let handle = ThreadHandler::new().spawn(&task, ctx_for(uri.clone(), tx));
        join_all([&handle], Duration::from_secs(2));
        assert_eq!(rx.try_recv(), Some((uri, Message::Fail)));
    }

    #[test]
    fn process_handler_reports_done_on_zero_exit() {
        let (tx, rx) = channel();
        let uri = Uri::task("a");
        let task = Task::command(uri.clone(), "true").build();
        let handle = ProcessHandler::new().spawn(&task, ctx_for(uri.clone(), tx));
        join_all([&handle], Duration::from_secs(2));
        assert_eq!(rx.try_recv(), Some((uri, Message::Done)));
    }

    #[test]
    fn process_handler_reports_fail_on_nonzero_exit() {
        let (tx, rx) = channel();
        let uri = Uri::task("a");
        let task = Task::command(uri.clone(), "false").build();
        let handle = ProcessHandler::new().spawn(&task, ctx_for(uri.clone(), tx));
        join_all([&handle], Duration::from_secs(2));
        assert_eq!(rx.try_recv(), Some((uri, Message::Fail)));
    }

    #[test]
    fn notify_terminate_kills_running_process() {
        let (tx, _rx) = channel();
        let uri = Uri::task("a");
        let task = Task::command(uri.clone(), "sleep 30").build();
        let handle = ProcessHandler::new().spawn(&task, ctx_for(uri, tx));
        thread::sleep(Duration::from_millis(50));
        notify_terminate([&handle]);
        join_all([&handle], Duration::from_secs(2));
        assert!(!handle.is_alive());
    }
}
