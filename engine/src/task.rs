//! Task records: the per-task state the scheduler reasons about.

use crate::channel::{Message, MessageSender};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use taskgraph_uri::Uri;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskStatus {
    Initialized,
    Ready,
    Submitted,
    Done,
    Fail,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Fail)
    }
}

/// Which worker substrate a task's body can run on. Checked once, at
/// registration, against the worker handler the caller chose for the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    /// An arbitrary Rust closure, run on a pool thread.
    Thread,
    /// A shell command, run in a spawned child process.
    Process,
}

pub(crate) enum TaskBody {
    Thread(Arc<dyn Fn(&TaskContext) -> bool + Send + Sync>),
    Command(String),
}

/// What a running task body is handed: a way to learn the engine is
/// shutting down, and a way to announce it has begun work.
#[derive(Clone)]
pub struct TaskContext {
    pub(crate) uri: Uri,
    pub(crate) sender: MessageSender,
    pub(crate) shutdown: Arc<AtomicBool>,
}

impl TaskContext {
    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    /// True once the scheduler has begun emergency shutdown. Long-running
    /// task bodies should poll this at safe yield points and return early.
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Optional: announce that work has begun, before the body returns.
    /// Purely informational for a task dispatched normally.
    pub fn announce_started(&self) {
        self.sender.send(self.uri.clone(), Message::Started(true));
    }
}

/// A node in the workflow: a unit of work with declared data dependencies.
pub struct Task {
    uri: Uri,
    slots: u32,
    inputs: Vec<Uri>,
    outputs: Vec<Uri>,
    mutables: Vec<Uri>,
    kind: TaskKind,
    pub(crate) body: TaskBody,
    is_satisfied: Box<dyn Fn() -> bool + Send + Sync>,
    finalize: Box<dyn Fn() + Send + Sync>,
    initial_status: TaskStatus,
}

impl Task {
    pub fn thread(uri: Uri, body: impl Fn(&TaskContext) -> bool + Send + Sync + 'static) -> TaskBuilder {
        TaskBuilder::new(uri, TaskKind::Thread, TaskBody::Thread(Arc::new(body)))
    }

    pub fn command(uri: Uri, command: impl Into<String>) -> TaskBuilder {
        TaskBuilder::new(uri, TaskKind::Process, TaskBody::Command(command.into()))
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    pub fn slots(&self) -> u32 {
        self.slots
    }

    pub fn inputs(&self) -> &[Uri] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[Uri] {
        &self.outputs
    }

    pub fn mutables(&self) -> &[Uri] {
        &self.mutables
    }

    pub fn kind(&self) -> TaskKind {
        self.kind
    }

    pub fn initial_status(&self) -> TaskStatus {
        self.initial_status
    }

    pub fn is_satisfied(&self) -> bool {
        (self.is_satisfied)()
    }

    pub fn finalize(&self) {
        (self.finalize)()
    }

    pub(crate) fn thread_body(&self) -> Option<Arc<dyn Fn(&TaskContext) -> bool + Send + Sync>> {
        match &self.body {
            TaskBody::Thread(f) => Some(f.clone()),
            TaskBody::Command(_) => None,
        }
    }

    pub(crate) fn command_body(&self) -> Option<&str> {
        match &self.body {
            TaskBody::Command(c) => Some(c.as_str()),
            TaskBody::Thread(_) => None,
        }
    }
}

pub struct TaskBuilder {
    uri: Uri,
    slots: u32,
    inputs: Vec<Uri>,
    outputs: Vec<Uri>,
    mutables: Vec<Uri>,
    kind: TaskKind,
    body: TaskBody,
    is_satisfied: Box<dyn Fn() -> bool + Send + Sync>,
    finalize: Box<dyn Fn() + Send + Sync>,
    initial_status: TaskStatus,
}

impl TaskBuilder {
    fn new(uri: Uri, kind: TaskKind, body: TaskBody) -> Self {
        TaskBuilder {
            uri,
            slots: 1,
            inputs: Vec::new(),
            outputs: Vec::new(),
            mutables: Vec::new(),
            kind,
            body,
            is_satisfied: Box::new(|| false),
            finalize: Box::new(|| {}),
            initial_status: TaskStatus::Initialized,
        }
    }

    pub fn slots(mut self, slots: u32) -> Self {
        self.slots = slots;
        self
    }

    pub fn inputs(mut self, inputs: Vec<Uri>) -> Self {
        self.inputs = inputs;
        self
    }

    pub fn outputs(mut self, outputs: Vec<Uri>) -> Self {
        self.outputs = outputs;
        self
    }

    pub fn mutables(mut self, mutables: Vec<Uri>) -> Self {
        self.mutables = mutables;
        self
    }

    pub fn is_satisfied(mut self, f: impl Fn() -> bool + Send + Sync + 'static) -> Self {
        self.is_satisfied = Box::new(f);
        self
    }

    pub fn finalize(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.finalize = Box::new(f);
        self
    }

    /// Marks the task as already complete (or otherwise not eligible for
    /// fresh admission) from the very first scan. The admission scan only
    /// ever looks at `Initialized` tasks, so any other starting status is
    /// accepted as-is and left untouched until a later `refreshTargets`
    /// call explicitly resets it.
    pub fn initial_status(mut self, status: TaskStatus) -> Self {
        self.initial_status = status;
        self
    }

    pub fn build(self) -> Task {
        Task {
            uri: self.uri,
            slots: self.slots,
            inputs: self.inputs,
            outputs: self.outputs,
            mutables: self.mutables,
            kind: self.kind,
            body: self.body,
            is_satisfied: self.is_satisfied,
            finalize: self.finalize,
            initial_status: self.initial_status,
        }
    }
}
