//! A concurrent refresh-loop scheduler for a DAG of data-object-dependent
//! tasks: register tasks and data objects into a [`Workflow`], then hand
//! it to a [`Scheduler`] (or [`serial::run_serial`] for the no-concurrency
//! substrate) to bring a set of target tasks to a terminal status.

mod channel;
mod data;
mod dot;
mod error;
mod scheduler;
mod serial;
mod task;
mod worker;
mod workflow;

pub use data::{file_uri_to_path, mtime_satisfied, DataObject, DiskInterface, SystemDiskInterface};
pub use dot::{to_dot, to_makefile};
pub use error::EngineError;
pub use scheduler::{Progress, RunReport, Scheduler};
pub use serial::run_serial;
pub use task::{Task, TaskBuilder, TaskContext, TaskKind, TaskStatus};
pub use worker::{ProcessHandler, ThreadHandler, WorkerHandle, WorkerHandler};
pub use workflow::Workflow;

pub use taskgraph_dag::{Dag, DagError};
pub use taskgraph_uri::{Scheme, Uri, UriError, UriRegistry};
