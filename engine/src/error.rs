use crate::task::TaskKind;
use taskgraph_dag::DagError;
use taskgraph_uri::UriError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Uri(#[from] UriError),

    #[error(transparent)]
    Dag(#[from] DagError),

    #[error("task {0:?} has kind {1:?}, which no registered worker handler accepts")]
    UnsupportedTaskKind(String, TaskKind),

    #[error("output {output:?} is claimed by both {first:?} and {second:?} while both are active")]
    OutputCollision {
        output: String,
        first: String,
        second: String,
    },

    #[error("target {0:?} is not a registered task")]
    UnknownTarget(String),

    #[error("task {uri:?} requires {slots} slots, more than the configured maximum of {max_slots}")]
    SlotOverflow {
        uri: String,
        slots: u32,
        max_slots: u32,
    },

    #[error("{failed} task(s) failed (successes: {succeeded}); aborting rather than waiting for the rest")]
    TaskFailure { failed: u32, succeeded: u32 },

    #[error("{failed} task(s) failed (successes: {succeeded}) after the run was otherwise allowed to finish")]
    LateTaskFailure { failed: u32, succeeded: u32 },

    #[error("scheduler loop crashed")]
    SchedulerCrashed(#[source] anyhow::Error),
}
