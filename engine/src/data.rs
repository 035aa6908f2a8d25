//! Data objects and the mtime-based satisfaction check most file-backed
//! tasks will want to use as their `is_satisfied` predicate.

use std::{
    io,
    path::{Path, PathBuf},
    sync::Arc,
    time::SystemTime,
};
use taskgraph_uri::{Scheme, Uri};

/// A named piece of data a task reads or produces. The engine never
/// inspects data objects itself — `is_present` exists for task bodies and
/// `is_satisfied` predicates to call.
#[derive(Clone)]
pub struct DataObject {
    uri: Uri,
    is_present: Arc<dyn Fn() -> bool + Send + Sync>,
}

impl DataObject {
    /// A `file://` object, present when the path it names exists on disk.
    pub fn file(uri: Uri) -> Self {
        let path = file_uri_to_path(&uri);
        DataObject {
            uri,
            is_present: Arc::new(move || path.as_ref().map(|p| p.exists()).unwrap_or(false)),
        }
    }

    /// A `state://` object backed by an arbitrary caller-supplied check.
    pub fn state(uri: Uri, is_present: impl Fn() -> bool + Send + Sync + 'static) -> Self {
        DataObject {
            uri,
            is_present: Arc::new(is_present),
        }
    }

    /// Auto-registers a bare reference to `uri` (as seen in a task's
    /// declared inputs/outputs/mutables) without any caller-supplied
    /// predicate. `file://` URIs get the real disk-presence check; every
    /// other scheme is a `state://`-style placeholder that defaults to
    /// "not present" until a caller registers the real object with
    /// [`crate::Workflow::add_object`].
    pub fn referenced(uri: Uri) -> Self {
        match uri.scheme() {
            Scheme::File => DataObject::file(uri),
            _ => DataObject::state(uri, || false),
        }
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    pub fn is_present(&self) -> bool {
        (self.is_present)()
    }
}

/// Converts a `file://relative/path` URI into a filesystem path, relative
/// to the current working directory.
pub fn file_uri_to_path(uri: &Uri) -> Option<PathBuf> {
    uri.as_str().strip_prefix("file://").map(PathBuf::from)
}

/// Abstraction over `fs::metadata` so rebuild-freshness logic can be tested
/// against a fake clock instead of real files.
pub trait DiskInterface: Send + Sync {
    fn modified(&self, path: &Path) -> io::Result<SystemTime>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemDiskInterface;

impl DiskInterface for SystemDiskInterface {
    fn modified(&self, path: &Path) -> io::Result<SystemTime> {
        taskgraph_metrics::scoped_metric!(taskgraph_metrics::MetricKind::DiskStat);
        std::fs::metadata(path)?.modified()
    }
}

/// A task is satisfied when every output exists and is at least as new as
/// every input. Missing outputs, or any input newer than the oldest
/// output, mean the task still needs to run.
pub fn mtime_satisfied(disk: &dyn DiskInterface, inputs: &[Uri], outputs: &[Uri]) -> bool {
    if outputs.is_empty() {
        return false;
    }

    let mut oldest_output: Option<SystemTime> = None;
    for output in outputs {
        let path = match file_uri_to_path(output) {
            Some(p) => p,
            None => return false,
        };
        let modified = match disk.modified(&path) {
            Ok(t) => t,
            Err(_) => return false,
        };
        oldest_output = Some(match oldest_output {
            Some(cur) => cur.min(modified),
            None => modified,
        });
    }
    let oldest_output = oldest_output.expect("outputs is non-empty");

    for input in inputs {
        let path = match file_uri_to_path(input) {
            Some(p) => p,
            None => return false,
        };
        match disk.modified(&path) {
            Ok(t) if t <= oldest_output => continue,
            _ => return false,
        }
    }

    true
}
