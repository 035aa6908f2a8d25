//! URI-based identifier registry.
//!
//! Every object that participates in a workflow (a task or a data object) is
//! named by an opaque [`Uri`]. The scheme distinguishes what kind of thing it
//! names (`task://`, `file://`, `state://`, `workflow://`); callers supply
//! the rest of the path. [`UriRegistry`] is the bookkeeping a workflow uses
//! to reject distinct objects that collide on the same name while tolerating
//! idempotent re-registration of the same object.

use std::{collections::BTreeMap, fmt, sync::Arc};
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum UriError {
    #[error("uri {0:?} has no recognized scheme (expected one of task/file/state/workflow://)")]
    UnrecognizedScheme(String),
    #[error("uri {0:?} is already registered to a different object")]
    Duplicate(String),
    #[error("uri {0:?} is not registered")]
    NotFound(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Scheme {
    Task,
    File,
    State,
    Workflow,
}

impl Scheme {
    fn prefix(self) -> &'static str {
        match self {
            Scheme::Task => "task://",
            Scheme::File => "file://",
            Scheme::State => "state://",
            Scheme::Workflow => "workflow://",
        }
    }

    fn parse(raw: &str) -> Option<Scheme> {
        for scheme in [Scheme::Task, Scheme::File, Scheme::State, Scheme::Workflow] {
            if raw.starts_with(scheme.prefix()) {
                return Some(scheme);
            }
        }
        None
    }
}

/// An interned, scheme-validated identifier. Cloning is cheap (shared string).
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Uri {
    raw: Arc<str>,
    scheme: Scheme,
}

impl Uri {
    pub fn parse(raw: impl AsRef<str>) -> Result<Self, UriError> {
        let raw = raw.as_ref();
        let scheme =
            Scheme::parse(raw).ok_or_else(|| UriError::UnrecognizedScheme(raw.to_owned()))?;
        Ok(Uri {
            raw: Arc::from(raw),
            scheme,
        })
    }

    pub fn task(path: impl fmt::Display) -> Self {
        Uri::parse(format!("task://{}", path)).expect("task:// scheme always parses")
    }

    pub fn file(path: impl fmt::Display) -> Self {
        Uri::parse(format!("file://{}", path)).expect("file:// scheme always parses")
    }

    pub fn state(path: impl fmt::Display) -> Self {
        Uri::parse(format!("state://{}", path)).expect("state:// scheme always parses")
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }
}

impl fmt::Debug for Uri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Uri({:?})", self.raw)
    }
}

impl fmt::Display for Uri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.raw)
    }
}

/// Maps each registered [`Uri`] to its payload, refusing to let a second,
/// distinct object claim a URI already in use.
///
/// "Distinct" is caller-defined: the `same` predicate passed to
/// [`UriRegistry::insert_if_new`] decides whether a re-registration of an
/// already-known URI is the same object (a no-op) or a collision (an
/// error). This mirrors how a caller may legitimately register the same
/// shared input file from two different tasks.
#[derive(Debug, Default)]
pub struct UriRegistry<T> {
    entries: BTreeMap<Uri, T>,
}

impl<T> UriRegistry<T> {
    pub fn new() -> Self {
        UriRegistry {
            entries: BTreeMap::new(),
        }
    }

    pub fn contains(&self, uri: &Uri) -> bool {
        self.entries.contains_key(uri)
    }

    pub fn get(&self, uri: &Uri) -> Option<&T> {
        self.entries.get(uri)
    }

    /// Inserts `value` under `uri`. If `uri` is already registered, `same`
    /// is consulted to decide whether this is a harmless re-registration
    /// (returns `Ok(false)`, nothing changes) or a [`UriError::Duplicate`].
    pub fn insert_if_new(
        &mut self,
        uri: Uri,
        value: T,
        same: impl FnOnce(&T) -> bool,
    ) -> Result<bool, UriError> {
        if let Some(existing) = self.entries.get(&uri) {
            return if same(existing) {
                Ok(false)
            } else {
                Err(UriError::Duplicate(uri.as_str().to_owned()))
            };
        }
        self.entries.insert(uri, value);
        Ok(true)
    }

    pub fn remove(&mut self, uri: &Uri) -> Result<T, UriError> {
        self.entries
            .remove(uri)
            .ok_or_else(|| UriError::NotFound(uri.as_str().to_owned()))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Uri, &T)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_schemes() {
        assert_eq!(Uri::parse("task://build").unwrap().scheme(), Scheme::Task);
        assert_eq!(Uri::parse("file:///tmp/a").unwrap().scheme(), Scheme::File);
        assert_eq!(Uri::parse("state://flag").unwrap().scheme(), Scheme::State);
        assert_eq!(
            Uri::parse("workflow://w/1").unwrap().scheme(),
            Scheme::Workflow
        );
    }

    #[test]
    fn rejects_unknown_scheme() {
        assert!(matches!(
            Uri::parse("http://example.com"),
            Err(UriError::UnrecognizedScheme(_))
        ));
    }

    #[test]
    fn registry_allows_reregistering_same_object() {
        let mut reg = UriRegistry::new();
        let uri = Uri::task("a");
        assert!(reg.insert_if_new(uri.clone(), 1, |_| true).unwrap());
        assert!(!reg.insert_if_new(uri.clone(), 1, |_| true).unwrap());
        assert_eq!(reg.get(&uri), Some(&1));
    }

    #[test]
    fn registry_rejects_distinct_object_on_same_uri() {
        let mut reg = UriRegistry::new();
        let uri = Uri::task("a");
        reg.insert_if_new(uri.clone(), 1, |_| true).unwrap();
        let err = reg.insert_if_new(uri.clone(), 2, |_| false).unwrap_err();
        assert_eq!(err, UriError::Duplicate(uri.as_str().to_owned()));
    }

    #[test]
    fn registry_remove_missing_errors() {
        let mut reg: UriRegistry<i32> = UriRegistry::new();
        let err = reg.remove(&Uri::task("missing")).unwrap_err();
        assert_eq!(err, UriError::NotFound("task://missing".to_owned()));
    }
}
