/// The set of files currently registered with the file-change notifier.
///
/// Restart cycles clear the whole set before the new child reports its
/// dependencies, so paths from an earlier run never linger.
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Errors from registering or unregistering a watch.
#[derive(Debug)]
pub enum WatchError {
    /// The underlying notifier refused the path.
    Notify {
        path: PathBuf,
        source: notify::Error,
    },
    /// The notifier could not be created.
    Init { source: notify::Error },
}

impl std::fmt::Display for WatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WatchError::Notify { path, source } => {
                write!(f, "cannot watch {}: {}", path.display(), source)
            }
            WatchError::Init { source } => {
                write!(f, "failed to initialize file watcher: {}", source)
            }
        }
    }
}

impl std::error::Error for WatchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            WatchError::Notify { source, .. } => Some(source),
            WatchError::Init { source } => Some(source),
        }
    }
}

/// The external file-change notifier.
pub trait FileWatcher {
    fn watch(&mut self, path: &Path) -> Result<(), WatchError>;
    fn unwatch(&mut self, path: &Path) -> Result<(), WatchError>;
}

pub struct WatchSet<W> {
    watcher: W,
    paths: HashSet<PathBuf>,
}

impl<W: FileWatcher> WatchSet<W> {
    pub fn new(watcher: W) -> Self {
        Self {
            watcher,
            paths: HashSet::new(),
        }
    }

    /// Register `path` with the watcher.
    ///
    /// Returns `true` if the path was newly added. Re-adding a watched path is
    /// a no-op; a path the watcher refuses is logged and left out of the set.
    pub fn add(&mut self, path: PathBuf) -> bool {
        if self.paths.contains(&path) {
            return false;
        }
        match self.watcher.watch(&path) {
            Ok(()) => {
                tracing::debug!(path = %path.display(), "watching");
                self.paths.insert(path);
                true
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to watch dependency");
                false
            }
        }
    }

    /// Unregister every watched path.
    pub fn clear(&mut self) {
        for path in self.paths.drain() {
            if let Err(e) = self.watcher.unwatch(&path) {
                tracing::debug!(error = %e, "failed to unwatch");
            }
        }
    }

    #[cfg(test)]
    pub fn contains(&self, path: &Path) -> bool {
        self.paths.contains(path)
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    #[cfg(test)]
    pub fn watcher(&self) -> &W {
        &self.watcher
    }
}
