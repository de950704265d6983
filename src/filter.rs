/// Dependency filtering: decides whether a path reported by the child is worth watching.
///
/// Two rules apply, in order:
/// - a path starting with any configured ignore prefix is never watched
/// - otherwise it is watched when its nesting level is within the depth limit
///
/// The nesting level counts how many dependency-boundary segments (e.g.
/// `node_modules`) the path passes through. Level 0 is the application's own
/// code; each boundary crossed is one level deeper into third-party code.
use serde::{Deserialize, Serialize};

/// Maximum nesting level to watch.
///
/// Configured as an integer where any negative value (conventionally `-1`)
/// means no limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(from = "i64", into = "i64")]
pub enum DepthLimit {
    Unlimited,
    Max(usize),
}

impl From<i64> for DepthLimit {
    fn from(value: i64) -> Self {
        if value < 0 {
            DepthLimit::Unlimited
        } else {
            DepthLimit::Max(value as usize)
        }
    }
}

impl From<DepthLimit> for i64 {
    fn from(limit: DepthLimit) -> Self {
        match limit {
            DepthLimit::Unlimited => -1,
            DepthLimit::Max(max) => max as i64,
        }
    }
}

impl DepthLimit {
    /// Whether a dependency at `level` is within the limit.
    pub fn allows(self, level: usize) -> bool {
        match self {
            DepthLimit::Unlimited => true,
            DepthLimit::Max(max) => level <= max,
        }
    }
}

impl std::fmt::Display for DepthLimit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DepthLimit::Unlimited => write!(f, "unlimited"),
            DepthLimit::Max(max) => write!(f, "{max}"),
        }
    }
}

/// Count the path segments equal to `marker`.
///
/// Both `/` and `\` are treated as separators so the result does not depend
/// on the platform the path was reported from.
pub fn nesting_level(path: &str, marker: &str) -> usize {
    if marker.is_empty() {
        return 0;
    }
    path.split(['/', '\\'])
        .filter(|segment| *segment == marker)
        .count()
}

/// Stateless watch decision built from configuration.
#[derive(Debug, Clone)]
pub struct DependencyFilter {
    ignore: Vec<String>,
    depth: DepthLimit,
    marker: String,
}

impl DependencyFilter {
    pub fn new(ignore: Vec<String>, depth: DepthLimit, marker: impl Into<String>) -> Self {
        Self {
            ignore,
            depth,
            marker: marker.into(),
        }
    }

    /// True if `path` starts with one of the ignore prefixes (literal string match).
    pub fn is_ignored(&self, path: &str) -> bool {
        self.ignore
            .iter()
            .any(|prefix| path.starts_with(prefix.as_str()))
    }

    pub fn should_watch(&self, path: &str) -> bool {
        if self.is_ignored(path) {
            return false;
        }
        self.depth.allows(nesting_level(path, &self.marker))
    }
}
