use crate::filter::{DependencyFilter, DepthLimit};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Top-level configuration loaded from respawn.toml.
#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
#[derive(Default)]
pub struct RespawnConfig {
    pub child: ChildConfig,
    pub watch: WatchConfig,
    pub notify: NotifyConfig,
    pub launch: LaunchConfig,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct ChildConfig {
    pub interpreter: String,
    pub interpreter_args: Vec<String>,
    /// Keep running after the child exits on its own, waiting for a change.
    pub respawn: bool,
    /// Sent over the control channel instead of SIGTERM when set.
    /// Rendered separately by [`RespawnConfig::render`]; TOML has no null.
    #[serde(skip_serializing)]
    pub graceful_shutdown: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preload: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct WatchConfig {
    pub ignore: Vec<String>,
    pub deps: DepthLimit,
    pub boundary_marker: String,
    pub poll: bool,
    pub interval_ms: u64,
    pub debounce_ms: u64,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
#[derive(Default)]
pub struct NotifyConfig {
    pub clear: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
#[derive(Default)]
pub struct LaunchConfig {
    /// Extra interpreter arguments keyed by script extension.
    pub extensions: BTreeMap<String, Vec<String>>,
}

impl WatchConfig {
    pub fn filter(&self) -> DependencyFilter {
        DependencyFilter::new(self.ignore.clone(), self.deps, self.boundary_marker.clone())
    }
}

/// Errors from loading configuration.
#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    /// A graceful shutdown payload given on the command line was not JSON.
    GracefulPayload { source: serde_json::Error },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config {}: {}", path.display(), source)
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse config {}: {}", path.display(), source)
            }
            ConfigError::GracefulPayload { source } => {
                write!(f, "graceful shutdown payload is not valid JSON: {}", source)
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            ConfigError::GracefulPayload { source } => Some(source),
        }
    }
}

impl RespawnConfig {
    /// Load configuration from `path`.
    ///
    /// When `required` is false a missing file yields the defaults.
    pub fn load(path: &Path, required: bool) -> Result<Self, ConfigError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if !required && e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source: e,
                })
            }
        };
        toml::from_str(&contents).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Render the resolved settings for `--dry-run`. The graceful shutdown
    /// payload follows as JSON in a trailing comment.
    pub fn render(&self) -> Result<String, toml::ser::Error> {
        let mut text = toml::to_string_pretty(self)?;
        if let Some(payload) = &self.child.graceful_shutdown {
            text.push_str(&format!("\n# child.graceful_shutdown (JSON)\n# {payload}\n"));
        }
        Ok(text)
    }
}

/// Parse a graceful shutdown payload given as JSON text.
pub fn parse_graceful_payload(text: &str) -> Result<serde_json::Value, ConfigError> {
    serde_json::from_str(text).map_err(|e| ConfigError::GracefulPayload { source: e })
}

// --- Default implementations ---

impl Default for ChildConfig {
    fn default() -> Self {
        Self {
            interpreter: "node".to_string(),
            interpreter_args: Vec::new(),
            respawn: false,
            graceful_shutdown: None,
            preload: None,
        }
    }
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            ignore: Vec::new(),
            deps: DepthLimit::Max(1),
            boundary_marker: "node_modules".to_string(),
            poll: false,
            interval_ms: 1000,
            debounce_ms: 10,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_defaults() {
        let config = RespawnConfig::default();
        assert_eq!(config.child.interpreter, "node");
        assert!(!config.child.respawn);
        assert!(config.child.graceful_shutdown.is_none());
        assert_eq!(config.watch.deps, DepthLimit::Max(1));
        assert_eq!(config.watch.boundary_marker, "node_modules");
        assert!(!config.watch.poll);
        assert!(!config.notify.clear);
        assert!(config.launch.extensions.is_empty());
    }

    #[test]
    fn test_parse_full_config() {
        let config: RespawnConfig = toml::from_str(
            r#"
            [child]
            interpreter = "deno"
            interpreter_args = ["run", "-A"]
            respawn = true
            graceful_shutdown = { type = "shutdown" }

            [watch]
            ignore = ["/app/generated"]
            deps = -1
            poll = true
            interval_ms = 250

            [notify]
            clear = true
            timestamp = "%H:%M:%S"

            [launch.extensions]
            ".ts" = ["--import", "tsx"]
            "#,
        )
        .unwrap();

        assert_eq!(config.child.interpreter, "deno");
        assert_eq!(config.child.interpreter_args, vec!["run", "-A"]);
        assert!(config.child.respawn);
        assert_eq!(
            config.child.graceful_shutdown,
            Some(json!({"type": "shutdown"}))
        );
        assert_eq!(config.watch.ignore, vec!["/app/generated"]);
        assert_eq!(config.watch.deps, DepthLimit::Unlimited);
        assert!(config.watch.poll);
        assert_eq!(config.watch.interval_ms, 250);
        // Unspecified fields keep their defaults
        assert_eq!(config.watch.debounce_ms, 10);
        assert_eq!(config.watch.boundary_marker, "node_modules");
        assert!(config.notify.clear);
        assert_eq!(config.notify.timestamp.as_deref(), Some("%H:%M:%S"));
        assert_eq!(config.launch.extensions[".ts"], vec!["--import", "tsx"]);
    }

    #[test]
    fn test_load_missing_optional_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = RespawnConfig::load(&dir.path().join("respawn.toml"), false).unwrap();
        assert_eq!(config.child.interpreter, "node");
    }

    #[test]
    fn test_load_missing_required_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = RespawnConfig::load(&dir.path().join("custom.toml"), true).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_load_invalid_toml_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("respawn.toml");
        std::fs::write(&path, "[watch]\ndeps = \"deep\"\n").unwrap();
        let err = RespawnConfig::load(&path, false).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains("failed to parse config"));
    }

    #[test]
    fn test_watch_filter_uses_config() {
        let watch = WatchConfig {
            ignore: vec!["/skip".to_string()],
            deps: DepthLimit::Max(0),
            ..Default::default()
        };
        let filter = watch.filter();
        assert!(!filter.should_watch("/skip/a.js"));
        assert!(!filter.should_watch("/app/node_modules/a.js"));
        assert!(filter.should_watch("/app/a.js"));
    }

    #[test]
    fn test_parse_graceful_payload() {
        assert_eq!(
            parse_graceful_payload(r#"{"cmd":"stop"}"#).unwrap(),
            json!({"cmd": "stop"})
        );
        assert!(matches!(
            parse_graceful_payload("{not json"),
            Err(ConfigError::GracefulPayload { .. })
        ));
    }

    #[test]
    fn test_render_payload_with_null() {
        let mut config = RespawnConfig::default();
        config.child.graceful_shutdown = Some(json!([1, {"a": null}]));
        let text = config.render().unwrap();
        assert!(text.contains(r#"# [1,{"a":null}]"#));

        config.child.graceful_shutdown = Some(json!(null));
        assert!(config.render().unwrap().ends_with("# null\n"));
    }

    #[test]
    fn test_render_is_loadable_toml() {
        let mut config = RespawnConfig::default();
        config.child.graceful_shutdown = Some(json!({"type": "shutdown"}));
        config.watch.deps = DepthLimit::Unlimited;
        let parsed: RespawnConfig = toml::from_str(&config.render().unwrap()).unwrap();
        assert_eq!(parsed.watch.deps, DepthLimit::Unlimited);
        assert!(parsed.child.graceful_shutdown.is_none());
    }

    #[test]
    fn test_serialize_round_trips_depth() {
        let config = RespawnConfig::default();
        let text = toml::to_string_pretty(&config).unwrap();
        assert!(text.contains("deps = 1"));
        let parsed: RespawnConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.watch.deps, DepthLimit::Max(1));
    }
}
