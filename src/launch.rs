/// Launch command construction: which program runs the script, with which
/// arguments and environment.
use crate::config::{ChildConfig, LaunchConfig};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Environment variable carrying the control socket path to the child.
pub const CONTROL_SOCKET_ENV: &str = "RESPAWN_CONTROL_SOCKET";

/// Environment variable carrying the preload module path to the child.
pub const PRELOAD_ENV: &str = "RESPAWN_PRELOAD";

/// A fully resolved command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchCommand {
    pub program: String,
    pub args: Vec<String>,
    /// Extra environment on top of the supervisor's own.
    pub env: Vec<(String, String)>,
}

/// Builds the command that runs a script.
pub trait LaunchCommandBuilder {
    fn build(&self, script: &Path, script_args: &[String]) -> LaunchCommand;
}

/// Runs the script through a configured interpreter.
///
/// Arguments are laid out as
/// `interpreter [interpreter_args] [extension args] script [script_args]`.
/// An empty interpreter executes the script directly.
#[derive(Debug, Clone)]
pub struct InterpreterLaunch {
    interpreter: String,
    interpreter_args: Vec<String>,
    extensions: BTreeMap<String, Vec<String>>,
    preload: Option<PathBuf>,
}

impl InterpreterLaunch {
    pub fn new(child: &ChildConfig, launch: &LaunchConfig) -> Self {
        Self {
            interpreter: child.interpreter.clone(),
            interpreter_args: child.interpreter_args.clone(),
            extensions: launch
                .extensions
                .iter()
                .map(|(ext, args)| (ext.trim_start_matches('.').to_string(), args.clone()))
                .collect(),
            preload: child.preload.clone(),
        }
    }

    /// Extra interpreter arguments registered for the script's extension.
    fn extension_args(&self, script: &Path) -> &[String] {
        script
            .extension()
            .and_then(|ext| ext.to_str())
            .and_then(|ext| self.extensions.get(ext))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

impl LaunchCommandBuilder for InterpreterLaunch {
    fn build(&self, script: &Path, script_args: &[String]) -> LaunchCommand {
        let script_str = script.to_string_lossy().into_owned();
        let (program, mut args) = if self.interpreter.is_empty() {
            (script_str, Vec::new())
        } else {
            let mut args = self.interpreter_args.clone();
            args.extend(self.extension_args(script).iter().cloned());
            args.push(script_str);
            (self.interpreter.clone(), args)
        };
        args.extend(script_args.iter().cloned());

        let mut env = Vec::new();
        if let Some(preload) = &self.preload {
            env.push((
                PRELOAD_ENV.to_string(),
                preload.to_string_lossy().into_owned(),
            ));
        }

        LaunchCommand { program, args, env }
    }
}
