/// The supervisor's event loop.
///
/// Child exits, control messages, file changes and OS signals all arrive on
/// one loop, which owns the coordinator and with it the child slot and the
/// watch set.
use crate::config::RespawnConfig;
use crate::launch::{InterpreterLaunch, LaunchCommandBuilder};
use crate::notifier::LogNotifier;
use crate::process::{ProcessSpawner, SpawnError};
use crate::restart::RestartCoordinator;
use crate::signals::SignalHandler;
use crate::supervisor::{Event, Flow, Supervisor};
use crate::watch_set::{WatchError, WatchSet};
use crate::watcher::NotifyWatcher;
use std::path::Path;
use std::time::Duration;
use tokio::sync::mpsc;

/// How long to wait for a relayed graceful payload to reach the child.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug)]
pub enum RunError {
    Spawner(SpawnError),
    Watcher(WatchError),
    Signals(std::io::Error),
    WorkingDir(std::io::Error),
}

impl std::fmt::Display for RunError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunError::Spawner(e) => write!(f, "{}", e),
            RunError::Watcher(e) => write!(f, "{}", e),
            RunError::Signals(e) => write!(f, "failed to install signal handlers: {}", e),
            RunError::WorkingDir(e) => write!(f, "failed to read working directory: {}", e),
        }
    }
}

impl std::error::Error for RunError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RunError::Spawner(e) => Some(e),
            RunError::Watcher(e) => Some(e),
            RunError::Signals(e) => Some(e),
            RunError::WorkingDir(e) => Some(e),
        }
    }
}

/// Supervise `script` until the supervisor should exit; returns the exit code.
pub async fn run(
    config: &RespawnConfig,
    script: &Path,
    script_args: &[String],
) -> Result<i32, RunError> {
    let (events, mut incoming) = mpsc::unbounded_channel();

    let command = InterpreterLaunch::new(&config.child, &config.launch).build(script, script_args);
    tracing::debug!(
        program = %command.program,
        args = ?command.args,
        deps = %config.watch.deps,
        ignore = ?config.watch.ignore,
        "resolved launch"
    );

    let spawner = ProcessSpawner::new(command, events.clone()).map_err(RunError::Spawner)?;
    let watcher = NotifyWatcher::new(&config.watch, events.clone()).map_err(RunError::Watcher)?;
    let mut signals = SignalHandler::install().map_err(RunError::Signals)?;
    let base_dir = std::env::current_dir().map_err(RunError::WorkingDir)?;

    let mut coordinator = RestartCoordinator::new(
        Supervisor::new(
            spawner,
            config.child.respawn,
            config.child.graceful_shutdown.clone(),
        ),
        WatchSet::new(watcher),
        config.watch.filter(),
        LogNotifier,
        config.notify.clear,
        base_dir,
    );

    if let Flow::Exit(code) = coordinator.start() {
        return Ok(code);
    }

    loop {
        let event = tokio::select! {
            Some(event) = incoming.recv() => event,
            signal = signals.recv() => Event::Terminate { signal },
        };
        let relayed = matches!(event, Event::Terminate { .. });

        if let Flow::Exit(code) = coordinator.handle(event) {
            if relayed {
                if let Some(child) = coordinator.supervisor().child_handle() {
                    child.flush(FLUSH_TIMEOUT).await;
                }
            }
            return Ok(code);
        }
    }
}
