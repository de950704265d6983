/// Child processes: spawn the launch command, hand it a control socket,
/// and report its exit back to the event loop.
use crate::control::{self, ControlError, Outgoing};
use crate::launch::{LaunchCommand, CONTROL_SOCKET_ENV};
use crate::supervisor::{ChildHandle, ChildId, Event, Spawner};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serde_json::Value;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::UnixListener;
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};

/// Errors that can occur while launching a child.
#[derive(Debug)]
pub enum SpawnError {
    /// Failed to create the directory holding control sockets.
    SocketDir { source: std::io::Error },
    /// Failed to bind the child's control socket.
    Socket {
        path: PathBuf,
        source: std::io::Error,
    },
    /// Failed to spawn the child process.
    Spawn {
        program: String,
        source: std::io::Error,
    },
}

impl SpawnError {
    /// Exit code reported for a child that never started, following shell
    /// conventions: 127 for a missing program, 126 otherwise.
    pub fn exit_code(&self) -> i32 {
        match self {
            SpawnError::Spawn { source, .. } if source.kind() == std::io::ErrorKind::NotFound => {
                127
            }
            _ => 126,
        }
    }
}

impl std::fmt::Display for SpawnError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SpawnError::SocketDir { source } => {
                write!(f, "failed to create control socket directory: {}", source)
            }
            SpawnError::Socket { path, source } => {
                write!(
                    f,
                    "failed to bind control socket {}: {}",
                    path.display(),
                    source
                )
            }
            SpawnError::Spawn { program, source } => {
                write!(f, "failed to spawn {}: {}", program, source)
            }
        }
    }
}

impl std::error::Error for SpawnError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SpawnError::SocketDir { source } => Some(source),
            SpawnError::Socket { source, .. } => Some(source),
            SpawnError::Spawn { source, .. } => Some(source),
        }
    }
}

/// Exit code for a finished process. Signal deaths map to 128 + signal.
pub fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|signal| 128 + signal))
        .unwrap_or(1)
}

/// Upper bound on waiting for a dead child's control output, in case a
/// grandchild still holds the socket open.
const DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

pub struct ProcessSpawner {
    command: LaunchCommand,
    socket_dir: TempDir,
    events: mpsc::UnboundedSender<Event>,
}

impl ProcessSpawner {
    pub fn new(
        command: LaunchCommand,
        events: mpsc::UnboundedSender<Event>,
    ) -> Result<Self, SpawnError> {
        let socket_dir = tempfile::Builder::new()
            .prefix("respawn-")
            .tempdir()
            .map_err(|e| SpawnError::SocketDir { source: e })?;
        Ok(Self {
            command,
            socket_dir,
            events,
        })
    }

    fn socket_path(&self, id: ChildId) -> PathBuf {
        self.socket_dir.path().join(format!("child-{id}.sock"))
    }
}

impl Spawner for ProcessSpawner {
    type Child = ProcessChild;

    /// Spawn the child with the supervisor's environment and working
    /// directory, plus the control socket path.
    fn spawn(&mut self, id: ChildId) -> Result<ProcessChild, SpawnError> {
        let socket_path = self.socket_path(id);
        let listener = UnixListener::bind(&socket_path).map_err(|e| SpawnError::Socket {
            path: socket_path.clone(),
            source: e,
        })?;

        tracing::debug!(
            command = %self.command.program,
            args = ?self.command.args,
            socket = %socket_path.display(),
            "spawning child"
        );

        let spawned = Command::new(&self.command.program)
            .args(&self.command.args)
            .envs(self.command.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .env(CONTROL_SOCKET_ENV, &socket_path)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .spawn();
        let child = match spawned {
            Ok(child) => child,
            Err(e) => {
                drop(listener);
                control::remove_socket(&socket_path);
                return Err(SpawnError::Spawn {
                    program: self.command.program.clone(),
                    source: e,
                });
            }
        };

        let pid = child.id();
        let (exit_notice, exited) = oneshot::channel();
        tokio::spawn(wait_for_exit(id, child, exit_notice, self.events.clone()));

        let (outgoing, commands) = mpsc::unbounded_channel();
        tokio::spawn(control::serve_connection(
            id,
            listener,
            socket_path,
            commands,
            exited,
            self.events.clone(),
        ));

        Ok(ProcessChild { pid, outgoing })
    }
}

async fn wait_for_exit(
    id: ChildId,
    mut child: tokio::process::Child,
    exit_notice: oneshot::Sender<oneshot::Sender<()>>,
    events: mpsc::UnboundedSender<Event>,
) {
    let code = match child.wait().await {
        Ok(status) => exit_code(status),
        Err(e) => {
            tracing::error!(child = %id, error = %e, "failed to wait for child");
            1
        }
    };

    // Control messages written before the exit are delivered first
    let (ack, drained) = oneshot::channel();
    if exit_notice.send(ack).is_ok()
        && tokio::time::timeout(DRAIN_TIMEOUT, drained).await.is_err()
    {
        tracing::debug!(child = %id, "timed out draining control channel");
    }
    let _ = events.send(Event::Exited { child: id, code });
}

pub struct ProcessChild {
    pid: Option<u32>,
    outgoing: mpsc::UnboundedSender<Outgoing>,
}

impl ProcessChild {
    /// Wait, up to `timeout`, for queued control writes to reach the child.
    pub async fn flush(&self, timeout: Duration) {
        let (ack, done) = oneshot::channel();
        if self.outgoing.send(Outgoing::Flush(ack)).is_err() {
            return;
        }
        if tokio::time::timeout(timeout, done).await.is_err() {
            tracing::debug!("timed out flushing control channel");
        }
    }
}

impl ChildHandle for ProcessChild {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn send(&mut self, payload: &Value) -> Result<(), ControlError> {
        let line =
            serde_json::to_string(payload).map_err(|e| ControlError::Encode { source: e })?;
        self.outgoing
            .send(Outgoing::Send(line))
            .map_err(|_| ControlError::Closed)
    }

    fn terminate(&mut self) -> std::io::Result<()> {
        let Some(pid) = self.pid else {
            return Ok(());
        };
        kill(Pid::from_raw(pid as i32), Signal::SIGTERM)?;
        Ok(())
    }

    fn disconnect(&mut self) {
        let _ = self.outgoing.send(Outgoing::Disconnect);
    }
}
