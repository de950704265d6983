/// Child lifecycle: owns at most one live child and moves it through
/// launch, ready, stop and exit.
///
/// All mutation happens from the runner's single event loop, so the child
/// slot needs no locking. A new child is only spawned once the previous
/// one's exit event has been observed.
use crate::control::{ChildMessage, ControlError};
use crate::process::SpawnError;
use serde_json::Value;
use std::path::PathBuf;

/// Identity of one spawned child. Increases with every launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChildId(pub u64);

impl std::fmt::Display for ChildId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Everything the event loop reacts to.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// The child process exited (signal deaths are reported as 128 + signal).
    Exited { child: ChildId, code: i32 },
    /// The child connected to its control channel.
    Connected { child: ChildId },
    /// The control channel closed, from either side.
    Disconnected { child: ChildId },
    /// A decoded control message from the child.
    Message { child: ChildId, message: ChildMessage },
    /// A watched file changed.
    FileChanged(PathBuf),
    /// The file watcher degraded to polling after hitting a handle limit.
    PollingFallback { limit: u64 },
    /// The supervisor received an OS termination signal.
    Terminate { signal: &'static str },
}

/// What the event loop should do after handling an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    /// Terminate the supervisor with this exit code.
    Exit(i32),
}

/// Observable lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    NotStarted,
    Launching,
    Running,
    Stopping,
    /// The last child exited and nothing is running.
    Exited,
}

/// Launches child processes.
pub trait Spawner {
    type Child: ChildHandle;

    fn spawn(&mut self, id: ChildId) -> Result<Self::Child, SpawnError>;
}

/// Operations on one live child.
pub trait ChildHandle {
    fn pid(&self) -> Option<u32>;

    /// Queue a payload on the control channel.
    fn send(&mut self, payload: &Value) -> Result<(), ControlError>;

    /// Send the forceful termination signal.
    fn terminate(&mut self) -> std::io::Result<()>;

    /// Close the control channel.
    fn disconnect(&mut self);
}

/// Work held back until the child reports ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deferred {
    Disconnect,
}

/// One-shot "child is ready" signal with a queue of continuations.
///
/// Continuations registered before the gate fires run when it fires;
/// continuations registered afterwards are handed straight back to run now.
/// If the gate never fires, queued work never runs.
#[derive(Debug, Default)]
pub struct ReadyGate {
    fired: bool,
    queued: Vec<Deferred>,
}

impl ReadyGate {
    /// Register `action`. Returns it back if the gate already fired.
    pub fn defer(&mut self, action: Deferred) -> Option<Deferred> {
        if self.fired {
            return Some(action);
        }
        if !self.queued.contains(&action) {
            self.queued.push(action);
        }
        None
    }

    /// Fire the gate, returning the queued continuations. Only the first call yields any.
    pub fn fire(&mut self) -> Vec<Deferred> {
        if self.fired {
            return Vec::new();
        }
        self.fired = true;
        std::mem::take(&mut self.queued)
    }

    pub fn is_fired(&self) -> bool {
        self.fired
    }
}

struct Child<H> {
    id: ChildId,
    handle: H,
    /// Exit keeps the supervisor alive instead of propagating the code.
    respawn: bool,
    connected: bool,
    ready: ReadyGate,
    /// A termination request was sent, or the child announced it is terminating itself.
    terminating: bool,
    /// Launch a replacement once this child exits.
    restart_on_exit: bool,
}

impl<H: ChildHandle> Child<H> {
    fn new(id: ChildId, handle: H, respawn: bool) -> Self {
        Self {
            id,
            handle,
            respawn,
            connected: false,
            ready: ReadyGate::default(),
            terminating: false,
            restart_on_exit: false,
        }
    }

    fn run(&mut self, action: Deferred) {
        match action {
            Deferred::Disconnect => {
                if self.connected {
                    tracing::debug!(child = %self.id, "disconnecting control channel");
                    self.handle.disconnect();
                    self.connected = false;
                }
            }
        }
    }

    /// Ask the child to terminate, at most once.
    ///
    /// The graceful payload needs a connected channel to be delivered;
    /// otherwise the forceful signal is used.
    fn request_termination(&mut self, graceful: Option<&Value>) {
        if self.terminating {
            return;
        }
        self.terminating = true;

        if let Some(payload) = graceful {
            if self.connected {
                tracing::info!(child = %self.id, payload = %payload, "sending graceful shutdown payload");
                match self.handle.send(payload) {
                    Ok(()) => return,
                    Err(e) => {
                        tracing::warn!(child = %self.id, error = %e, "graceful shutdown failed, sending SIGTERM");
                    }
                }
            } else {
                tracing::warn!(
                    child = %self.id,
                    "child is not connected to its control channel, sending SIGTERM instead of the graceful payload"
                );
            }
        }

        tracing::debug!(child = %self.id, pid = ?self.handle.pid(), "sending SIGTERM");
        if let Err(e) = self.handle.terminate() {
            tracing::warn!(child = %self.id, error = %e, "failed to signal child");
        }
    }
}

pub struct Supervisor<S: Spawner> {
    spawner: S,
    respawn_on_exit: bool,
    graceful_shutdown: Option<Value>,
    next_id: u64,
    child: Option<Child<S::Child>>,
}

impl<S: Spawner> Supervisor<S> {
    pub fn new(spawner: S, respawn_on_exit: bool, graceful_shutdown: Option<Value>) -> Self {
        Self {
            spawner,
            respawn_on_exit,
            graceful_shutdown,
            next_id: 0,
            child: None,
        }
    }

    pub fn state(&self) -> SupervisorState {
        match &self.child {
            None if self.next_id == 0 => SupervisorState::NotStarted,
            None => SupervisorState::Exited,
            Some(child) if child.terminating => SupervisorState::Stopping,
            Some(child) if child.ready.is_fired() => SupervisorState::Running,
            Some(_) => SupervisorState::Launching,
        }
    }

    pub fn has_child(&self) -> bool {
        self.child.is_some()
    }

    /// True if `id` is the live child. Events from earlier children are stale.
    pub fn is_current(&self, id: ChildId) -> bool {
        self.child.as_ref().is_some_and(|c| c.id == id)
    }

    /// True if `id` is the live child and it is on its way out, either
    /// asked to terminate or terminating on its own.
    pub fn is_stopping(&self, id: ChildId) -> bool {
        self.child
            .as_ref()
            .is_some_and(|c| c.id == id && c.terminating)
    }

    /// Handle of the live child, if any.
    pub fn child_handle(&self) -> Option<&S::Child> {
        self.child.as_ref().map(|c| &c.handle)
    }

    fn current_mut(&mut self, id: ChildId) -> Option<&mut Child<S::Child>> {
        self.child.as_mut().filter(|c| c.id == id)
    }

    /// Launch a new child. Does not wait for it to become ready.
    ///
    /// A spawn failure is handled like an immediate exit of the new child.
    pub fn start(&mut self) -> Flow {
        if let Some(child) = &self.child {
            tracing::warn!(child = %child.id, "start requested while a child is still live, ignoring");
            return Flow::Continue;
        }

        self.next_id += 1;
        let id = ChildId(self.next_id);

        match self.spawner.spawn(id) {
            Ok(handle) => {
                tracing::info!(child = %id, pid = ?handle.pid(), "child started");
                self.child = Some(Child::new(id, handle, self.respawn_on_exit));
                Flow::Continue
            }
            Err(e) => {
                let code = e.exit_code();
                tracing::error!(child = %id, error = %e, code, "failed to launch child");
                if self.respawn_on_exit {
                    Flow::Continue
                } else {
                    Flow::Exit(code)
                }
            }
        }
    }

    /// Stop the live child.
    ///
    /// Always marks the child for respawn, so its exit does not end the
    /// supervisor. Unless the child is terminating on its own, a graceful
    /// payload or SIGTERM is sent. The control channel is disconnected only
    /// after the child has reported ready.
    pub fn stop(&mut self, self_terminating: bool) {
        let graceful = self.graceful_shutdown.as_ref();
        let Some(child) = self.child.as_mut() else {
            tracing::debug!("stop requested with no live child");
            return;
        };

        child.respawn = true;
        if self_terminating {
            child.terminating = true;
        } else {
            child.request_termination(graceful);
        }

        if let Some(action) = child.ready.defer(Deferred::Disconnect) {
            child.run(action);
        }
    }

    /// Register a relaunch for when the live child exits.
    ///
    /// Returns `false` if there is no child or a relaunch is already pending.
    pub fn restart_on_exit(&mut self) -> bool {
        match self.child.as_mut() {
            Some(child) if !child.restart_on_exit => {
                child.restart_on_exit = true;
                true
            }
            _ => false,
        }
    }

    pub fn handle_exit(&mut self, id: ChildId, code: i32) -> Flow {
        if !self.is_current(id) {
            tracing::debug!(child = %id, code, "ignoring exit of stale child");
            return Flow::Continue;
        }
        let Some(child) = self.child.take() else {
            return Flow::Continue;
        };

        tracing::debug!(child = %id, code, "child exited");
        if !child.respawn {
            return Flow::Exit(code);
        }
        if child.restart_on_exit {
            return self.start();
        }
        tracing::info!(code, "child exited, waiting for changes before restarting");
        Flow::Continue
    }

    pub fn handle_connected(&mut self, id: ChildId) {
        if let Some(child) = self.current_mut(id) {
            child.connected = true;
        }
    }

    pub fn handle_disconnected(&mut self, id: ChildId) {
        if let Some(child) = self.current_mut(id) {
            child.connected = false;
        }
    }

    pub fn handle_ready(&mut self, id: ChildId) {
        if let Some(child) = self.current_mut(id) {
            tracing::debug!(child = %id, "child ready");
            for action in child.ready.fire() {
                child.run(action);
            }
        }
    }

    /// Forward an OS termination signal to the child, then end the supervisor.
    pub fn relay_termination(&mut self) -> Flow {
        let graceful = self.graceful_shutdown.as_ref();
        if let Some(child) = self.child.as_mut() {
            child.respawn = true;
            child.request_termination(graceful);
        }
        Flow::Exit(0)
    }
}

/// Route a decoded message type name for logging.
pub fn message_kind(message: &ChildMessage) -> &'static str {
    match message {
        ChildMessage::DependencyLoaded { .. } => "dependency-loaded",
        ChildMessage::FatalError { .. } => "error",
        ChildMessage::Ready => "loaded",
    }
}
