/// Restart coordination: turns file changes, control messages and process
/// exits into supervisor actions.
///
/// Every restart cycle starts by clearing the watch set, so whichever child
/// reports dependencies next starts from nothing. Changes arriving while a
/// restart is already pending fold into that restart.
use crate::control::ChildMessage;
use crate::filter::DependencyFilter;
use crate::notifier::{Level, Notifier};
use crate::supervisor::{message_kind, ChildId, Event, Flow, Spawner, Supervisor};
use crate::watch_set::{FileWatcher, WatchSet};
use std::path::{Path, PathBuf};

pub struct RestartCoordinator<S: Spawner, W: FileWatcher, N: Notifier> {
    supervisor: Supervisor<S>,
    watch_set: WatchSet<W>,
    filter: DependencyFilter,
    notifier: N,
    clear_screen: bool,
    /// Base for dependency paths reported relative.
    base_dir: PathBuf,
}

impl<S: Spawner, W: FileWatcher, N: Notifier> RestartCoordinator<S, W, N> {
    pub fn new(
        supervisor: Supervisor<S>,
        watch_set: WatchSet<W>,
        filter: DependencyFilter,
        notifier: N,
        clear_screen: bool,
        base_dir: PathBuf,
    ) -> Self {
        Self {
            supervisor,
            watch_set,
            filter,
            notifier,
            clear_screen,
            base_dir,
        }
    }

    pub fn supervisor(&self) -> &Supervisor<S> {
        &self.supervisor
    }

    #[cfg(test)]
    pub fn watch_set(&self) -> &WatchSet<W> {
        &self.watch_set
    }

    /// Launch the first child.
    pub fn start(&mut self) -> Flow {
        self.supervisor.start()
    }

    pub fn handle(&mut self, event: Event) -> Flow {
        tracing::trace!(?event, state = ?self.supervisor.state(), "handling event");
        match event {
            Event::FileChanged(path) => self.on_change(&path),
            Event::PollingFallback { limit } => {
                self.on_polling_fallback(limit);
                Flow::Continue
            }
            Event::Message { child, message } => {
                self.on_message(child, message);
                Flow::Continue
            }
            Event::Connected { child } => {
                self.supervisor.handle_connected(child);
                Flow::Continue
            }
            Event::Disconnected { child } => {
                self.supervisor.handle_disconnected(child);
                Flow::Continue
            }
            Event::Exited { child, code } => self.supervisor.handle_exit(child, code),
            Event::Terminate { signal } => {
                tracing::info!(signal, "relaying termination to child");
                self.supervisor.relay_termination()
            }
        }
    }

    fn on_change(&mut self, path: &Path) -> Flow {
        if self.clear_screen {
            self.notifier.clear_screen();
        }
        self.notifier.notify(
            "Restarting",
            &format!("{} has been modified", path.display()),
            Level::Info,
        );

        tracing::debug!(watched = self.watch_set.len(), "clearing watch set");
        self.watch_set.clear();

        if !self.supervisor.has_child() {
            return self.supervisor.start();
        }
        if self.supervisor.restart_on_exit() {
            self.supervisor.stop(false);
        } else {
            tracing::debug!("restart already pending");
        }
        Flow::Continue
    }

    fn on_message(&mut self, child: ChildId, message: ChildMessage) {
        if !self.supervisor.is_current(child) {
            tracing::debug!(child = %child, kind = message_kind(&message), "ignoring message from stale child");
            return;
        }

        match message {
            ChildMessage::DependencyLoaded { required } => {
                // The watch set already belongs to the next child
                if self.supervisor.is_stopping(child) {
                    tracing::debug!(
                        child = %child,
                        path = %required.display(),
                        "ignoring dependency from stopping child"
                    );
                } else {
                    self.on_dependency(required);
                }
            }
            ChildMessage::FatalError {
                error,
                message,
                will_terminate,
            } => {
                self.notifier.notify(&error, &message, Level::Error);
                self.supervisor.stop(will_terminate);
            }
            ChildMessage::Ready => self.supervisor.handle_ready(child),
        }
    }

    fn on_dependency(&mut self, required: PathBuf) {
        let path = if required.is_absolute() {
            required
        } else {
            self.base_dir.join(required)
        };

        if self.filter.should_watch(&path.to_string_lossy()) {
            self.watch_set.add(path);
        } else {
            tracing::trace!(path = %path.display(), "not watching dependency");
        }
    }

    fn on_polling_fallback(&mut self, limit: u64) {
        self.notifier.notify(
            "Polling",
            &format!(
                "File watcher hit the handle limit ({limit}) and fell back to polling. \
                 Reduce the number of watched files with --ignore or --deps, \
                 or raise the limit (ulimit -n, fs.inotify.max_user_watches)."
            ),
            Level::Warning,
        );
    }
}
