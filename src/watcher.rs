//! File-change notifier backed by `notify`.
//!
//! Raw filesystem events are debounced and forwarded to the event loop as
//! [`Event::FileChanged`]. When the OS refuses more watches the watcher
//! switches to polling and reports [`Event::PollingFallback`].

use crate::config::WatchConfig;
use crate::supervisor::Event;
use crate::watch_set::{FileWatcher, WatchError};
use notify::{EventKind, PollWatcher, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;

type RawEvent = notify::Result<notify::Event>;

pub struct NotifyWatcher {
    inner: Box<dyn Watcher>,
    raw: mpsc::UnboundedSender<RawEvent>,
    events: mpsc::UnboundedSender<Event>,
    polling: bool,
    interval: Duration,
    /// Mirror of the registered paths, replayed when switching to polling.
    watched: HashSet<PathBuf>,
}

impl NotifyWatcher {
    /// Create the watcher and start its forwarding task. Must be called from
    /// within a tokio runtime.
    pub fn new(
        config: &WatchConfig,
        events: mpsc::UnboundedSender<Event>,
    ) -> Result<Self, WatchError> {
        let (raw, raw_rx) = mpsc::unbounded_channel();
        tokio::spawn(forward_changes(
            raw_rx,
            events.clone(),
            Duration::from_millis(config.debounce_ms),
        ));

        let interval = Duration::from_millis(config.interval_ms);
        let inner: Box<dyn Watcher> = if config.poll {
            Box::new(poll_watcher(raw.clone(), interval)?)
        } else {
            Box::new(
                RecommendedWatcher::new(handler(raw.clone()), notify::Config::default())
                    .map_err(|e| WatchError::Init { source: e })?,
            )
        };
        tracing::debug!(polling = config.poll, "file watcher ready");

        Ok(Self {
            inner,
            raw,
            events,
            polling: config.poll,
            interval,
            watched: HashSet::new(),
        })
    }

    fn fall_back_to_polling(&mut self) -> Result<(), WatchError> {
        let mut poller = poll_watcher(self.raw.clone(), self.interval)?;
        for path in &self.watched {
            if let Err(e) = poller.watch(path, RecursiveMode::NonRecursive) {
                tracing::warn!(path = %path.display(), error = %e, "failed to re-watch while switching to polling");
            }
        }
        self.inner = Box::new(poller);
        self.polling = true;
        let _ = self.events.send(Event::PollingFallback {
            limit: handle_limit(),
        });
        Ok(())
    }
}

impl FileWatcher for NotifyWatcher {
    fn watch(&mut self, path: &Path) -> Result<(), WatchError> {
        match self.inner.watch(path, RecursiveMode::NonRecursive) {
            Ok(()) => {}
            Err(e) if !self.polling && matches!(e.kind, notify::ErrorKind::MaxFilesWatch) => {
                self.fall_back_to_polling()?;
                self.inner
                    .watch(path, RecursiveMode::NonRecursive)
                    .map_err(|e| WatchError::Notify {
                        path: path.to_path_buf(),
                        source: e,
                    })?;
            }
            Err(e) => {
                return Err(WatchError::Notify {
                    path: path.to_path_buf(),
                    source: e,
                })
            }
        }
        self.watched.insert(path.to_path_buf());
        Ok(())
    }

    fn unwatch(&mut self, path: &Path) -> Result<(), WatchError> {
        self.watched.remove(path);
        self.inner.unwatch(path).map_err(|e| WatchError::Notify {
            path: path.to_path_buf(),
            source: e,
        })
    }
}

fn handler(raw: mpsc::UnboundedSender<RawEvent>) -> impl FnMut(RawEvent) + Send + 'static {
    move |res| {
        let _ = raw.send(res);
    }
}

fn poll_watcher(
    raw: mpsc::UnboundedSender<RawEvent>,
    interval: Duration,
) -> Result<PollWatcher, WatchError> {
    PollWatcher::new(
        handler(raw),
        notify::Config::default().with_poll_interval(interval),
    )
    .map_err(|e| WatchError::Init { source: e })
}

/// The OS limit that forced the fallback: inotify's per-user watch limit
/// where available, otherwise the open file soft limit.
pub fn handle_limit() -> u64 {
    if let Ok(text) = std::fs::read_to_string("/proc/sys/fs/inotify/max_user_watches") {
        if let Ok(limit) = text.trim().parse() {
            return limit;
        }
    }
    match nix::sys::resource::getrlimit(nix::sys::resource::Resource::RLIMIT_NOFILE) {
        Ok((soft, _hard)) => soft as u64,
        Err(_) => 0,
    }
}

/// The path a raw event is about, if it is a content change.
fn changed_path(result: RawEvent) -> Option<PathBuf> {
    match result {
        Ok(event) => match event.kind {
            EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_) => {
                event.paths.into_iter().next()
            }
            _ => None,
        },
        Err(e) => {
            tracing::warn!(error = %e, "file watch error");
            None
        }
    }
}

/// Forward one change per burst: the first changed path is reported once
/// no further change has arrived for `debounce`. Changes within the burst
/// restart the quiet period and are otherwise dropped.
async fn forward_changes(
    mut raw: mpsc::UnboundedReceiver<RawEvent>,
    events: mpsc::UnboundedSender<Event>,
    debounce: Duration,
) {
    while let Some(result) = raw.recv().await {
        let Some(path) = changed_path(result) else {
            continue;
        };

        let quiet = tokio::time::sleep(debounce);
        tokio::pin!(quiet);
        loop {
            tokio::select! {
                _ = &mut quiet => break,
                more = raw.recv() => match more {
                    Some(result) => {
                        if changed_path(result).is_some() {
                            quiet.as_mut().reset(tokio::time::Instant::now() + debounce);
                        }
                    }
                    None => break,
                },
            }
        }

        tracing::debug!(path = %path.display(), "file changed");
        if events.send(Event::FileChanged(path)).is_err() {
            return;
        }
    }
}
