/// Human-facing notifications. The core supplies a title, message and
/// severity; delivery is up to the implementation.
use std::io::Write;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Info,
    Warning,
    Error,
}

pub trait Notifier {
    fn notify(&mut self, title: &str, message: &str, level: Level);

    /// Clear the terminal before a restart.
    fn clear_screen(&mut self);
}

/// Delivers notifications as log lines.
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&mut self, title: &str, message: &str, level: Level) {
        match level {
            Level::Info => tracing::info!("[{title}] {message}"),
            Level::Warning => tracing::warn!("[{title}] {message}"),
            Level::Error => tracing::error!("[{title}] {message}"),
        }
    }

    fn clear_screen(&mut self) {
        let mut stdout = std::io::stdout();
        // Erase display, scrollback, then home the cursor
        let _ = stdout.write_all(b"\x1b[2J\x1b[3J\x1b[H");
        let _ = stdout.flush();
    }
}
