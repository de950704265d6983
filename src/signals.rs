/// Signal handling for the supervisor itself.
///
/// SIGTERM, SIGINT and SIGHUP are all relayed: the child gets the same
/// graceful-or-forceful termination as any other stop, then the supervisor
/// exits with 0 without waiting for the child.
use tokio::signal::unix::{signal, Signal, SignalKind};

pub struct SignalHandler {
    term: Signal,
    int: Signal,
    hup: Signal,
}

impl SignalHandler {
    pub fn install() -> std::io::Result<SignalHandler> {
        Ok(SignalHandler {
            term: signal(SignalKind::terminate())?,
            int: signal(SignalKind::interrupt())?,
            hup: signal(SignalKind::hangup())?,
        })
    }

    /// Wait for the next termination signal and return its name.
    pub async fn recv(&mut self) -> &'static str {
        tokio::select! {
            _ = self.term.recv() => "SIGTERM",
            _ = self.int.recv() => "SIGINT",
            _ = self.hup.recv() => "SIGHUP",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_install_and_wait_without_signal() {
        let mut handler = SignalHandler::install().unwrap();
        let waited = tokio::time::timeout(Duration::from_millis(50), handler.recv()).await;
        assert!(waited.is_err());
    }
}
