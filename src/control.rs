//! Control channel between the supervisor and its child.
//!
//! Each child gets its own Unix socket; its path is handed to the child in
//! `RESPAWN_CONTROL_SOCKET`. Messages are JSON objects, one per line:
//!
//! ```text
//! child -> supervisor   {"type":"dependency-loaded","required":"/abs/path.js"}
//!                       {"type":"error","error":"TypeError","message":"...","willTerminate":true}
//!                       {"type":"loaded"}
//! supervisor -> child   <graceful shutdown payload, verbatim>
//! ```

use crate::supervisor::{ChildId, Event};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, oneshot};

/// A message sent by the child.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type")]
pub enum ChildMessage {
    /// The child loaded a file it depends on.
    #[serde(rename = "dependency-loaded")]
    DependencyLoaded { required: PathBuf },
    /// The child hit an error it cannot recover from.
    #[serde(rename = "error")]
    FatalError {
        error: String,
        message: String,
        #[serde(rename = "willTerminate", default)]
        will_terminate: bool,
    },
    /// The child finished starting up.
    #[serde(rename = "loaded")]
    Ready,
}

impl ChildMessage {
    pub fn decode(line: &str) -> Result<Self, ControlError> {
        serde_json::from_str(line).map_err(|e| ControlError::Decode {
            line: line.to_string(),
            source: e,
        })
    }
}

/// Commands from the supervisor to a connection task.
#[derive(Debug)]
pub enum Outgoing {
    /// Write one encoded line.
    Send(String),
    /// Close the connection.
    Disconnect,
    /// Acknowledge once everything queued before this has been written.
    Flush(oneshot::Sender<()>),
}

#[derive(Debug)]
pub enum ControlError {
    /// A line from the child was not a valid control message.
    Decode {
        line: String,
        source: serde_json::Error,
    },
    /// A payload could not be encoded.
    Encode { source: serde_json::Error },
    /// The connection task is gone.
    Closed,
}

impl std::fmt::Display for ControlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ControlError::Decode { line, source } => {
                write!(f, "invalid control message {:?}: {}", line, source)
            }
            ControlError::Encode { source } => {
                write!(f, "failed to encode control payload: {}", source)
            }
            ControlError::Closed => write!(f, "control channel is closed"),
        }
    }
}

impl std::error::Error for ControlError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ControlError::Decode { source, .. } => Some(source),
            ControlError::Encode { source } => Some(source),
            ControlError::Closed => None,
        }
    }
}

/// Unlink a control socket file. A file that is already gone is fine.
pub fn remove_socket(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            tracing::debug!(path = %path.display(), error = %e, "failed to remove control socket");
        }
    }
}

/// Delivered once the child process is gone. The connection task answers
/// on the enclosed sender after forwarding everything the child wrote.
pub type ExitNotice = oneshot::Receiver<oneshot::Sender<()>>;

/// Resolve when the exit notice arrives. Never resolves once it has been
/// taken or its sender was dropped.
async fn child_exited(exited: &mut Option<ExitNotice>) -> Option<oneshot::Sender<()>> {
    let Some(notice) = exited.as_mut() else {
        return std::future::pending().await;
    };
    let drained = notice.await;
    *exited = None;
    drained.ok()
}

/// Wait for the child to connect, or for the supervisor to give up on it.
async fn accept_connection(
    child: ChildId,
    listener: &UnixListener,
    commands: &mut mpsc::UnboundedReceiver<Outgoing>,
    exited: &mut Option<ExitNotice>,
) -> Option<UnixStream> {
    loop {
        tokio::select! {
            drained = child_exited(exited) => {
                if drained.is_some() {
                    tracing::debug!(child = %child, "child exited without connecting");
                    return None;
                }
            },
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => return Some(stream),
                Err(e) => {
                    tracing::warn!(child = %child, error = %e, "failed to accept control connection");
                    return None;
                }
            },
            command = commands.recv() => match command {
                Some(Outgoing::Send(_)) => {
                    tracing::debug!(child = %child, "dropping payload for unconnected child");
                }
                Some(Outgoing::Flush(ack)) => {
                    let _ = ack.send(());
                }
                Some(Outgoing::Disconnect) | None => return None,
            },
        }
    }
}

/// Accept the child's connection and pump messages both ways until either
/// side closes.
///
/// Decoded messages become [`Event::Message`]; connection state changes
/// become [`Event::Connected`] and [`Event::Disconnected`]. Payloads queued
/// before the child connects are dropped. The socket file at `socket_path`
/// is removed as soon as the listener is no longer needed.
///
/// After `exited` fires the task keeps reading until EOF, so messages the
/// child wrote before dying reach the event loop ahead of its exit.
pub async fn serve_connection(
    child: ChildId,
    listener: UnixListener,
    socket_path: PathBuf,
    mut commands: mpsc::UnboundedReceiver<Outgoing>,
    exited: ExitNotice,
    events: mpsc::UnboundedSender<Event>,
) {
    let mut exited = Some(exited);
    let accepted = accept_connection(child, &listener, &mut commands, &mut exited).await;
    drop(listener);
    remove_socket(&socket_path);
    let Some(stream) = accepted else {
        return;
    };

    tracing::debug!(child = %child, "control channel connected");
    let _ = events.send(Event::Connected { child });

    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();
    let mut drained = None;

    loop {
        tokio::select! {
            biased;

            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match ChildMessage::decode(&line) {
                        Ok(message) => {
                            let _ = events.send(Event::Message { child, message });
                        }
                        Err(e) => {
                            tracing::warn!(child = %child, error = %e, "ignoring malformed control message");
                        }
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(child = %child, error = %e, "control channel read failed");
                    break;
                }
            },
            command = commands.recv() => match command {
                Some(Outgoing::Send(line)) => {
                    let written = async {
                        write.write_all(line.as_bytes()).await?;
                        write.write_all(b"\n").await?;
                        write.flush().await
                    };
                    if let Err(e) = written.await {
                        tracing::warn!(child = %child, error = %e, "control channel write failed");
                        break;
                    }
                }
                Some(Outgoing::Flush(ack)) => {
                    let _ = write.flush().await;
                    let _ = ack.send(());
                }
                Some(Outgoing::Disconnect) | None => break,
            },
            ack = child_exited(&mut exited) => {
                if ack.is_some() {
                    tracing::debug!(child = %child, "child exited, draining control channel");
                    drained = ack;
                }
            },
        }
    }

    tracing::debug!(child = %child, "control channel closed");
    let _ = events.send(Event::Disconnected { child });
    if let Some(ack) = drained {
        let _ = ack.send(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_dependency_loaded() {
        let msg = ChildMessage::decode(r#"{"type":"dependency-loaded","required":"/app/a.js"}"#)
            .unwrap();
        assert_eq!(
            msg,
            ChildMessage::DependencyLoaded {
                required: PathBuf::from("/app/a.js")
            }
        );
    }

    #[test]
    fn test_decode_error_with_will_terminate() {
        let msg = ChildMessage::decode(
            r#"{"type":"error","error":"SyntaxError","message":"Unexpected token","willTerminate":true}"#,
        )
        .unwrap();
        assert_eq!(
            msg,
            ChildMessage::FatalError {
                error: "SyntaxError".to_string(),
                message: "Unexpected token".to_string(),
                will_terminate: true,
            }
        );
    }

    #[test]
    fn test_decode_error_will_terminate_defaults_false() {
        let msg =
            ChildMessage::decode(r#"{"type":"error","error":"E","message":"m"}"#).unwrap();
        assert!(matches!(
            msg,
            ChildMessage::FatalError {
                will_terminate: false,
                ..
            }
        ));
    }

    #[test]
    fn test_decode_loaded_ignores_extra_fields() {
        assert_eq!(
            ChildMessage::decode(r#"{"type":"loaded","extra":1}"#).unwrap(),
            ChildMessage::Ready
        );
    }

    #[test]
    fn test_decode_unknown_type_fails() {
        let err = ChildMessage::decode(r#"{"type":"hello"}"#).unwrap_err();
        assert!(matches!(err, ControlError::Decode { .. }));
    }

    #[test]
    fn test_decode_missing_field_fails() {
        assert!(ChildMessage::decode(r#"{"type":"dependency-loaded"}"#).is_err());
        assert!(ChildMessage::decode(r#"{"type":"error","message":"m"}"#).is_err());
    }

    #[test]
    fn test_decode_not_json_fails() {
        let err = ChildMessage::decode("loaded").unwrap_err();
        assert!(err.to_string().contains("invalid control message"));
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<Event>) -> Event {
        tokio::time::timeout(std::time::Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed")
    }

    #[tokio::test]
    async fn test_connection_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("control.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (ev_tx, mut ev_rx) = mpsc::unbounded_channel();
        let (_exit_tx, exit_rx) = oneshot::channel();
        let task = tokio::spawn(serve_connection(
            ChildId(7),
            listener,
            path.clone(),
            cmd_rx,
            exit_rx,
            ev_tx,
        ));

        let stream = UnixStream::connect(&path).await.unwrap();
        assert_eq!(next_event(&mut ev_rx).await, Event::Connected { child: ChildId(7) });
        // Nothing else may connect once the child has
        assert!(!path.exists());

        let (read, mut write) = stream.into_split();
        write
            .write_all(b"{\"type\":\"dependency-loaded\",\"required\":\"/x.js\"}\nnot json\n{\"type\":\"loaded\"}\n")
            .await
            .unwrap();

        assert_eq!(
            next_event(&mut ev_rx).await,
            Event::Message {
                child: ChildId(7),
                message: ChildMessage::DependencyLoaded {
                    required: PathBuf::from("/x.js")
                }
            }
        );
        // The malformed line is skipped
        assert_eq!(
            next_event(&mut ev_rx).await,
            Event::Message {
                child: ChildId(7),
                message: ChildMessage::Ready
            }
        );

        cmd_tx
            .send(Outgoing::Send(r#"{"type":"shutdown"}"#.to_string()))
            .unwrap();
        let mut reader = BufReader::new(read).lines();
        let line = reader.next_line().await.unwrap().unwrap();
        assert_eq!(line, r#"{"type":"shutdown"}"#);

        cmd_tx.send(Outgoing::Disconnect).unwrap();
        assert_eq!(
            next_event(&mut ev_rx).await,
            Event::Disconnected { child: ChildId(7) }
        );
        // Closed from the supervisor side: the child sees EOF
        assert_eq!(reader.next_line().await.unwrap(), None);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_child_eof_reports_disconnected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("control.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let (_cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (ev_tx, mut ev_rx) = mpsc::unbounded_channel();
        let (_exit_tx, exit_rx) = oneshot::channel();
        tokio::spawn(serve_connection(
            ChildId(1),
            listener,
            path.clone(),
            cmd_rx,
            exit_rx,
            ev_tx,
        ));

        let stream = UnixStream::connect(&path).await.unwrap();
        assert_eq!(next_event(&mut ev_rx).await, Event::Connected { child: ChildId(1) });
        drop(stream);
        assert_eq!(
            next_event(&mut ev_rx).await,
            Event::Disconnected { child: ChildId(1) }
        );
    }

    #[tokio::test]
    async fn test_flush_before_connect_acks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("control.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (ev_tx, _ev_rx) = mpsc::unbounded_channel();
        let (_exit_tx, exit_rx) = oneshot::channel();
        tokio::spawn(serve_connection(ChildId(1), listener, path, cmd_rx, exit_rx, ev_tx));

        let (ack, done) = oneshot::channel();
        cmd_tx.send(Outgoing::Flush(ack)).unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(5), done)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_dropped_commands_end_unconnected_task() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("control.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (ev_tx, _ev_rx) = mpsc::unbounded_channel();
        let (_exit_tx, exit_rx) = oneshot::channel();
        let task = tokio::spawn(serve_connection(
            ChildId(1),
            listener,
            path.clone(),
            cmd_rx,
            exit_rx,
            ev_tx,
        ));
        assert!(path.exists());
        drop(cmd_tx);
        tokio::time::timeout(std::time::Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_exit_acked_after_child_output_forwarded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("control.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let (_cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = oneshot::channel();
        let (ev_tx, mut ev_rx) = mpsc::unbounded_channel();
        tokio::spawn(serve_connection(
            ChildId(3),
            listener,
            path.clone(),
            cmd_rx,
            exit_rx,
            ev_tx,
        ));

        let mut stream = UnixStream::connect(&path).await.unwrap();
        assert_eq!(next_event(&mut ev_rx).await, Event::Connected { child: ChildId(3) });

        let mut burst = String::new();
        for i in 0..500 {
            burst.push_str(&format!(
                "{{\"type\":\"dependency-loaded\",\"required\":\"/app/{i}.js\"}}\n"
            ));
        }
        burst.push_str("{\"type\":\"error\",\"error\":\"E\",\"message\":\"m\",\"willTerminate\":true}\n");
        stream.write_all(burst.as_bytes()).await.unwrap();
        drop(stream);

        // The child is gone; its output must be forwarded before the ack
        let (ack, drained) = oneshot::channel();
        exit_tx.send(ack).unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(5), drained)
            .await
            .unwrap()
            .unwrap();

        let mut messages = 0;
        let mut last = None;
        while let Ok(event) = ev_rx.try_recv() {
            if let Event::Message { message, .. } = &event {
                messages += 1;
                last = Some(message.clone());
            }
            if event == (Event::Disconnected { child: ChildId(3) }) {
                break;
            }
        }
        assert_eq!(messages, 501);
        assert!(matches!(
            last,
            Some(ChildMessage::FatalError {
                will_terminate: true,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_exit_before_connect_ends_task() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("control.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let (_cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = oneshot::channel();
        let (ev_tx, _ev_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(serve_connection(
            ChildId(1),
            listener,
            path.clone(),
            cmd_rx,
            exit_rx,
            ev_tx,
        ));

        let (ack, drained) = oneshot::channel();
        exit_tx.send(ack).unwrap();
        // Nothing to drain: the ack is dropped rather than answered
        assert!(tokio::time::timeout(std::time::Duration::from_secs(5), drained)
            .await
            .unwrap()
            .is_err());
        tokio::time::timeout(std::time::Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_remove_socket_tolerates_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gone.sock");
        remove_socket(&path);
        std::fs::write(&path, "").unwrap();
        remove_socket(&path);
        assert!(!path.exists());
    }
}
