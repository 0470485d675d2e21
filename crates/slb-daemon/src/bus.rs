//! Event bus: in-process broadcast plus the daemon's socket server.
//!
//! Events fan out over a `tokio::sync::broadcast` channel. When the daemon
//! is running it serves the channel over the project's Unix socket as
//! newline-delimited JSON; CLI processes push events to it with a one-line
//! `publish` frame after they mutate the store. Everything here is
//! best-effort — the store is the authority, and watchers without a daemon
//! synthesize the same events by polling.

use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use slb_core::events::RequestEvent;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Default broadcast channel capacity.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Errors from the socket server.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// Binding or accepting on the socket failed.
    #[error("event socket I/O during {context}: {source}")]
    Io {
        /// Operation that failed.
        context: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
}

/// One frame sent by a client after connecting.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum ClientFrame {
    /// Receive all subsequent events as NDJSON.
    Subscribe,
    /// Inject one event into the bus.
    Publish {
        /// The event to broadcast.
        event: RequestEvent,
    },
}

/// Broadcast bus for request events.
///
/// Events can reach the bus twice for the same change — once pushed by the
/// CLI that made it and once synthesized by the daemon's store poller — so
/// `publish` drops an event whose kind matches the last one broadcast for
/// the same request. Per-request lifecycle never legitimately repeats a
/// kind.
#[derive(Debug)]
pub struct EventBus {
    sender: broadcast::Sender<RequestEvent>,
    last_kind: std::sync::Mutex<std::collections::HashMap<String, slb_core::events::EventKind>>,
}

impl EventBus {
    /// Create a bus with the default capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Create a bus with a specific channel capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            last_kind: std::sync::Mutex::new(std::collections::HashMap::new()),
        }
    }

    /// Publish an event to all subscribers. Returns the receiver count.
    ///
    /// A duplicate (same request, same kind as the last broadcast) is
    /// dropped so subscribers see each lifecycle event exactly once.
    pub fn publish(&self, event: RequestEvent) -> usize {
        let receivers = self.sender.receiver_count();
        {
            let mut last = self
                .last_kind
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if last.get(&event.request_id) == Some(&event.event) {
                debug!(event = %event.event, request_id = %event.request_id, "duplicate event dropped");
                return receivers;
            }
            last.insert(event.request_id.clone(), event.event);
        }
        debug!(event = %event.event, request_id = %event.request_id, receivers, "publishing event");
        // Send only fails when there are no receivers; that is fine.
        let _ = self.sender.send(event);
        receivers
    }

    /// Subscribe to all events published after this call.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<RequestEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Serve the bus on a Unix socket until the future is dropped.
///
/// A stale socket file is replaced; the new one is restricted to mode 0600.
/// Each connection sends one frame: `subscribe` turns it into an NDJSON
/// event stream, `publish` injects an event and closes.
pub async fn serve(socket_path: &Path, bus: Arc<EventBus>) -> Result<(), BusError> {
    if socket_path.exists() {
        std::fs::remove_file(socket_path)
            .map_err(|e| io_err("remove stale socket", e))?;
    }
    let listener = UnixListener::bind(socket_path).map_err(|e| io_err("bind socket", e))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(0o600))
            .map_err(|e| io_err("restrict socket permissions", e))?;
    }
    info!(socket = %socket_path.display(), "event bus listening");

    loop {
        match listener.accept().await {
            Ok((stream, _addr)) => {
                let bus = Arc::clone(&bus);
                tokio::spawn(async move {
                    if let Err(err) = handle_connection(stream, bus).await {
                        debug!(%err, "bus connection ended with error");
                    }
                });
            }
            Err(err) => {
                warn!(%err, "failed to accept bus connection");
            }
        }
    }
}

async fn handle_connection(stream: UnixStream, bus: Arc<EventBus>) -> std::io::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    let Some(line) = lines.next_line().await? else {
        return Ok(());
    };
    let frame: ClientFrame = match serde_json::from_str(&line) {
        Ok(frame) => frame,
        Err(err) => {
            debug!(%err, "ignoring malformed bus frame");
            return Ok(());
        }
    };

    match frame {
        ClientFrame::Publish { event } => {
            bus.publish(event);
            Ok(())
        }
        ClientFrame::Subscribe => {
            let mut receiver = bus.subscribe();
            loop {
                match receiver.recv().await {
                    Ok(event) => {
                        let mut payload = serde_json::to_vec(&event)?;
                        payload.push(b'\n');
                        writer.write_all(&payload).await?;
                        writer.flush().await?;
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "subscriber lagged; events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => return Ok(()),
                }
            }
        }
    }
}

fn io_err(context: &str, source: std::io::Error) -> BusError {
    BusError::Io {
        context: context.to_string(),
        source,
    }
}

/// Whether a daemon is currently serving the project socket.
#[must_use]
pub fn daemon_running(socket_path: &Path) -> bool {
    std::os::unix::net::UnixStream::connect(socket_path).is_ok()
}

/// Push one event to a running daemon, best-effort.
///
/// Callers mutate the store first; the daemon socket is only a delivery
/// optimization, so connection failures are logged and swallowed.
pub fn publish_to_daemon(socket_path: &Path, event: &RequestEvent) {
    use std::io::Write;

    let mut stream = match std::os::unix::net::UnixStream::connect(socket_path) {
        Ok(stream) => stream,
        Err(err) => {
            debug!(%err, "no daemon to publish to");
            return;
        }
    };
    let frame = serde_json::json!({ "op": "publish", "event": event });
    if let Err(err) = writeln!(stream, "{frame}") {
        debug!(%err, "could not publish event to daemon");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slb_core::events::EventKind;

    #[tokio::test]
    async fn test_publish_reaches_subscriber() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish(RequestEvent::status_change(EventKind::RequestApproved, "req-1"));
        let event = rx.recv().await.unwrap();
        assert_eq!(event.event, EventKind::RequestApproved);
        assert_eq!(event.request_id, "req-1");
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_fine() {
        let bus = EventBus::new();
        assert_eq!(
            bus.publish(RequestEvent::status_change(EventKind::RequestPending, "req-1")),
            0
        );
    }

    #[tokio::test]
    async fn test_duplicate_events_are_dropped() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish(RequestEvent::status_change(EventKind::RequestPending, "req-1"));
        bus.publish(RequestEvent::status_change(EventKind::RequestPending, "req-1"));
        bus.publish(RequestEvent::status_change(EventKind::RequestApproved, "req-1"));

        assert_eq!(rx.recv().await.unwrap().event, EventKind::RequestPending);
        assert_eq!(rx.recv().await.unwrap().event, EventKind::RequestApproved);
        assert!(rx.try_recv().is_err(), "duplicate pending must not be delivered");
    }

    #[tokio::test]
    async fn test_socket_subscribe_and_publish() {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("socket");
        let bus = Arc::new(EventBus::new());

        let server = tokio::spawn({
            let bus = Arc::clone(&bus);
            let socket_path = socket_path.clone();
            async move { serve(&socket_path, bus).await }
        });

        // Wait for the socket to come up.
        for _ in 0..50 {
            if socket_path.exists() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        // Subscribe over the socket.
        let sub = UnixStream::connect(&socket_path).await.unwrap();
        let (reader, mut writer) = sub.into_split();
        writer.write_all(b"{\"op\":\"subscribe\"}\n").await.unwrap();
        writer.flush().await.unwrap();
        let mut lines = BufReader::new(reader).lines();

        // Give the server a beat to register the subscription.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        // Publish over a second connection.
        let mut publisher = UnixStream::connect(&socket_path).await.unwrap();
        let frame = serde_json::json!({
            "op": "publish",
            "event": { "event": "request_pending", "request_id": "req-42" },
        });
        publisher
            .write_all(format!("{frame}\n").as_bytes())
            .await
            .unwrap();
        publisher.flush().await.unwrap();

        let line = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            lines.next_line(),
        )
        .await
        .unwrap()
        .unwrap()
        .unwrap();
        let event: RequestEvent = serde_json::from_str(&line).unwrap();
        assert_eq!(event.event, EventKind::RequestPending);
        assert_eq!(event.request_id, "req-42");

        server.abort();
    }

    #[test]
    fn test_daemon_running_without_socket() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!daemon_running(&dir.path().join("socket")));
    }
}
