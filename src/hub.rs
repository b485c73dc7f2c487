//! Registry of live-reload push connections.
//!
//! The hub owns every open WebSocket sink behind a single async mutex. Registration,
//! removal and broadcast all take that lock, so a broadcast always sees a consistent
//! snapshot of the registry.

use std::collections::HashMap;
use std::fmt::Display;
use std::sync::atomic::{AtomicU64, Ordering};

use axum::extract::ws::{Message, WebSocket};
use futures_util::{sink::SinkExt, stream::SplitSink, Sink};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Write half of an upgraded live-reload WebSocket.
pub type WsSink = SplitSink<WebSocket, Message>;

/// Identifies one registered connection. Never reused within a hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

/// Fans text messages out to every registered connection.
pub struct BroadcastHub<S = WsSink> {
    connections: Mutex<HashMap<ConnectionId, S>>,
    next_id: AtomicU64,
}

impl<S> Default for BroadcastHub<S> {
    fn default() -> Self {
        Self {
            connections: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }
}

impl<S> BroadcastHub<S>
where
    S: Sink<Message> + Unpin + Send,
    S::Error: Display,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a connection and returns the id to unregister it with.
    pub async fn register(&self, sink: S) -> ConnectionId {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut connections = self.connections.lock().await;
        connections.insert(id, sink);
        debug!(
            connection = id.0,
            total = connections.len(),
            "Registered live-reload connection"
        );
        id
    }

    /// Removes and closes a connection. Returns `false` if it was already gone.
    pub async fn unregister(&self, id: ConnectionId) -> bool {
        let removed = self.connections.lock().await.remove(&id);
        match removed {
            Some(mut sink) => {
                // The peer is usually gone already.
                let _ = sink.close().await;
                debug!(connection = id.0, "Unregistered live-reload connection");
                true
            }
            None => false,
        }
    }

    /// Sends `message` to every registered connection as a text frame.
    ///
    /// Connections whose write fails are dropped from the registry after the pass and
    /// closed once the lock is released. A failed write never stops delivery to the
    /// other connections.
    ///
    /// # Arguments
    /// * `message` - The text pushed to every page, normally `refresh`.
    ///
    /// # Returns
    /// The number of connections the message was written to.
    pub async fn broadcast(&self, message: &str) -> usize {
        debug!(msg = message, "Broadcasting");
        let mut connections = self.connections.lock().await;

        let mut delivered = 0;
        let mut failed = Vec::new();
        for (id, sink) in connections.iter_mut() {
            match sink.send(Message::Text(message.to_string())).await {
                Ok(()) => delivered += 1,
                Err(e) => {
                    warn!(connection = id.0, error = %e, "WebSocket send error");
                    failed.push(*id);
                }
            }
        }

        let dropped: Vec<S> = failed
            .iter()
            .filter_map(|id| connections.remove(id))
            .collect();
        let remaining = connections.len();
        drop(connections);

        for mut sink in dropped {
            let _ = sink.close().await;
        }

        info!(
            msg = message,
            delivered,
            dropped = failed.len(),
            remaining,
            "Broadcast finished"
        );
        delivered
    }

    /// Number of registered connections.
    pub async fn len(&self) -> usize {
        self.connections.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.connections.lock().await.is_empty()
    }
}
