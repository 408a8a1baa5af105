//! Outbound WebSocket transport.
//!
//! Owns the duplex session with the server: correlation ids, the
//! pending-request table, and the offline send queue. Frames sent while
//! the connection is closed are queued and flushed in order on
//! reconnection, before any new traffic.

use crate::error::{ClientError, Result};
use futures::{SinkExt, StreamExt};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tether_engine::{ClientFrame, ServerFrame};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::{connect_async, tungstenite::Message};

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connecting,
    Open,
    Closed,
}

struct ConnectionInner {
    url: String,
    status: Mutex<ConnectionStatus>,
    queue: Mutex<VecDeque<ClientFrame>>,
    pending: Mutex<HashMap<u64, oneshot::Sender<ServerFrame>>>,
    next_id: AtomicU64,
    writer: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    events: mpsc::UnboundedSender<ServerFrame>,
}

/// A (re)connectable session with a Tether server.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    /// Create a connection in the `Closed` state. The returned receiver
    /// delivers uncorrelated inbound frames (broadcasts, re-sent query
    /// results, protocol errors) to the consumer's event loop.
    pub fn new(url: impl Into<String>) -> (Self, mpsc::UnboundedReceiver<ServerFrame>) {
        let (events, event_rx) = mpsc::unbounded_channel();
        let connection = Self {
            inner: Arc::new(ConnectionInner {
                url: url.into(),
                status: Mutex::new(ConnectionStatus::Closed),
                queue: Mutex::new(VecDeque::new()),
                pending: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                writer: Mutex::new(None),
                events,
            }),
        };
        (connection, event_rx)
    }

    /// Current lifecycle state.
    pub fn status(&self) -> ConnectionStatus {
        *lock(&self.inner.status)
    }

    /// Issue the next correlation id (monotonically increasing).
    pub fn next_correlation_id(&self) -> u64 {
        self.inner.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Number of frames waiting for the next reconnection.
    pub fn queued_count(&self) -> usize {
        lock(&self.inner.queue).len()
    }

    /// Dial the server, then flush the offline queue in order.
    pub async fn open(&self) -> Result<()> {
        *lock(&self.inner.status) = ConnectionStatus::Connecting;

        let (socket, _response) = connect_async(self.inner.url.as_str()).await.map_err(|error| {
            *lock(&self.inner.status) = ConnectionStatus::Closed;
            ClientError::Transport(error.to_string())
        })?;
        let (mut sink, mut stream) = socket.split();

        let (writer, mut writer_rx) = mpsc::unbounded_channel::<Message>();
        *lock(&self.inner.writer) = Some(writer);
        *lock(&self.inner.status) = ConnectionStatus::Open;

        tokio::spawn(async move {
            while let Some(message) = writer_rx.recv().await {
                if let Err(error) = sink.send(message).await {
                    tracing::warn!(%error, "websocket send failed");
                    break;
                }
            }
        });

        let reader = self.clone();
        tokio::spawn(async move {
            while let Some(message) = stream.next().await {
                match message {
                    Ok(Message::Text(text)) => match serde_json::from_str::<ServerFrame>(&text) {
                        Ok(frame) => reader.dispatch_frame(frame),
                        // protocol error: report, do not disconnect
                        Err(error) => tracing::warn!(%error, "unparseable server frame"),
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(error) => {
                        tracing::warn!(%error, "websocket receive failed");
                        break;
                    }
                }
            }
            reader.mark_closed();
        });

        self.flush_queue();
        Ok(())
    }

    /// Send a frame, or queue it if the connection is not open.
    pub fn send(&self, frame: ClientFrame) {
        if self.status() == ConnectionStatus::Open {
            self.transmit(&frame);
        } else {
            lock(&self.inner.queue).push_back(frame);
        }
    }

    /// Send a correlated frame and await its reply.
    ///
    /// On timeout the pending entry is dropped and the caller decides
    /// what to do; nothing already applied locally is rolled back.
    pub async fn request(
        &self,
        id: u64,
        frame: ClientFrame,
        timeout: Duration,
    ) -> Result<ServerFrame> {
        let (reply_tx, reply_rx) = oneshot::channel();
        lock(&self.inner.pending).insert(id, reply_tx);
        self.send(frame);

        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(frame)) => Ok(frame),
            Ok(Err(_)) => Err(ClientError::Closed),
            Err(_) => {
                lock(&self.inner.pending).remove(&id);
                Err(ClientError::Timeout)
            }
        }
    }

    /// Route an inbound frame: correlated frames resolve their pending
    /// entry; everything else goes to the event channel.
    pub(crate) fn dispatch_frame(&self, frame: ServerFrame) {
        let correlation = match &frame {
            ServerFrame::QueryResult { id, .. } | ServerFrame::MutateAck { id, .. } => Some(*id),
            ServerFrame::Error { id, .. } => *id,
            ServerFrame::Broadcast { .. } | ServerFrame::Pong => None,
        };
        if let Some(id) = correlation {
            if let Some(sender) = lock(&self.inner.pending).remove(&id) {
                let _ = sender.send(frame);
                return;
            }
        }
        let _ = self.inner.events.send(frame);
    }

    fn transmit(&self, frame: &ClientFrame) {
        match serde_json::to_string(frame) {
            Ok(text) => {
                if let Some(writer) = lock(&self.inner.writer).as_ref() {
                    let _ = writer.send(Message::Text(text));
                }
            }
            Err(error) => tracing::error!(%error, "failed to serialize frame"),
        }
    }

    fn flush_queue(&self) {
        loop {
            // re-lock per frame so transmit never runs under the queue lock
            let frame = match lock(&self.inner.queue).pop_front() {
                Some(frame) => frame,
                None => break,
            };
            self.transmit(&frame);
        }
    }

    fn mark_closed(&self) {
        *lock(&self.inner.status) = ConnectionStatus::Closed;
        *lock(&self.inner.writer) = None;
        // pending requests stay registered: they resolve on reply after
        // reconnect or fall to their caller's timeout
    }

    #[cfg(test)]
    fn attach_test_writer(&self) -> mpsc::UnboundedReceiver<Message> {
        let (writer, rx) = mpsc::unbounded_channel();
        *lock(&self.inner.writer) = Some(writer);
        *lock(&self.inner.status) = ConnectionStatus::Open;
        rx
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeMap;
    use tether_engine::{EncodedField, Mutation, Timestamp, WriteMutation};

    fn mutate_frame(connection: &Connection, title: &str, stamp: &str) -> ClientFrame {
        let payload: BTreeMap<_, _> = [(
            "title".to_string(),
            EncodedField::new(json!(title), Timestamp::new(stamp)),
        )]
        .into_iter()
        .collect();
        ClientFrame::Mutate {
            id: connection.next_correlation_id(),
            mutation: Mutation::Update(WriteMutation::new(
                "cards",
                "c1",
                payload,
                Timestamp::new(stamp),
            )),
        }
    }

    #[tokio::test]
    async fn frames_queue_while_closed_and_flush_in_order() {
        let (connection, _events) = Connection::new("ws://unused");
        assert_eq!(connection.status(), ConnectionStatus::Closed);

        connection.send(mutate_frame(&connection, "first", "T1"));
        connection.send(mutate_frame(&connection, "second", "T2"));
        connection.send(mutate_frame(&connection, "third", "T3"));
        assert_eq!(connection.queued_count(), 3);

        let mut outbox = connection.attach_test_writer();
        connection.flush_queue();
        assert_eq!(connection.queued_count(), 0);

        // original order, original client-side timestamps
        for expected in ["T1", "T2", "T3"] {
            let Message::Text(text) = outbox.try_recv().unwrap() else {
                panic!("expected text frame");
            };
            assert!(text.contains(expected));
        }
        assert!(outbox.try_recv().is_err());
    }

    #[tokio::test]
    async fn open_connection_sends_immediately() {
        let (connection, _events) = Connection::new("ws://unused");
        let mut outbox = connection.attach_test_writer();

        connection.send(mutate_frame(&connection, "now", "T9"));
        assert_eq!(connection.queued_count(), 0);
        assert!(outbox.try_recv().is_ok());
    }

    #[tokio::test]
    async fn correlation_ids_increase() {
        let (connection, _events) = Connection::new("ws://unused");
        let a = connection.next_correlation_id();
        let b = connection.next_correlation_id();
        assert!(b > a);
    }

    #[tokio::test]
    async fn dispatch_resolves_pending_and_forwards_the_rest() {
        let (connection, mut events) = Connection::new("ws://unused");
        let _outbox = connection.attach_test_writer();

        let reply = tokio::spawn({
            let connection = connection.clone();
            async move {
                connection
                    .request(
                        42,
                        ClientFrame::Unsubscribe { id: 42 },
                        Duration::from_secs(1),
                    )
                    .await
            }
        });
        tokio::task::yield_now().await;

        connection.dispatch_frame(ServerFrame::MutateAck {
            id: 42,
            accepted: true,
            data: None,
            accepted_values: None,
        });
        assert!(matches!(
            reply.await.unwrap(),
            Ok(ServerFrame::MutateAck { id: 42, .. })
        ));

        // an uncorrelated broadcast lands on the event channel
        connection.dispatch_frame(ServerFrame::Broadcast {
            resource: "cards".to_string(),
            resource_id: Some("c1".to_string()),
            procedure: "UPDATE".to_string(),
            payload: BTreeMap::new(),
            input: None,
            meta: tether_engine::MutationMeta {
                timestamp: Timestamp::new("T1"),
            },
        });
        assert!(matches!(
            events.try_recv(),
            Ok(ServerFrame::Broadcast { .. })
        ));
    }

    #[tokio::test]
    async fn request_times_out_and_clears_pending() {
        let (connection, _events) = Connection::new("ws://unused");
        let _outbox = connection.attach_test_writer();

        let result = connection
            .request(
                7,
                ClientFrame::Unsubscribe { id: 7 },
                Duration::from_millis(20),
            )
            .await;
        assert!(matches!(result, Err(ClientError::Timeout)));

        // a late reply for the abandoned id is forwarded, not lost
        let (connection2, mut events2) = Connection::new("ws://unused");
        connection2.dispatch_frame(ServerFrame::QueryResult {
            id: 7,
            data: BTreeMap::new(),
        });
        assert!(matches!(
            events2.try_recv(),
            Ok(ServerFrame::QueryResult { .. })
        ));
    }
}
