//! One accepted controller connection, as seen by the application layer.
//!
//! A [`ConnectionSession`] owns the sending half of a bounded frame queue.
//! The WebSocket writer task in the infrastructure layer drains the other
//! half.  Nothing here touches the socket, which keeps the dispatcher and the
//! hub testable without a network.
//!
//! Two ways to queue a frame:
//!
//! - [`send`](ConnectionSession::send) awaits queue space.  Used for direct
//!   responses on the connection's own reader task.
//! - [`try_deliver`](ConnectionSession::try_deliver) never waits.  Used for
//!   broadcasts, where one slow connection must not stall the others; a full
//!   queue closes the session instead.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use thiserror::Error;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, warn};

use ucapi_core::protocol::SequenceCounter;
use ucapi_core::{AssistantEvent, OutboundMessage};

use crate::domain::ConnectionId;

/// A serialized text frame, shared between all recipients of a broadcast.
pub type Frame = Arc<str>;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("connection is closed")]
    Closed,
    #[error("outbound queue is full")]
    Lagging,
}

#[derive(Debug)]
pub struct ConnectionSession {
    id: ConnectionId,
    peer: SocketAddr,
    subscribed: AtomicBool,
    closed: AtomicBool,
    close_signal: Notify,
    frames: SequenceCounter,
    outbound: mpsc::Sender<Frame>,
    /// Voice session id → entity, recorded by `voice_start` commands.
    voice_entities: Mutex<HashMap<u32, String>>,
}

impl ConnectionSession {
    /// Creates a session and the receiver its writer task drains.
    pub fn new(peer: SocketAddr, queue_capacity: usize) -> (Arc<Self>, mpsc::Receiver<Frame>) {
        let (outbound, rx) = mpsc::channel(queue_capacity.max(1));
        let session = Arc::new(Self {
            id: ConnectionId::new(),
            peer,
            subscribed: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            close_signal: Notify::new(),
            frames: SequenceCounter::new(),
            outbound,
            voice_entities: Mutex::new(HashMap::new()),
        });
        (session, rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscribed.load(Ordering::Acquire)
    }

    pub fn set_subscribed(&self, subscribed: bool) {
        self.subscribed.store(subscribed, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Number of frames queued on this connection so far.
    pub fn frames_sent(&self) -> u64 {
        self.frames.current()
    }

    /// Marks the session closed and wakes its reader task.  Idempotent.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!("connection {}: closing", self.id);
            // `notify_one` stores a permit, so a reader that starts waiting
            // after this call still wakes up.
            self.close_signal.notify_one();
        }
    }

    /// Resolves once [`close`](Self::close) has been called.
    pub async fn closed(&self) {
        if self.is_closed() {
            return;
        }
        self.close_signal.notified().await;
    }

    /// Remembers which entity the controller started voice session
    /// `session_id` for.
    pub fn bind_voice_entity(&self, session_id: u32, entity_id: &str) {
        self.voice_entities
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(session_id, entity_id.to_string());
    }

    pub fn unbind_voice_entity(&self, session_id: u32) {
        self.voice_entities
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&session_id);
    }

    /// The entity bound to `session_id`, removing the binding.
    pub fn take_voice_entity(&self, session_id: u32) -> Option<String> {
        self.voice_entities
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&session_id)
    }

    /// Sends an `assistant_event` to this connection only.
    ///
    /// # Errors
    ///
    /// [`DeliveryError::Closed`] if the connection is gone.
    pub async fn send_assistant_event(&self, event: &AssistantEvent) -> Result<(), DeliveryError> {
        self.send(&event.to_message()).await
    }

    /// Serializes and queues one frame, waiting for queue space.
    ///
    /// # Errors
    ///
    /// [`DeliveryError::Closed`] if the session is closed or its writer is gone.
    pub async fn send(&self, message: &OutboundMessage) -> Result<(), DeliveryError> {
        let frame = self.serialize(message)?;
        if self.is_closed() {
            return Err(DeliveryError::Closed);
        }
        self.outbound
            .send(frame)
            .await
            .map_err(|_| DeliveryError::Closed)?;
        self.log_queued(message);
        Ok(())
    }

    /// Queues an already serialized frame without waiting.
    ///
    /// A full queue means the peer is not reading; the session is closed and
    /// [`DeliveryError::Lagging`] returned.
    ///
    /// # Errors
    ///
    /// [`DeliveryError::Closed`] or [`DeliveryError::Lagging`].
    pub fn try_deliver(&self, frame: Frame) -> Result<(), DeliveryError> {
        if self.is_closed() {
            return Err(DeliveryError::Closed);
        }
        match self.outbound.try_send(frame) {
            Ok(()) => {
                let seq = self.frames.next();
                debug!("connection {}: queued broadcast frame #{seq}", self.id);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(
                    "connection {} ({}): outbound queue full, dropping connection",
                    self.id, self.peer
                );
                self.close();
                Err(DeliveryError::Lagging)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.close();
                Err(DeliveryError::Closed)
            }
        }
    }

    fn serialize(&self, message: &OutboundMessage) -> Result<Frame, DeliveryError> {
        message.to_json().map(Frame::from).map_err(|e| {
            // Payload types only produce string keys, so this is a bug in the caller.
            warn!("connection {}: dropping unserializable frame: {e}", self.id);
            DeliveryError::Closed
        })
    }

    fn log_queued(&self, message: &OutboundMessage) {
        let seq = self.frames.next();
        debug!(
            "connection {}: queued frame #{seq} {}",
            self.id,
            message.redacted()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use ucapi_core::protocol::messages::names;
    use ucapi_core::StatusCode;

    fn peer() -> SocketAddr {
        "127.0.0.1:5000".parse().unwrap()
    }

    #[tokio::test]
    async fn test_send_queues_serialized_frame() {
        // Arrange
        let (session, mut rx) = ConnectionSession::new(peer(), 4);
        let message = OutboundMessage::response(1, StatusCode::Ok, names::RESULT, json!({}));

        // Act
        session.send(&message).await.unwrap();

        // Assert
        let frame = rx.recv().await.unwrap();
        let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["req_id"], 1);
        assert_eq!(session.frames_sent(), 1);
    }

    #[test]
    fn test_try_deliver_on_full_queue_closes_session() {
        // Arrange: capacity of one
        let (session, _rx) = ConnectionSession::new(peer(), 1);
        session.try_deliver(Frame::from("a")).unwrap();

        // Act
        let result = session.try_deliver(Frame::from("b"));

        // Assert
        assert_eq!(result, Err(DeliveryError::Lagging));
        assert!(session.is_closed());
    }

    #[test]
    fn test_try_deliver_after_receiver_dropped_is_closed() {
        let (session, rx) = ConnectionSession::new(peer(), 4);
        drop(rx);
        assert_eq!(
            session.try_deliver(Frame::from("x")),
            Err(DeliveryError::Closed)
        );
    }

    #[tokio::test]
    async fn test_closed_resolves_even_if_close_came_first() {
        let (session, _rx) = ConnectionSession::new(peer(), 4);
        session.close();
        tokio::time::timeout(std::time::Duration::from_secs(1), session.closed())
            .await
            .expect("closed() must resolve");
    }

    #[tokio::test]
    async fn test_assistant_event_is_queued_on_this_connection() {
        // Arrange
        let (session, mut rx) = ConnectionSession::new(peer(), 4);
        let event = AssistantEvent::ready("voice", 3);

        // Act
        session.send_assistant_event(&event).await.unwrap();

        // Assert
        let value: serde_json::Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(value["msg"], "assistant_event");
        assert_eq!(value["msg_data"]["type"], "ready");
        assert_eq!(value["msg_data"]["session_id"], 3);
    }

    #[test]
    fn test_voice_entity_binding_is_taken_once() {
        let (session, _rx) = ConnectionSession::new(peer(), 4);
        session.bind_voice_entity(7, "voice");

        assert_eq!(session.take_voice_entity(7).as_deref(), Some("voice"));
        assert_eq!(session.take_voice_entity(7), None);
    }

    #[test]
    fn test_subscription_flag_toggles() {
        let (session, _rx) = ConnectionSession::new(peer(), 4);
        assert!(!session.is_subscribed());
        session.set_subscribed(true);
        assert!(session.is_subscribed());
    }
}
