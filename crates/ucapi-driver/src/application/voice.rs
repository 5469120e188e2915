//! Voice session multiplexer.
//!
//! Each connection owns one [`VoiceMultiplexer`].  It keys sessions by the
//! controller-assigned id and routes binary frames:
//!
//! ```text
//!   NONE ──begin──▶ ACTIVE ──data──▶ ACTIVE ──end / connection loss──▶ NONE
//! ```
//!
//! `begin` on an active id fails with [`VoiceError::InvalidSession`]; `data`
//! or `end` on an id that is not active fails with
//! [`VoiceError::UnknownSession`].  An ended id can be begun again.
//!
//! Audio reaches driver code as a [`VoiceStream`]: a lazy `Stream` of byte
//! chunks backed by a bounded queue.  When the driver falls behind and the
//! queue is full, the newest chunk is dropped.  Chunks of one session are
//! yielded in arrival order and never mix with another session's chunks.
//!
//! A [`VoiceSession`] can answer the connection that started it with
//! assistant events; nothing it sends reaches other connections.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, OnceLock};
use std::task::{Context, Poll};

use futures_util::Stream;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use ucapi_core::{
    decode_voice_frame, AssistantEvent, AudioConfiguration, ProtocolError, VoiceFrame,
};

use super::callbacks::VoiceHandler;
use super::session::{ConnectionSession, DeliveryError};
use crate::domain::ConnectionId;

/// Log one in this many dropped chunks.
const DROP_LOG_INTERVAL: u64 = 50;

#[derive(Debug, Error, PartialEq)]
pub enum VoiceError {
    #[error("voice session {0} is already active")]
    InvalidSession(u32),

    #[error("voice session {0} is not active")]
    UnknownSession(u32),

    #[error("no voice handler installed")]
    NoHandler,

    #[error("invalid voice frame: {0}")]
    Frame(#[from] ProtocolError),
}

/// Why a voice stream ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoiceEndReason {
    /// The controller sent an `end` frame.
    Normal,
    /// The connection dropped mid-session.
    Remote,
}

/// Per-session counters, returned when a session ends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VoiceStats {
    pub chunks: u64,
    pub bytes: u64,
    pub dropped: u64,
}

// ── Stream handed to driver code ──────────────────────────────────────────────

/// Audio chunks of one voice session, in arrival order.
///
/// Yields `None` once the session has ended; [`end_reason`](Self::end_reason)
/// then tells why.
#[derive(Debug)]
pub struct VoiceStream {
    rx: mpsc::Receiver<Vec<u8>>,
    end: Arc<OnceLock<VoiceEndReason>>,
}

impl VoiceStream {
    pub fn end_reason(&self) -> Option<VoiceEndReason> {
        self.end.get().copied()
    }
}

impl Stream for VoiceStream {
    type Item = Vec<u8>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// Everything a [`VoiceHandler`] gets for one session.
#[derive(Debug)]
pub struct VoiceSession {
    pub session_id: u32,
    /// Entity named by the `voice_start` command that announced this
    /// session, if there was one.
    pub entity_id: Option<String>,
    pub config: AudioConfiguration,
    pub audio: VoiceStream,
    connection: Arc<ConnectionSession>,
}

impl VoiceSession {
    pub fn connection_id(&self) -> ConnectionId {
        self.connection.id()
    }

    /// Sends `event` to the connection that started this session.
    ///
    /// # Errors
    ///
    /// [`DeliveryError::Closed`] once that connection is gone.
    pub async fn send_event(&self, event: &AssistantEvent) -> Result<(), DeliveryError> {
        self.connection.send_assistant_event(event).await
    }
}

// ── Multiplexer ───────────────────────────────────────────────────────────────

struct ActiveVoice {
    tx: mpsc::Sender<Vec<u8>>,
    end: Arc<OnceLock<VoiceEndReason>>,
    stats: VoiceStats,
}

pub struct VoiceMultiplexer {
    connection: Arc<ConnectionSession>,
    capacity: usize,
    handler: Option<Arc<dyn VoiceHandler>>,
    sessions: HashMap<u32, ActiveVoice>,
}

impl VoiceMultiplexer {
    pub fn new(
        connection: Arc<ConnectionSession>,
        handler: Option<Arc<dyn VoiceHandler>>,
        capacity: usize,
    ) -> Self {
        Self {
            connection,
            capacity: capacity.max(1),
            handler,
            sessions: HashMap::new(),
        }
    }

    pub fn is_active(&self, session_id: u32) -> bool {
        self.sessions.contains_key(&session_id)
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }

    /// Decodes one binary WebSocket message and routes it.
    ///
    /// # Errors
    ///
    /// [`VoiceError::Frame`] for undecodable bytes, otherwise see
    /// [`handle_frame`](Self::handle_frame).
    pub fn handle_binary(&mut self, bytes: &[u8]) -> Result<(), VoiceError> {
        let (frame, consumed) = decode_voice_frame(bytes)?;
        if consumed != bytes.len() {
            debug!(
                "connection {}: {} trailing byte(s) after voice frame ignored",
                self.connection.id(),
                bytes.len() - consumed
            );
        }
        self.handle_frame(frame)
    }

    /// Routes a decoded frame.  `Begin` spawns the installed
    /// [`VoiceHandler`] on its own task.
    ///
    /// # Errors
    ///
    /// [`VoiceError::NoHandler`], [`VoiceError::InvalidSession`] or
    /// [`VoiceError::UnknownSession`].
    pub fn handle_frame(&mut self, frame: VoiceFrame) -> Result<(), VoiceError> {
        match frame {
            VoiceFrame::Begin { session_id, config } => {
                let handler = self.handler.clone().ok_or(VoiceError::NoHandler)?;
                let session = self.open(session_id, config)?;
                tokio::spawn(async move {
                    handler.handle_voice(session).await;
                });
                Ok(())
            }
            VoiceFrame::Data {
                session_id,
                samples,
            } => self.push(session_id, samples),
            VoiceFrame::End { session_id } => self.end(session_id).map(|_| ()),
        }
    }

    /// Opens a session and returns it without spawning a handler.
    ///
    /// # Errors
    ///
    /// [`VoiceError::InvalidSession`] if `session_id` is already active.
    pub fn open(
        &mut self,
        session_id: u32,
        config: AudioConfiguration,
    ) -> Result<VoiceSession, VoiceError> {
        if self.sessions.contains_key(&session_id) {
            return Err(VoiceError::InvalidSession(session_id));
        }

        let entity_id = self.connection.take_voice_entity(session_id);
        let (tx, rx) = mpsc::channel(self.capacity);
        let end = Arc::new(OnceLock::new());
        self.sessions.insert(
            session_id,
            ActiveVoice {
                tx,
                end: Arc::clone(&end),
                stats: VoiceStats::default(),
            },
        );
        info!(
            "connection {}: voice session {session_id} started for {} ({} ch, {} Hz, {:?})",
            self.connection.id(),
            entity_id.as_deref().unwrap_or("an unannounced entity"),
            config.channels,
            config.sample_rate,
            config.sample_format
        );

        Ok(VoiceSession {
            session_id,
            entity_id,
            config,
            audio: VoiceStream { rx, end },
            connection: Arc::clone(&self.connection),
        })
    }

    /// Queues one chunk for an active session.  A full queue drops the chunk.
    ///
    /// # Errors
    ///
    /// [`VoiceError::UnknownSession`] if `session_id` is not active.
    pub fn push(&mut self, session_id: u32, chunk: Vec<u8>) -> Result<(), VoiceError> {
        let connection = self.connection.id();
        let active = self
            .sessions
            .get_mut(&session_id)
            .ok_or(VoiceError::UnknownSession(session_id))?;

        let len = chunk.len() as u64;
        match active.tx.try_send(chunk) {
            Ok(()) => {
                active.stats.chunks += 1;
                active.stats.bytes += len;
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                active.stats.dropped += 1;
                if active.stats.dropped == 1 || active.stats.dropped % DROP_LOG_INTERVAL == 0 {
                    debug!(
                        "connection {connection}: voice session {session_id} consumer behind, {} chunk(s) dropped",
                        active.stats.dropped
                    );
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                // The handler stopped reading; keep accepting frames until `end`.
                active.stats.dropped += 1;
            }
        }
        Ok(())
    }

    /// Ends a session normally.  The stream yields its queued chunks and
    /// then `None`.
    ///
    /// # Errors
    ///
    /// [`VoiceError::UnknownSession`] if `session_id` is not active.
    pub fn end(&mut self, session_id: u32) -> Result<VoiceStats, VoiceError> {
        let active = self
            .sessions
            .remove(&session_id)
            .ok_or(VoiceError::UnknownSession(session_id))?;
        Ok(self.finish(session_id, active, VoiceEndReason::Normal))
    }

    /// Ends every session with [`VoiceEndReason::Remote`].  Called when the
    /// connection goes away.
    pub fn close_all(&mut self) {
        let sessions: Vec<_> = self.sessions.drain().collect();
        for (session_id, active) in sessions {
            self.finish(session_id, active, VoiceEndReason::Remote);
        }
    }

    fn finish(&self, session_id: u32, active: ActiveVoice, reason: VoiceEndReason) -> VoiceStats {
        // Record the reason before the sender drops, so a consumer that sees
        // the end of the stream can always read it.
        let _ = active.end.set(reason);
        let stats = active.stats;
        drop(active.tx);

        if reason == VoiceEndReason::Normal {
            info!(
                "connection {}: voice session {session_id} ended ({} chunk(s), {} byte(s), {} dropped)",
                self.connection.id(),
                stats.chunks,
                stats.bytes,
                stats.dropped
            );
        } else {
            warn!(
                "connection {}: voice session {session_id} cut off ({reason:?})",
                self.connection.id()
            );
        }
        stats
    }
}

impl Drop for VoiceMultiplexer {
    fn drop(&mut self) {
        self.close_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use futures_util::StreamExt;
    use tokio_test::{assert_pending, assert_ready_eq, task};
    use ucapi_core::encode_voice_frame;

    use crate::application::session::Frame;

    fn connection() -> (Arc<ConnectionSession>, mpsc::Receiver<Frame>) {
        ConnectionSession::new("127.0.0.1:6000".parse().unwrap(), 8)
    }

    fn mux(capacity: usize) -> VoiceMultiplexer {
        VoiceMultiplexer::new(connection().0, None, capacity)
    }

    #[tokio::test]
    async fn test_begin_data_end_yields_chunks_in_order() {
        // Arrange
        let mut mux = mux(8);
        let mut session = mux.open(7, AudioConfiguration::default()).unwrap();

        // Act
        mux.push(7, vec![1, 2]).unwrap();
        mux.push(7, vec![3]).unwrap();
        let stats = mux.end(7).unwrap();

        // Assert
        let chunks: Vec<Vec<u8>> = (&mut session.audio).collect().await;
        assert_eq!(chunks, vec![vec![1, 2], vec![3]]);
        assert_eq!(session.audio.end_reason(), Some(VoiceEndReason::Normal));
        assert_eq!(stats.chunks, 2);
        assert_eq!(stats.bytes, 3);
    }

    #[test]
    fn test_data_after_end_is_unknown_session() {
        let mut mux = mux(8);
        let _session = mux.open(7, AudioConfiguration::default()).unwrap();
        mux.end(7).unwrap();

        assert_eq!(mux.push(7, vec![0]), Err(VoiceError::UnknownSession(7)));
        assert_eq!(mux.end(7), Err(VoiceError::UnknownSession(7)));
    }

    #[test]
    fn test_data_for_never_begun_session_is_unknown() {
        let mut mux = mux(8);
        assert_eq!(mux.push(3, vec![0]), Err(VoiceError::UnknownSession(3)));
    }

    #[test]
    fn test_begin_on_active_session_is_invalid() {
        let mut mux = mux(8);
        let _session = mux.open(1, AudioConfiguration::default()).unwrap();
        assert!(matches!(
            mux.open(1, AudioConfiguration::default()),
            Err(VoiceError::InvalidSession(1))
        ));
        assert_eq!(mux.active_sessions(), 1);
    }

    #[test]
    fn test_ended_session_id_can_begin_again() {
        let mut mux = mux(8);
        let _first = mux.open(4, AudioConfiguration::default()).unwrap();
        mux.end(4).unwrap();
        assert!(mux.open(4, AudioConfiguration::default()).is_ok());
    }

    #[tokio::test]
    async fn test_interleaved_sessions_never_cross() {
        // Arrange
        let mut mux = mux(8);
        let mut one = mux.open(1, AudioConfiguration::default()).unwrap();
        let mut two = mux.open(2, AudioConfiguration::default()).unwrap();

        // Act: alternate chunks between the two sessions
        mux.push(1, vec![0x11]).unwrap();
        mux.push(2, vec![0x21]).unwrap();
        mux.push(1, vec![0x12]).unwrap();
        mux.push(2, vec![0x22]).unwrap();
        mux.end(1).unwrap();
        mux.end(2).unwrap();

        // Assert
        let from_one: Vec<Vec<u8>> = (&mut one.audio).collect().await;
        let from_two: Vec<Vec<u8>> = (&mut two.audio).collect().await;
        assert_eq!(from_one, vec![vec![0x11], vec![0x12]]);
        assert_eq!(from_two, vec![vec![0x21], vec![0x22]]);
    }

    #[test]
    fn test_stream_is_lazy_until_chunk_arrives() {
        // Arrange
        let mut mux = mux(8);
        let mut session = mux.open(9, AudioConfiguration::default()).unwrap();
        let mut next = task::spawn(session.audio.next());

        // Assert: nothing to yield yet
        assert_pending!(next.poll());

        // Act
        mux.push(9, vec![42]).unwrap();

        // Assert
        assert!(next.is_woken());
        assert_ready_eq!(next.poll(), Some(vec![42]));
    }

    #[tokio::test]
    async fn test_full_queue_drops_newest_chunk() {
        // Arrange: room for two chunks
        let mut mux = mux(2);
        let mut session = mux.open(5, AudioConfiguration::default()).unwrap();

        // Act
        for byte in 0..4u8 {
            mux.push(5, vec![byte]).unwrap();
        }
        let stats = mux.end(5).unwrap();

        // Assert: the oldest chunks survive
        let chunks: Vec<Vec<u8>> = (&mut session.audio).collect().await;
        assert_eq!(chunks, vec![vec![0], vec![1]]);
        assert_eq!(stats.dropped, 2);
    }

    #[tokio::test]
    async fn test_close_all_marks_streams_remote() {
        let mut mux = mux(8);
        let mut session = mux.open(1, AudioConfiguration::default()).unwrap();
        mux.push(1, vec![7]).unwrap();

        mux.close_all();

        assert_eq!(session.audio.next().await, Some(vec![7]));
        assert_eq!(session.audio.next().await, None);
        assert_eq!(session.audio.end_reason(), Some(VoiceEndReason::Remote));
        assert_eq!(mux.active_sessions(), 0);
    }

    #[test]
    fn test_begin_without_handler_is_rejected() {
        let mut mux = mux(8);
        let frame = VoiceFrame::Begin {
            session_id: 1,
            config: AudioConfiguration::default(),
        };
        assert_eq!(mux.handle_frame(frame), Err(VoiceError::NoHandler));
        assert!(!mux.is_active(1));
    }

    #[test]
    fn test_garbage_bytes_are_frame_errors() {
        let mut mux = mux(8);
        assert!(matches!(
            mux.handle_binary(&[0xFF, 0x00]),
            Err(VoiceError::Frame(_))
        ));
    }

    /// Forwards every session it is handed to the test body.
    struct ForwardingHandler(mpsc::UnboundedSender<VoiceSession>);

    #[async_trait]
    impl VoiceHandler for ForwardingHandler {
        async fn handle_voice(&self, session: VoiceSession) {
            let _ = self.0.send(session);
        }
    }

    #[tokio::test]
    async fn test_binary_begin_spawns_handler_with_configuration() {
        // Arrange
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut mux = VoiceMultiplexer::new(
            connection().0,
            Some(Arc::new(ForwardingHandler(tx))),
            8,
        );
        let config = AudioConfiguration {
            channels: 2,
            sample_rate: 48_000,
            ..AudioConfiguration::default()
        };
        let begin = encode_voice_frame(&VoiceFrame::Begin {
            session_id: 3,
            config,
        })
        .unwrap();
        let data = encode_voice_frame(&VoiceFrame::Data {
            session_id: 3,
            samples: vec![1, 2, 3],
        })
        .unwrap();

        // Act
        mux.handle_binary(&begin).unwrap();
        mux.handle_binary(&data).unwrap();
        let mut session = rx.recv().await.unwrap();

        // Assert
        assert_eq!(session.session_id, 3);
        assert_eq!(session.config, config);
        assert_eq!(session.audio.next().await, Some(vec![1, 2, 3]));
    }

    #[tokio::test]
    async fn test_session_events_go_to_the_starting_connection_only() {
        // Arrange
        let (origin, mut origin_rx) = connection();
        let (_other, mut other_rx) = connection();
        origin.bind_voice_entity(4, "assistant");
        let mut mux = VoiceMultiplexer::new(Arc::clone(&origin), None, 8);
        let session = mux.open(4, AudioConfiguration::default()).unwrap();

        // Act
        let event = AssistantEvent::stt_response("assistant", 4, "lights on");
        session.send_event(&event).await.unwrap();

        // Assert
        assert_eq!(session.entity_id.as_deref(), Some("assistant"));
        assert_eq!(session.connection_id(), origin.id());
        let frame: serde_json::Value =
            serde_json::from_str(&origin_rx.recv().await.unwrap()).unwrap();
        assert_eq!(frame["msg"], "assistant_event");
        assert_eq!(frame["msg_data"]["data"]["text"], "lights on");
        assert!(other_rx.try_recv().is_err());
    }

    #[test]
    fn test_session_without_voice_start_has_no_entity() {
        let mut mux = mux(8);
        let session = mux.open(2, AudioConfiguration::default()).unwrap();
        assert_eq!(session.entity_id, None);
    }
}
