//! WebSocket server: accept loop and per-connection tasks.
//!
//! This module is responsible for:
//!
//! 1. Binding a TCP listener on the configured address.
//! 2. Announcing the driver through the installed [`ServicePublisher`].
//! 3. Accepting controller connections and upgrading them to WebSocket.
//! 4. Running one socket reader, one writer and one processing loop per
//!    connection:
//!    - **Reader**: forwards data messages and notices the socket closing.
//!    - **Processing**: text frames go to the engine's dispatcher, binary
//!      frames to the connection's voice multiplexer.
//!    - **Writer**: drains the session's outbound queue into the socket.
//! 5. Stopping the accept loop when the `running` flag is cleared.
//!
//! Each connection runs in its own Tokio task; the accept loop never waits
//! on a connection.  The engine decides when a session is over (for example
//! when its outbound queue overflowed) by closing it, which ends the reader.

use std::net::SocketAddr;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use anyhow::Context;
use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::{
    accept_async,
    tungstenite::{Error as WsError, Message as WsMessage},
    WebSocketStream,
};
use tracing::{debug, error, info, warn};

use crate::application::IntegrationEngine;
use crate::domain::{ConnectionId, DriverConfig};
use crate::infrastructure::discovery::{ServiceAnnouncement, ServicePublisher};

const ACCEPT_POLL: Duration = Duration::from_millis(200);

// ── Public API ────────────────────────────────────────────────────────────────

/// Binds `config.bind_addr`, announces the driver, and serves controller
/// connections until `running` is set to `false`.
///
/// The announcement is skipped when `config.disable_publish` is set.  A
/// publisher error is logged and the server keeps running.
///
/// # Errors
///
/// Returns an error if the TCP listener cannot be bound.
pub async fn run_server(
    engine: Arc<IntegrationEngine>,
    config: &DriverConfig,
    publisher: &dyn ServicePublisher,
    running: Arc<AtomicBool>,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind WebSocket listener on {}", config.bind_addr))?;
    let local_addr = listener
        .local_addr()
        .context("failed to read the listener address")?;

    info!(
        "driver '{}' listening on {local_addr}, reachable at {}",
        engine.metadata().driver_id,
        config.websocket_url(local_addr)
    );

    let published = if config.disable_publish {
        info!("service announcement disabled");
        false
    } else {
        let announcement = ServiceAnnouncement::for_driver(
            engine.metadata(),
            local_addr,
            config.driver_url.as_deref(),
        );
        match publisher.publish(&announcement) {
            Ok(()) => true,
            Err(e) => {
                warn!("service announcement failed: {e}");
                false
            }
        }
    };

    serve(listener, engine, running).await;

    if published {
        publisher.withdraw();
    }
    Ok(())
}

/// Accept loop over an already bound listener.
///
/// Polls `running` at least every 200 ms so shutdown does not wait for the
/// next connection.
pub async fn serve(listener: TcpListener, engine: Arc<IntegrationEngine>, running: Arc<AtomicBool>) {
    loop {
        if !running.load(Ordering::Relaxed) {
            info!("shutdown flag set; stopping accept loop");
            break;
        }

        match timeout(ACCEPT_POLL, listener.accept()).await {
            Ok(Ok((stream, peer))) => {
                debug!("TCP connection from {peer}");
                let engine = Arc::clone(&engine);
                tokio::spawn(async move {
                    handle_connection(stream, peer, engine).await;
                });
            }
            Ok(Err(e)) => {
                // Transient (for example out of file descriptors); keep accepting.
                error!("accept error: {e}");
            }
            Err(_) => {}
        }
    }
}

// ── Per-connection handler ────────────────────────────────────────────────────

/// Wraps [`run_connection`] and logs the outcome.
async fn handle_connection(stream: TcpStream, peer: SocketAddr, engine: Arc<IntegrationEngine>) {
    match run_connection(stream, peer, engine).await {
        Ok(()) => debug!("connection from {peer} finished"),
        Err(e) => warn!("connection from {peer} failed: {e:#}"),
    }
}

/// Runs one controller connection from handshake to teardown.
///
/// Three tasks cooperate:
///
/// - the **socket reader** forwards text and binary messages and closes the
///   session when the socket ends;
/// - the **writer** drains the session's outbound queue;
/// - this task processes messages one at a time.
///
/// A text frame is dispatched on its own task so a slow handler never hides a
/// disconnect: once the session closes, teardown runs at once and the handler
/// finishes detached (a late setup result is discarded by the setup flow).
///
/// # Errors
///
/// Returns an error if the WebSocket handshake fails or the socket reports an
/// error other than an orderly close.
async fn run_connection(
    stream: TcpStream,
    peer: SocketAddr,
    engine: Arc<IntegrationEngine>,
) -> anyhow::Result<()> {
    let ws_stream = accept_async(stream)
        .await
        .with_context(|| format!("WebSocket handshake failed with {peer}"))?;
    let (mut ws_tx, ws_rx) = ws_stream.split();

    let (session, mut outbound) = engine.open_session(peer).await;
    let mut voice = engine.voice_multiplexer(&session);
    let id = session.id();

    // ── Writer ────────────────────────────────────────────────────────────────
    let writer_session = Arc::clone(&session);
    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            if let Err(e) = ws_tx.send(WsMessage::Text(frame.to_string())).await {
                debug!("connection {}: send failed: {e}", writer_session.id());
                break;
            }
        }
        writer_session.close();
    });

    // ── Socket reader ─────────────────────────────────────────────────────────
    // Unbounded so the reader keeps watching the socket while a message is
    // being processed.
    let (inbound_tx, mut inbound) = mpsc::unbounded_channel();
    let reader_session = Arc::clone(&session);
    let reader = tokio::spawn(async move {
        let result = read_socket(ws_rx, inbound_tx, id).await;
        reader_session.close();
        result
    });

    // ── Processing ────────────────────────────────────────────────────────────
    loop {
        let message = tokio::select! {
            message = inbound.recv() => match message {
                Some(message) => message,
                None => break,
            },
            () = session.closed() => break,
        };

        match message {
            Inbound::Text(text) => {
                let engine = Arc::clone(&engine);
                let dispatch_session = Arc::clone(&session);
                let dispatch = tokio::spawn(async move {
                    engine.dispatch_text(&dispatch_session, &text).await;
                });
                tokio::select! {
                    joined = dispatch => {
                        if let Err(e) = joined {
                            error!("connection {id}: dispatch task failed: {e}");
                        }
                    }
                    () = session.closed() => {
                        debug!("connection {id}: closed while a request was in progress");
                        break;
                    }
                }
            }
            Inbound::Binary(bytes) => {
                if let Err(e) = voice.handle_binary(&bytes) {
                    warn!("connection {id}: voice frame rejected: {e}");
                }
            }
        }
    }

    voice.close_all();
    engine.close_session(&session);
    writer.abort();
    reader.abort();
    match reader.await {
        Ok(result) => result,
        // Aborted above because the engine closed the session first.
        Err(_) => Ok(()),
    }
}

/// A data message handed from the socket reader to the processing loop.
enum Inbound {
    Text(String),
    Binary(Vec<u8>),
}

/// Reads the socket until it closes, forwarding data messages.
async fn read_socket(
    mut ws_rx: SplitStream<WebSocketStream<TcpStream>>,
    inbound: mpsc::UnboundedSender<Inbound>,
    id: ConnectionId,
) -> anyhow::Result<()> {
    while let Some(next) = ws_rx.next().await {
        let message = match next {
            Ok(message) => message,
            Err(WsError::ConnectionClosed | WsError::Protocol(_)) => {
                debug!("connection {id}: WebSocket closed");
                return Ok(());
            }
            Err(e) => {
                return Err(anyhow::Error::new(e).context(format!("connection {id}: read failed")));
            }
        };

        let forwarded = match message {
            WsMessage::Text(text) => inbound.send(Inbound::Text(text)),
            WsMessage::Binary(bytes) => inbound.send(Inbound::Binary(bytes)),
            WsMessage::Ping(data) => {
                debug!("connection {id}: WebSocket ping ({} bytes)", data.len());
                Ok(())
            }
            WsMessage::Pong(_) => {
                debug!("connection {id}: WebSocket pong");
                Ok(())
            }
            WsMessage::Close(_) => {
                debug!("connection {id}: Close frame received");
                return Ok(());
            }
            WsMessage::Frame(_) => {
                debug!("connection {id}: raw frame (ignored)");
                Ok(())
            }
        };
        if forwarded.is_err() {
            // Processing loop is gone; the connection is being torn down.
            return Ok(());
        }
    }
    debug!("connection {id}: stream ended");
    Ok(())
}
