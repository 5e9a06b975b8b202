//! WebSocket server for realtime call sessions.
//!
//! Accepts one connection per call session and drives the duplex
//! protocol: client events are dispatched to the gateway, server events
//! are drained from a per-connection channel by a writer task. The
//! receive loop polls with a short timeout so idle keepalives fire even
//! when the caller is silent, and teardown runs on every exit path.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::Engine as _;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::sync::Notify;
use tokio_tungstenite::{tungstenite::Message, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::gateway::Gateway;
use crate::protocol::{ClientEvent, ServerEvent};
use crate::session::{CallStatus, IngestOutcome};

/// Whether the connection should stay open after an event.
enum Flow {
    Continue,
    Close,
}

/// WebSocket server for the realtime voice API.
pub struct RealtimeServer {
    gateway: Arc<Gateway>,
    shutdown: Arc<Notify>,
}

impl RealtimeServer {
    pub fn new(gateway: Arc<Gateway>) -> Self {
        Self {
            gateway,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Bind and start serving. Returns the bound address (useful when the
    /// configured port is 0).
    pub async fn start(&self) -> anyhow::Result<SocketAddr> {
        let server = &self.gateway.config.server;
        let addr: SocketAddr = format!("{}:{}", server.host, server.port).parse()?;
        let listener = TcpListener::bind(&addr).await?;
        let local_addr = listener.local_addr()?;

        info!("realtime server listening on ws://{}", local_addr);

        let shutdown = Arc::clone(&self.shutdown);
        let gateway = Arc::clone(&self.gateway);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, peer)) => {
                                info!("connection from {}", peer);
                                let gateway = Arc::clone(&gateway);
                                tokio::spawn(async move {
                                    if let Err(e) = handle_connection(stream, gateway).await {
                                        error!("connection {} failed: {}", peer, e);
                                    }
                                });
                            }
                            Err(e) => error!("accept failed: {}", e),
                        }
                    }
                    _ = shutdown.notified() => {
                        info!("realtime server shutting down");
                        break;
                    }
                }
            }
        });

        Ok(local_addr)
    }

    pub fn stop(&self) {
        self.shutdown.notify_waiters();
    }
}

// ---------------------------------------------------------------------------
// Connection handling
// ---------------------------------------------------------------------------

async fn handle_connection(stream: TcpStream, gateway: Arc<Gateway>) -> anyhow::Result<()> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (ws_sender, mut ws_receiver) = ws_stream.split();

    let (event_tx, event_rx) = mpsc::unbounded_channel::<ServerEvent>();
    let (pong_tx, pong_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let writer = tokio::spawn(write_loop(ws_sender, event_rx, pong_rx));

    let poll_interval = Duration::from_millis(gateway.config.server.poll_interval_ms);
    let keepalive = Duration::from_secs(gateway.config.server.ping_interval_secs);
    let mut last_keepalive = Instant::now();
    let mut session_id: Option<String> = None;

    loop {
        // Idle keepalive so the transport does not expire between turns.
        if let Some(sid) = &session_id {
            if last_keepalive.elapsed() >= keepalive {
                let _ = event_tx.send(ServerEvent::Heartbeat {
                    session_id: sid.clone(),
                });
                last_keepalive = Instant::now();
            }
        }

        let frame = match tokio::time::timeout(poll_interval, ws_receiver.next()).await {
            Err(_) => continue,
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                warn!("websocket receive error: {}", e);
                break;
            }
            Ok(Some(Ok(frame))) => frame,
        };

        match frame {
            Message::Text(text) => {
                let event = match serde_json::from_str::<ClientEvent>(&text) {
                    Ok(event) => event,
                    Err(e) => {
                        debug!("undecodable client event: {}", e);
                        let _ = event_tx.send(ServerEvent::Error {
                            session_id: session_id.clone(),
                            message: format!("Unrecognized message: {e}"),
                        });
                        continue;
                    }
                };
                match dispatch(&gateway, event, &mut session_id, &event_tx).await {
                    Flow::Continue => {}
                    Flow::Close => break,
                }
            }
            Message::Binary(data) => {
                debug!("ignoring {} bytes of binary data", data.len());
            }
            Message::Ping(data) => {
                let _ = pong_tx.send(data);
            }
            Message::Close(_) => {
                info!("connection closed by client");
                break;
            }
            _ => {}
        }
    }

    // Teardown runs on every exit path: normal close, disconnect, error.
    if let Some(sid) = session_id {
        gateway.interrupts.unregister(&sid);
        if gateway.sessions.end(&sid).is_some() {
            info!("session {} cleaned up on disconnect", sid);
        }
    }
    drop(event_tx);
    drop(pong_tx);
    let _ = writer.await;
    Ok(())
}

async fn write_loop(
    mut sink: SplitSink<WebSocketStream<TcpStream>, Message>,
    mut event_rx: mpsc::UnboundedReceiver<ServerEvent>,
    mut pong_rx: mpsc::UnboundedReceiver<Vec<u8>>,
) {
    loop {
        tokio::select! {
            event = event_rx.recv() => match event {
                Some(event) => {
                    let text = match serde_json::to_string(&event) {
                        Ok(text) => text,
                        Err(e) => {
                            error!("failed to serialize event: {}", e);
                            continue;
                        }
                    };
                    if sink.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            pong = pong_rx.recv() => match pong {
                Some(data) => {
                    if sink.send(Message::Pong(data)).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Event dispatch
// ---------------------------------------------------------------------------

async fn dispatch(
    gateway: &Arc<Gateway>,
    event: ClientEvent,
    current_session: &mut Option<String>,
    events: &UnboundedSender<ServerEvent>,
) -> Flow {
    match event {
        ClientEvent::SessionStart {
            session_id,
            user_id,
            settings,
        } => {
            match gateway
                .sessions
                .create(&session_id, user_id.as_deref(), &settings)
            {
                Ok(handle) => {
                    gateway.interrupts.register(&session_id);
                    gateway.pools.optimize_for_realtime();
                    handle.advance_status(CallStatus::Connected);
                    *current_session = Some(session_id.clone());
                    let _ = events.send(ServerEvent::Status {
                        session_id,
                        message: "Call connected".to_string(),
                    });
                }
                Err(e) => {
                    let _ = events.send(ServerEvent::Error {
                        session_id: Some(session_id),
                        message: format!("Failed to start call: {e}"),
                    });
                }
            }
            Flow::Continue
        }

        ClientEvent::AudioData { session_id, audio } => {
            let Some(handle) = gateway.sessions.get(&session_id) else {
                let _ = events.send(ServerEvent::Error {
                    session_id: Some(session_id),
                    message: "Session not found".to_string(),
                });
                return Flow::Continue;
            };

            let chunk = match base64::engine::general_purpose::STANDARD.decode(audio.as_bytes()) {
                Ok(chunk) if !chunk.is_empty() => chunk,
                Ok(_) => {
                    let _ = events.send(ServerEvent::Error {
                        session_id: Some(session_id),
                        message: "Empty audio payload".to_string(),
                    });
                    return Flow::Continue;
                }
                Err(e) => {
                    let _ = events.send(ServerEvent::Error {
                        session_id: Some(session_id),
                        message: format!("Undecodable audio payload: {e}"),
                    });
                    return Flow::Continue;
                }
            };

            gateway.interrupts.start_user_speaking(&session_id, events);

            match gateway.sessions.ingest_audio(&handle, chunk) {
                IngestOutcome::Buffering => {}
                IngestOutcome::QueuedBehindTurn | IngestOutcome::DroppedBusy => {
                    let _ = events.send(ServerEvent::Status {
                        session_id,
                        message: "Still processing previous request...".to_string(),
                    });
                }
                IngestOutcome::Throttled => {
                    let _ = events.send(ServerEvent::Status {
                        session_id,
                        message: "Processing...".to_string(),
                    });
                }
                IngestOutcome::ReadyTurn {
                    audio,
                    format,
                    guard,
                } => {
                    let pipeline = Arc::clone(&gateway.pipeline);
                    let events = events.clone();
                    tokio::spawn(async move {
                        pipeline
                            .run_audio_turn(handle, audio, format, guard, events)
                            .await;
                    });
                }
            }
            Flow::Continue
        }

        ClientEvent::Interrupt { session_id } => {
            if !gateway.interrupts.manual_interrupt(&session_id, events) {
                let _ = events.send(ServerEvent::Error {
                    session_id: Some(session_id),
                    message: "Nothing to interrupt".to_string(),
                });
            }
            Flow::Continue
        }

        ClientEvent::UserStopSpeaking { session_id } => {
            gateway.interrupts.stop_user_speaking(&session_id);
            Flow::Continue
        }

        ClientEvent::SettingsUpdate {
            session_id,
            settings,
        } => {
            match gateway.sessions.get(&session_id) {
                Some(handle) => {
                    handle.update_settings(&settings);
                    let _ = events.send(ServerEvent::Status {
                        session_id,
                        message: "Settings updated".to_string(),
                    });
                }
                None => {
                    let _ = events.send(ServerEvent::Error {
                        session_id: Some(session_id),
                        message: "Session not found".to_string(),
                    });
                }
            }
            Flow::Continue
        }

        ClientEvent::Ping { session_id } => {
            let _ = events.send(ServerEvent::Pong { session_id });
            Flow::Continue
        }

        ClientEvent::SessionEnd { session_id } => {
            gateway.interrupts.unregister(&session_id);
            let summary = gateway.sessions.end(&session_id).unwrap_or_default();
            let _ = events.send(ServerEvent::SessionEnded {
                session_id,
                summary,
            });
            *current_session = None;
            Flow::Close
        }
    }
}
