// End-to-end scenarios over a live WebSocket connection with scripted
// engines: happy-path turn, busy-drop, auto barge-in, and model-timeout
// fallback.

mod common;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use base64::Engine as _;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use voicegate::protocol::{ClientEvent, InterruptKind, ServerEvent};
use voicegate::realtime::RealtimeServer;

use common::*;

type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

// ─────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────

async fn connect(addr: SocketAddr) -> WsClient {
    let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}"))
        .await
        .expect("websocket handshake");
    ws
}

async fn send(ws: &mut WsClient, event: &ClientEvent) {
    let text = serde_json::to_string(event).unwrap();
    ws.send(Message::Text(text)).await.expect("send frame");
}

async fn send_audio(ws: &mut WsClient, session_id: &str, len: usize) {
    let audio = base64::engine::general_purpose::STANDARD.encode(audio_payload(len));
    send(
        ws,
        &ClientEvent::AudioData {
            session_id: session_id.to_string(),
            audio,
        },
    )
    .await;
}

/// Collect server events until the predicate matches or the window closes.
async fn collect_until(
    ws: &mut WsClient,
    window: Duration,
    mut stop: impl FnMut(&ServerEvent) -> bool,
) -> Vec<ServerEvent> {
    let mut events = Vec::new();
    let deadline = Instant::now() + window;
    while let Some(remaining) = deadline.checked_duration_since(Instant::now()) {
        match tokio::time::timeout(remaining, ws.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => {
                if let Ok(event) = serde_json::from_str::<ServerEvent>(&text) {
                    let hit = stop(&event);
                    events.push(event);
                    if hit {
                        break;
                    }
                }
            }
            Ok(Some(Ok(_))) => continue,
            _ => break,
        }
    }
    events
}

async fn start_session(ws: &mut WsClient, session_id: &str) {
    send(
        ws,
        &ClientEvent::SessionStart {
            session_id: session_id.to_string(),
            user_id: None,
            settings: HashMap::new(),
        },
    )
    .await;
    let events = collect_until(ws, Duration::from_secs(1), |e| {
        matches!(e, ServerEvent::Status { .. } | ServerEvent::Error { .. })
    })
    .await;
    assert!(
        events.iter().any(|e| matches!(e, ServerEvent::Status { .. })),
        "expected a status ack, got {events:?}"
    );
}

// ─────────────────────────────────────────────────────────────
// Scenario A: start, speak, get transcription then response
// ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn scenario_a_speech_yields_transcription_then_response() {
    let mut config = test_config();
    config.interrupt.auto_interrupt_delay_ms = 5000;
    let tg = build_gateway(
        config,
        ScriptedStt::new(&["Hello there, how are you doing today?"]),
        ScriptedLlm::healthy(),
        ScriptedTts::instant(),
    );
    let server = RealtimeServer::new(tg.gateway.clone());
    let addr = server.start().await.unwrap();
    let mut ws = connect(addr).await;

    start_session(&mut ws, "call-a").await;
    send_audio(&mut ws, "call-a", 64).await;

    let events = collect_until(&mut ws, Duration::from_secs(2), |e| {
        matches!(e, ServerEvent::AiResponse { .. })
    })
    .await;

    let transcription_at = events
        .iter()
        .position(|e| matches!(e, ServerEvent::Transcription { .. }))
        .expect("transcription event");
    let response_at = events
        .iter()
        .position(|e| matches!(e, ServerEvent::AiResponse { .. }))
        .expect("ai_response event");
    assert!(transcription_at < response_at);

    match &events[response_at] {
        ServerEvent::AiResponse { text, audio, timing, .. } => {
            assert!(!text.is_empty());
            assert!(audio.is_some());
            assert!(timing.total >= 0.0);
        }
        _ => unreachable!(),
    }

    send(&mut ws, &ClientEvent::SessionEnd { session_id: "call-a".into() }).await;
    let events = collect_until(&mut ws, Duration::from_secs(1), |e| {
        matches!(e, ServerEvent::SessionEnded { .. })
    })
    .await;
    let ended = events
        .iter()
        .find_map(|e| match e {
            ServerEvent::SessionEnded { summary, .. } => Some(summary.clone()),
            _ => None,
        })
        .expect("session_ended event");
    assert_eq!(ended.turns, 2);

    // Both turns made it into call history, and the call is closed.
    let call = tg.history.call_for_session("call-a").expect("call recorded");
    assert_eq!(call.messages.len(), 2);
    assert!(call.ended_at.is_some());
    server.stop();
}

// ─────────────────────────────────────────────────────────────
// Scenario B: audio during an in-flight turn is not interleaved
// ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn scenario_b_busy_session_sends_notice_and_single_response() {
    let mut config = test_config();
    config.interrupt.auto_interrupt_delay_ms = 5000;
    config.pipeline.llm_timeout_ms = 2000;
    let tg = build_gateway(
        config,
        ScriptedStt::new(&["Tell me a story about the sea."]),
        ScriptedLlm::slow(Duration::from_millis(300)),
        ScriptedTts::instant(),
    );
    let server = RealtimeServer::new(tg.gateway.clone());
    let addr = server.start().await.unwrap();
    let mut ws = connect(addr).await;

    start_session(&mut ws, "call-b").await;
    send_audio(&mut ws, "call-b", 64).await;

    // Second chunk lands while the first turn is still in the model stage.
    tokio::time::sleep(Duration::from_millis(80)).await;
    send_audio(&mut ws, "call-b", 64).await;

    let events = collect_until(&mut ws, Duration::from_secs(2), |e| {
        matches!(e, ServerEvent::AiResponse { .. })
    })
    .await;
    // Give any duplicate response a chance to arrive, then drain.
    let extra = collect_until(&mut ws, Duration::from_millis(300), |_| false).await;

    let busy_notices = events
        .iter()
        .filter(|e| matches!(e, ServerEvent::Status { message, .. } if message.contains("Still processing")))
        .count();
    assert!(busy_notices >= 1, "expected a still-processing notice");

    let responses = events
        .iter()
        .chain(extra.iter())
        .filter(|e| matches!(e, ServerEvent::AiResponse { .. }))
        .count();
    assert_eq!(responses, 1, "exactly one response for the in-flight turn");
    server.stop();
}

// ─────────────────────────────────────────────────────────────
// Scenario C: sustained barge-in cancels the streaming response
// ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn scenario_c_sustained_speech_auto_interrupts_synthesis() {
    let config = test_config(); // 100ms auto-interrupt, 20ms debounce
    let tts = ScriptedTts::slow(Duration::from_millis(600));
    let tg = build_gateway(
        config,
        ScriptedStt::new(&["Tell me a very long story right now."]),
        ScriptedLlm::healthy(),
        tts,
    );
    let server = RealtimeServer::new(tg.gateway.clone());
    let addr = server.start().await.unwrap();
    let mut ws = connect(addr).await;

    start_session(&mut ws, "call-c").await;
    // The caller starts talking and never stops.
    send_audio(&mut ws, "call-c", 64).await;

    let events = collect_until(&mut ws, Duration::from_secs(2), |e| {
        matches!(e, ServerEvent::InterruptConfirmed { .. })
    })
    .await;

    let kind = events
        .iter()
        .find_map(|e| match e {
            ServerEvent::InterruptConfirmed { interrupt_type, .. } => Some(*interrupt_type),
            _ => None,
        })
        .expect("auto interrupt fired");
    assert_eq!(kind, InterruptKind::AutoInterrupt);

    // Synthesis never completed: no full response afterwards.
    assert!(!events.iter().any(|e| matches!(e, ServerEvent::AiResponse { .. })));
    let after = collect_until(&mut ws, Duration::from_millis(300), |e| {
        matches!(e, ServerEvent::AiResponse { .. })
    })
    .await;
    assert!(!after.iter().any(|e| matches!(e, ServerEvent::AiResponse { .. })));
    server.stop();
}

// ─────────────────────────────────────────────────────────────
// Scenario D: model timeout falls back, session stays alive
// ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn scenario_d_model_timeout_yields_fallback_and_live_session() {
    let mut config = test_config();
    config.interrupt.auto_interrupt_delay_ms = 5000;
    config.pipeline.llm_timeout_ms = 150;
    config.pipeline.fallback_timeout_ms = 150;
    let llm = ScriptedLlm::slow(Duration::from_millis(500));
    let tg = build_gateway(
        config,
        ScriptedStt::new(&["Is anyone out there listening to me?"]),
        llm.clone(),
        ScriptedTts::instant(),
    );
    let server = RealtimeServer::new(tg.gateway.clone());
    let addr = server.start().await.unwrap();
    let mut ws = connect(addr).await;

    start_session(&mut ws, "call-d").await;
    send_audio(&mut ws, "call-d", 64).await;

    let events = collect_until(&mut ws, Duration::from_secs(3), |e| {
        matches!(e, ServerEvent::AiResponse { .. })
    })
    .await;

    // Both attempts timed out; the templated apology still arrived.
    let text = events
        .iter()
        .find_map(|e| match e {
            ServerEvent::AiResponse { text, .. } => Some(text.clone()),
            _ => None,
        })
        .expect("turn produced an outcome");
    assert!(!text.is_empty());
    assert_eq!(llm.calls.load(Ordering::SeqCst), 2, "primary then fallback");

    // The session survived the failures.
    send(&mut ws, &ClientEvent::Ping { session_id: Some("call-d".into()) }).await;
    let events = collect_until(&mut ws, Duration::from_secs(1), |e| {
        matches!(e, ServerEvent::Pong { .. })
    })
    .await;
    assert!(events.iter().any(|e| matches!(e, ServerEvent::Pong { .. })));
    server.stop();
}

// ─────────────────────────────────────────────────────────────
// Registry edges
// ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn duplicate_session_start_is_rejected() {
    let mut config = test_config();
    config.interrupt.auto_interrupt_delay_ms = 5000;
    let tg = build_gateway(
        config,
        ScriptedStt::new(&[]),
        ScriptedLlm::healthy(),
        ScriptedTts::instant(),
    );
    let server = RealtimeServer::new(tg.gateway.clone());
    let addr = server.start().await.unwrap();
    let mut ws = connect(addr).await;

    start_session(&mut ws, "call-dup").await;
    send(
        &mut ws,
        &ClientEvent::SessionStart {
            session_id: "call-dup".into(),
            user_id: None,
            settings: HashMap::new(),
        },
    )
    .await;

    let events = collect_until(&mut ws, Duration::from_secs(1), |e| {
        matches!(e, ServerEvent::Error { .. })
    })
    .await;
    let message = events
        .iter()
        .find_map(|e| match e {
            ServerEvent::Error { message, .. } => Some(message.clone()),
            _ => None,
        })
        .expect("duplicate start rejected");
    assert!(message.contains("already exists"), "got: {message}");
    server.stop();
}

#[tokio::test]
async fn settings_update_acknowledged_mid_call() {
    let mut config = test_config();
    config.interrupt.auto_interrupt_delay_ms = 5000;
    let tg = build_gateway(
        config,
        ScriptedStt::new(&[]),
        ScriptedLlm::healthy(),
        ScriptedTts::instant(),
    );
    let server = RealtimeServer::new(tg.gateway.clone());
    let addr = server.start().await.unwrap();
    let mut ws = connect(addr).await;

    start_session(&mut ws, "call-s").await;

    let mut settings = HashMap::new();
    settings.insert("language".to_string(), serde_json::json!("es"));
    send(
        &mut ws,
        &ClientEvent::SettingsUpdate {
            session_id: "call-s".into(),
            settings,
        },
    )
    .await;

    let events = collect_until(&mut ws, Duration::from_secs(1), |e| {
        matches!(e, ServerEvent::Status { message, .. } if message.contains("Settings"))
    })
    .await;
    assert!(events
        .iter()
        .any(|e| matches!(e, ServerEvent::Status { message, .. } if message.contains("Settings updated"))));

    let handle = tg.gateway.sessions.get("call-s").unwrap();
    assert_eq!(handle.settings().language, "es");
    server.stop();
}
