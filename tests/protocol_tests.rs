// Wire-protocol shape tests: every event kind must keep its snake_case
// tag and field layout, since deployed clients parse these frames.

use std::collections::HashMap;

use serde_json::json;

use voicegate::protocol::{
    ClientEvent, InterruptKind, ServerEvent, SessionSummary, Stage, StageStatus, TurnTiming,
};

// ─────────────────────────────────────────────────────────────
// Client events
// ─────────────────────────────────────────────────────────────

#[test]
fn session_start_parses_with_settings() {
    let raw = r#"{
        "type": "session_start",
        "session_id": "phone-1234",
        "user_id": "u42",
        "settings": {"language": "fr", "safetyMode": true}
    }"#;
    let event: ClientEvent = serde_json::from_str(raw).unwrap();
    match event {
        ClientEvent::SessionStart { session_id, user_id, settings } => {
            assert_eq!(session_id, "phone-1234");
            assert_eq!(user_id.as_deref(), Some("u42"));
            assert_eq!(settings["language"], json!("fr"));
        }
        other => panic!("expected session_start, got {other:?}"),
    }
}

#[test]
fn session_start_without_user_is_anonymous() {
    let raw = r#"{"type": "session_start", "session_id": "s1", "settings": {}}"#;
    let event: ClientEvent = serde_json::from_str(raw).unwrap();
    assert!(matches!(event, ClientEvent::SessionStart { user_id: None, .. }));
}

#[test]
fn audio_data_carries_base64_payload() {
    let raw = r#"{"type": "audio_data", "session_id": "s1", "audio": "AAECAw=="}"#;
    let event: ClientEvent = serde_json::from_str(raw).unwrap();
    match event {
        ClientEvent::AudioData { audio, .. } => assert_eq!(audio, "AAECAw=="),
        other => panic!("expected audio_data, got {other:?}"),
    }
}

#[test]
fn every_client_kind_round_trips() {
    let events = vec![
        ClientEvent::SessionStart {
            session_id: "s".into(),
            user_id: None,
            settings: HashMap::new(),
        },
        ClientEvent::AudioData { session_id: "s".into(), audio: "QQ==".into() },
        ClientEvent::Interrupt { session_id: "s".into() },
        ClientEvent::UserStopSpeaking { session_id: "s".into() },
        ClientEvent::SettingsUpdate { session_id: "s".into(), settings: HashMap::new() },
        ClientEvent::Ping { session_id: Some("s".into()) },
        ClientEvent::SessionEnd { session_id: "s".into() },
    ];
    for event in events {
        let text = serde_json::to_string(&event).unwrap();
        let back: ClientEvent = serde_json::from_str(&text).unwrap();
        assert_eq!(
            serde_json::to_value(&event).unwrap()["type"],
            serde_json::to_value(&back).unwrap()["type"]
        );
    }
}

// ─────────────────────────────────────────────────────────────
// Server events
// ─────────────────────────────────────────────────────────────

#[test]
fn ai_response_serializes_timing() {
    let event = ServerEvent::AiResponse {
        session_id: "s1".into(),
        text: "hello".into(),
        audio: Some("QUJD".into()),
        timing: TurnTiming { stt: 0.4, llm: 1.2, tts: 0.8, total: 2.4 },
    };
    let v = serde_json::to_value(&event).unwrap();
    assert_eq!(v["type"], "ai_response");
    assert_eq!(v["timing"]["llm"], 1.2);
    assert_eq!(v["audio"], "QUJD");
}

#[test]
fn ai_response_omits_missing_audio() {
    let event = ServerEvent::AiResponse {
        session_id: "s1".into(),
        text: "text only".into(),
        audio: None,
        timing: TurnTiming::default(),
    };
    let v = serde_json::to_value(&event).unwrap();
    assert!(v.get("audio").is_none());
}

#[test]
fn process_status_uses_snake_case_stages() {
    let event = ServerEvent::ProcessStatus {
        session_id: "s1".into(),
        stage: Stage::Stt,
        status: StageStatus::Active,
        details: "Recognizing speech...".into(),
    };
    let v = serde_json::to_value(&event).unwrap();
    assert_eq!(v["stage"], "stt");
    assert_eq!(v["status"], "active");
}

#[test]
fn audio_chunk_final_marker_round_trips() {
    let event = ServerEvent::AudioChunk {
        session_id: "s1".into(),
        index: 2,
        total: 3,
        text: String::new(),
        audio: "QQ==".into(),
        is_final: true,
        timing: Some(TurnTiming::default()),
    };
    let text = serde_json::to_string(&event).unwrap();
    let back: ServerEvent = serde_json::from_str(&text).unwrap();
    match back {
        ServerEvent::AudioChunk { index, total, is_final, timing, .. } => {
            assert_eq!(index, 2);
            assert_eq!(total, 3);
            assert!(is_final);
            assert!(timing.is_some());
        }
        other => panic!("expected audio_chunk, got {other:?}"),
    }
}

#[test]
fn interrupt_kinds_serialize_as_snake_case() {
    assert_eq!(
        serde_json::to_value(InterruptKind::AutoInterrupt).unwrap(),
        json!("auto_interrupt")
    );
    assert_eq!(
        serde_json::to_value(InterruptKind::ManualInterrupt).unwrap(),
        json!("manual_interrupt")
    );
}

#[test]
fn session_ended_carries_summary() {
    let event = ServerEvent::SessionEnded {
        session_id: "s1".into(),
        summary: SessionSummary { duration_secs: 12.5, turns: 4, interrupted_turns: 1 },
    };
    let v = serde_json::to_value(&event).unwrap();
    assert_eq!(v["type"], "session_ended");
    assert_eq!(v["summary"]["turns"], 4);
    assert_eq!(v["summary"]["interrupted_turns"], 1);
}

#[test]
fn heartbeat_is_minimal() {
    let v = serde_json::to_value(ServerEvent::Heartbeat { session_id: "s1".into() }).unwrap();
    assert_eq!(v, json!({"type": "heartbeat", "session_id": "s1"}));
}
