//! End-to-end session tests: mock REST handshake plus a scripted agent socket

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::sync::oneshot;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use vocal_live::audio::encode_pcm16;
use vocal_live::{
    EventLog, LogCategory, SessionConfig, SessionOptions, SessionState, SessionUpdate,
    TtsEngine, VoiceSession,
};

mod common;
use common::{FakeAudio, ServerSocket, messages};

async fn send_json(ws: &mut ServerSocket, value: Value) {
    ws.send(Message::Text(value.to_string().into())).await.unwrap();
}

/// Minimal agent: answers typed input the way the voice server does
async fn agent(mut ws: ServerSocket) {
    send_json(&mut ws, json!({"type": "session.created", "session_id": "abc123"})).await;

    while let Some(Ok(msg)) = ws.next().await {
        let text = match msg {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };
        let request: Value = serde_json::from_str(text.as_str()).unwrap();
        match request["type"].as_str() {
            Some("input.text") => {
                let said = request["text"].as_str().unwrap_or_default().to_string();
                send_json(
                    &mut ws,
                    json!({"type": "transcription", "text": said, "is_final": true, "source": "text"}),
                )
                .await;
                send_json(&mut ws, json!({"type": "response.start"})).await;
                send_json(&mut ws, json!({"type": "response.text", "text": "Salut !"})).await;
                send_json(
                    &mut ws,
                    json!({"type": "audio.start", "sample_rate": 24000, "channels": 1}),
                )
                .await;
                ws.send(Message::Binary(encode_pcm16(&[0.25; 480]).into()))
                    .await
                    .unwrap();
                ws.send(Message::Binary(encode_pcm16(&[-0.25; 480]).into()))
                    .await
                    .unwrap();
                send_json(&mut ws, json!({"type": "audio.end"})).await;
                send_json(&mut ws, json!({"type": "response.end"})).await;
            }
            Some("session.update") => {
                send_json(
                    &mut ws,
                    json!({"type": "session.updated", "config": {"voice_id": request["voice_id"]}}),
                )
                .await;
            }
            Some("conversation.clear") => {
                send_json(&mut ws, json!({"type": "conversation.cleared"})).await;
            }
            Some("memory.clear") => {
                send_json(&mut ws, json!({"type": "memory.cleared"})).await;
            }
            Some("ping") => send_json(&mut ws, json!({"type": "pong"})).await,
            _ => {}
        }
    }
}

async fn mount_handshake(ws_addr: std::net::SocketAddr) -> MockServer {
    let rest = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/start-session"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "session_id": "abc123",
            "websocket_url": format!("ws://{ws_addr}/ws/abc123"),
            "config": {"voice_id": "v1", "tts_engine": "melo"},
        })))
        .expect(1)
        .mount(&rest)
        .await;
    rest
}

fn new_session(rest: &MockServer, audio: FakeAudio) -> VoiceSession {
    session_with(rest, audio, SessionOptions::default())
}

fn session_with(rest: &MockServer, audio: FakeAudio, options: SessionOptions) -> VoiceSession {
    VoiceSession::new(
        common::handshake_client(&rest.uri()),
        Box::new(audio),
        EventLog::default(),
        options,
    )
}

/// Pump events until `done` holds
async fn pump_until(session: &mut VoiceSession, done: impl Fn(&VoiceSession) -> bool) {
    timeout(Duration::from_secs(5), async {
        while !done(session) {
            assert!(session.process_next().await, "connection went away");
        }
    })
    .await
    .expect("timed out waiting for session events");
}

fn scenario_config() -> SessionConfig {
    SessionConfig {
        personality: "X".to_string(),
        voice_id: "v1".to_string(),
        tts_engine: TtsEngine::Melo,
        ..SessionConfig::default()
    }
}

#[tokio::test]
async fn test_typed_conversation_round_trip() {
    let ws_addr = common::spawn_ws_server(agent).await;
    let rest = mount_handshake(ws_addr).await;
    let audio = FakeAudio::default();
    let mut session = new_session(&rest, audio.clone());

    session.connect(scenario_config()).await.unwrap();
    assert_eq!(session.state(), SessionState::Active);
    assert_eq!(session.session().unwrap().id, "abc123");

    let created: Vec<_> = messages(session.log(), LogCategory::System)
        .into_iter()
        .filter(|m| m.starts_with("Session created"))
        .collect();
    assert_eq!(created, vec!["Session created: abc123".to_string()]);

    let mut draft = "Bonjour".to_string();
    assert!(session.send_text(&mut draft));
    assert!(draft.is_empty());
    assert_eq!(messages(session.log(), LogCategory::User), vec!["Bonjour"]);

    pump_until(&mut session, |s| {
        s.log()
            .entries()
            .iter()
            .any(|e| e.message == "Response complete")
    })
    .await;

    // Typed input echo is not logged a second time
    assert_eq!(messages(session.log(), LogCategory::User), vec!["Bonjour"]);
    assert_eq!(messages(session.log(), LogCategory::Agent), vec!["Salut !"]);

    let order: Vec<_> = session
        .log()
        .entries()
        .into_iter()
        .map(|e| e.message)
        .filter(|m| m == "Agent is responding" || m == "Salut !" || m == "Response complete")
        .collect();
    assert_eq!(order, vec!["Agent is responding", "Salut !", "Response complete"]);

    let audio_log = messages(session.log(), LogCategory::Audio);
    assert_eq!(audio_log, vec!["Agent speaking (24000 Hz)", "Agent finished speaking"]);
    assert!(!session.is_playing());
    assert_eq!(audio.outputs_opened(), 1);

    session.disconnect().await;
    assert_eq!(session.state(), SessionState::Closed);
    let disconnects = messages(session.log(), LogCategory::System)
        .into_iter()
        .filter(|m| m == "Disconnected")
        .count();
    assert_eq!(disconnects, 1);

    session.disconnect().await;
    assert_eq!(session.state(), SessionState::Closed);
    let disconnects = messages(session.log(), LogCategory::System)
        .into_iter()
        .filter(|m| m == "Disconnected")
        .count();
    assert_eq!(disconnects, 1);
    assert!(messages(session.log(), LogCategory::Error).is_empty());
}

#[tokio::test]
async fn test_session_controls() {
    let ws_addr = common::spawn_ws_server(agent).await;
    let rest = mount_handshake(ws_addr).await;
    let mut session = new_session(&rest, FakeAudio::default());
    session.connect(scenario_config()).await.unwrap();

    assert!(session.update_session(SessionUpdate {
        voice_id: Some("v2".to_string()),
        ..SessionUpdate::default()
    }));
    assert_eq!(session.session().unwrap().config.voice_id, "v2");
    assert!(session.clear_conversation());
    assert!(session.ping());

    pump_until(&mut session, |s| {
        s.log()
            .entries()
            .iter()
            .any(|e| e.message == "Conversation cleared")
    })
    .await;

    assert_eq!(
        session.session().unwrap().echoed.voice_id.as_deref(),
        Some("v2")
    );
    assert!(
        messages(session.log(), LogCategory::System)
            .iter()
            .any(|m| m.starts_with("Session updated"))
    );

    session.disconnect().await;
}

#[tokio::test]
async fn test_clear_memory_round_trip() {
    let ws_addr = common::spawn_ws_server(agent).await;
    let rest = mount_handshake(ws_addr).await;
    let mut session = new_session(&rest, FakeAudio::default());
    session.connect(scenario_config()).await.unwrap();

    assert!(session.clear_memory());
    pump_until(&mut session, |s| {
        s.log()
            .entries()
            .iter()
            .any(|e| e.message == "Memory cleared")
    })
    .await;

    let cleared: Vec<_> = session
        .log()
        .by_category(LogCategory::System)
        .into_iter()
        .filter(|e| e.message == "Memory cleared")
        .collect();
    assert_eq!(cleared.len(), 1);

    session.disconnect().await;
    assert!(!session.clear_memory());
}

#[tokio::test]
async fn test_keepalive_pings_while_active() {
    let (tx, rx) = oneshot::channel();
    let ws_addr = common::spawn_ws_server(|mut ws| async move {
        let mut tx = Some(tx);
        while let Some(Ok(msg)) = ws.next().await {
            match msg {
                Message::Text(text) => {
                    let request: Value = serde_json::from_str(text.as_str()).unwrap();
                    if request == json!({"type": "ping"}) {
                        if let Some(tx) = tx.take() {
                            let _ = tx.send(());
                        }
                        send_json(&mut ws, json!({"type": "pong"})).await;
                    }
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    })
    .await;
    let rest = mount_handshake(ws_addr).await;
    let options = SessionOptions {
        keepalive: Some(Duration::from_millis(50)),
        ..SessionOptions::default()
    };
    let mut session = session_with(&rest, FakeAudio::default(), options);
    session.connect(scenario_config()).await.unwrap();

    let mut rx = rx;
    timeout(Duration::from_secs(5), async {
        loop {
            tokio::select! {
                _ = &mut rx => break,
                alive = session.process_next() => assert!(alive, "connection went away"),
            }
        }
    })
    .await
    .expect("no keepalive ping reached the server");

    assert_eq!(session.state(), SessionState::Active);
    assert!(messages(session.log(), LogCategory::Error).is_empty());
    session.disconnect().await;
}

#[tokio::test]
async fn test_microphone_frames_reach_server() {
    let (tx, rx) = oneshot::channel();
    let ws_addr = common::spawn_ws_server(|mut ws| async move {
        let mut frames = Vec::new();
        while let Some(Ok(msg)) = ws.next().await {
            match msg {
                Message::Binary(bytes) => frames.push(bytes.len()),
                Message::Close(_) => break,
                _ => {}
            }
        }
        let _ = tx.send(frames);
    })
    .await;
    let rest = mount_handshake(ws_addr).await;

    let audio = FakeAudio {
        mic_samples: vec![0.1; 4096 * 2 + 100],
        ..FakeAudio::default()
    };
    let mut session = new_session(&rest, audio);
    session.connect(scenario_config()).await.unwrap();

    assert!(session.start_recording());
    assert!(session.is_recording());
    assert_eq!(messages(session.log(), LogCategory::Audio), vec!["Recording started"]);

    session.disconnect().await;
    assert!(!session.is_recording());

    let frames = timeout(Duration::from_secs(5), rx).await.unwrap().unwrap();
    assert_eq!(frames, vec![4096 * 2, 4096 * 2]);
}

#[tokio::test]
async fn test_server_abort_closes_session() {
    let ws_addr = common::spawn_ws_server(|ws| async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(ws);
    })
    .await;
    let rest = mount_handshake(ws_addr).await;
    let mut session = new_session(&rest, FakeAudio::default());
    session.connect(scenario_config()).await.unwrap();

    pump_until(&mut session, |s| s.state() == SessionState::Closed).await;

    assert!(!session.is_connected());
    assert_eq!(messages(session.log(), LogCategory::Error).len(), 1);
    assert!(!session.process_next().await);
    assert!(session.state().can_connect());
}

#[tokio::test]
async fn test_unreachable_stream_endpoint() {
    let rest = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/start-session"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "session_id": "abc123",
            "websocket_url": "ws://127.0.0.1:9/ws/abc123",
        })))
        .mount(&rest)
        .await;

    let mut session = new_session(&rest, FakeAudio::default());
    let err = session.connect(scenario_config()).await.unwrap_err();

    assert!(matches!(
        err,
        vocal_live::Error::Transport(vocal_live::error::TransportError::ConnectFailed(_))
    ));
    assert_eq!(session.state(), SessionState::Closed);
    let errors = messages(session.log(), LogCategory::Error);
    assert_eq!(errors.len(), 1);
    assert!(errors[0].starts_with("Connection error"));
}
