//! End-to-end tests driving real `Server` instances over real TCP/WebSocket
//! connections, exercising the wire protocol rather than any one stage's
//! internals in isolation (those are covered by each module's own
//! `#[cfg(test)]` suite).

use futures_util::{SinkExt, StreamExt};
use speechd::codec::{self, Frame};
use speechd::generator::StubTextGenerator;
use speechd::llm::LlmStage;
use speechd::server::Server;
use speechd::stt::SttStage;
use speechd::synthesizer::StubSynthesizer;
use speechd::transcriber::StubTranscriber;
use speechd::tts::TtsStage;
use std::collections::HashMap;
use std::time::Duration;
use tokio_tungstenite::tungstenite::Message;

type ClientWs =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn connect(port: u16) -> ClientWs {
    let (ws, _) = tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{port}"))
        .await
        .expect("client connects to stage listener");
    ws
}

async fn send(ws: &mut ClientWs, frame: Frame) {
    ws.send(Message::Text(codec::encode(&frame))).await.expect("send frame");
}

async fn recv(ws: &mut ClientWs) -> Frame {
    loop {
        match ws.next().await.expect("stream not closed").expect("no transport error") {
            Message::Text(text) => return codec::decode(&text).expect("valid frame"),
            _ => continue,
        }
    }
}

#[tokio::test]
async fn non_chat_mode_turn_returns_transcript_directly() {
    let store_root = tempfile::tempdir().unwrap().into_path();
    let stage = SttStage::new(StubTranscriber, HashMap::new(), store_root, "en");
    let server = Server::new("stt", "127.0.0.1", 28_200, stage);
    tokio::spawn(async move { server.serve_forever().await });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut ws = connect(28_200).await;
    send(
        &mut ws,
        Frame::new()
            .with("id", "turn-1")
            .with("status", "RECORDING")
            .with("audio", vec![0u8; 16])
            .with("audio_config", Frame::new().with("format", 1i64).with("channels", 1i64).with("rate", 16_000i64))
            .with("chat_mode", false),
    )
    .await;
    send(&mut ws, Frame::new().with("id", "turn-1").with("status", "FINISHED")).await;

    let reply = recv(&mut ws).await;
    assert_eq!(reply.status(), Some("FINISHED"));
    assert!(reply.text().unwrap().contains("16"));
    assert!(reply.save_path().is_some());
}

#[tokio::test]
async fn chat_mode_turn_relays_through_llm_and_tts_to_terminal_audio() {
    let tts_stage = TtsStage::new(StubSynthesizer::default());
    let tts_server = Server::new("tts", "127.0.0.1", 28_302, tts_stage);
    tokio::spawn(async move { tts_server.serve_forever().await });

    let mut llm_downstream = HashMap::new();
    llm_downstream.insert("tts".to_string(), "ws://127.0.0.1:28302".to_string());
    let llm_stage = LlmStage::new(StubTextGenerator, llm_downstream, "you are a test assistant", 0);
    let llm_server = Server::new("llm", "127.0.0.1", 28_301, llm_stage);
    tokio::spawn(async move { llm_server.serve_forever().await });

    let mut stt_downstream = HashMap::new();
    stt_downstream.insert("chat".to_string(), "ws://127.0.0.1:28301".to_string());
    let store_root = tempfile::tempdir().unwrap().into_path();
    let stt_stage = SttStage::new(StubTranscriber, stt_downstream, store_root, "en");
    let stt_server = Server::new("stt", "127.0.0.1", 28_300, stt_stage);
    tokio::spawn(async move { stt_server.serve_forever().await });

    // The dial-with-retry loop means start order between these three
    // listeners doesn't matter, but give everything a moment to bind and
    // chain-dial before the test client connects.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let mut ws = connect(28_300).await;
    send(
        &mut ws,
        Frame::new()
            .with("id", "turn-1")
            .with("status", "RECORDING")
            .with("audio", vec![0u8; 16])
            .with("audio_config", Frame::new().with("format", 1i64).with("channels", 1i64).with("rate", 16_000i64))
            .with("chat_mode", true),
    )
    .await;
    send(&mut ws, Frame::new().with("id", "turn-1").with("status", "FINISHED")).await;

    let mut saw_audio = false;
    loop {
        let reply = tokio::time::timeout(Duration::from_secs(5), recv(&mut ws))
            .await
            .expect("pipeline responds before the timeout");
        if reply.status() == Some("GENERATING") {
            saw_audio = saw_audio || reply.audio().is_some_and(|a| !a.is_empty());
        } else if reply.status() == Some("FINISHED") {
            assert!(reply.audio().is_some_and(<[u8]>::is_empty));
            break;
        }
    }
    assert!(saw_audio, "expected at least one non-empty audio chunk before FINISHED");
}

#[tokio::test]
async fn a_new_turn_id_interrupts_audio_delivery_for_the_old_one() {
    let tts_stage = TtsStage::new(StubSynthesizer::default());
    let tts_server = Server::new("tts", "127.0.0.1", 28_402, tts_stage);
    tokio::spawn(async move { tts_server.serve_forever().await });

    let mut llm_downstream = HashMap::new();
    llm_downstream.insert("tts".to_string(), "ws://127.0.0.1:28402".to_string());
    let llm_stage = LlmStage::new(StubTextGenerator, llm_downstream, "you are a test assistant", 0);
    let llm_server = Server::new("llm", "127.0.0.1", 28_401, llm_stage);
    tokio::spawn(async move { llm_server.serve_forever().await });

    let mut stt_downstream = HashMap::new();
    stt_downstream.insert("chat".to_string(), "ws://127.0.0.1:28401".to_string());
    let store_root = tempfile::tempdir().unwrap().into_path();
    let stt_stage = SttStage::new(StubTranscriber, stt_downstream, store_root, "en");
    let stt_server = Server::new("stt", "127.0.0.1", 28_400, stt_stage);
    tokio::spawn(async move { stt_server.serve_forever().await });

    tokio::time::sleep(Duration::from_millis(200)).await;

    let mut ws = connect(28_400).await;
    send(
        &mut ws,
        Frame::new()
            .with("id", "turn-1")
            .with("status", "RECORDING")
            .with("audio", vec![0u8; 16])
            .with("audio_config", Frame::new().with("format", 1i64).with("channels", 1i64).with("rate", 16_000i64))
            .with("chat_mode", true),
    )
    .await;
    send(&mut ws, Frame::new().with("id", "turn-1").with("status", "FINISHED")).await;

    // Immediately start a second turn without draining turn-1's replies.
    send(
        &mut ws,
        Frame::new()
            .with("id", "turn-2")
            .with("status", "RECORDING")
            .with("audio", vec![1u8; 16])
            .with("audio_config", Frame::new().with("format", 1i64).with("channels", 1i64).with("rate", 16_000i64))
            .with("chat_mode", true),
    )
    .await;
    send(&mut ws, Frame::new().with("id", "turn-2").with("status", "FINISHED")).await;

    // Every frame seen from here on must carry turn-2's id — a leaked
    // turn-1 frame would show up with the wrong id rather than being
    // silently merged, since ids are attached per frame, not inferred.
    let mut saw_turn_two_finished = false;
    for _ in 0..64 {
        let reply = match tokio::time::timeout(Duration::from_secs(5), recv(&mut ws)).await {
            Ok(reply) => reply,
            Err(_) => break,
        };
        if let Some(id) = reply.id() {
            assert_eq!(id, "turn-2", "a stale turn-1 frame must never reach the client");
        }
        if reply.status() == Some("FINISHED") {
            saw_turn_two_finished = true;
            break;
        }
    }
    assert!(saw_turn_two_finished, "turn-2 should complete even though turn-1 was interrupted");
}
