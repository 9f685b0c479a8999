//! End-to-end tests: a real server on an ephemeral port, driven by the crate's client.

use actix_web::{web, App, HttpServer};
use async_trait::async_trait;
use audio_stream_backend::audio::{
    AudioModel, AudioSample, DspModel, NativeBuffer, ProcessingParams,
};
use audio_stream_backend::client::{
    ClientEvent, PlaybackSink, ReconnectPolicy, StreamingClient, WavRecorder,
};
use audio_stream_backend::config::AppConfig;
use audio_stream_backend::configure_routes;
use audio_stream_backend::state::AppState;
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type RawSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Model whose first call stalls, every later call answers at once.
struct StallsOnce {
    calls: AtomicUsize,
    stall: Duration,
    inner: DspModel,
}

#[async_trait]
impl AudioModel for StallsOnce {
    fn name(&self) -> &str {
        "stalls-once"
    }

    async fn process_audio(
        &self,
        sample: AudioSample,
        params: ProcessingParams,
    ) -> anyhow::Result<AudioSample> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            tokio::time::sleep(self.stall).await;
        }
        self.inner.process_audio(sample, params).await
    }
}

fn spawn_server() -> (String, AppState) {
    spawn_server_with(AppConfig::default(), Arc::new(DspModel::new()))
}

fn spawn_server_with(config: AppConfig, model: Arc<dyn AudioModel>) -> (String, AppState) {
    let state = AppState::new(config, model);
    let data = state.clone();

    let server = HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(data.clone()))
            .configure(configure_routes)
    })
    .workers(1)
    .bind(("127.0.0.1", 0))
    .unwrap();

    let addr = server.addrs()[0];
    actix_web::rt::spawn(server.run());
    (format!("ws://{}/ws/audio", addr), state)
}

async fn next(client: &mut StreamingClient) -> ClientEvent {
    tokio::time::timeout(Duration::from_secs(5), client.next_event())
        .await
        .expect("timed out waiting for the server")
        .expect("transport error")
        .expect("connection closed")
}

async fn connect(url: &str) -> StreamingClient {
    let mut client = StreamingClient::connect(url, ReconnectPolicy::default())
        .await
        .unwrap();
    match next(&mut client).await {
        ClientEvent::Ready { session_id } => assert!(!session_id.is_empty()),
        other => panic!("expected ready, got {:?}", other),
    }
    client
}

#[actix_web::test]
async fn test_start_stream_and_stop() {
    let (url, state) = spawn_server();
    let mut client = connect(&url).await;
    assert!(client.session_id().is_some());

    client.start(ProcessingParams::new(0.8, 0.0, 1.0)).await.unwrap();
    client
        .push(&NativeBuffer::mono(16000, vec![0.5; 128]))
        .await
        .unwrap();

    let mut recorder = WavRecorder::new();
    match next(&mut client).await {
        ClientEvent::Audio(buffer) => {
            assert_eq!(buffer.sample_rate, 16000);
            assert_eq!(buffer.len(), 128);
            assert!((buffer.channels[0][0] - 0.4).abs() < 1e-6);
            recorder.play(&buffer).unwrap();
        }
        other => panic!("expected audio, got {:?}", other),
    }
    assert_eq!(recorder.samples().len(), 128);

    client.stop().await.unwrap();
    match next(&mut client).await {
        ClientEvent::Stopped { message } => assert_eq!(message, "Streaming stopped"),
        other => panic!("expected stop acknowledgment, got {:?}", other),
    }

    client.close().await.unwrap();
    assert!(!client.is_open());

    let metrics = state.metrics.snapshot();
    assert_eq!(metrics.connections_opened, 1);
    assert_eq!(metrics.jobs_started, 1);
    assert_eq!(metrics.chunks_processed, 1);
}

#[actix_web::test]
async fn test_audio_before_start_keeps_connection_open() {
    let (url, _) = spawn_server();
    let mut client = connect(&url).await;

    for _ in 0..2 {
        client
            .push(&NativeBuffer::mono(16000, vec![0.1; 32]))
            .await
            .unwrap();
        match next(&mut client).await {
            ClientEvent::Error(error) => assert_eq!(error.operation, "audio"),
            other => panic!("expected error, got {:?}", other),
        }
    }

    client.ping(7.0).await.unwrap();
    match next(&mut client).await {
        ClientEvent::Pong(beat) => assert_eq!(beat.timestamp, 7.0),
        other => panic!("expected pong, got {:?}", other),
    }
}

#[actix_web::test]
async fn test_realistic_chunk_size() {
    let (url, _) = spawn_server();
    let mut client = connect(&url).await;

    // 250 ms at 48 kHz is well over 64 KiB as JSON.
    let samples: Vec<f32> = (0..12_000).map(|i| i as f32 / 12_000.0 - 0.5).collect();
    client.start(ProcessingParams::new(0.5, 0.0, 1.0)).await.unwrap();
    client.push(&NativeBuffer::mono(48000, samples)).await.unwrap();

    match next(&mut client).await {
        ClientEvent::Audio(buffer) => {
            assert_eq!(buffer.sample_rate, 48000);
            assert_eq!(buffer.len(), 12_000);
            assert!((buffer.channels[0][0] + 0.25).abs() < 1e-6);
        }
        other => panic!("expected audio, got {:?}", other),
    }
    assert!(client.is_open());
}

#[actix_web::test]
async fn test_extreme_params_fail_per_chunk() {
    let (url, state) = spawn_server();
    let mut client = connect(&url).await;

    for params in [
        ProcessingParams::new(0.8, 0.0, 1e-20),
        ProcessingParams::new(0.8, -240.0, 1.0),
    ] {
        client.start(params).await.unwrap();
        client
            .push(&NativeBuffer::mono(16000, vec![0.5; 128]))
            .await
            .unwrap();
        match next(&mut client).await {
            ClientEvent::Error(error) => assert_eq!(error.operation, "process-audio"),
            other => panic!("expected error, got {:?}", other),
        }

        // Still streaming: stop is acknowledged, not a violation.
        client.stop().await.unwrap();
        match next(&mut client).await {
            ClientEvent::Stopped { .. } => {}
            other => panic!("expected stop acknowledgment, got {:?}", other),
        }
    }

    assert!(client.is_open());
    assert_eq!(state.metrics.snapshot().chunks_failed, 2);
}

#[actix_web::test]
async fn test_model_timeout_through_the_socket() {
    let mut config = AppConfig::default();
    config.streaming.model_timeout_ms = 100;
    let model = Arc::new(StallsOnce {
        calls: AtomicUsize::new(0),
        stall: Duration::from_secs(3),
        inner: DspModel::new(),
    });
    let (url, state) = spawn_server_with(config, model);
    let mut client = connect(&url).await;

    client.start(ProcessingParams::default()).await.unwrap();
    client
        .push(&NativeBuffer::mono(16000, vec![0.1; 64]))
        .await
        .unwrap();
    match next(&mut client).await {
        ClientEvent::Error(error) => {
            assert_eq!(error.operation, "process-audio");
            assert!(error.reason.contains("did not respond within 100 ms"));
            assert!(error.job_id.is_some());
        }
        other => panic!("expected error, got {:?}", other),
    }

    client
        .push(&NativeBuffer::mono(16000, vec![0.1; 64]))
        .await
        .unwrap();
    match next(&mut client).await {
        ClientEvent::Audio(buffer) => assert_eq!(buffer.len(), 64),
        other => panic!("expected audio, got {:?}", other),
    }

    let metrics = state.metrics.snapshot();
    assert_eq!(metrics.chunks_failed, 1);
    assert_eq!(metrics.chunks_processed, 1);
}

#[actix_web::test]
async fn test_pcm16_frames_and_text() {
    let (url, _) = spawn_server();
    let mut client = connect(&url).await;

    client.start(ProcessingParams::default()).await.unwrap();
    client
        .push_pcm16(&NativeBuffer::mono(8000, vec![0.25; 64]))
        .await
        .unwrap();
    match next(&mut client).await {
        ClientEvent::Audio(buffer) => {
            assert_eq!(buffer.sample_rate, 8000);
            assert_eq!(buffer.len(), 64);
        }
        other => panic!("expected audio, got {:?}", other),
    }

    client.say("hello").await.unwrap();
    match next(&mut client).await {
        ClientEvent::Text(message) => {
            assert_eq!(message.text, "hello");
            assert!(message.timestamp > 0);
        }
        other => panic!("expected text, got {:?}", other),
    }
}

#[actix_web::test]
async fn test_text_is_answered_with_speech() {
    let (url, state) = spawn_server();
    let mut client = connect(&url).await;

    client.say("tell me a story").await.unwrap();
    assert!(matches!(next(&mut client).await, ClientEvent::Text(_)));
    assert!(matches!(
        next(&mut client).await,
        ClientEvent::Processing { .. }
    ));

    // One second of 24 kHz speech in 50 ms chunks.
    let mut recorder = WavRecorder::new();
    let mut chunks = 0;
    loop {
        match next(&mut client).await {
            ClientEvent::Audio(buffer) => {
                assert_eq!(buffer.len(), 1200);
                recorder.play(&buffer).unwrap();
                chunks += 1;
            }
            ClientEvent::Finished { .. } => break,
            other => panic!("expected speech, got {:?}", other),
        }
    }

    assert_eq!(chunks, 20);
    assert_eq!(recorder.sample_rate(), Some(24000));
    assert!((recorder.duration_ms() - 1000.0).abs() < 1e-9);
    assert_eq!(state.metrics.snapshot().syntheses_completed, 1);
    assert_eq!(state.metrics.snapshot().frames_evicted, 0);
}

#[actix_web::test]
async fn test_malformed_frame_gets_decode_error() {
    let (url, _) = spawn_server();
    let (mut socket, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
    assert_eq!(read_json(&mut socket).await["type"], "ready");

    socket
        .send(WsMessage::Text("not json".to_string()))
        .await
        .unwrap();

    let frame = read_json(&mut socket).await;
    assert_eq!(frame["type"], "error");
    assert_eq!(frame["payload"]["operation"], "decode");

    // Still usable afterwards.
    socket
        .send(WsMessage::Text(r#"{"type":"ping","payload":{"timestamp":3}}"#.to_string()))
        .await
        .unwrap();
    assert_eq!(read_json(&mut socket).await["type"], "pong");
}

async fn read_json(socket: &mut RawSocket) -> serde_json::Value {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), socket.next())
            .await
            .expect("timed out waiting for the server")
            .expect("connection closed")
            .expect("transport error");
        if let WsMessage::Text(text) = frame {
            return serde_json::from_str(&text).unwrap();
        }
    }
}
