//! Protocol client tests against an in-process websocket service.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use futures_util::{SinkExt, StreamExt};
use live_agent::{
    capture::{CaptureConfig, CaptureError, CapturePipeline, InputDevice, InputGuard, SampleCallback},
    config::Endpoint,
    playback::{
        AudioSink, OutputDevice, OutputGuard, PlaybackConfig, PlaybackError, PlaybackScheduler,
        ScheduledSlot, SharedTimeline,
    },
    protocol::{FunctionResponse, Part, SessionConfig},
    ClientConfig, ClientEvent, ConnectionState, LiveClient, LiveError,
};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::{accept_async, tungstenite::protocol::Message};

const WAIT: Duration = Duration::from_secs(5);
const QUIET: Duration = Duration::from_millis(250);

/// One-connection websocket service the test scripts by hand.
struct MockService {
    endpoint: String,
    from_client: mpsc::UnboundedReceiver<Value>,
    to_client: mpsc::UnboundedSender<Message>,
}

impl MockService {
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = format!("ws://{}", listener.local_addr().unwrap());
        let (in_tx, from_client) = mpsc::unbounded_channel();
        let (to_client, mut out_rx) = mpsc::unbounded_channel::<Message>();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let ws = accept_async(stream).await.unwrap();
            let (mut write, mut read) = ws.split();
            loop {
                tokio::select! {
                    incoming = read.next() => match incoming {
                        Some(Ok(Message::Text(text))) => {
                            let _ = in_tx.send(serde_json::from_str(text.as_str()).unwrap());
                        }
                        Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                        Some(Ok(_)) => {}
                    },
                    outgoing = out_rx.recv() => match outgoing {
                        Some(message) => {
                            let closing = matches!(message, Message::Close(_));
                            if write.send(message).await.is_err() || closing {
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
        });

        Self {
            endpoint,
            from_client,
            to_client,
        }
    }

    fn endpoint(&self) -> Endpoint {
        Endpoint::relay(&self.endpoint).unwrap()
    }

    fn send(&self, message: Value) {
        self.to_client
            .send(Message::Text(message.to_string().into()))
            .unwrap();
    }

    async fn next_message(&mut self) -> Value {
        tokio::time::timeout(WAIT, self.from_client.recv())
            .await
            .expect("timed out waiting for a client message")
            .expect("client connection ended")
    }

    async fn assert_quiet(&mut self) {
        if let Ok(Some(message)) = tokio::time::timeout(QUIET, self.from_client.recv()).await {
            panic!("unexpected client message: {}", message);
        }
    }
}

/// Playback stand-in recording every call in order.
#[derive(Default)]
struct RecordingSink {
    calls: Mutex<Vec<String>>,
    enqueued: Mutex<Vec<Vec<u8>>>,
}

impl RecordingSink {
    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

impl AudioSink for RecordingSink {
    fn enqueue(&self, pcm: &[u8]) -> Result<ScheduledSlot, PlaybackError> {
        self.calls.lock().unwrap().push(format!("enqueue:{}", pcm.len()));
        self.enqueued.lock().unwrap().push(pcm.to_vec());
        Ok(ScheduledSlot {
            start_frame: 0,
            end_frame: pcm.len() as u64 / 2,
        })
    }

    fn flush(&self) {
        self.calls.lock().unwrap().push("flush".to_string());
    }

    fn stop(&self) {
        self.calls.lock().unwrap().push("stop".to_string());
    }
}

/// Output device that only counts how often it was acquired.
#[derive(Clone, Default)]
struct CountingOutput {
    opened: Arc<AtomicUsize>,
}

impl OutputDevice for CountingOutput {
    fn open(&self, _timeline: SharedTimeline) -> Result<OutputGuard, PlaybackError> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(()))
    }
}

async fn next_event(events: &mut mpsc::UnboundedReceiver<ClientEvent>) -> ClientEvent {
    loop {
        let event = tokio::time::timeout(WAIT, events.recv())
            .await
            .expect("timed out waiting for an event")
            .expect("event channel closed");
        if !matches!(event, ClientEvent::Log(_)) {
            return event;
        }
    }
}

async fn active_client(
    service: &mut MockService,
    sink: Arc<dyn AudioSink>,
) -> (LiveClient, mpsc::UnboundedReceiver<ClientEvent>) {
    let (client, mut events) = LiveClient::new(ClientConfig::default(), sink);
    client
        .open(&service.endpoint(), SessionConfig::new("m1"))
        .await
        .unwrap();
    assert_eq!(service.next_message().await, json!({"setup": {"model": "m1"}}));

    service.send(json!({"setupComplete": {}}));
    assert_eq!(next_event(&mut events).await, ClientEvent::Open);
    assert_eq!(client.state(), ConnectionState::Active);
    (client, events)
}

fn audio_message(pcm: &[u8]) -> Value {
    json!({
        "serverContent": {
            "modelTurn": {
                "role": "model",
                "parts": [{"inlineData": {"mimeType": "audio/pcm;rate=24000", "data": STANDARD.encode(pcm)}}]
            }
        }
    })
}

fn response(id: &str) -> FunctionResponse {
    FunctionResponse {
        id: id.to_string(),
        name: "x".to_string(),
        response: json!({"ok": true}),
    }
}

#[test_log::test(tokio::test)]
async fn test_content_turn_then_audio_reaches_playback_once() {
    let mut service = MockService::start().await;
    let sink = Arc::new(RecordingSink::default());
    let (client, mut events) = active_client(&mut service, sink.clone()).await;

    client.send_content(vec![Part::text("hi")], true).unwrap();
    assert_eq!(
        service.next_message().await,
        json!({"clientContent": {"turns": [{"role": "user", "parts": [{"text": "hi"}]}], "turnComplete": true}})
    );
    service.assert_quiet().await;

    let pcm: Vec<u8> = (0..320).map(|i| i as u8).collect();
    service.send(audio_message(&pcm));
    assert_eq!(next_event(&mut events).await, ClientEvent::Audio(pcm.clone()));
    assert_eq!(*sink.enqueued.lock().unwrap(), vec![pcm]);

    client.close().await;
}

#[tokio::test]
async fn test_cancelled_call_is_never_answered() {
    let mut service = MockService::start().await;
    let (client, mut events) = active_client(&mut service, Arc::new(RecordingSink::default())).await;

    service.send(json!({"toolCall": {"functionCalls": [{"id": "1", "name": "x"}]}}));
    service.send(json!({"toolCallCancellation": {"ids": ["1"]}}));

    match next_event(&mut events).await {
        ClientEvent::ToolCall(calls) => {
            assert_eq!(calls.len(), 1);
            assert_eq!(calls[0].id, "1");
            assert_eq!(calls[0].name, "x");
        }
        other => panic!("expected toolcall, got {:?}", other),
    }
    assert_eq!(
        next_event(&mut events).await,
        ClientEvent::ToolCallCancellation(vec!["1".to_string()])
    );

    client.send_tool_response(vec![response("1")]).unwrap();
    service.assert_quiet().await;

    client.close().await;
}

#[tokio::test]
async fn test_tool_responses_are_a_subset_and_sent_once() {
    let mut service = MockService::start().await;
    let (client, mut events) = active_client(&mut service, Arc::new(RecordingSink::default())).await;

    service.send(json!({"toolCall": {"functionCalls": [
        {"id": "a", "name": "x", "args": {}},
        {"id": "b", "name": "x", "args": {}}
    ]}}));
    assert!(matches!(next_event(&mut events).await, ClientEvent::ToolCall(_)));

    client
        .send_tool_response(vec![response("a"), response("unknown")])
        .unwrap();
    let sent = service.next_message().await;
    let ids: Vec<&str> = sent["toolResponse"]["functionResponses"]
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["id"].as_str().unwrap())
        .collect();
    assert_eq!(ids, vec!["a"]);

    client.send_tool_response(vec![response("a")]).unwrap();
    service.assert_quiet().await;

    client.send_tool_response(vec![response("b")]).unwrap();
    assert_eq!(
        service.next_message().await["toolResponse"]["functionResponses"][0]["id"],
        "b"
    );

    client.close().await;
}

#[tokio::test]
async fn test_sends_fail_fast_outside_active() {
    let mut service = MockService::start().await;
    let (client, mut events) = LiveClient::new(ClientConfig::default(), Arc::new(RecordingSink::default()));

    assert!(matches!(
        client.send_content(vec![Part::text("early")], true),
        Err(LiveError::NotConnected(_))
    ));

    client
        .open(&service.endpoint(), SessionConfig::new("m1"))
        .await
        .unwrap();
    assert_eq!(client.state(), ConnectionState::AwaitingSetupAck);
    assert!(service.next_message().await.get("setup").is_some());

    assert!(matches!(
        client.send_content(vec![Part::text("too soon")], true),
        Err(LiveError::NotConnected(_))
    ));
    assert!(matches!(
        client.send_tool_response(vec![response("1")]),
        Err(LiveError::NotConnected(_))
    ));
    service.assert_quiet().await;

    service.send(json!({"setupComplete": {}}));
    tokio::time::timeout(WAIT, client.wait_for_state(ConnectionState::Active))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(next_event(&mut events).await, ClientEvent::Open);

    client.close().await;
    assert!(matches!(
        client.send_content(vec![Part::text("late")], true),
        Err(LiveError::NotConnected(_))
    ));
}

#[tokio::test]
async fn test_interrupted_flag_flushes_before_new_audio() {
    let mut service = MockService::start().await;
    let sink = Arc::new(RecordingSink::default());
    let (client, mut events) = active_client(&mut service, sink.clone()).await;

    service.send(audio_message(&[1, 0, 2, 0]));
    service.send(json!({"serverContent": {"interrupted": true}}));
    service.send(audio_message(&[3, 0, 4, 0, 5, 0]));

    assert!(matches!(next_event(&mut events).await, ClientEvent::Audio(_)));
    assert_eq!(next_event(&mut events).await, ClientEvent::Interrupted);
    assert!(matches!(next_event(&mut events).await, ClientEvent::Audio(_)));
    assert_eq!(sink.calls(), vec!["enqueue:4", "flush", "enqueue:6"]);

    client.close().await;
}

#[tokio::test]
async fn test_interruption_keeps_output_device_open() {
    let mut service = MockService::start().await;
    let device = CountingOutput::default();
    let scheduler = PlaybackScheduler::new(PlaybackConfig::default(), device.clone());
    let (client, mut events) = active_client(&mut service, Arc::new(scheduler.clone())).await;

    service.send(audio_message(&[1, 0, 2, 0]));
    service.send(json!({"serverContent": {"interrupted": true}}));
    service.send(audio_message(&[3, 0, 4, 0, 5, 0]));

    assert!(matches!(next_event(&mut events).await, ClientEvent::Audio(_)));
    assert_eq!(next_event(&mut events).await, ClientEvent::Interrupted);
    assert!(matches!(next_event(&mut events).await, ClientEvent::Audio(_)));
    assert_eq!(device.opened.load(Ordering::SeqCst), 1);
    assert_eq!(scheduler.queued_buffers(), 1);
    assert!(scheduler.is_active());

    client.close().await;
    assert!(!scheduler.is_active());
}

#[tokio::test]
async fn test_unknown_parts_do_not_drop_the_model_turn() {
    let mut service = MockService::start().await;
    let sink = Arc::new(RecordingSink::default());
    let (client, mut events) = active_client(&mut service, sink.clone()).await;

    service.send(json!({
        "serverContent": {
            "modelTurn": {"parts": [
                {"text": "thinking", "thought": true},
                {"fileData": {"mimeType": "image/png", "fileUri": "gs://bucket/a.png"}},
                {"inlineData": {"mimeType": "audio/pcm;rate=24000", "data": STANDARD.encode([7u8, 0, 8, 0])}}
            ]},
            "turnComplete": true
        }
    }));

    assert_eq!(
        next_event(&mut events).await,
        ClientEvent::Content(Part::text("thinking"))
    );
    match next_event(&mut events).await {
        ClientEvent::Content(Part::Other(value)) => {
            assert_eq!(value["fileData"]["fileUri"], "gs://bucket/a.png");
        }
        other => panic!("expected an unrecognized part, got {:?}", other),
    }
    assert_eq!(
        next_event(&mut events).await,
        ClientEvent::Audio(vec![7, 0, 8, 0])
    );
    assert_eq!(next_event(&mut events).await, ClientEvent::TurnComplete);
    assert_eq!(sink.calls(), vec!["enqueue:4"]);
    assert!(!client
        .session_log()
        .iter()
        .any(|entry| entry.tag == "server.unknown"));

    client.close().await;
}

#[tokio::test]
async fn test_json_in_binary_frames_is_handled_like_text() {
    let mut service = MockService::start().await;
    let (client, mut events) = LiveClient::new(ClientConfig::default(), Arc::new(RecordingSink::default()));
    client
        .open(&service.endpoint(), SessionConfig::new("m1"))
        .await
        .unwrap();
    service.next_message().await;

    let ack = json!({"setupComplete": {}}).to_string().into_bytes();
    service.to_client.send(Message::Binary(ack.into())).unwrap();
    assert_eq!(next_event(&mut events).await, ClientEvent::Open);

    let done = json!({"serverContent": {"turnComplete": true}}).to_string().into_bytes();
    service.to_client.send(Message::Binary(done.into())).unwrap();
    assert_eq!(next_event(&mut events).await, ClientEvent::TurnComplete);

    client.close().await;
}

#[tokio::test]
async fn test_interruption_marker_discards_rest_of_message() {
    let mut service = MockService::start().await;
    let sink = Arc::new(RecordingSink::default());
    let (client, mut events) = active_client(&mut service, sink.clone()).await;

    service.send(json!({
        "serverContent": {
            "modelTurn": {"parts": [
                {"text": "interrupted"},
                {"inlineData": {"mimeType": "audio/pcm;rate=24000", "data": STANDARD.encode([9u8, 9])}}
            ]}
        }
    }));
    service.send(json!({"serverContent": {"turnComplete": true}}));

    assert_eq!(next_event(&mut events).await, ClientEvent::Interrupted);
    assert_eq!(next_event(&mut events).await, ClientEvent::TurnComplete);
    assert_eq!(sink.calls(), vec!["flush"]);

    client.close().await;
}

#[tokio::test]
async fn test_parts_surface_in_order_before_turn_complete() {
    let mut service = MockService::start().await;
    let (client, mut events) = active_client(&mut service, Arc::new(RecordingSink::default())).await;

    service.send(json!({
        "serverContent": {
            "modelTurn": {"parts": [
                {"text": "hello"},
                {"executableCode": {"language": "PYTHON", "code": "print(1)"}}
            ]},
            "turnComplete": true
        }
    }));

    assert_eq!(
        next_event(&mut events).await,
        ClientEvent::Content(Part::text("hello"))
    );
    assert!(matches!(
        next_event(&mut events).await,
        ClientEvent::Content(Part::ExecutableCode(_))
    ));
    assert_eq!(next_event(&mut events).await, ClientEvent::TurnComplete);

    client.close().await;
}

#[tokio::test]
async fn test_messages_before_setup_complete_are_discarded() {
    let mut service = MockService::start().await;
    let (client, mut events) = LiveClient::new(ClientConfig::default(), Arc::new(RecordingSink::default()));
    client
        .open(&service.endpoint(), SessionConfig::new("m1"))
        .await
        .unwrap();
    service.next_message().await;

    service.send(json!({"toolCall": {"functionCalls": [{"id": "1", "name": "x"}]}}));
    service.send(json!({"setupComplete": {}}));

    // The early tool call produces no event; the next one is the readiness signal.
    assert_eq!(next_event(&mut events).await, ClientEvent::Open);
    assert!(client
        .session_log()
        .iter()
        .any(|entry| entry.tag == "server.toolCall"));

    client.close().await;
}

#[tokio::test]
async fn test_unrecognized_message_is_logged_not_fatal() {
    let mut service = MockService::start().await;
    let (client, mut events) = active_client(&mut service, Arc::new(RecordingSink::default())).await;

    service.send(json!({"somethingNew": {"x": 1}}));
    service.send(json!({"serverContent": {"turnComplete": true}}));

    assert_eq!(next_event(&mut events).await, ClientEvent::TurnComplete);
    assert_eq!(client.state(), ConnectionState::Active);
    assert!(client
        .session_log()
        .iter()
        .any(|entry| entry.tag == "server.unknown"));

    client.close().await;
}

#[tokio::test]
async fn test_every_message_is_logged() {
    let mut service = MockService::start().await;
    let (client, _events) = active_client(&mut service, Arc::new(RecordingSink::default())).await;

    client.send_content(vec![Part::text("one")], true).unwrap();
    service.next_message().await;

    let tags: Vec<String> = client.session_log().into_iter().map(|e| e.tag).collect();
    assert_eq!(
        tags,
        vec!["client.setup", "server.setupComplete", "client.clientContent"]
    );

    client.close().await;
}

#[tokio::test]
async fn test_remote_close_stops_playback() {
    let mut service = MockService::start().await;
    let sink = Arc::new(RecordingSink::default());
    let (client, mut events) = active_client(&mut service, sink.clone()).await;

    service.to_client.send(Message::Close(None)).unwrap();
    assert!(matches!(next_event(&mut events).await, ClientEvent::Close(_)));
    assert_eq!(client.state(), ConnectionState::Closed);
    assert!(sink.calls().contains(&"stop".to_string()));

    // Already closed: nothing further.
    client.close().await;
    assert_eq!(client.state(), ConnectionState::Closed);
}

#[tokio::test]
async fn test_close_is_idempotent_and_allows_reopen() {
    let mut service = MockService::start().await;
    let sink = Arc::new(RecordingSink::default());
    let (client, mut events) = active_client(&mut service, sink.clone()).await;

    client.close().await;
    assert!(matches!(next_event(&mut events).await, ClientEvent::Close(_)));
    assert_eq!(client.state(), ConnectionState::Closed);
    assert_eq!(sink.calls(), vec!["stop"]);

    // The service sees the transport go away.
    assert!(tokio::time::timeout(WAIT, service.from_client.recv())
        .await
        .unwrap()
        .is_none());

    client.close().await;
    while let Ok(event) = events.try_recv() {
        assert!(!matches!(event, ClientEvent::Close(_)), "second close emitted an event");
    }

    let mut second = MockService::start().await;
    client
        .open(&second.endpoint(), SessionConfig::new("m2"))
        .await
        .unwrap();
    assert_eq!(second.next_message().await, json!({"setup": {"model": "m2"}}));
    assert_eq!(client.session_config().unwrap().model, "m2");

    client.close().await;
}

#[tokio::test]
async fn test_connection_failure_is_absorbing() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let endpoint = Endpoint::relay(&format!("ws://{}", listener.local_addr().unwrap())).unwrap();
    drop(listener);

    let (client, mut events) = LiveClient::new(ClientConfig::default(), Arc::new(RecordingSink::default()));
    let result = client.open(&endpoint, SessionConfig::new("m1")).await;
    assert!(matches!(result, Err(LiveError::Connection(_))));
    assert_eq!(client.state(), ConnectionState::Errored);

    assert!(matches!(next_event(&mut events).await, ClientEvent::Error(_)));
    assert!(matches!(next_event(&mut events).await, ClientEvent::Close(_)));

    assert!(matches!(
        client.open(&endpoint, SessionConfig::new("m1")).await,
        Err(LiveError::InvalidState { operation: "open", .. })
    ));
    assert!(client.wait_for_state(ConnectionState::Active).await.is_err());
}

/// Microphone the test feeds by hand.
#[derive(Clone, Default)]
struct ManualInput {
    callback: Arc<Mutex<Option<SampleCallback>>>,
}

impl ManualInput {
    fn feed(&self, samples: &[f32]) {
        if let Some(callback) = self.callback.lock().unwrap().as_mut() {
            callback(samples);
        }
    }
}

struct Release(Arc<Mutex<Option<SampleCallback>>>);

impl Drop for Release {
    fn drop(&mut self) {
        self.0.lock().unwrap().take();
    }
}

impl InputDevice for ManualInput {
    fn open(&self, _rate: u32, on_samples: SampleCallback) -> Result<InputGuard, CaptureError> {
        *self.callback.lock().unwrap() = Some(on_samples);
        Ok(Box::new(Release(self.callback.clone())))
    }
}

#[tokio::test]
async fn test_capture_frames_forwarded_as_realtime_input() {
    let mut service = MockService::start().await;
    let device = ManualInput::default();
    let pipeline = CapturePipeline::new(CaptureConfig::default(), device.clone());

    let (idle, _events) = LiveClient::new(ClientConfig::default(), Arc::new(RecordingSink::default()));
    assert!(matches!(
        idle.start_capture(&pipeline),
        Err(LiveError::NotConnected(_))
    ));
    assert!(!pipeline.is_capturing());

    let (client, _events) = active_client(&mut service, Arc::new(RecordingSink::default())).await;
    client.start_capture(&pipeline).unwrap();
    assert!(pipeline.is_capturing());

    device.feed(&[0.25; 512]);
    let message = service.next_message().await;
    let chunk = &message["realtimeInput"]["mediaChunks"][0];
    assert_eq!(chunk["mimeType"], "audio/pcm;rate=16000");
    let bytes = STANDARD.decode(chunk["data"].as_str().unwrap()).unwrap();
    assert_eq!(bytes.len(), 1024);

    client.close().await;
    assert!(!pipeline.is_capturing());
}
