//! Integration tests for StreamRelay
//!
//! These drive a full relay (state actor, bus, agent socket, binding
//! handshake) with a scripted upstream agent on the Unix socket and an
//! in-process downstream transport.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, oneshot};

use streamrelay::agentlink::{AgentLink, create_listener_at};
use streamrelay::binding::{BindingHandshake, BindingOffers, BindingOutcome, DecodeError, OpticalDecoder};
use streamrelay::bus::{EventBus, InMemoryBus};
use streamrelay::domain::{Destination, TraceStatus};
use streamrelay::relay::{Relay, RelayOptions, RelayOutcome};
use streamrelay::state::StateManager;
use streamrelay::stream::{SessionSettings, StreamState};
use streamrelay::transport::{ChannelTransport, OutboundFrame};

/// Treats the last path segment of the image URL as the decoded payload
struct PathDecoder;

#[async_trait]
impl OpticalDecoder for PathDecoder {
    async fn decode(&self, image_url: &str) -> Result<String, DecodeError> {
        image_url
            .rsplit('/')
            .next()
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .ok_or(DecodeError::Empty)
    }
}

struct Fixture {
    _temp: TempDir,
    relay: Relay,
    state: StateManager,
    socket_path: std::path::PathBuf,
    _stop: oneshot::Sender<()>,
}

async fn fixture() -> Fixture {
    let temp = TempDir::new().expect("Failed to create temp dir");
    let state = StateManager::spawn(temp.path().join("store")).unwrap();
    let bus: Arc<dyn EventBus> = Arc::new(InMemoryBus::default());

    let offers = Arc::new(BindingOffers::new(Duration::from_secs(600)));
    let handshake = BindingHandshake::new(state.clone(), offers, Arc::new(PathDecoder));
    let options = RelayOptions {
        session: SessionSettings {
            idle_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(20),
            summary_grace: Duration::from_millis(300),
            ..SessionSettings::default()
        },
        ..RelayOptions::default()
    };
    let relay = Relay::new(state.clone(), bus.clone(), handshake, options);

    let socket_path = temp.path().join("agents.sock");
    let (listener, path) = create_listener_at(&socket_path).unwrap();
    let (stop, stopped) = oneshot::channel::<()>();
    tokio::spawn(AgentLink::new(state.clone(), bus).serve(listener, path, async move {
        let _ = stopped.await;
    }));

    Fixture {
        _temp: temp,
        relay,
        state,
        socket_path,
        _stop: stop,
    }
}

/// Scripted upstream agent
struct Agent {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl Agent {
    async fn connect(path: &Path, agent_token: &str) -> Self {
        let stream = UnixStream::connect(path).await.unwrap();
        let (reader, writer) = stream.into_split();
        let mut agent = Self {
            lines: BufReader::new(reader).lines(),
            writer,
        };
        agent.send(json!({"type": "connect", "agent_token": agent_token})).await;
        assert_eq!(agent.recv().await["type"], "connected");
        agent
    }

    async fn send(&mut self, value: Value) {
        self.writer.write_all(value.to_string().as_bytes()).await.unwrap();
        self.writer.write_all(b"\n").await.unwrap();
        self.writer.flush().await.unwrap();
    }

    async fn recv(&mut self) -> Value {
        let line = tokio::time::timeout(Duration::from_secs(5), self.lines.next_line())
            .await
            .expect("agent read timed out")
            .unwrap()
            .unwrap();
        serde_json::from_str(&line).unwrap()
    }

    async fn chunk(&mut self, session_id: &str, sequence: u64, content: &str) {
        self.send(json!({
            "type": "stream_chunk",
            "content": content,
            "sequence": sequence,
            "session_id": session_id
        }))
        .await;
    }
}

fn chat_request(message_id: &str, text: &str) -> streamrelay::RelayRequest {
    serde_json::from_value(json!({
        "message_id": message_id,
        "agent_id": "glasses-1",
        "user_id": "user-1",
        "message": [{"role": "user", "content": text}]
    }))
    .unwrap()
}

fn photo_request(message_id: &str, url: &str) -> streamrelay::RelayRequest {
    serde_json::from_value(json!({
        "message_id": message_id,
        "agent_id": "glasses-1",
        "user_id": "user-1",
        "message": [{"role": "user", "type": "image", "image_url": url}]
    }))
    .unwrap()
}

async fn collect(mut rx: mpsc::Receiver<OutboundFrame>) -> Vec<OutboundFrame> {
    let mut frames = Vec::new();
    while let Some(frame) = rx.recv().await {
        frames.push(frame);
    }
    frames
}

fn answers(frames: &[OutboundFrame]) -> Vec<(String, bool)> {
    frames
        .iter()
        .filter(|f| f.name() == Some("message"))
        .filter_map(|f| f.data())
        .map(|d| {
            (
                d["answer_stream"].as_str().unwrap_or_default().to_string(),
                d["is_finish"].as_bool().unwrap_or(false),
            )
        })
        .collect()
}

async fn bind_device(f: &Fixture, dest_id: &str) {
    // First contact: no destination, the relay asks for a photo
    let (transport, rx) = ChannelTransport::pair(16);
    let outcome = f.relay.handle(chat_request("bind-1", "hello"), None, transport).await;
    assert!(matches!(outcome, RelayOutcome::BindingOffered));
    let frames = collect(rx).await;
    assert_eq!(frames[1].data().unwrap()["tool_call"]["command"], "take_photo");

    // The photo carries a freshly issued token
    let token = f.state.issue_token(dest_id, 300_000).await.unwrap();
    let (transport, rx) = ChannelTransport::pair(16);
    let url = format!("https://images.example/{}", token.token);
    let outcome = f.relay.handle(photo_request("bind-1", &url), None, transport).await;
    assert!(matches!(outcome, RelayOutcome::Binding(BindingOutcome::Bound(_))));
    let frames = collect(rx).await;
    assert!(answers(&frames)[0].0.contains("Kitchen"));
}

#[tokio::test]
async fn test_bind_then_stream_out_of_order() {
    let f = fixture().await;
    let dest = Destination::new("Kitchen");
    let dest_id = dest.id.clone();
    let agent_token = dest.agent_token.clone();
    f.state.create_destination(dest).await.unwrap();

    bind_device(&f, &dest_id).await;
    let bound = f.state.get_destination(&dest_id).await.unwrap().unwrap();
    assert_eq!(bound.bound_device_id.as_deref(), Some("glasses-1"));
    assert_eq!(bound.bound_user_id.as_deref(), Some("user-1"));

    // Agent connects, which also marks the destination online
    let mut agent = Agent::connect(&f.socket_path, &agent_token).await;

    let (transport, rx) = ChannelTransport::pair(16);
    let relay = f.relay.clone();
    let session = tokio::spawn(async move { relay.handle(chat_request("m1", "say hello"), None, transport).await });

    let command = agent.recv().await;
    assert_eq!(command["type"], "execute");
    assert_eq!(command["params"]["message"], "say hello");
    assert_eq!(command["metadata"]["session_id"], "m1");

    agent.chunk("m1", 1, "lo").await;
    agent.chunk("m1", 0, "Hel").await;
    agent.send(json!({"type": "stream_end", "session_id": "m1"})).await;

    let outcome = session.await.unwrap();
    let RelayOutcome::Streamed(outcome) = outcome else {
        panic!("expected a streamed outcome, got {:?}", outcome);
    };
    assert_eq!(outcome.state, StreamState::Completed);
    assert_eq!(outcome.trace.status, TraceStatus::Completed);

    let frames = collect(rx).await;
    assert_eq!(
        answers(&frames),
        vec![
            ("Hel".to_string(), false),
            ("lo".to_string(), false),
            (String::new(), true),
        ]
    );
    assert_eq!(frames.last().unwrap().name(), Some("done"));
    assert_eq!(frames.iter().filter(|f| f.name() == Some("done")).count(), 1);

    let stored = f.state.get_trace(&outcome.trace.id).await.unwrap().unwrap();
    assert_eq!(stored.downstream_content, "Hello");
    assert_eq!(stored.downstream_fragment_count, 2);
}

#[tokio::test]
async fn test_lost_suffix_is_compensated_from_summary() {
    let f = fixture().await;
    let dest = Destination::new("Kitchen");
    let dest_id = dest.id.clone();
    let agent_token = dest.agent_token.clone();
    f.state.create_destination(dest).await.unwrap();
    bind_device(&f, &dest_id).await;

    let mut agent = Agent::connect(&f.socket_path, &agent_token).await;
    let (transport, rx) = ChannelTransport::pair(32);
    let relay = f.relay.clone();
    let session = tokio::spawn(async move { relay.handle(chat_request("m2", "story"), None, transport).await });
    agent.recv().await;

    let full = "The quick brown fox jumps over the lazy dog, then naps in the sun.";
    let head: String = full.chars().take(12).collect();
    agent.chunk("m2", 0, &head).await;
    agent.send(json!({"type": "stream_end", "session_id": "m2"})).await;
    agent
        .send(json!({
            "type": "stream_summary",
            "total_content": full,
            "total_chunks": 5,
            "session_id": "m2"
        }))
        .await;

    let outcome = session.await.unwrap();
    let RelayOutcome::Streamed(outcome) = outcome else {
        panic!("expected a streamed outcome, got {:?}", outcome);
    };
    assert_eq!(outcome.trace.status, TraceStatus::Anomaly);
    assert!(outcome.trace.compensated);

    let frames = collect(rx).await;
    let delivered: String = answers(&frames).iter().map(|(text, _)| text.as_str()).collect();
    assert_eq!(delivered, full);
    assert_eq!(frames.last().unwrap().name(), Some("done"));
}

#[tokio::test]
async fn test_second_user_cannot_take_bound_destination() {
    let f = fixture().await;
    let dest = Destination::new("Kitchen");
    let dest_id = dest.id.clone();
    f.state.create_destination(dest).await.unwrap();
    let token = f.state.issue_token(&dest_id, 300_000).await.unwrap();
    let url = format!("https://images.example/{}", token.token);

    bind_device(&f, &dest_id).await;

    // A second device and user presenting a valid token for it is refused
    let offer: streamrelay::RelayRequest = serde_json::from_value(json!({
        "message_id": "b2",
        "agent_id": "glasses-2",
        "user_id": "user-2",
        "message": [{"role": "user", "content": "hi"}]
    }))
    .unwrap();
    let (transport, _rx) = ChannelTransport::pair(16);
    let outcome = f.relay.handle(offer, None, transport).await;
    assert!(matches!(outcome, RelayOutcome::BindingOffered));

    let first = f.state.get_token(&token.token).await.unwrap().unwrap();
    assert!(!first.is_used(), "bind_device issued its own token");

    let photo: streamrelay::RelayRequest = serde_json::from_value(json!({
        "message_id": "b2",
        "agent_id": "glasses-2",
        "user_id": "user-2",
        "message": [{"role": "user", "type": "image", "image_url": url}]
    }))
    .unwrap();
    let (transport, rx) = ChannelTransport::pair(16);
    let outcome = f.relay.handle(photo, None, transport).await;
    assert!(matches!(
        outcome,
        RelayOutcome::Binding(BindingOutcome::Rejected(streamrelay::BindingError::Conflict))
    ));
    let frames = collect(rx).await;
    assert!(answers(&frames)[0].0.contains("already bound"));

    let used = f.state.list_destinations().await.unwrap();
    assert_eq!(used.len(), 1);
    assert_eq!(used[0].bound_device_id.as_deref(), Some("glasses-1"));
}
