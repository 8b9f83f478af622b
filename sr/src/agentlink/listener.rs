//! Agent link listener
//!
//! Accepts upstream agent connections on a Unix Domain Socket. Each
//! connection authenticates with its destination's agent token, then
//! publishes fragment events onto the bus and receives the destination's
//! command envelopes.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use eyre::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use super::messages::{AgentControl, AgentFrame, LinkResponse};
use crate::bus::{EventBus, topics};
use crate::domain::{Destination, now_ms};
use crate::state::StateManager;

/// Largest accepted frame (summaries carry the full content)
const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Create and bind the agent socket
///
/// Handles cleanup of stale socket files from previous runs.
pub fn create_listener_at(socket_path: &Path) -> Result<(UnixListener, PathBuf)> {
    debug!(?socket_path, "create_listener_at: creating agent socket");

    // Ensure parent directory exists
    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent).context("Failed to create socket directory")?;
    }

    // Clean up stale socket if exists
    if socket_path.exists() {
        debug!(?socket_path, "create_listener_at: removing stale socket");
        std::fs::remove_file(socket_path).context("Failed to remove stale socket")?;
    }

    let listener = UnixListener::bind(socket_path).context("Failed to bind agent socket")?;
    debug!(?socket_path, "create_listener_at: socket bound successfully");

    Ok((listener, socket_path.to_path_buf()))
}

/// Remove the socket file on shutdown
pub fn cleanup_socket(socket_path: &Path) {
    if socket_path.exists() {
        debug!(?socket_path, "cleanup_socket: removing socket file");
        if let Err(e) = std::fs::remove_file(socket_path) {
            warn!(?socket_path, error = %e, "Failed to remove socket file");
        }
    }
}

async fn send_line(writer: &mut OwnedWriteHalf, line: &str) -> Result<()> {
    writer.write_all(line.as_bytes()).await.context("Failed to write frame")?;
    writer.write_all(b"\n").await.context("Failed to write newline")?;
    writer.flush().await.context("Failed to flush frame")?;
    Ok(())
}

/// Send a response on the stream
async fn send_response(writer: &mut OwnedWriteHalf, response: &LinkResponse) -> Result<()> {
    let response_json = serde_json::to_string(response).context("Failed to serialize response")?;
    send_line(writer, &response_json).await?;
    debug!(?response, "send_response: sent response");
    Ok(())
}

/// Newline-delimited frame reader that never buffers more than one frame
///
/// Partial reads stay in `buf`, so a `next_frame` future dropped by
/// `select!` loses nothing.
struct FrameReader {
    reader: BufReader<OwnedReadHalf>,
    buf: Vec<u8>,
}

impl FrameReader {
    fn new(reader: OwnedReadHalf) -> Self {
        Self {
            reader: BufReader::new(reader),
            buf: Vec::new(),
        }
    }

    async fn next_frame(&mut self) -> Result<Option<String>> {
        let budget = (MAX_FRAME_SIZE + 1).saturating_sub(self.buf.len()) as u64;
        let read = (&mut self.reader)
            .take(budget)
            .read_until(b'\n', &mut self.buf)
            .await
            .context("Failed to read agent frame")?;

        let complete = self.buf.last() == Some(&b'\n');
        if !complete && self.buf.len() > MAX_FRAME_SIZE {
            return Err(eyre::eyre!("Frame exceeds {} bytes", MAX_FRAME_SIZE));
        }
        if !complete && read == 0 && self.buf.is_empty() {
            return Ok(None);
        }

        let mut frame = std::mem::take(&mut self.buf);
        if complete {
            frame.pop();
            if frame.last() == Some(&b'\r') {
                frame.pop();
            }
        }
        String::from_utf8(frame)
            .map(Some)
            .context("Agent frame is not valid UTF-8")
    }
}

/// Serves upstream agents
#[derive(Clone)]
pub struct AgentLink {
    state: StateManager,
    bus: Arc<dyn EventBus>,
}

impl AgentLink {
    pub fn new(state: StateManager, bus: Arc<dyn EventBus>) -> Self {
        Self { state, bus }
    }

    /// Accept connections until `shutdown` resolves, then remove the socket
    pub async fn serve(self, listener: UnixListener, socket_path: PathBuf, shutdown: impl Future<Output = ()>) {
        info!(?socket_path, "Agent link listening");
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let link = self.clone();
                        tokio::spawn(async move {
                            if let Err(e) = link.handle_connection(stream).await {
                                warn!(error = %e, "Agent connection ended with error");
                            }
                        });
                    }
                    Err(e) => warn!(error = %e, "Failed to accept agent connection"),
                },
                _ = &mut shutdown => break,
            }
        }

        info!("Agent link shutting down");
        cleanup_socket(&socket_path);
    }

    /// Authenticate the first frame, returning the agent's destination
    async fn authenticate(
        &self,
        frames: &mut FrameReader,
        writer: &mut OwnedWriteHalf,
    ) -> Result<Option<Destination>> {
        let Some(line) = frames.next_frame().await? else {
            return Ok(None);
        };

        let agent_token = match AgentFrame::parse(line.trim()) {
            Ok(AgentFrame::Control(AgentControl::Connect { agent_token })) => agent_token,
            _ => {
                send_response(writer, &LinkResponse::error("Expected connect frame")).await?;
                return Ok(None);
            }
        };

        let dest = match self.state.find_destination_by_agent_token(&agent_token).await {
            Ok(Some(dest)) => dest,
            Ok(None) => {
                warn!("Agent presented an unknown token");
                send_response(writer, &LinkResponse::error("Unknown agent token")).await?;
                return Ok(None);
            }
            Err(e) => {
                send_response(writer, &LinkResponse::error(e.to_string())).await?;
                return Ok(None);
            }
        };

        if let Err(e) = self.state.touch_destination(&dest.id, now_ms()).await {
            warn!(dest_id = %dest.id, error = %e, "Failed to record agent presence");
        }
        Ok(Some(dest))
    }

    /// Serve one agent connection until either side goes away
    pub async fn handle_connection(&self, stream: UnixStream) -> Result<()> {
        debug!("handle_connection: called");
        let (reader, mut writer) = stream.into_split();
        let mut frames = FrameReader::new(reader);

        let Some(dest) = self.authenticate(&mut frames, &mut writer).await? else {
            return Ok(());
        };

        // Subscribe before acknowledging so no command published after the
        // agent sees `connected` can be missed
        let mut commands = self.bus.subscribe(&topics::commands(&dest.id));
        send_response(
            &mut writer,
            &LinkResponse::Connected {
                destination_id: dest.id.clone(),
            },
        )
        .await?;
        info!(dest_id = %dest.id, name = %dest.name, "Agent connected");

        let result = self.pump(&dest, &mut frames, &mut writer, &mut commands).await;

        self.bus.unsubscribe(commands);
        info!(dest_id = %dest.id, "Agent disconnected");
        result
    }

    async fn pump(
        &self,
        dest: &Destination,
        frames: &mut FrameReader,
        writer: &mut OwnedWriteHalf,
        commands: &mut crate::bus::Subscription,
    ) -> Result<()> {
        loop {
            tokio::select! {
                line = frames.next_frame() => {
                    let Some(line) = line? else {
                        return Ok(());
                    };
                    if line.trim().is_empty() {
                        continue;
                    }
                    if let Some(response) = self.on_frame(dest, line.trim()).await {
                        send_response(writer, &response).await?;
                    }
                }
                command = commands.recv() => match command {
                    Ok(command) => {
                        debug!(dest_id = %dest.id, "pump: forwarding command");
                        send_line(writer, &command.to_string()).await?;
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(dest_id = %dest.id, skipped, "Agent fell behind on commands");
                    }
                    Err(RecvError::Closed) => return Ok(()),
                },
            }
        }
    }

    /// Handle one frame after authentication, returning any reply
    async fn on_frame(&self, dest: &Destination, line: &str) -> Option<LinkResponse> {
        match AgentFrame::parse(line) {
            Ok(AgentFrame::Control(AgentControl::Ping)) => {
                if let Err(e) = self.state.touch_destination(&dest.id, now_ms()).await {
                    warn!(dest_id = %dest.id, error = %e, "Failed to record agent presence");
                }
                Some(LinkResponse::Pong)
            }
            Ok(AgentFrame::Control(AgentControl::Connect { .. })) => Some(LinkResponse::error("Already connected")),
            Ok(AgentFrame::Fragment(event, raw)) => {
                let Some(session_id) = event.session_id() else {
                    return Some(LinkResponse::error("Fragment is missing session_id"));
                };
                let topic = topics::stream(&dest.id, session_id);
                let seen = self.bus.publish(&topic, raw);
                debug!(%topic, kind = event.kind(), seen, "on_frame: published fragment");
                if seen == 0 {
                    debug!(%topic, "No session listening for fragment");
                }
                None
            }
            Err(message) => Some(LinkResponse::Error { message }),
        }
    }
}
