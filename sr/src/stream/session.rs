//! Stream session - the task that owns one stream
//!
//! Drains the stream's bus subscription with a bounded wait, reassembles
//! fragments, writes them downstream, and ends the stream on an end marker,
//! an error marker, idle timeout, or client disconnect. Teardown always
//! unsubscribes and finalizes the trace.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};

use super::compensator::{Compensator, LossThresholds, StreamSummary};
use super::monitor::{IdleMonitor, StreamState};
use super::reassembler::{Ingest, Reassembler};
use crate::bus::{EventBus, Subscription};
use crate::domain::TraceRecord;
use crate::protocol::{AgentMessage, EVENT_DONE, EVENT_MESSAGE, FragmentEvent};
use crate::trace::TraceRecorder;
use crate::transport::{Transport, TransportError};

/// Text delivered when the upstream agent stops responding
pub const TIMEOUT_MESSAGE: &str = "Request timed out. The destination may be offline or slow, please try again later.";

/// Timing and loss knobs for a session
#[derive(Debug, Clone, Copy)]
pub struct SessionSettings {
    pub idle_timeout: Duration,
    pub poll_interval: Duration,
    /// How long to keep draining for a summary after the end marker
    pub summary_grace: Duration,
    pub thresholds: LossThresholds,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(60),
            poll_interval: Duration::from_millis(100),
            summary_grace: Duration::from_millis(1000),
            thresholds: LossThresholds::default(),
        }
    }
}

/// How a session ended
#[derive(Debug)]
pub struct SessionOutcome {
    pub state: StreamState,
    pub client_closed: bool,
    pub trace: TraceRecord,
}

enum Step {
    Inbound(Result<serde_json::Value, RecvError>),
    ClientGone,
    Tick,
}

enum Flow {
    Continue,
    /// Terminal frames already written
    Stop,
    /// Write the closing `is_finish` message and `done`
    Finish,
}

/// One stream, from command dispatch to teardown
pub struct StreamSession<T: Transport> {
    stream_id: String,
    agent_id: String,
    bus: Arc<dyn EventBus>,
    subscription: Subscription,
    transport: T,
    reassembler: Reassembler,
    monitor: IdleMonitor,
    compensator: Compensator,
    recorder: TraceRecorder,
    settings: SessionSettings,
    grace_deadline: Option<Instant>,
    client_closed: bool,
}

impl<T: Transport> StreamSession<T> {
    pub fn new(
        stream_id: impl Into<String>,
        agent_id: impl Into<String>,
        bus: Arc<dyn EventBus>,
        subscription: Subscription,
        transport: T,
        recorder: TraceRecorder,
        settings: SessionSettings,
    ) -> Self {
        let stream_id = stream_id.into();
        debug!(%stream_id, topic = subscription.topic(), "StreamSession::new: called");
        Self {
            reassembler: Reassembler::new(stream_id.clone()),
            stream_id,
            agent_id: agent_id.into(),
            bus,
            subscription,
            transport,
            monitor: IdleMonitor::new(settings.idle_timeout, Instant::now()),
            compensator: Compensator::new(settings.thresholds),
            recorder,
            settings,
            grace_deadline: None,
            client_closed: false,
        }
    }

    /// Drive the stream to a terminal state, then tear down
    pub async fn run(mut self) -> SessionOutcome {
        info!(stream_id = %self.stream_id, trace_id = %self.recorder.trace_id(), "Stream session started");

        loop {
            let now = Instant::now();
            if self.monitor.check(now) == StreamState::TimedOut {
                self.on_timeout(now).await;
                break;
            }
            if self.grace_deadline.is_some_and(|deadline| now >= deadline) {
                debug!(stream_id = %self.stream_id, "run: summary grace elapsed");
                self.finish().await;
                break;
            }

            let step = tokio::select! {
                biased;
                _ = self.transport.closed() => Step::ClientGone,
                received = self.subscription.recv() => Step::Inbound(received),
                _ = sleep(self.settings.poll_interval) => Step::Tick,
            };

            let flow = match step {
                Step::Tick => Ok(Flow::Continue),
                Step::ClientGone => {
                    self.on_client_closed();
                    break;
                }
                Step::Inbound(Ok(payload)) => {
                    self.monitor.touch(Instant::now());
                    let flow = self.on_payload(payload).await;
                    self.recorder.flush().await;
                    flow
                }
                Step::Inbound(Err(RecvError::Lagged(skipped))) => {
                    warn!(stream_id = %self.stream_id, skipped, "Stream subscription lagged");
                    self.recorder.bus_lagged(skipped);
                    Ok(Flow::Continue)
                }
                Step::Inbound(Err(RecvError::Closed)) if self.monitor.state().is_terminal() => {
                    debug!(stream_id = %self.stream_id, "run: topic closed during summary grace");
                    Ok(Flow::Finish)
                }
                Step::Inbound(Err(RecvError::Closed)) => {
                    warn!(stream_id = %self.stream_id, "Stream topic closed");
                    self.on_upstream_error("stream topic closed").await
                }
            };

            match flow {
                Ok(Flow::Continue) => {}
                Ok(Flow::Stop) => break,
                Ok(Flow::Finish) => {
                    self.finish().await;
                    break;
                }
                Err(TransportError::Closed) => {
                    self.on_client_closed();
                    break;
                }
            }
        }

        self.teardown().await
    }

    async fn on_payload(&mut self, payload: serde_json::Value) -> Result<Flow, TransportError> {
        let Some(event) = FragmentEvent::from_value(payload) else {
            debug!(stream_id = %self.stream_id, "on_payload: ignoring non-fragment payload");
            return Ok(Flow::Continue);
        };
        if !event.belongs_to(&self.stream_id) {
            debug!(stream_id = %self.stream_id, other = ?event.session_id(), "on_payload: ignoring foreign session");
            return Ok(Flow::Continue);
        }

        match event {
            FragmentEvent::StreamChunk { content, sequence, .. } => {
                self.on_chunk(sequence, content.unwrap_or_default()).await
            }
            FragmentEvent::StreamEnd { .. } => Ok(self.on_end()),
            FragmentEvent::StreamError { error, .. } => {
                let message = error.unwrap_or_else(|| "unknown error".to_string());
                self.on_upstream_error(&message).await
            }
            FragmentEvent::StreamSummary {
                total_content,
                total_chunks,
                content_hash,
                ..
            } => {
                let summary = StreamSummary {
                    total_content,
                    total_fragments: total_chunks,
                    content_hash,
                };
                self.on_summary(&summary).await
            }
        }
    }

    async fn on_chunk(&mut self, sequence: Option<u64>, content: String) -> Result<Flow, TransportError> {
        self.recorder.fragment_received(sequence, &content, Instant::now());

        match self.reassembler.ingest(sequence, content) {
            Ingest::Released(items) => {
                for item in items {
                    if item.content.is_empty() {
                        debug!(stream_id = %self.stream_id, sequence = ?item.sequence, "on_chunk: skipping empty fragment");
                        self.recorder.fragment_skipped(item.sequence);
                        continue;
                    }
                    let msg = AgentMessage::answer(&self.stream_id, &self.agent_id, item.content.as_str(), false);
                    self.transport.write_event(EVENT_MESSAGE, &msg.to_value()).await?;
                    self.recorder.fragment_delivered(item.sequence, &item.content);
                }
            }
            Ingest::Buffered => {}
            Ingest::Duplicate => self.recorder.duplicate_dropped(sequence),
        }

        self.recorder.detect();
        Ok(Flow::Continue)
    }

    fn on_end(&mut self) -> Flow {
        if !self.monitor.complete() {
            debug!(stream_id = %self.stream_id, "on_end: repeated end marker");
            return Flow::Continue;
        }
        info!(stream_id = %self.stream_id, delivered = self.reassembler.delivered_length(), "Stream ended");
        let now = Instant::now();
        self.recorder.stream_end(self.reassembler.next_expected(), now);

        if self.compensator.is_reconciled() || self.settings.summary_grace.is_zero() {
            Flow::Finish
        } else {
            self.grace_deadline = Some(now + self.settings.summary_grace);
            Flow::Continue
        }
    }

    async fn on_summary(&mut self, summary: &StreamSummary) -> Result<Flow, TransportError> {
        self.recorder.summary_received(summary);
        let downstream = self.recorder.trace().downstream_fragment_count;
        let Some(reconciliation) =
            self.compensator
                .reconcile(summary, downstream, self.reassembler.delivered_length())
        else {
            return Ok(Flow::Continue);
        };

        if let Some(ref suffix) = reconciliation.compensation {
            info!(stream_id = %self.stream_id, chars = suffix.chars().count(), "Sending compensation");
            let msg = AgentMessage::answer(&self.stream_id, &self.agent_id, suffix.as_str(), false);
            self.transport.write_event(EVENT_MESSAGE, &msg.to_value()).await?;
            self.reassembler.note_delivered(suffix);
            self.recorder.compensation_sent(suffix);
            // The suffix covers every fragment the summary counted
            let dropped = self.reassembler.seal(summary.total_fragments);
            if !dropped.is_empty() {
                debug!(stream_id = %self.stream_id, ?dropped, "on_summary: buffered fragments covered by compensation");
            }
        }
        self.recorder.reconciled(reconciliation);
        self.recorder.detect();

        if self.monitor.state() == StreamState::Completed {
            Ok(Flow::Finish)
        } else {
            Ok(Flow::Continue)
        }
    }

    async fn on_upstream_error(&mut self, error: &str) -> Result<Flow, TransportError> {
        if !self.monitor.fail() {
            return Ok(Flow::Continue);
        }
        warn!(stream_id = %self.stream_id, %error, "Upstream reported an error");
        self.recorder.stream_error(error);
        let msg = AgentMessage::answer(
            &self.stream_id,
            &self.agent_id,
            format!("Processing failed: {}", error),
            true,
        );
        self.transport.write_event(EVENT_MESSAGE, &msg.to_value()).await?;
        self.write_done().await?;
        Ok(Flow::Stop)
    }

    async fn on_timeout(&mut self, now: Instant) {
        let idle = now.saturating_duration_since(self.monitor.last_activity());
        warn!(stream_id = %self.stream_id, idle_ms = idle.as_millis() as u64, "Idle timeout");
        self.recorder.idle_timeout(idle.as_millis() as u64);

        let msg = AgentMessage::answer(&self.stream_id, &self.agent_id, TIMEOUT_MESSAGE, true);
        let written = match self.transport.write_event(EVENT_MESSAGE, &msg.to_value()).await {
            Ok(()) => self.write_done().await,
            Err(e) => Err(e),
        };
        if written.is_err() {
            self.on_client_closed();
        }
    }

    fn on_client_closed(&mut self) {
        if !self.client_closed {
            info!(stream_id = %self.stream_id, "Client disconnected");
            self.client_closed = true;
            self.recorder.client_closed();
        }
    }

    async fn finish(&mut self) {
        let msg = AgentMessage::answer(&self.stream_id, &self.agent_id, "", true);
        let written = match self.transport.write_event(EVENT_MESSAGE, &msg.to_value()).await {
            Ok(()) => self.write_done().await,
            Err(e) => Err(e),
        };
        if written.is_err() {
            self.on_client_closed();
        }
    }

    async fn write_done(&mut self) -> Result<(), TransportError> {
        let done = AgentMessage::done(&self.stream_id, &self.agent_id);
        self.transport.write_event(EVENT_DONE, &done.to_value()).await
    }

    async fn teardown(mut self) -> SessionOutcome {
        let abandoned = self.reassembler.release_buffered();
        if !abandoned.is_empty() {
            warn!(stream_id = %self.stream_id, ?abandoned, "Releasing undelivered buffered fragments");
        }

        self.bus.unsubscribe(self.subscription);
        let state = self.monitor.state();
        let trace = self.recorder.finalize().await;
        info!(stream_id = %self.stream_id, %state, status = %trace.status, "Stream session finished");

        SessionOutcome {
            state,
            client_closed: self.client_closed,
            trace,
        }
    }
}
