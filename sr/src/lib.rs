//! StreamRelay - streaming relay between upstream agents and downstream clients
//!
//! A downstream client opens a stream over SSE; the relay resolves the
//! destination bound to the client's device, dispatches a command to that
//! destination's upstream agent over the event bus, and relays the agent's
//! fragment events back in order.
//!
//! # Core Concepts
//!
//! - **One Task Per Stream**: a stream's reassembly, idle monitoring and
//!   compensation state is owned by exactly one task, no locks
//! - **Ordered Delivery**: fragments are released strictly by sequence
//! - **Loss Compensation**: the upstream summary backfills a lost suffix once
//! - **Traced**: every stream leaves a persistent timeline with loss analysis
//!
//! # Modules
//!
//! - [`stream`] - Reassembler, idle monitor, compensator and the session loop
//! - [`trace`] - Trace recorder and anomaly analysis
//! - [`binding`] - Optical-code binding handshake
//! - [`relay`] - Request routing and command dispatch
//! - [`transport`] - Downstream adapters (SSE, in-process channel)
//! - [`agentlink`] - Upstream agent Unix socket
//! - [`bus`] - Topic publish/subscribe
//! - [`state`] - Persistent state actor
//! - [`config`] - Configuration types and loading
//! - [`cli`] - Command-line interface

pub mod agentlink;
pub mod binding;
pub mod bus;
pub mod cli;
pub mod config;
pub mod domain;
pub mod protocol;
pub mod relay;
pub mod state;
pub mod stream;
pub mod trace;
pub mod transport;

// Re-export commonly used types
pub use agentlink::AgentLink;
pub use binding::{BindingError, BindingHandshake, BindingOffers, BindingOutcome, HttpDecoder, OpticalDecoder};
pub use bus::{EventBus, InMemoryBus, Subscription, topics};
pub use config::Config;
pub use domain::{BindingToken, Destination, TraceRecord, TraceStatus, TraceSummary};
pub use protocol::{AgentMessage, CommandEnvelope, FragmentEvent, RelayRequest};
pub use relay::{Relay, RelayOptions, RelayOutcome};
pub use state::{StateError, StateManager, TraceQuery};
pub use stream::{Compensator, IdleMonitor, LossThresholds, Reassembler, SessionSettings, StreamSession, StreamState};
pub use trace::TraceRecorder;
pub use transport::{ChannelTransport, OutboundFrame, Transport, TransportError};
