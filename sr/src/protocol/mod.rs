//! Wire types shared by the transports, the bus and upstream agents
//!
//! - `request`: what a downstream client sends to open a stream
//! - `command`: the envelope published to an upstream agent
//! - `fragment`: what an upstream agent publishes back
//! - `outbound`: the frames written to the downstream client

mod command;
mod fragment;
mod outbound;
mod request;

pub use command::{CommandEnvelope, CommandMetadata, CommandParams};
pub use fragment::FragmentEvent;
pub use outbound::{AgentMessage, EVENT_DONE, EVENT_MESSAGE, ToolCall};
pub use request::{InboundMessage, ProtocolError, RelayRequest, ValidRequest};
