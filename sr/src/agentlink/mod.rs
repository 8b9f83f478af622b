//! Upstream agent link
//!
//! Agents connect over a Unix Domain Socket, authenticate with their
//! destination's agent token and then exchange newline-delimited JSON with
//! the relay: fragment events and pings in, command envelopes out.

mod listener;
mod messages;

pub use listener::{AgentLink, cleanup_socket, create_listener_at};
pub use messages::{AgentControl, AgentFrame, LinkResponse};
