//! State management with actor pattern
//!
//! StateManager owns the RelayStore and processes messages via channels,
//! providing serialized access to persistent state.

mod manager;
mod messages;

pub use manager::StateManager;
pub use messages::{StateCommand, StateError, StateResponse, TraceQuery};
