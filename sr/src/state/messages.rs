//! State manager messages
//!
//! Commands and responses for the actor pattern.

use thiserror::Error;
use tokio::sync::oneshot;

use crate::binding::BindingError;
use crate::domain::{BindingToken, Destination, TraceRecord, TraceStatus};

/// Errors from state operations
#[derive(Debug, Error)]
pub enum StateError {
    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Store error: {0}")]
    StoreError(String),

    #[error(transparent)]
    Binding(#[from] BindingError),

    #[error("Channel error")]
    ChannelError,
}

/// Response from state operations
pub type StateResponse<T> = Result<T, StateError>;

/// Filters for listing traces
#[derive(Debug, Clone, Default)]
pub struct TraceQuery {
    pub status: Option<TraceStatus>,
    pub destination_id: Option<String>,
    pub limit: Option<usize>,
}

/// Commands sent to the StateManager actor
#[derive(Debug)]
pub enum StateCommand {
    // Destination operations
    CreateDestination {
        record: Destination,
        reply: oneshot::Sender<StateResponse<String>>,
    },
    GetDestination {
        id: String,
        reply: oneshot::Sender<StateResponse<Option<Destination>>>,
    },
    ListDestinations {
        reply: oneshot::Sender<StateResponse<Vec<Destination>>>,
    },
    FindDestination {
        user_id: Option<String>,
        device_id: Option<String>,
        reply: oneshot::Sender<StateResponse<Option<Destination>>>,
    },
    FindDestinationByAgentToken {
        agent_token: String,
        reply: oneshot::Sender<StateResponse<Option<Destination>>>,
    },
    TouchDestination {
        id: String,
        now: i64,
        reply: oneshot::Sender<StateResponse<()>>,
    },
    UnbindDestination {
        id: String,
        reply: oneshot::Sender<StateResponse<Destination>>,
    },

    // BindingToken operations
    IssueToken {
        destination_id: String,
        ttl_ms: i64,
        reply: oneshot::Sender<StateResponse<BindingToken>>,
    },
    GetToken {
        token: String,
        reply: oneshot::Sender<StateResponse<Option<BindingToken>>>,
    },
    BindWithToken {
        token: String,
        device_id: String,
        user_id: Option<String>,
        now: i64,
        reply: oneshot::Sender<StateResponse<Destination>>,
    },
    PurgeTokens {
        now: i64,
        reply: oneshot::Sender<StateResponse<usize>>,
    },

    // TraceRecord operations
    SaveTrace {
        trace: Box<TraceRecord>,
        reply: oneshot::Sender<StateResponse<()>>,
    },
    GetTrace {
        id: String,
        reply: oneshot::Sender<StateResponse<Option<TraceRecord>>>,
    },
    ListTraces {
        query: TraceQuery,
        reply: oneshot::Sender<StateResponse<Vec<TraceRecord>>>,
    },

    // Shutdown
    Shutdown,
}
