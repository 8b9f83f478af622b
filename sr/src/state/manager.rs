//! StateManager - actor that owns the RelayStore
//!
//! Processes commands via channels so destinations, tokens and traces are only
//! ever touched by one task. Multi-record operations such as binding run as a
//! single command and cannot interleave with anything else.

use std::path::Path;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::binding::BindingError;
use crate::domain::{BindingToken, Destination, Filter, FilterOp, IndexValue, Store, TraceRecord};

use super::messages::{StateCommand, StateError, StateResponse, TraceQuery};

/// Handle to send commands to the StateManager
#[derive(Clone)]
pub struct StateManager {
    tx: mpsc::Sender<StateCommand>,
}

impl StateManager {
    /// Spawn a new StateManager actor backed by a store in `store_dir`
    pub fn spawn(store_dir: impl AsRef<Path>) -> eyre::Result<Self> {
        debug!(store_dir = %store_dir.as_ref().display(), "spawn: called");
        let store = Store::open(store_dir.as_ref())?;
        Self::spawn_with_store(store)
    }

    /// Spawn the actor around an already opened store
    pub fn spawn_with_store(mut store: Store) -> eyre::Result<Self> {
        let dest_count = store.rebuild_indexes::<Destination>()?;
        let token_count = store.rebuild_indexes::<BindingToken>()?;
        let trace_count = store.rebuild_indexes::<TraceRecord>()?;
        info!(dest_count, token_count, trace_count, "Rebuilt indexes");

        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(actor_loop(store, rx));

        info!("StateManager spawned");
        Ok(Self { tx })
    }

    async fn call<T>(&self, build: impl FnOnce(oneshot::Sender<StateResponse<T>>) -> StateCommand) -> StateResponse<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(build(reply_tx))
            .await
            .map_err(|_| StateError::ChannelError)?;
        reply_rx.await.map_err(|_| StateError::ChannelError)?
    }

    // === Destination operations ===

    pub async fn create_destination(&self, record: Destination) -> StateResponse<String> {
        debug!(dest_id = %record.id, "create_destination: called");
        self.call(|reply| StateCommand::CreateDestination { record, reply }).await
    }

    pub async fn get_destination(&self, id: &str) -> StateResponse<Option<Destination>> {
        debug!(%id, "get_destination: called");
        let id = id.to_string();
        self.call(|reply| StateCommand::GetDestination { id, reply }).await
    }

    pub async fn list_destinations(&self) -> StateResponse<Vec<Destination>> {
        debug!("list_destinations: called");
        self.call(|reply| StateCommand::ListDestinations { reply }).await
    }

    /// Resolve the destination bound to a user, falling back to the device
    pub async fn find_destination(
        &self,
        user_id: Option<&str>,
        device_id: Option<&str>,
    ) -> StateResponse<Option<Destination>> {
        debug!(?user_id, ?device_id, "find_destination: called");
        let user_id = user_id.map(str::to_string);
        let device_id = device_id.map(str::to_string);
        self.call(|reply| StateCommand::FindDestination {
            user_id,
            device_id,
            reply,
        })
        .await
    }

    pub async fn find_destination_by_agent_token(&self, agent_token: &str) -> StateResponse<Option<Destination>> {
        debug!("find_destination_by_agent_token: called");
        let agent_token = agent_token.to_string();
        self.call(|reply| StateCommand::FindDestinationByAgentToken { agent_token, reply })
            .await
    }

    /// Record that the destination's upstream agent is alive
    pub async fn touch_destination(&self, id: &str, now: i64) -> StateResponse<()> {
        debug!(%id, now, "touch_destination: called");
        let id = id.to_string();
        self.call(|reply| StateCommand::TouchDestination { id, now, reply }).await
    }

    pub async fn unbind_destination(&self, id: &str) -> StateResponse<Destination> {
        debug!(%id, "unbind_destination: called");
        let id = id.to_string();
        self.call(|reply| StateCommand::UnbindDestination { id, reply }).await
    }

    // === BindingToken operations ===

    /// Issue a token for a destination, purging stale tokens first
    pub async fn issue_token(&self, destination_id: &str, ttl_ms: i64) -> StateResponse<BindingToken> {
        debug!(%destination_id, ttl_ms, "issue_token: called");
        let destination_id = destination_id.to_string();
        self.call(|reply| StateCommand::IssueToken {
            destination_id,
            ttl_ms,
            reply,
        })
        .await
    }

    pub async fn get_token(&self, token: &str) -> StateResponse<Option<BindingToken>> {
        debug!("get_token: called");
        let token = token.to_string();
        self.call(|reply| StateCommand::GetToken { token, reply }).await
    }

    /// Validate and consume a token, binding the device (and user) to its destination
    pub async fn bind_with_token(
        &self,
        token: &str,
        device_id: &str,
        user_id: Option<&str>,
        now: i64,
    ) -> StateResponse<Destination> {
        debug!(%device_id, ?user_id, "bind_with_token: called");
        let token = token.to_string();
        let device_id = device_id.to_string();
        let user_id = user_id.map(str::to_string);
        self.call(|reply| StateCommand::BindWithToken {
            token,
            device_id,
            user_id,
            now,
            reply,
        })
        .await
    }

    /// Delete every expired or used token, returning how many were removed
    pub async fn purge_tokens(&self, now: i64) -> StateResponse<usize> {
        debug!(now, "purge_tokens: called");
        self.call(|reply| StateCommand::PurgeTokens { now, reply }).await
    }

    // === TraceRecord operations ===

    /// Insert or replace a trace
    pub async fn save_trace(&self, trace: TraceRecord) -> StateResponse<()> {
        debug!(trace_id = %trace.id, status = %trace.status, "save_trace: called");
        let trace = Box::new(trace);
        self.call(|reply| StateCommand::SaveTrace { trace, reply }).await
    }

    pub async fn get_trace(&self, id: &str) -> StateResponse<Option<TraceRecord>> {
        debug!(%id, "get_trace: called");
        let id = id.to_string();
        self.call(|reply| StateCommand::GetTrace { id, reply }).await
    }

    /// List traces, most recently updated first
    pub async fn list_traces(&self, query: TraceQuery) -> StateResponse<Vec<TraceRecord>> {
        debug!(?query, "list_traces: called");
        self.call(|reply| StateCommand::ListTraces { query, reply }).await
    }

    /// Shutdown the actor
    pub async fn shutdown(&self) -> StateResponse<()> {
        debug!("shutdown: called");
        self.tx
            .send(StateCommand::Shutdown)
            .await
            .map_err(|_| StateError::ChannelError)
    }
}

fn store_err(e: eyre::Report) -> StateError {
    StateError::StoreError(e.to_string())
}

fn find_one(store: &Store, field: &str, value: &str) -> StateResponse<Option<Destination>> {
    let found: Vec<Destination> = store.list(&[Filter::eq(field, value)]).map_err(store_err)?;
    Ok(found.into_iter().next())
}

fn find_destination(
    store: &Store,
    user_id: Option<&str>,
    device_id: Option<&str>,
) -> StateResponse<Option<Destination>> {
    if let Some(user) = user_id
        && let Some(dest) = find_one(store, "bound_user_id", user)?
    {
        return Ok(Some(dest));
    }
    match device_id {
        Some(device) => find_one(store, "bound_device_id", device),
        None => Ok(None),
    }
}

fn purge_tokens(store: &mut Store, now: i64) -> StateResponse<usize> {
    let used = store
        .delete_where::<BindingToken>(&[Filter::eq("used", true)])
        .map_err(store_err)?;
    let expired = store
        .delete_where::<BindingToken>(&[Filter {
            field: "expires_at".to_string(),
            op: FilterOp::Lte,
            value: IndexValue::Int(now),
        }])
        .map_err(store_err)?;
    Ok(used + expired)
}

fn issue_token(store: &mut Store, destination_id: &str, ttl_ms: i64) -> StateResponse<BindingToken> {
    let exists: Option<Destination> = store.get(destination_id).map_err(store_err)?;
    if exists.is_none() {
        return Err(StateError::NotFound(destination_id.to_string()));
    }

    let token = BindingToken::issue(destination_id, ttl_ms);
    let purged = purge_tokens(store, token.created_at)?;
    debug!(purged, "issue_token: purged stale tokens");
    store.create(token.clone()).map_err(store_err)?;
    Ok(token)
}

fn bind_with_token(
    store: &mut Store,
    token: &str,
    device_id: &str,
    user_id: Option<&str>,
    now: i64,
) -> StateResponse<Destination> {
    let mut record: BindingToken = store
        .get(token)
        .map_err(store_err)?
        .ok_or(BindingError::TokenNotFound)?;
    record.check(now)?;

    let mut dest: Destination = store
        .get(&record.destination_id)
        .map_err(store_err)?
        .ok_or_else(|| BindingError::DestinationNotFound(record.destination_id.clone()))?;

    let user_conflict = dest.bound_user_id.is_some() && dest.bound_user_id.as_deref() != user_id;
    let device_conflict = dest.bound_user_id.is_none()
        && dest.bound_device_id.is_some()
        && dest.bound_device_id.as_deref() != Some(device_id);
    if user_conflict || device_conflict {
        return Err(BindingError::Conflict.into());
    }

    for (field, value) in [("bound_device_id", Some(device_id)), ("bound_user_id", user_id)] {
        if let Some(value) = value
            && let Some(other) = find_one(store, field, value)?
            && other.id != dest.id
        {
            return Err(BindingError::AlreadyBoundElsewhere(other.id).into());
        }
    }

    record.mark_used(device_id, now)?;
    dest.bind(device_id, user_id);
    store.update_pair(record, dest.clone()).map_err(store_err)?;
    Ok(dest)
}

fn list_traces(store: &Store, query: &TraceQuery) -> StateResponse<Vec<TraceRecord>> {
    let mut filters = Vec::new();
    if let Some(status) = query.status {
        filters.push(Filter::eq("status", status.as_str()));
    }
    if let Some(ref dest) = query.destination_id {
        filters.push(Filter::eq("destination_id", dest.as_str()));
    }
    match query.limit {
        Some(limit) => store.list_recent(&filters, limit),
        None => store.list(&filters),
    }
    .map_err(store_err)
}

/// The actor loop that processes commands
async fn actor_loop(mut store: Store, mut rx: mpsc::Receiver<StateCommand>) {
    debug!("StateManager actor started");

    while let Some(cmd) = rx.recv().await {
        match cmd {
            StateCommand::CreateDestination { record, reply } => {
                debug!(dest_id = %record.id, "actor_loop: CreateDestination command");
                let _ = reply.send(store.create(record).map_err(store_err));
            }

            StateCommand::GetDestination { id, reply } => {
                debug!(%id, "actor_loop: GetDestination command");
                let _ = reply.send(store.get(&id).map_err(store_err));
            }

            StateCommand::ListDestinations { reply } => {
                debug!("actor_loop: ListDestinations command");
                let _ = reply.send(store.list(&[]).map_err(store_err));
            }

            StateCommand::FindDestination {
                user_id,
                device_id,
                reply,
            } => {
                debug!(?user_id, ?device_id, "actor_loop: FindDestination command");
                let _ = reply.send(find_destination(&store, user_id.as_deref(), device_id.as_deref()));
            }

            StateCommand::FindDestinationByAgentToken { agent_token, reply } => {
                debug!("actor_loop: FindDestinationByAgentToken command");
                let _ = reply.send(find_one(&store, "agent_token", &agent_token));
            }

            StateCommand::TouchDestination { id, now, reply } => {
                debug!(%id, "actor_loop: TouchDestination command");
                let result = match store.get::<Destination>(&id) {
                    Ok(Some(mut dest)) => {
                        dest.touch(now);
                        store.update(dest).map_err(store_err)
                    }
                    Ok(None) => Err(StateError::NotFound(id)),
                    Err(e) => Err(store_err(e)),
                };
                let _ = reply.send(result);
            }

            StateCommand::UnbindDestination { id, reply } => {
                debug!(%id, "actor_loop: UnbindDestination command");
                let result = match store.get::<Destination>(&id) {
                    Ok(Some(mut dest)) => {
                        dest.unbind();
                        store.update(dest.clone()).map(|_| dest).map_err(store_err)
                    }
                    Ok(None) => Err(StateError::NotFound(id)),
                    Err(e) => Err(store_err(e)),
                };
                let _ = reply.send(result);
            }

            StateCommand::IssueToken {
                destination_id,
                ttl_ms,
                reply,
            } => {
                debug!(%destination_id, "actor_loop: IssueToken command");
                let _ = reply.send(issue_token(&mut store, &destination_id, ttl_ms));
            }

            StateCommand::GetToken { token, reply } => {
                debug!("actor_loop: GetToken command");
                let _ = reply.send(store.get(&token).map_err(store_err));
            }

            StateCommand::BindWithToken {
                token,
                device_id,
                user_id,
                now,
                reply,
            } => {
                debug!(%device_id, "actor_loop: BindWithToken command");
                let result = bind_with_token(&mut store, &token, &device_id, user_id.as_deref(), now);
                if let Err(ref e) = result {
                    warn!(error = %e, %device_id, "actor_loop: binding rejected");
                }
                let _ = reply.send(result);
            }

            StateCommand::PurgeTokens { now, reply } => {
                debug!(now, "actor_loop: PurgeTokens command");
                let _ = reply.send(purge_tokens(&mut store, now));
            }

            StateCommand::SaveTrace { trace, reply } => {
                debug!(trace_id = %trace.id, "actor_loop: SaveTrace command");
                let _ = reply.send(store.upsert(*trace).map_err(store_err));
            }

            StateCommand::GetTrace { id, reply } => {
                debug!(%id, "actor_loop: GetTrace command");
                let _ = reply.send(store.get(&id).map_err(store_err));
            }

            StateCommand::ListTraces { query, reply } => {
                debug!(?query, "actor_loop: ListTraces command");
                let _ = reply.send(list_traces(&store, &query));
            }

            StateCommand::Shutdown => {
                info!("StateManager shutting down");
                break;
            }
        }
    }

    debug!("StateManager actor stopped");
}
