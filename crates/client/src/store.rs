//! Session store
//!
//! Single source of truth for the session list, ICP models, and the
//! current-session id. Every mutation goes REST-first with a local
//! fallback, so the UI never blocks on backend availability; the cost is
//! silent local/remote divergence until the next successful refresh.
//!
//! Reads go through a lock-free `ArcSwap` snapshot; a watch channel
//! carries a revision counter so observers can react to changes. The
//! "current session" is derived from the snapshot by id lookup, never
//! stored as a copy.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;
use chrono::Utc;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, info, warn};

use gtmintel_protocol::{
    IcpConfig, IcpModel, ServerMessage, Session, WorkflowStage, WorkflowStatus,
};

use crate::cache::CacheCommand;
use crate::error::{RestError, ValidationError};
use crate::reducer::{reduce, Effect, Input};
use crate::rest::{IcpModelBody, RestClient, SearchRequest, UpdateSessionBody};

/// Steps of a full search run: search, enrich, score.
const TOTAL_SEARCH_STEPS: u32 = 3;

/// A user-facing notification (rendered by the host as a toast/line).
#[derive(Debug, Clone)]
pub struct Notice {
    pub message: String,
}

/// Query-history mutation shapes accepted by [`SessionStore::update_session_query`].
#[derive(Debug, Clone)]
pub enum QueryUpdate {
    /// Append one refinement to the history.
    Append(String),
    /// Replace the whole history (conversation clearing, message removal).
    Replace(Vec<String>),
}

impl QueryUpdate {
    fn resolve(&self, current: &[String]) -> Vec<String> {
        match self {
            QueryUpdate::Append(q) => {
                let mut next = current.to_vec();
                next.push(q.clone());
                next
            }
            QueryUpdate::Replace(qs) => qs.clone(),
        }
    }
}

/// Options for [`SessionStore::start_search`].
#[derive(Debug, Clone)]
pub struct StartSearchOptions {
    pub count: u32,
    pub search_type: String,
}

impl Default for StartSearchOptions {
    fn default() -> Self {
        Self {
            count: 10,
            search_type: "standard".to_string(),
        }
    }
}

/// Unsaved or edited ICP model handed to [`SessionStore::save_icp_model`].
#[derive(Debug, Clone)]
pub struct IcpModelDraft {
    /// `None` creates a new model; `Some` edits an existing one.
    pub id: Option<String>,
    pub name: String,
    pub is_primary: bool,
    pub config: IcpConfig,
}

/// Immutable view of the store, cheap to clone out via `Arc`.
#[derive(Debug, Clone, Default)]
pub struct StoreSnapshot {
    pub sessions: Vec<Session>,
    pub icp_models: Vec<IcpModel>,
    pub current_id: Option<String>,
}

impl StoreSnapshot {
    /// Derived projection: the current session, looked up by id.
    pub fn current_session(&self) -> Option<&Session> {
        let id = self.current_id.as_deref()?;
        self.sessions.iter().find(|s| s.id == id)
    }

    pub fn primary_model(&self) -> Option<&IcpModel> {
        self.icp_models.iter().find(|m| m.is_primary)
    }
}

/// Which cached mirror a mutation touches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CacheScope {
    Sessions,
    Models,
}

#[derive(Default)]
struct StoreState {
    sessions: Vec<Session>,
    icp_models: Vec<IcpModel>,
    current_id: Option<String>,
    /// Per-session mutation counters for last-writer-wins-by-sequence.
    mutation_seq: HashMap<String, u64>,
}

impl StoreState {
    fn session(&self, id: &str) -> Option<&Session> {
        self.sessions.iter().find(|s| s.id == id)
    }

    fn session_mut(&mut self, id: &str) -> Option<&mut Session> {
        self.sessions.iter_mut().find(|s| s.id == id)
    }

    fn model_mut(&mut self, id: &str) -> Option<&mut IcpModel> {
        self.icp_models.iter_mut().find(|m| m.id == id)
    }

    fn next_seq(&mut self, id: &str) -> u64 {
        let entry = self.mutation_seq.entry(id.to_string()).or_insert(0);
        *entry += 1;
        *entry
    }

    /// A remote response only reconciles local state if it belongs to the
    /// latest mutation issued for the session.
    fn is_latest(&self, id: &str, seq: u64) -> bool {
        self.mutation_seq.get(id).copied() == Some(seq)
    }

    fn replace_session(&mut self, session: Session) {
        match self.sessions.iter_mut().find(|s| s.id == session.id) {
            Some(slot) => *slot = session,
            // Deleted while the request was in flight; drop the response.
            None => debug!(
                component = "store",
                event = "store.reconcile.session_gone",
                session_id = %session.id,
                "Session vanished before reconcile"
            ),
        }
    }

    fn upsert_model(&mut self, model: IcpModel) {
        match self.icp_models.iter_mut().find(|m| m.id == model.id) {
            Some(slot) => *slot = model,
            None => self.icp_models.insert(0, model),
        }
    }

    /// Clear `is_primary` everywhere except `keep`. Runs on every
    /// mutation path that can set the flag.
    fn make_sole_primary(&mut self, keep: &str) {
        for model in &mut self.icp_models {
            model.is_primary = model.id == keep;
        }
    }
}

/// The session store. One instance per running client.
pub struct SessionStore {
    rest: RestClient,
    state: Mutex<StoreState>,
    snapshot: ArcSwap<StoreSnapshot>,
    revision_tx: watch::Sender<u64>,
    notices_tx: broadcast::Sender<Notice>,
    cache_tx: Option<mpsc::Sender<CacheCommand>>,
}

impl SessionStore {
    pub fn new(rest: RestClient, cache_tx: Option<mpsc::Sender<CacheCommand>>) -> Arc<Self> {
        let (revision_tx, _) = watch::channel(0);
        let (notices_tx, _) = broadcast::channel(16);
        Arc::new(Self {
            rest,
            state: Mutex::new(StoreState::default()),
            snapshot: ArcSwap::from_pointee(StoreSnapshot::default()),
            revision_tx,
            notices_tx,
            cache_tx,
        })
    }

    /// Lock-free snapshot read.
    pub fn snapshot(&self) -> Arc<StoreSnapshot> {
        self.snapshot.load_full()
    }

    /// Watch channel bumped on every state change.
    pub fn revision_watch(&self) -> watch::Receiver<u64> {
        self.revision_tx.subscribe()
    }

    pub fn subscribe_notices(&self) -> broadcast::Receiver<Notice> {
        self.notices_tx.subscribe()
    }

    /// Seed state from the offline cache at startup. Sweeps the
    /// primary-model invariant in case a stale cache carries duplicates.
    pub fn seed(&self, sessions: Vec<Session>, icp_models: Vec<IcpModel>) {
        self.mutate(None, |st| {
            st.sessions = sessions;
            st.icp_models = icp_models;
            if let Some(first_primary) = st
                .icp_models
                .iter()
                .find(|m| m.is_primary)
                .map(|m| m.id.clone())
            {
                st.make_sole_primary(&first_primary);
            }
        });
    }

    /// Switch the current session. `None` deselects.
    pub fn set_current(&self, id: Option<&str>) {
        self.mutate(None, |st| {
            match id {
                Some(id) if st.session(id).is_some() => st.current_id = Some(id.to_string()),
                Some(id) => warn!(
                    component = "store",
                    event = "store.set_current.unknown",
                    session_id = %id,
                    "Refusing to select unknown session"
                ),
                None => st.current_id = None,
            }
        });
    }

    /// Run one mutation under the state lock, then republish the snapshot,
    /// bump the revision, and mirror the touched entity to the cache.
    fn mutate<R>(&self, scope: Option<CacheScope>, f: impl FnOnce(&mut StoreState) -> R) -> R {
        let (result, snapshot) = {
            let mut st = self.state.lock().expect("state lock poisoned");
            let result = f(&mut st);
            debug_assert!(
                st.icp_models.iter().filter(|m| m.is_primary).count() <= 1,
                "more than one primary ICP model"
            );
            let snapshot = StoreSnapshot {
                sessions: st.sessions.clone(),
                icp_models: st.icp_models.clone(),
                current_id: st.current_id.clone(),
            };
            (result, snapshot)
        };

        if let Some(tx) = &self.cache_tx {
            let command = match scope {
                Some(CacheScope::Sessions) => {
                    Some(CacheCommand::SaveSessions(snapshot.sessions.clone()))
                }
                Some(CacheScope::Models) => {
                    Some(CacheCommand::SaveIcpModels(snapshot.icp_models.clone()))
                }
                None => None,
            };
            if let Some(command) = command {
                if tx.try_send(command).is_err() {
                    warn!(
                        component = "store",
                        event = "store.cache.channel_full",
                        "Cache channel full or closed, mirror write dropped"
                    );
                }
            }
        }

        self.snapshot.store(Arc::new(snapshot));
        self.revision_tx.send_modify(|rev| *rev += 1);
        result
    }

    /// The REST-first/local-fallback shape shared by every durable
    /// mutation: `apply` receives `Some(response)` on success and `None`
    /// when the backend was unreachable.
    async fn durable<T, R>(
        &self,
        scope: Option<CacheScope>,
        op: &'static str,
        remote: impl std::future::Future<Output = Result<T, RestError>>,
        apply: impl FnOnce(&mut StoreState, Option<T>) -> R,
    ) -> R {
        match remote.await {
            Ok(value) => self.mutate(scope, |st| apply(st, Some(value))),
            Err(err) => {
                warn!(
                    component = "store",
                    event = "store.rest.fallback",
                    op,
                    error = %err,
                    "Backend call failed, applying local fallback"
                );
                self.mutate(scope, |st| apply(st, None))
            }
        }
    }

    // -- Sessions -----------------------------------------------------------

    /// Create a session and make it current. Offline, a synthetic
    /// `local-<millis>` session is created instead so the caller always
    /// gets a usable session. Returns the session id.
    pub async fn create_session(&self, name: &str) -> Result<String, ValidationError> {
        let name = name.trim().to_string();
        if name.is_empty() {
            return Err(ValidationError::EmptySessionName);
        }

        let fallback_name = name.clone();
        let id = self
            .durable(
                Some(CacheScope::Sessions),
                "session.create",
                self.rest.create_session(&name),
                move |st, remote| {
                    let session = remote
                        .unwrap_or_else(|| Session::new(local_id(), fallback_name, Utc::now()));
                    let id = session.id.clone();
                    st.sessions.insert(0, session);
                    st.current_id = Some(id.clone());
                    id
                },
            )
            .await;

        info!(
            component = "store",
            event = "store.session.created",
            session_id = %id,
            "Session created"
        );
        Ok(id)
    }

    /// Apply a query-history mutation. PATCHes the backend with the full
    /// resulting sequence, then reconciles from the response; offline, the
    /// same transform applies locally so user-visible behavior is
    /// unaffected. `query` stays a sequence under every path.
    pub async fn update_session_query(&self, id: &str, update: QueryUpdate) {
        let prepared = self.mutate(None, |st| {
            let next = update.resolve(&st.session(id)?.query);
            let seq = st.next_seq(id);
            Some((seq, next))
        });
        let Some((seq, next)) = prepared else {
            warn!(
                component = "store",
                event = "store.query.unknown_session",
                session_id = %id,
                "Ignoring query update for unknown session"
            );
            return;
        };

        match self.rest.update_session_query(id, &next).await {
            Ok(session) => self.mutate(Some(CacheScope::Sessions), |st| {
                if st.is_latest(id, seq) {
                    st.replace_session(session);
                } else {
                    debug!(
                        component = "store",
                        event = "store.query.superseded",
                        session_id = %id,
                        "Stale query response ignored"
                    );
                }
            }),
            Err(err) => {
                warn!(
                    component = "store",
                    event = "store.rest.fallback",
                    op = "session.query",
                    error = %err,
                    "Backend call failed, applying local fallback"
                );
                self.mutate(Some(CacheScope::Sessions), |st| {
                    if st.is_latest(id, seq) {
                        if let Some(session) = st.session_mut(id) {
                            session.query = next;
                        }
                    }
                });
            }
        }
    }

    /// Empty the query history.
    pub async fn clear_session_query(&self, id: &str) {
        self.update_session_query(id, QueryUpdate::Replace(Vec::new()))
            .await;
    }

    /// Remove one entry from the query history by position.
    pub async fn remove_query_at(&self, id: &str, index: usize) {
        let next = self.mutate(None, |st| {
            st.session(id).map(|s| {
                let mut q = s.query.clone();
                if index < q.len() {
                    q.remove(index);
                }
                q
            })
        });
        let Some(next) = next else {
            return;
        };
        self.update_session_query(id, QueryUpdate::Replace(next))
            .await;
    }

    pub async fn rename_session(&self, id: &str, name: &str) -> Result<(), ValidationError> {
        let name = name.trim().to_string();
        if name.is_empty() {
            return Err(ValidationError::EmptySessionName);
        }

        let seq = self.mutate(None, |st| {
            if st.session(id).is_some() {
                Some(st.next_seq(id))
            } else {
                None
            }
        });
        let Some(seq) = seq else {
            return Err(ValidationError::UnknownSession(id.to_string()));
        };

        let local_name = name.clone();
        self.durable(
            Some(CacheScope::Sessions),
            "session.rename",
            self.rest
                .update_session(id, &UpdateSessionBody { name: Some(&name) }),
            move |st, remote| {
                if !st.is_latest(id, seq) {
                    return;
                }
                match remote {
                    Some(session) => st.replace_session(session),
                    None => {
                        if let Some(session) = st.session_mut(id) {
                            session.name = local_name;
                        }
                    }
                }
            },
        )
        .await;
        Ok(())
    }

    /// Delete a session. Local removal happens whether or not the backend
    /// call succeeds; if the deleted session was current, current falls
    /// back to the first remaining session.
    pub async fn delete_session(&self, id: &str) {
        if let Err(err) = self.rest.delete_session(id).await {
            warn!(
                component = "store",
                event = "store.rest.fallback",
                op = "session.delete",
                error = %err,
                "Backend delete failed, removing locally anyway"
            );
        }

        self.mutate(Some(CacheScope::Sessions), |st| {
            st.sessions.retain(|s| s.id != id);
            st.mutation_seq.remove(id);
            if st.current_id.as_deref() == Some(id) {
                st.current_id = st.sessions.first().map(|s| s.id.clone());
            }
        });
    }

    /// Kick off the asynchronous search workflow: append the query, mark
    /// the session searching, and POST the start request. Results arrive
    /// later over the transport; this does not wait for them.
    pub async fn start_search(
        &self,
        session_id: &str,
        query: &str,
        icp_model_id: Option<&str>,
        opts: StartSearchOptions,
    ) -> Result<(), ValidationError> {
        let query = query.trim();
        if query.is_empty() {
            return Err(ValidationError::EmptyQuery);
        }

        let seq = self.mutate(Some(CacheScope::Sessions), |st| {
            if st.session(session_id).is_none() {
                return None;
            }
            let seq = st.next_seq(session_id);
            if let Some(session) = st.session_mut(session_id) {
                session.query.push(query.to_string());
                // Previous run's status is superseded wholesale.
                session.status = Some(WorkflowStatus::searching(
                    "Starting company search",
                    TOTAL_SEARCH_STEPS,
                ));
                session.icp_model_id = icp_model_id.map(str::to_string);
            }
            Some(seq)
        });
        let Some(seq) = seq else {
            return Err(ValidationError::UnknownSession(session_id.to_string()));
        };

        let request = SearchRequest {
            session_id,
            query,
            icp_model_id,
            count: opts.count,
            search_type: &opts.search_type,
        };
        if let Err(err) = self.rest.start_search(&request).await {
            warn!(
                component = "store",
                event = "store.search.start_failed",
                session_id = %session_id,
                error = %err,
                "Search request failed"
            );
            self.mutate(Some(CacheScope::Sessions), |st| {
                if st.is_latest(session_id, seq) {
                    if let Some(session) = st.session_mut(session_id) {
                        session.status = Some(WorkflowStatus {
                            stage: WorkflowStage::Error,
                            message: "Could not reach the search service".to_string(),
                            ..Default::default()
                        });
                    }
                }
            });
            let _ = self.notices_tx.send(Notice {
                message: "Search failed to start — check your connection".to_string(),
            });
        }
        Ok(())
    }

    /// Re-fetch the full session list and replace local state. The
    /// designated recovery action after reconnection or detected drift.
    pub async fn refresh_sessions(&self) {
        match self.rest.list_sessions().await {
            Ok(sessions) => {
                let count = sessions.len();
                self.mutate(Some(CacheScope::Sessions), |st| {
                    st.sessions = sessions;
                    let current_still_exists = st
                        .current_id
                        .as_deref()
                        .is_some_and(|id| st.session(id).is_some());
                    if !current_still_exists {
                        st.current_id = st.sessions.first().map(|s| s.id.clone());
                    }
                });
                info!(
                    component = "store",
                    event = "store.sessions.refreshed",
                    count,
                    "Session list refreshed from backend"
                );
            }
            Err(err) => warn!(
                component = "store",
                event = "store.sessions.refresh_failed",
                error = %err,
                "Refresh failed, keeping local state"
            ),
        }
    }

    pub async fn refresh_icp_models(&self) {
        match self.rest.list_icp_models().await {
            Ok(models) => self.mutate(Some(CacheScope::Models), |st| {
                st.icp_models = models;
                if let Some(first_primary) = st
                    .icp_models
                    .iter()
                    .find(|m| m.is_primary)
                    .map(|m| m.id.clone())
                {
                    st.make_sole_primary(&first_primary);
                }
            }),
            Err(err) => warn!(
                component = "store",
                event = "store.models.refresh_failed",
                error = %err,
                "Model refresh failed, keeping local state"
            ),
        }
    }

    // -- ICP models ---------------------------------------------------------

    /// Create or edit an ICP model. When the draft is marked primary the
    /// store clears the flag on every other model in the same update.
    /// Returns the model id.
    pub async fn save_icp_model(&self, draft: IcpModelDraft) -> Result<String, ValidationError> {
        let IcpModelDraft {
            id,
            name,
            is_primary,
            config,
        } = draft;
        let name = name.trim().to_string();
        if name.is_empty() {
            return Err(ValidationError::EmptyModelName);
        }

        let body = IcpModelBody {
            name: &name,
            is_primary,
            config: &config,
        };
        let now = Utc::now();

        let model_id = match &id {
            Some(existing_id) => {
                let apply_id = existing_id.clone();
                let local_name = name.clone();
                let local_config = config.clone();
                self.durable(
                    Some(CacheScope::Models),
                    "icp.update",
                    self.rest.update_icp_model(existing_id, &body),
                    move |st, remote| {
                        match remote {
                            Some(model) => st.upsert_model(model),
                            None => {
                                if let Some(model) = st.model_mut(&apply_id) {
                                    model.name = local_name;
                                    model.is_primary = is_primary;
                                    model.config = local_config;
                                    model.updated_at = now;
                                }
                            }
                        }
                        if is_primary {
                            st.make_sole_primary(&apply_id);
                        }
                        apply_id
                    },
                )
                .await
            }
            None => {
                let local_name = name.clone();
                let local_config = config.clone();
                self.durable(
                    Some(CacheScope::Models),
                    "icp.create",
                    self.rest.create_icp_model(&body),
                    move |st, remote| {
                        let model = remote.unwrap_or_else(|| IcpModel {
                            id: format!("local-{}", gtmintel_protocol::new_id()),
                            name: local_name,
                            is_primary,
                            created_at: now,
                            updated_at: now,
                            config: local_config,
                        });
                        let model_id = model.id.clone();
                        st.upsert_model(model);
                        if is_primary {
                            st.make_sole_primary(&model_id);
                        }
                        model_id
                    },
                )
                .await
            }
        };

        Ok(model_id)
    }

    /// Flag one model as the default for new searches.
    pub async fn set_primary_model(&self, id: &str) {
        let id_owned = id.to_string();
        self.durable(
            Some(CacheScope::Models),
            "icp.set_primary",
            self.rest.set_primary_model(id),
            move |st, _remote| {
                // Same transform either way; the sweep IS the operation.
                st.make_sole_primary(&id_owned);
                if let Some(model) = st.model_mut(&id_owned) {
                    model.updated_at = Utc::now();
                }
            },
        )
        .await;
    }

    /// Delete a model. Local removal happens regardless of the REST
    /// outcome, mirroring session deletion.
    pub async fn delete_icp_model(&self, id: &str) {
        if let Err(err) = self.rest.delete_icp_model(id).await {
            warn!(
                component = "store",
                event = "store.rest.fallback",
                op = "icp.delete",
                error = %err,
                "Backend delete failed, removing locally anyway"
            );
        }
        self.mutate(Some(CacheScope::Models), |st| {
            st.icp_models.retain(|m| m.id != id);
        });
    }

    // -- Server events ------------------------------------------------------

    /// Fold one server-pushed event into the store. Events addressed to a
    /// session other than the current one are discarded — background
    /// sessions never get partial updates; `refresh_sessions` recovers
    /// them later.
    pub async fn apply_server_message(&self, msg: &ServerMessage) {
        let (session_id, input) = match msg {
            ServerMessage::Connected => {
                debug!(
                    component = "store",
                    event = "store.event.connected",
                    "Workflow server acknowledged connection"
                );
                return;
            }
            ServerMessage::SessionJoined { session_id } => {
                debug!(
                    component = "store",
                    event = "store.event.session_joined",
                    session_id = %session_id,
                    "Joined session channel"
                );
                return;
            }
            ServerMessage::Error { message } => {
                warn!(
                    component = "store",
                    event = "store.event.server_error",
                    message = %message,
                    "Workflow server reported an error"
                );
                return;
            }
            ServerMessage::WorkflowStatus { session_id, data } => {
                (session_id.clone(), Input::Status(data.clone()))
            }
            ServerMessage::WorkflowSubsteps { session_id, data } => {
                (session_id.clone(), Input::SubstepsReplaced(data.clone()))
            }
            ServerMessage::WorkflowSubstep { session_id, data } => {
                (session_id.clone(), Input::SubstepPatched(data.clone()))
            }
            ServerMessage::SearchComplete {
                session_id,
                results_count,
                summary,
                ..
            } => (
                session_id.clone(),
                Input::SearchComplete {
                    results_count: *results_count,
                    summary: summary.clone(),
                },
            ),
        };

        // The isolation guard: only the active session takes live updates.
        if self.snapshot.load().current_id.as_deref() != Some(session_id.as_str()) {
            debug!(
                component = "store",
                event = "store.event.inactive_session",
                session_id = %session_id,
                "Dropping event for inactive session"
            );
            return;
        }

        let effects = self.mutate(Some(CacheScope::Sessions), |st| {
            let Some(session) = st.session_mut(&session_id) else {
                return Vec::new();
            };
            let (status, effects) = reduce(session.status.take(), input);
            session.status = status;
            effects
        });

        for effect in effects {
            match effect {
                Effect::RefreshSessions => self.refresh_sessions().await,
                Effect::Notify(message) => {
                    let _ = self.notices_tx.send(Notice { message });
                }
            }
        }
    }
}

/// Timestamp-derived synthetic session id for the offline fallback.
fn local_id() -> String {
    format!("local-{}", Utc::now().timestamp_millis())
}
