//! Peer connection registry.
//!
//! Maps peer IDs to connection sessions. One `RwLock` guards the mapping and
//! every session's mutable fields (state, candidate list, local description);
//! with a single control client and short candidate bursts, contention stays
//! low.

use crate::engine::{EngineEvent, EngineFactory, EventSink, PeerEngine, SessionId};
use peerlink_core::{ConnectionInfo, RelayError, RelayResult};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, RwLock};
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

/// Lifecycle of one session.
///
/// getInfo path: `Created → OfferPending → Gathering → Complete`.
/// connect path: `Created → RemoteSet → DataChannelReady`.
/// Any step may end in `Error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    OfferPending,
    Gathering,
    Complete,
    RemoteSet,
    DataChannelReady,
    Error,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionState::Created => "created",
            SessionState::OfferPending => "offer-pending",
            SessionState::Gathering => "gathering",
            SessionState::Complete => "complete",
            SessionState::RemoteSet => "remote-set",
            SessionState::DataChannelReady => "data-channel-ready",
            SessionState::Error => "error",
        };
        f.write_str(s)
    }
}

/// A single connection session.
struct Session {
    peer_id: String,
    engine: Arc<dyn PeerEngine>,
    state: SessionState,
    /// Local candidates in discovery order.
    candidates: Vec<String>,
    local_description: Option<String>,
    /// The engine reported gathering-complete.
    gathering_done: bool,
    created_at: Instant,
    /// Pending gathering timer, aborted once the session settles.
    timer: Option<AbortHandle>,
}

impl Session {
    fn settle(&mut self, state: SessionState) {
        self.state = state;
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

/// Cheap handle for driving a session's engine outside the registry lock.
#[derive(Clone)]
pub struct SessionHandle {
    pub id: SessionId,
    pub peer_id: String,
    pub engine: Arc<dyn PeerEngine>,
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.id)
            .field("peer_id", &self.peer_id)
            .finish_non_exhaustive()
    }
}

/// Point-in-time copy of a session's mutable fields.
#[cfg(test)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub id: SessionId,
    pub peer_id: String,
    pub state: SessionState,
    pub candidates: Vec<String>,
    pub local_description: Option<String>,
    pub gathering_done: bool,
}

/// What happened to a candidate reported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateOutcome {
    Appended,
    /// The session already replied; the list is final.
    Late,
    UnknownSession,
}

#[derive(Default)]
struct RegistryState {
    sessions: HashMap<SessionId, Session>,
    /// The current session for each peer ID.
    by_peer: HashMap<String, SessionId>,
    next_id: SessionId,
}

impl RegistryState {
    fn allocate_id(&mut self) -> SessionId {
        self.next_id += 1;
        self.next_id
    }

    /// Detach a session from both maps.
    fn take(&mut self, id: SessionId) -> Option<Session> {
        let mut session = self.sessions.remove(&id)?;
        if self.by_peer.get(&session.peer_id) == Some(&id) {
            self.by_peer.remove(&session.peer_id);
        }
        if let Some(timer) = session.timer.take() {
            timer.abort();
        }
        Some(session)
    }

    /// Detach every session matching `pred`.
    fn take_where(&mut self, pred: impl Fn(&Session) -> bool) -> Vec<(SessionId, Session)> {
        let ids: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|(_, s)| pred(s))
            .map(|(id, _)| *id)
            .collect();
        let mut removed = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(session) = self.take(id) {
                removed.push((id, session));
            }
        }
        removed
    }
}

/// Registry of connection sessions keyed by peer ID.
pub struct PeerConnectionRegistry {
    state: RwLock<RegistryState>,
    engine: Arc<dyn EngineFactory>,
    events: mpsc::UnboundedSender<EngineEvent>,
}

impl PeerConnectionRegistry {
    /// Create an empty registry. New engines post their events to `events`.
    pub fn new(engine: Arc<dyn EngineFactory>, events: mpsc::UnboundedSender<EngineEvent>) -> Self {
        Self {
            state: RwLock::new(RegistryState::default()),
            engine,
            events,
        }
    }

    /// Return the peer's current session, creating one if none exists.
    ///
    /// Creation happens under the write lock, so concurrent callers for the
    /// same peer always share one engine connection.
    pub async fn get_or_create(&self, peer_id: &str) -> RelayResult<SessionHandle> {
        let mut state = self.state.write().await;
        if let Some(id) = state.by_peer.get(peer_id).copied() {
            if let Some(session) = state.sessions.get(&id) {
                debug!(peer = %peer_id, session_id = id, "reusing session");
                return Ok(SessionHandle {
                    id,
                    peer_id: peer_id.to_string(),
                    engine: session.engine.clone(),
                });
            }
        }
        self.insert_new(&mut state, peer_id).await
    }

    /// Always create a fresh session and make it the peer's current one.
    ///
    /// A session previously bound to the peer stays registered (and keeps
    /// its pending reply) until it is closed or swept.
    pub async fn create(&self, peer_id: &str) -> RelayResult<SessionHandle> {
        let mut state = self.state.write().await;
        if let Some(previous) = state.by_peer.get(peer_id) {
            debug!(peer = %peer_id, superseded = *previous, "replacing current session");
        }
        self.insert_new(&mut state, peer_id).await
    }

    async fn insert_new(
        &self,
        state: &mut RegistryState,
        peer_id: &str,
    ) -> RelayResult<SessionHandle> {
        let id = state.allocate_id();
        let engine = self
            .engine
            .create(EventSink::new(id, self.events.clone()))
            .await?;

        let session = Session {
            peer_id: peer_id.to_string(),
            engine: engine.clone(),
            state: SessionState::Created,
            candidates: Vec::new(),
            local_description: None,
            gathering_done: false,
            created_at: Instant::now(),
            timer: None,
        };
        state.sessions.insert(id, session);
        state.by_peer.insert(peer_id.to_string(), id);
        info!(peer = %peer_id, session_id = id, "session created");

        Ok(SessionHandle {
            id,
            peer_id: peer_id.to_string(),
            engine,
        })
    }

    /// The peer's current session, if any.
    #[cfg(test)]
    pub async fn get(&self, peer_id: &str) -> Option<SessionHandle> {
        let state = self.state.read().await;
        let id = *state.by_peer.get(peer_id)?;
        let session = state.sessions.get(&id)?;
        Some(SessionHandle {
            id,
            peer_id: peer_id.to_string(),
            engine: session.engine.clone(),
        })
    }

    #[cfg(test)]
    pub async fn snapshot(&self, id: SessionId) -> Option<SessionSnapshot> {
        let state = self.state.read().await;
        state.sessions.get(&id).map(|s| SessionSnapshot {
            id,
            peer_id: s.peer_id.clone(),
            state: s.state,
            candidates: s.candidates.clone(),
            local_description: s.local_description.clone(),
            gathering_done: s.gathering_done,
        })
    }

    /// Move a session to `new_state`. Returns `false` for unknown sessions.
    pub async fn set_state(&self, id: SessionId, new_state: SessionState) -> bool {
        let mut state = self.state.write().await;
        match state.sessions.get_mut(&id) {
            Some(session) => {
                if session.state != new_state {
                    debug!(
                        session_id = id,
                        from = %session.state,
                        to = %new_state,
                        "session state transition"
                    );
                }
                if matches!(new_state, SessionState::Error | SessionState::Complete) {
                    session.settle(new_state);
                } else {
                    session.state = new_state;
                }
                true
            }
            None => false,
        }
    }

    pub async fn set_local_description(&self, id: SessionId, sdp: String) {
        let mut state = self.state.write().await;
        if let Some(session) = state.sessions.get_mut(&id) {
            session.local_description = Some(sdp);
        }
    }

    /// Append a discovered local candidate, unless the session already
    /// replied with its final list.
    pub async fn push_candidate(&self, id: SessionId, candidate: String) -> CandidateOutcome {
        let mut state = self.state.write().await;
        let Some(session) = state.sessions.get_mut(&id) else {
            return CandidateOutcome::UnknownSession;
        };
        if session.state == SessionState::Complete {
            return CandidateOutcome::Late;
        }
        session.candidates.push(candidate);
        CandidateOutcome::Appended
    }

    /// Record that the engine finished gathering.
    pub async fn mark_gathering_done(&self, id: SessionId) -> bool {
        let mut state = self.state.write().await;
        match state.sessions.get_mut(&id) {
            Some(session) => {
                session.gathering_done = true;
                true
            }
            None => false,
        }
    }

    /// Enter `Gathering`, keeping the timer (if any) so it can be cancelled.
    pub async fn enter_gathering(&self, id: SessionId, timer: Option<AbortHandle>) -> bool {
        let mut state = self.state.write().await;
        match state.sessions.get_mut(&id) {
            Some(session) if session.state == SessionState::OfferPending => {
                session.state = SessionState::Gathering;
                session.timer = timer;
                debug!(session_id = id, "session state transition to gathering");
                true
            }
            _ => {
                if let Some(timer) = timer {
                    timer.abort();
                }
                false
            }
        }
    }

    /// Complete a gathering session if the engine already reported
    /// gathering-complete.
    ///
    /// Returns the reply target and payload exactly once per session: the
    /// `Gathering → Complete` transition happens under the lock.
    pub async fn try_finish(&self, id: SessionId) -> Option<(String, ConnectionInfo)> {
        let mut state = self.state.write().await;
        let session = state.sessions.get_mut(&id)?;
        if session.state != SessionState::Gathering || !session.gathering_done {
            return None;
        }
        session.settle(SessionState::Complete);
        let info = ConnectionInfo {
            sdp: session.local_description.clone().unwrap_or_default(),
            ice_candidates: session.candidates.clone(),
        };
        Some((session.peer_id.clone(), info))
    }

    /// Fail a session that is still gathering. Returns the peer to notify.
    pub async fn fail_gathering(&self, id: SessionId) -> Option<String> {
        let mut state = self.state.write().await;
        let session = state.sessions.get_mut(&id)?;
        if session.state != SessionState::Gathering {
            return None;
        }
        session.settle(SessionState::Error);
        Some(session.peer_id.clone())
    }

    /// Close every session that belongs to `peer_id`, current or superseded.
    pub async fn close_peer(&self, peer_id: &str) -> RelayResult<usize> {
        let removed = self
            .state
            .write()
            .await
            .take_where(|s| s.peer_id == peer_id);

        if removed.is_empty() {
            return Err(RelayError::SessionNotFound(peer_id.to_string()));
        }
        let count = removed.len();
        close_all(removed).await;
        info!(peer = %peer_id, count, "peer sessions closed");
        Ok(count)
    }

    /// Close every session.
    pub async fn evict_all(&self) -> usize {
        let removed = self.state.write().await.take_where(|_| true);
        let count = removed.len();
        close_all(removed).await;
        if count > 0 {
            info!(count, "all sessions evicted");
        }
        count
    }

    /// Close sessions older than `max_age`. Returns the closed session IDs.
    pub async fn sweep(&self, max_age: Duration) -> Vec<SessionId> {
        let removed = self
            .state
            .write()
            .await
            .take_where(|s| s.created_at.elapsed() > max_age);
        let ids: Vec<SessionId> = removed.iter().map(|(id, _)| *id).collect();
        close_all(removed).await;
        if !ids.is_empty() {
            debug!(count = ids.len(), "sweep removed expired sessions");
        }
        ids
    }

    /// Number of registered sessions.
    pub async fn count(&self) -> usize {
        self.state.read().await.sessions.len()
    }
}

async fn close_all(sessions: Vec<(SessionId, Session)>) {
    for (id, session) in sessions {
        if let Err(e) = session.engine.close().await {
            warn!(session_id = id, peer = %session.peer_id, error = %e, "engine close failed");
        }
    }
}
