//! Transport engine seam.
//!
//! The relay never drives WebRTC directly. It talks to a [`PeerEngine`]
//! created by an [`EngineFactory`], and everything the engine discovers on
//! its own schedule (candidates, gathering completion, data channel
//! activity) arrives as an [`EngineEvent`] on the coordinator's channel.
//!
//! - **[`webrtc`]**: production engine backed by the `webrtc` crate.
//! - `fake` (tests only): scripted engine that emits synthetic events.

#[cfg(test)]
pub mod fake;
pub mod webrtc;

use async_trait::async_trait;
use peerlink_core::RelayResult;
use std::sync::Arc;
use tokio::sync::mpsc;

pub use self::webrtc::WebRtcEngineFactory;

/// Registry-assigned identifier of one connection session.
pub type SessionId = u64;

/// Something the engine observed for one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEventKind {
    /// A local candidate line (`candidate:...`) was discovered.
    Candidate(String),
    /// Gathering reached its complete state.
    GatheringComplete,
    /// The per-session gathering timer fired.
    GatheringTimedOut,
    /// A data channel opened.
    ChannelOpen { label: String },
    /// A data channel delivered a message.
    ChannelMessage { label: String, len: usize },
}

/// An engine event tagged with the session it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineEvent {
    pub session: SessionId,
    pub kind: EngineEventKind,
}

impl EngineEvent {
    pub fn new(session: SessionId, kind: EngineEventKind) -> Self {
        Self { session, kind }
    }
}

/// Posts events for one session onto the coordinator's channel.
///
/// Cheap to clone; sends never block, so it is safe to use from engine
/// callbacks.
#[derive(Debug, Clone)]
pub struct EventSink {
    session: SessionId,
    tx: mpsc::UnboundedSender<EngineEvent>,
}

impl EventSink {
    pub fn new(session: SessionId, tx: mpsc::UnboundedSender<EngineEvent>) -> Self {
        Self { session, tx }
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    /// Returns `false` once the dispatcher has gone away.
    pub fn post(&self, kind: EngineEventKind) -> bool {
        self.tx.send(EngineEvent::new(self.session, kind)).is_ok()
    }
}

/// One engine-side peer connection.
#[async_trait]
pub trait PeerEngine: Send + Sync {
    /// Synthesize a local offer and return its SDP.
    async fn create_offer(&self) -> RelayResult<String>;

    /// Commit an offer SDP as the local description. Starts gathering.
    async fn set_local_offer(&self, sdp: &str) -> RelayResult<()>;

    /// Apply a remote party's offer SDP.
    async fn set_remote_offer(&self, sdp: &str) -> RelayResult<()>;

    /// Add one remote candidate line.
    async fn add_candidate(&self, candidate: &str) -> RelayResult<()>;

    /// Create an application data channel; open/message activity is
    /// reported through the session's [`EventSink`].
    async fn create_data_channel(&self, label: &str) -> RelayResult<()>;

    /// Tear the connection down.
    async fn close(&self) -> RelayResult<()>;
}

/// Builds engine connections for new sessions.
#[async_trait]
pub trait EngineFactory: Send + Sync {
    async fn create(&self, events: EventSink) -> RelayResult<Arc<dyn PeerEngine>>;
}
