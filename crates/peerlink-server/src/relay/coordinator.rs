//! Connection session coordinator.
//!
//! Drives each session through its state machine. Request flows (getInfo,
//! connect, close) run on the read loop and return as soon as the engine
//! has accepted their calls; everything the engine reports later arrives
//! as an [`EngineEvent`] and is handled by [`SessionCoordinator::run`], the
//! single dispatcher task.

use super::registry::{CandidateOutcome, PeerConnectionRegistry, SessionHandle, SessionState};
use crate::engine::{EngineEvent, EngineEventKind, EventSink, SessionId};
use crate::notifier::OutboundNotifier;
use peerlink_core::messages::{ConnectDetails, MsgType};
use peerlink_core::{RelayError, RelayResult};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub struct SessionCoordinator {
    registry: Arc<PeerConnectionRegistry>,
    notifier: Arc<OutboundNotifier>,
    events: mpsc::UnboundedSender<EngineEvent>,
    gathering_timeout: Option<Duration>,
    data_channel_label: String,
}

impl SessionCoordinator {
    pub fn new(
        registry: Arc<PeerConnectionRegistry>,
        notifier: Arc<OutboundNotifier>,
        events: mpsc::UnboundedSender<EngineEvent>,
        gathering_timeout: Option<Duration>,
        data_channel_label: impl Into<String>,
    ) -> Self {
        Self {
            registry,
            notifier,
            events,
            gathering_timeout,
            data_channel_label: data_channel_label.into(),
        }
    }

    // ── getInfo ─────────────────────────────────────────────────────

    /// Start the offering flow for `from`. The `connectionInfo` reply is
    /// sent later, once the engine reports gathering-complete.
    pub async fn handle_get_info(&self, from: &str) {
        if let Err(e) = self.start_offer(from).await {
            warn!(peer = %from, kind = ?e.kind(), error = %e, "getInfo failed");
            self.notifier.send_error(from, &e).await;
        }
    }

    async fn start_offer(&self, from: &str) -> RelayResult<()> {
        let session = self.registry.create(from).await?;
        if let Err(e) = self.offer(&session).await {
            self.registry.set_state(session.id, SessionState::Error).await;
            return Err(e);
        }
        Ok(())
    }

    async fn offer(&self, session: &SessionHandle) -> RelayResult<()> {
        self.registry
            .set_state(session.id, SessionState::OfferPending)
            .await;

        let sdp = session.engine.create_offer().await?;
        session.engine.set_local_offer(&sdp).await?;
        self.registry.set_local_description(session.id, sdp).await;

        let timer = self.gathering_timeout.map(|timeout| {
            let sink = EventSink::new(session.id, self.events.clone());
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                sink.post(EngineEventKind::GatheringTimedOut);
            })
            .abort_handle()
        });
        if !self.registry.enter_gathering(session.id, timer).await {
            // Closed while the offer was being committed.
            debug!(
                peer = %session.peer_id,
                session_id = session.id,
                "session gone before gathering"
            );
            return Ok(());
        }
        debug!(peer = %session.peer_id, session_id = session.id, "waiting for ICE gathering");

        // The engine may have finished gathering before we got here.
        self.finish(session.id).await;
        Ok(())
    }

    /// Send the `connectionInfo` reply if the session is ready for it.
    async fn finish(&self, id: SessionId) {
        let Some((peer, info)) = self.registry.try_finish(id).await else {
            return;
        };
        info!(
            peer = %peer,
            session_id = id,
            candidates = info.ice_candidates.len(),
            "ICE gathering complete"
        );
        match info.to_payload() {
            Ok(payload) => {
                self.notifier
                    .send(MsgType::ConnectionInfo, &peer, "", payload)
                    .await
            }
            Err(e) => self.notifier.send_error(&peer, &e).await,
        }
    }

    // ── connect ─────────────────────────────────────────────────────

    /// Bridge to a remote party that is already offering. No reply is sent
    /// on success.
    pub async fn handle_connect(&self, target: &str, details: ConnectDetails) {
        if let Err(e) = self.bridge(target, &details).await {
            warn!(peer = %target, kind = ?e.kind(), error = %e, "connect failed");
            self.notifier.send_error(target, &e).await;
        }
    }

    async fn bridge(&self, target: &str, details: &ConnectDetails) -> RelayResult<()> {
        let session = self.registry.get_or_create(target).await?;
        if let Err(e) = self.apply_remote(&session, details).await {
            self.registry.set_state(session.id, SessionState::Error).await;
            return Err(e);
        }
        Ok(())
    }

    async fn apply_remote(
        &self,
        session: &SessionHandle,
        details: &ConnectDetails,
    ) -> RelayResult<()> {
        session.engine.set_remote_offer(&details.sdp).await?;
        self.registry
            .set_state(session.id, SessionState::RemoteSet)
            .await;

        let mut added = 0usize;
        for candidate in &details.ice_candidates {
            match session.engine.add_candidate(candidate).await {
                Ok(()) => added += 1,
                Err(e) => warn!(
                    peer = %session.peer_id,
                    candidate = %candidate,
                    error = %e,
                    "skipping remote candidate"
                ),
            }
        }

        session
            .engine
            .create_data_channel(&self.data_channel_label)
            .await?;
        self.registry
            .set_state(session.id, SessionState::DataChannelReady)
            .await;
        info!(
            peer = %session.peer_id,
            session_id = session.id,
            candidates = added,
            label = %self.data_channel_label,
            "data channel created"
        );
        Ok(())
    }

    // ── close ───────────────────────────────────────────────────────

    /// Close every session of `target` and acknowledge.
    pub async fn handle_close(&self, target: &str) {
        match self.registry.close_peer(target).await {
            Ok(_) => {
                self.notifier
                    .send(MsgType::Ack, target, "", "closed")
                    .await
            }
            Err(e) => {
                debug!(peer = %target, error = %e, "close failed");
                self.notifier.send_error(target, &e).await;
            }
        }
    }

    // ── engine events ───────────────────────────────────────────────

    /// Drain engine events until every sender is gone.
    pub async fn run(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<EngineEvent>) {
        while let Some(event) = events.recv().await {
            self.handle_event(event).await;
        }
        debug!("engine event channel closed");
    }

    pub async fn handle_event(&self, event: EngineEvent) {
        let id = event.session;
        match event.kind {
            EngineEventKind::Candidate(candidate) => {
                match self.registry.push_candidate(id, candidate).await {
                    CandidateOutcome::Appended => debug!(session_id = id, "local candidate"),
                    CandidateOutcome::Late => {
                        debug!(session_id = id, "candidate after reply dropped")
                    }
                    CandidateOutcome::UnknownSession => {
                        debug!(session_id = id, "candidate for closed session")
                    }
                }
            }
            EngineEventKind::GatheringComplete => {
                if self.registry.mark_gathering_done(id).await {
                    self.finish(id).await;
                }
            }
            EngineEventKind::GatheringTimedOut => {
                if let Some(peer) = self.registry.fail_gathering(id).await {
                    let err = RelayError::GatheringTimeout {
                        secs: self.gathering_timeout.map(|t| t.as_secs()).unwrap_or_default(),
                    };
                    warn!(peer = %peer, session_id = id, error = %err, "gathering timed out");
                    self.notifier.send_error(&peer, &err).await;
                }
            }
            EngineEventKind::ChannelOpen { label } => {
                info!(session_id = id, label = %label, "data channel open");
            }
            EngineEventKind::ChannelMessage { label, len } => {
                debug!(session_id = id, label = %label, len, "data channel message");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::fake::{FakeEngineFactory, FakeScript};
    use peerlink_core::messages::{ConnectionInfo, Envelope};
    use peerlink_core::decode_envelope;
    use std::net::SocketAddr;

    struct Harness {
        factory: Arc<FakeEngineFactory>,
        registry: Arc<PeerConnectionRegistry>,
        coordinator: Arc<SessionCoordinator>,
        frames: mpsc::Receiver<Vec<u8>>,
    }

    async fn harness(script: FakeScript, timeout: Option<Duration>) -> Harness {
        let factory = Arc::new(FakeEngineFactory::new(script));
        let (tx, rx) = mpsc::unbounded_channel();
        let registry = Arc::new(PeerConnectionRegistry::new(factory.clone(), tx.clone()));
        let notifier = Arc::new(OutboundNotifier::new());
        let claim = notifier
            .claim(SocketAddr::from(([127, 0, 0, 1], 1)))
            .await
            .unwrap();
        let coordinator = Arc::new(SessionCoordinator::new(
            registry.clone(),
            notifier,
            tx,
            timeout,
            "dataChannel",
        ));
        tokio::spawn(coordinator.clone().run(rx));
        Harness {
            factory,
            registry,
            coordinator,
            frames: claim.frames,
        }
    }

    impl Harness {
        async fn next_reply(&mut self) -> Envelope {
            let frame = tokio::time::timeout(Duration::from_secs(2), self.frames.recv())
                .await
                .expect("reply timed out")
                .expect("writer closed");
            decode_envelope(&frame).unwrap()
        }

        async fn assert_quiet(&mut self) {
            let extra = tokio::time::timeout(Duration::from_millis(100), self.frames.recv()).await;
            assert!(extra.is_err(), "unexpected reply: {extra:?}");
        }
    }

    fn details(candidates: &[&str]) -> ConnectDetails {
        ConnectDetails {
            sdp: "v=0\r\no=- 1 2 IN IP4 10.0.0.1\r\n".into(),
            ice_candidates: candidates.iter().map(|c| c.to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn get_info_replies_once_with_all_candidates() {
        let mut h = harness(
            FakeScript {
                candidates: vec![
                    "candidate:1 1 udp 2130706431 10.0.0.2 5000 typ host".into(),
                    "candidate:2 1 udp 1694498815 1.2.3.4 5001 typ srflx".into(),
                ],
                ..Default::default()
            },
            None,
        )
        .await;

        h.coordinator.handle_get_info("A").await;
        let reply = h.next_reply().await;
        assert_eq!(reply.msg_type, "connectionInfo");
        assert_eq!(reply.to, "A");
        assert_eq!(reply.from, "");
        let info: ConnectionInfo = serde_json::from_str(&reply.payload).unwrap();
        assert!(info.sdp.starts_with("v=0"));
        assert_eq!(info.ice_candidates.len(), 2);
        assert!(info.ice_candidates[0].starts_with("candidate:1"));
        h.assert_quiet().await;
    }

    #[tokio::test]
    async fn late_candidate_does_not_trigger_second_reply() {
        let mut h = harness(FakeScript::default(), None).await;
        h.coordinator.handle_get_info("A").await;
        let reply = h.next_reply().await;
        let info: ConnectionInfo = serde_json::from_str(&reply.payload).unwrap();
        assert!(info.ice_candidates.is_empty());

        let peer = h.factory.peer(0);
        peer.emit(EngineEventKind::Candidate("candidate:9".into()));
        peer.emit(EngineEventKind::GatheringComplete);
        h.assert_quiet().await;

        let snap = h.registry.snapshot(peer.session()).await.unwrap();
        assert_eq!(snap.state, SessionState::Complete);
        assert!(snap.candidates.is_empty());
    }

    #[tokio::test]
    async fn repeated_get_info_creates_independent_sessions() {
        let mut h = harness(FakeScript::default(), None).await;
        h.coordinator.handle_get_info("A").await;
        h.coordinator.handle_get_info("A").await;

        let first = h.next_reply().await;
        let second = h.next_reply().await;
        assert_eq!(first.to, "A");
        assert_eq!(second.to, "A");
        assert_ne!(first.payload, second.payload);
        assert_eq!(h.factory.created(), 2);
        assert_eq!(h.registry.count().await, 2);
        h.assert_quiet().await;
    }

    #[tokio::test]
    async fn offer_failure_replies_error_and_marks_session() {
        let mut h = harness(
            FakeScript {
                fail_offer: true,
                ..Default::default()
            },
            None,
        )
        .await;
        h.coordinator.handle_get_info("A").await;
        let reply = h.next_reply().await;
        assert_eq!(reply.msg_type, "error");
        assert_eq!(reply.to, "A");
        assert_eq!(reply.payload, "Failed to create SDP offer");

        // The partially built session stays registered.
        let session = h.registry.get("A").await.unwrap();
        let snap = h.registry.snapshot(session.id).await.unwrap();
        assert_eq!(snap.state, SessionState::Error);
        h.assert_quiet().await;
    }

    #[tokio::test]
    async fn local_description_failure_replies_error_once() {
        let mut h = harness(
            FakeScript {
                fail_local_description: true,
                candidates: vec!["candidate:1".into()],
                ..Default::default()
            },
            Some(Duration::from_millis(50)),
        )
        .await;
        h.coordinator.handle_get_info("A").await;

        let reply = h.next_reply().await;
        assert_eq!(reply.msg_type, "error");
        assert_eq!(reply.to, "A");
        assert_eq!(reply.payload, "Failed to set local description");

        let session = h.registry.get("A").await.unwrap();
        let snap = h.registry.snapshot(session.id).await.unwrap();
        assert_eq!(snap.state, SessionState::Error);
        assert!(snap.local_description.is_none());

        // A completion reported afterwards does not produce connectionInfo,
        // and no gathering timer was armed.
        h.factory.peer(0).emit(EngineEventKind::GatheringComplete);
        tokio::time::sleep(Duration::from_millis(100)).await;
        h.assert_quiet().await;
    }

    #[tokio::test]
    async fn engine_creation_failure_replies_error() {
        let mut h = harness(
            FakeScript {
                fail_create: true,
                ..Default::default()
            },
            None,
        )
        .await;
        h.coordinator.handle_get_info("A").await;
        let reply = h.next_reply().await;
        assert_eq!(reply.payload, "Failed to create PeerConnection");
        assert_eq!(h.registry.count().await, 0);
    }

    #[tokio::test]
    async fn stalled_gathering_times_out_once() {
        let mut h = harness(
            FakeScript {
                stall_gathering: true,
                candidates: vec!["candidate:1".into()],
                ..Default::default()
            },
            Some(Duration::from_millis(50)),
        )
        .await;
        h.coordinator.handle_get_info("A").await;

        let reply = h.next_reply().await;
        assert_eq!(reply.msg_type, "error");
        assert_eq!(reply.to, "A");
        assert!(reply.payload.starts_with("Timed out"));

        // A late completion after the timeout is ignored.
        h.factory.peer(0).emit(EngineEventKind::GatheringComplete);
        h.assert_quiet().await;
    }

    #[tokio::test]
    async fn completion_cancels_timer() {
        let mut h = harness(FakeScript::default(), Some(Duration::from_millis(50))).await;
        h.coordinator.handle_get_info("A").await;
        assert_eq!(h.next_reply().await.msg_type, "connectionInfo");
        tokio::time::sleep(Duration::from_millis(100)).await;
        h.assert_quiet().await;
    }

    #[tokio::test]
    async fn connect_tolerates_bad_candidate() {
        let mut h = harness(FakeScript::default(), None).await;
        h.coordinator
            .handle_connect(
                "B",
                details(&[
                    "candidate:1 1 udp 1 10.0.0.1 1 typ host",
                    "garbage",
                    "candidate:2 1 udp 1 10.0.0.1 2 typ host",
                ]),
            )
            .await;

        let calls = h.factory.peer(0).calls();
        assert!(calls.iter().any(|c| c == "add_candidate:garbage"));
        assert_eq!(calls.iter().filter(|c| c.starts_with("add_candidate:")).count(), 3);
        assert_eq!(calls.last().unwrap(), "create_data_channel:dataChannel");

        let session = h.registry.get("B").await.unwrap();
        let snap = h.registry.snapshot(session.id).await.unwrap();
        assert_eq!(snap.state, SessionState::DataChannelReady);
        // Success produces no reply.
        h.assert_quiet().await;
    }

    #[tokio::test]
    async fn connect_reuses_existing_session() {
        let h = harness(FakeScript::default(), None).await;
        h.coordinator.handle_connect("B", details(&[])).await;
        h.coordinator.handle_connect("B", details(&[])).await;
        assert_eq!(h.factory.created(), 1);
        assert_eq!(h.registry.count().await, 1);
    }

    #[tokio::test]
    async fn connect_remote_description_failure() {
        let mut h = harness(FakeScript::default(), None).await;
        let bad = ConnectDetails {
            sdp: "not sdp".into(),
            ice_candidates: vec![],
        };
        h.coordinator.handle_connect("B", bad).await;

        let reply = h.next_reply().await;
        assert_eq!(reply.msg_type, "error");
        assert_eq!(reply.to, "B");
        assert_eq!(reply.payload, "Failed to set remote description");
        let calls = h.factory.peer(0).calls();
        assert!(!calls.iter().any(|c| c.starts_with("create_data_channel")));
    }

    #[tokio::test]
    async fn connect_data_channel_failure() {
        let mut h = harness(
            FakeScript {
                fail_data_channel: true,
                ..Default::default()
            },
            None,
        )
        .await;
        h.coordinator.handle_connect("B", details(&[])).await;
        assert_eq!(h.next_reply().await.payload, "Failed to create data channel");
    }

    #[tokio::test]
    async fn close_acks_and_unknown_peer_errors() {
        let mut h = harness(FakeScript::default(), None).await;
        h.coordinator.handle_connect("B", details(&[])).await;

        h.coordinator.handle_close("B").await;
        let ack = h.next_reply().await;
        assert_eq!(ack.msg_type, "ack");
        assert_eq!(ack.to, "B");
        assert_eq!(ack.payload, "closed");
        assert_eq!(h.registry.count().await, 0);

        h.coordinator.handle_close("B").await;
        let err = h.next_reply().await;
        assert_eq!(err.msg_type, "error");
        assert_eq!(err.payload, "Unknown peer");
    }
}
