//! Scripted engine for tests.
//!
//! Behaves like a well-mannered WebRTC stack without touching the network:
//! committing a local offer emits the scripted candidates followed by
//! gathering-complete, synchronously, before `set_local_offer` returns.

use super::{EngineEventKind, EngineFactory, EventSink, PeerEngine};
use async_trait::async_trait;
use peerlink_core::{RelayError, RelayResult};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, Default)]
pub struct FakeScript {
    /// Candidates emitted after the local offer is committed.
    pub candidates: Vec<String>,
    /// Never report gathering-complete.
    pub stall_gathering: bool,
    pub fail_create: bool,
    pub fail_offer: bool,
    pub fail_local_description: bool,
    pub fail_data_channel: bool,
    /// Delay before engine creation finishes, to widen race windows.
    pub create_delay: Option<Duration>,
}

/// Counts creations and records every call made against its engines.
#[derive(Default)]
pub struct FakeEngineFactory {
    script: FakeScript,
    created: AtomicUsize,
    pub peers: Mutex<Vec<Arc<FakePeer>>>,
}

impl FakeEngineFactory {
    pub fn new(script: FakeScript) -> Self {
        Self {
            script,
            ..Default::default()
        }
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn peer(&self, index: usize) -> Arc<FakePeer> {
        self.peers.lock().unwrap()[index].clone()
    }
}

#[async_trait]
impl EngineFactory for FakeEngineFactory {
    async fn create(&self, events: EventSink) -> RelayResult<Arc<dyn PeerEngine>> {
        if let Some(delay) = self.script.create_delay {
            tokio::time::sleep(delay).await;
        }
        if self.script.fail_create {
            return Err(RelayError::EngineInit("scripted failure".into()));
        }
        self.created.fetch_add(1, Ordering::SeqCst);
        let peer = Arc::new(FakePeer {
            script: self.script.clone(),
            events,
            calls: Mutex::new(Vec::new()),
        });
        self.peers.lock().unwrap().push(peer.clone());
        Ok(peer)
    }
}

pub struct FakePeer {
    script: FakeScript,
    events: EventSink,
    pub calls: Mutex<Vec<String>>,
}

impl FakePeer {
    pub fn session(&self) -> u64 {
        self.events.session()
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Emit an event as if the engine had observed it.
    pub fn emit(&self, kind: EngineEventKind) {
        self.events.post(kind);
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl PeerEngine for FakePeer {
    async fn create_offer(&self) -> RelayResult<String> {
        self.record("create_offer".into());
        if self.script.fail_offer {
            return Err(RelayError::OfferCreation("scripted failure".into()));
        }
        Ok(format!(
            "v=0\r\no=- {} 2 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n",
            self.events.session()
        ))
    }

    async fn set_local_offer(&self, sdp: &str) -> RelayResult<()> {
        self.record("set_local_offer".into());
        if self.script.fail_local_description || sdp.is_empty() {
            return Err(RelayError::LocalDescription("scripted failure".into()));
        }
        for candidate in &self.script.candidates {
            self.emit(EngineEventKind::Candidate(candidate.clone()));
        }
        if !self.script.stall_gathering {
            self.emit(EngineEventKind::GatheringComplete);
        }
        Ok(())
    }

    async fn set_remote_offer(&self, sdp: &str) -> RelayResult<()> {
        self.record(format!("set_remote_offer:{sdp}"));
        if !sdp.starts_with("v=0") {
            return Err(RelayError::RemoteDescription("not an SDP".into()));
        }
        Ok(())
    }

    async fn add_candidate(&self, candidate: &str) -> RelayResult<()> {
        self.record(format!("add_candidate:{candidate}"));
        if !candidate.starts_with("candidate:") {
            return Err(RelayError::Candidate(format!("invalid candidate {candidate:?}")));
        }
        Ok(())
    }

    async fn create_data_channel(&self, label: &str) -> RelayResult<()> {
        self.record(format!("create_data_channel:{label}"));
        if self.script.fail_data_channel {
            return Err(RelayError::DataChannel("scripted failure".into()));
        }
        self.emit(EngineEventKind::ChannelOpen {
            label: label.to_string(),
        });
        Ok(())
    }

    async fn close(&self) -> RelayResult<()> {
        self.record("close".into());
        Ok(())
    }
}
