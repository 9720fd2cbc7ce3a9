//! Production engine backed by the `webrtc` crate.
//!
//! Engine callbacks only translate what they see into [`EngineEventKind`]s
//! and post them; they never touch relay state.

use super::{EngineEventKind, EngineFactory, EventSink, PeerEngine};
use async_trait::async_trait;
use peerlink_core::{RelayError, RelayResult};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_gatherer_state::RTCIceGathererState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

/// Creates one `RTCPeerConnection` per session, sharing a single API
/// instance (media engine + interceptors).
pub struct WebRtcEngineFactory {
    api: API,
    ice_servers: Vec<RTCIceServer>,
}

impl WebRtcEngineFactory {
    /// Build the shared API and the ICE server list from STUN URLs.
    pub fn new(stun_servers: &[String]) -> RelayResult<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| RelayError::EngineInit(format!("failed to register codecs: {e}")))?;

        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(|e| RelayError::EngineInit(format!("failed to register interceptors: {e}")))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let ice_servers = stun_servers
            .iter()
            .map(|url| RTCIceServer {
                urls: vec![url.clone()],
                ..Default::default()
            })
            .collect();

        Ok(Self { api, ice_servers })
    }
}

#[async_trait]
impl EngineFactory for WebRtcEngineFactory {
    async fn create(&self, events: EventSink) -> RelayResult<Arc<dyn PeerEngine>> {
        let config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };

        let pc = self
            .api
            .new_peer_connection(config)
            .await
            .map_err(|e| RelayError::EngineInit(e.to_string()))?;
        let pc = Arc::new(pc);

        let candidate_sink = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let sink = candidate_sink.clone();
            Box::pin(async move {
                // `None` marks end-of-candidates; completion is reported by
                // the gathering state handler below.
                let Some(candidate) = candidate else { return };
                match candidate.to_json() {
                    Ok(init) => {
                        sink.post(EngineEventKind::Candidate(init.candidate));
                    }
                    Err(e) => {
                        warn!(
                            session_id = sink.session(),
                            error = %e,
                            "failed to serialize local candidate"
                        );
                    }
                }
            })
        }));

        let gathering_sink = events.clone();
        pc.on_ice_gathering_state_change(Box::new(move |state: RTCIceGathererState| {
            let sink = gathering_sink.clone();
            Box::pin(async move {
                debug!(session_id = sink.session(), state = %state, "gathering state changed");
                if state == RTCIceGathererState::Complete {
                    sink.post(EngineEventKind::GatheringComplete);
                }
            })
        }));

        Ok(Arc::new(WebRtcPeer {
            pc,
            events,
            channels: Mutex::new(Vec::new()),
        }))
    }
}

/// A session's `RTCPeerConnection` plus the data channels it created.
struct WebRtcPeer {
    pc: Arc<RTCPeerConnection>,
    events: EventSink,
    /// Held so channels live as long as the session.
    channels: Mutex<Vec<Arc<RTCDataChannel>>>,
}

#[async_trait]
impl PeerEngine for WebRtcPeer {
    async fn create_offer(&self) -> RelayResult<String> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| RelayError::OfferCreation(e.to_string()))?;
        Ok(offer.sdp)
    }

    async fn set_local_offer(&self, sdp: &str) -> RelayResult<()> {
        let offer = RTCSessionDescription::offer(sdp.to_string())
            .map_err(|e| RelayError::LocalDescription(e.to_string()))?;
        self.pc
            .set_local_description(offer)
            .await
            .map_err(|e| RelayError::LocalDescription(e.to_string()))
    }

    async fn set_remote_offer(&self, sdp: &str) -> RelayResult<()> {
        let offer = RTCSessionDescription::offer(sdp.to_string())
            .map_err(|e| RelayError::RemoteDescription(e.to_string()))?;
        self.pc
            .set_remote_description(offer)
            .await
            .map_err(|e| RelayError::RemoteDescription(e.to_string()))
    }

    async fn add_candidate(&self, candidate: &str) -> RelayResult<()> {
        let init = RTCIceCandidateInit {
            candidate: candidate.to_string(),
            ..Default::default()
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| RelayError::Candidate(e.to_string()))
    }

    async fn create_data_channel(&self, label: &str) -> RelayResult<()> {
        let channel = self
            .pc
            .create_data_channel(label, None)
            .await
            .map_err(|e| RelayError::DataChannel(e.to_string()))?;

        let open_sink = self.events.clone();
        let open_label = label.to_string();
        channel.on_open(Box::new(move || {
            open_sink.post(EngineEventKind::ChannelOpen {
                label: open_label.clone(),
            });
            Box::pin(async {})
        }));

        let message_sink = self.events.clone();
        let message_label = label.to_string();
        channel.on_message(Box::new(move |msg: DataChannelMessage| {
            message_sink.post(EngineEventKind::ChannelMessage {
                label: message_label.clone(),
                len: msg.data.len(),
            });
            Box::pin(async {})
        }));

        self.channels.lock().await.push(channel);
        Ok(())
    }

    async fn close(&self) -> RelayResult<()> {
        self.channels.lock().await.clear();
        self.pc
            .close()
            .await
            .map_err(|e| RelayError::EngineClose(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineEvent;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn offer_and_local_description_start_gathering() {
        let factory = WebRtcEngineFactory::new(&[]).unwrap();
        let (tx, _rx) = mpsc::unbounded_channel::<EngineEvent>();
        let peer = factory.create(EventSink::new(1, tx)).await.unwrap();

        // A data channel gives the offer an application m-line.
        peer.create_data_channel("probe").await.unwrap();
        let sdp = peer.create_offer().await.unwrap();
        assert!(sdp.starts_with("v=0"));
        peer.set_local_offer(&sdp).await.unwrap();
        peer.close().await.unwrap();
    }

    #[tokio::test]
    async fn garbage_remote_offer_is_rejected() {
        let factory = WebRtcEngineFactory::new(&[]).unwrap();
        let (tx, _rx) = mpsc::unbounded_channel::<EngineEvent>();
        let peer = factory.create(EventSink::new(2, tx)).await.unwrap();

        let err = peer.set_remote_offer("not an sdp").await.unwrap_err();
        assert!(matches!(err, RelayError::RemoteDescription(_)));
        peer.close().await.unwrap();
    }
}
