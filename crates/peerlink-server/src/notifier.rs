//! Outbound path to the control client, and the exclusive connection slot.
//!
//! At most one control connection is active. The gateway claims the slot on
//! accept and releases it on disconnect; every reply from any session goes
//! through [`OutboundNotifier::send`], which hands complete frames to the
//! connection's single writer task so concurrent sends never interleave.

use peerlink_core::messages::{Envelope, MsgType};
use peerlink_core::{frame_encode, RelayError, RelayResult};
use std::net::SocketAddr;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

/// Frames queued for the writer task. When a client stops reading and the
/// queue fills, further replies are dropped and logged; senders never wait.
const OUTBOUND_QUEUE: usize = 256;

/// Identifier of one accepted control connection.
pub type ConnectionId = u64;

struct ActiveConnection {
    id: ConnectionId,
    remote: SocketAddr,
    tx: mpsc::Sender<Vec<u8>>,
}

/// A successful claim on the control slot.
pub struct Claim {
    pub id: ConnectionId,
    /// Frames to write to the socket, in order.
    pub frames: mpsc::Receiver<Vec<u8>>,
}

pub struct OutboundNotifier {
    slot: Mutex<Option<ActiveConnection>>,
    next_id: Mutex<ConnectionId>,
}

impl Default for OutboundNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl OutboundNotifier {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(None),
            next_id: Mutex::new(1),
        }
    }

    /// Claim the slot for a newly accepted connection.
    ///
    /// Returns `None` when another connection already holds it; the caller
    /// must reject the newcomer.
    pub async fn claim(&self, remote: SocketAddr) -> Option<Claim> {
        let mut slot = self.slot.lock().await;
        if let Some(active) = slot.as_ref() {
            debug!(active = %active.remote, rejected = %remote, "control slot busy");
            return None;
        }

        let id = {
            let mut next = self.next_id.lock().await;
            let id = *next;
            *next += 1;
            id
        };
        let (tx, frames) = mpsc::channel(OUTBOUND_QUEUE);
        *slot = Some(ActiveConnection { id, remote, tx });
        Some(Claim { id, frames })
    }

    /// Release the slot if `id` still holds it. Dropping the sender ends the
    /// connection's writer task.
    pub async fn release(&self, id: ConnectionId) -> bool {
        let mut slot = self.slot.lock().await;
        match slot.as_ref() {
            Some(active) if active.id == id => {
                *slot = None;
                true
            }
            _ => false,
        }
    }

    /// Whether a control connection is currently active.
    #[cfg(test)]
    pub async fn is_connected(&self) -> bool {
        self.slot.lock().await.is_some()
    }

    /// Send one reply to the control client. Failures are logged, never
    /// returned.
    pub async fn send(&self, msg_type: MsgType, to: &str, from: &str, payload: impl Into<String>) {
        let envelope = Envelope::new(msg_type, to, from, payload);
        if let Err(e) = self.try_send(&envelope).await {
            warn!(msg_type = %msg_type, to = %to, error = %e, "reply not delivered");
        }
    }

    /// Send an `error` reply carrying `err`'s client-facing text.
    pub async fn send_error(&self, to: &str, err: &RelayError) {
        self.send(MsgType::Error, to, "", err.reply_text()).await;
    }

    /// Encode and enqueue one envelope for the active connection.
    pub async fn try_send(&self, envelope: &Envelope) -> RelayResult<()> {
        let frame = frame_encode(envelope)?;
        let tx = {
            let slot = self.slot.lock().await;
            slot.as_ref()
                .map(|active| active.tx.clone())
                .ok_or(RelayError::NoActiveConnection)?
        };
        tx.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                RelayError::Transport("outbound queue full, client not reading".into())
            }
            mpsc::error::TrySendError::Closed(_) => {
                RelayError::Transport("control connection writer closed".into())
            }
        })?;
        debug!(msg_type = %envelope.msg_type, to = %envelope.to, "reply queued");
        Ok(())
    }
}
