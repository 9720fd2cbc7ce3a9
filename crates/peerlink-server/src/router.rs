//! Message router: turns decoded envelopes into coordinator calls.
//!
//! Never fails. Malformed input is logged and dropped; protocol problems
//! (unknown command, missing target, bad nested payload) become `error`
//! replies.

use crate::context::RelayContext;
use crate::notifier::OutboundNotifier;
use crate::relay::SessionCoordinator;
use peerlink_core::messages::{ConnectDetails, Envelope, MsgType};
use peerlink_core::{RelayError, RelayResult};
use std::sync::Arc;
use tracing::{debug, warn};

pub struct MessageRouter {
    coordinator: Arc<SessionCoordinator>,
    notifier: Arc<OutboundNotifier>,
}

impl MessageRouter {
    pub fn new(ctx: &RelayContext) -> Self {
        Self {
            coordinator: ctx.coordinator.clone(),
            notifier: ctx.notifier.clone(),
        }
    }

    /// Handle one decoder result: dispatch envelopes, drop parse errors.
    pub async fn route(&self, decoded: RelayResult<Envelope>) {
        match decoded {
            Ok(envelope) => self.dispatch(envelope).await,
            Err(e) => warn!(error = %e, "dropping malformed message"),
        }
    }

    /// Route an envelope by its `type`.
    pub async fn dispatch(&self, envelope: Envelope) {
        debug!(
            msg_type = %envelope.msg_type,
            from = %envelope.from,
            to = %envelope.to,
            "control message"
        );

        match envelope.command() {
            Some(MsgType::GetInfo) => self.coordinator.handle_get_info(&envelope.from).await,
            Some(MsgType::Connect) => {
                let details = match ConnectDetails::parse(&envelope.payload) {
                    Ok(details) => details,
                    Err(e) => return self.reject(&envelope.to, e).await,
                };
                if envelope.to.is_empty() {
                    return self.reject("", RelayError::MissingTarget).await;
                }
                self.coordinator.handle_connect(&envelope.to, details).await;
            }
            Some(MsgType::Close) => {
                if envelope.to.is_empty() {
                    return self.reject("", RelayError::MissingTarget).await;
                }
                self.coordinator.handle_close(&envelope.to).await;
            }
            _ => {
                self.reject(
                    &envelope.from,
                    RelayError::UnknownCommand(envelope.msg_type.clone()),
                )
                .await
            }
        }
    }

    async fn reject(&self, to: &str, err: RelayError) {
        warn!(to = %to, kind = ?err.kind(), error = %err, "rejecting control message");
        self.notifier.send_error(to, &err).await;
    }
}
