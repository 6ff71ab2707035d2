//! Application callback surface fed by the session's dispatch tasks.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    feed::FeedStatus,
    proto::{lnrpc, routerrpc},
};

/// Error type returned from [`Listener`] callbacks. Observed and logged, never acted upon.
pub type ListenerError = Box<dyn std::error::Error + Send + Sync>;

/// Incoming circuit key identifying one intercepted forward: `(incoming channel, htlc index)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CircuitKey {
    pub chan_id: u64,
    pub htlc_id: u64,
}

impl From<&routerrpc::CircuitKey> for CircuitKey {
    fn from(key: &routerrpc::CircuitKey) -> Self {
        Self {
            chan_id: key.chan_id,
            htlc_id: key.htlc_id,
        }
    }
}

impl From<CircuitKey> for routerrpc::CircuitKey {
    fn from(key: CircuitKey) -> Self {
        Self {
            chan_id: key.chan_id,
            htlc_id: key.htlc_id,
        }
    }
}

/// Resolution of an intercepted forward.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForwardAction {
    /// Let the forward continue to the outgoing channel.
    #[default]
    Resume,
    /// Fail the forward back to the sender. lnd reports a temporary channel failure.
    Reject,
    /// Settle the incoming HTLC with the given preimage.
    Settle { preimage: Vec<u8> },
}

impl ForwardAction {
    fn wire_action(&self) -> routerrpc::ResolveHoldForwardAction {
        match self {
            ForwardAction::Resume => routerrpc::ResolveHoldForwardAction::Resume,
            ForwardAction::Reject => routerrpc::ResolveHoldForwardAction::Fail,
            ForwardAction::Settle { .. } => routerrpc::ResolveHoldForwardAction::Settle,
        }
    }
}

/// A decision tagged with the circuit key of the forward it answers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ForwardDecision {
    pub key: CircuitKey,
    pub action: ForwardAction,
}

impl ForwardDecision {
    #[must_use]
    pub fn into_response(self) -> routerrpc::ForwardHtlcInterceptResponse {
        let mut response = routerrpc::ForwardHtlcInterceptResponse {
            incoming_circuit_key: Some(self.key.into()),
            ..Default::default()
        };
        response.set_action(self.action.wire_action());
        if let ForwardAction::Settle { preimage } = self.action {
            response.preimage = preimage;
        }
        response
    }
}

/// Application handler for every event kind a [`crate::Session`] delivers.
///
/// # Concurrency
///
/// Each feed calls into the listener from its own task, so the invoice feed, the HTLC
/// event feed, the interceptor and every payment feed may be inside different methods
/// at the same time. Implementations must be safe for concurrent entry (hence the
/// `Send + Sync` bound). Within a single feed calls are strictly sequential: the next
/// message is not read until the current callback returns, so a slow callback only
/// stalls its own feed.
///
/// The default method bodies form the baseline listener: they log the event and, for
/// interception, return `None` so the session's configured
/// [`default_forward_action`](crate::SessionConfig::default_forward_action) is applied.
#[async_trait]
pub trait Listener: Send + Sync + 'static {
    /// An HTLC forward is held by lnd awaiting a decision.
    ///
    /// Return `Ok(Some(action))` to decide explicitly. `Ok(None)` and `Err(_)` both fall
    /// back to the configured default action. Exactly one decision is sent per forward;
    /// the listener never sends on the interceptor stream itself.
    async fn on_htlc_intercept(
        &self,
        forward: &routerrpc::ForwardHtlcInterceptRequest,
    ) -> Result<Option<ForwardAction>, ListenerError> {
        debug!(
            target: "lnsdk::listener",
            payment_hash = %hex::encode(&forward.payment_hash),
            outgoing_chan_id = forward.outgoing_requested_chan_id,
            incoming_amount_msat = forward.incoming_amount_msat,
            outgoing_amount_msat = forward.outgoing_amount_msat,
            "htlc intercepted; deferring to default action"
        );
        Ok(None)
    }

    /// Status update for a payment submitted through the session.
    async fn on_payment(&self, payment: &lnrpc::Payment) -> Result<(), ListenerError> {
        debug!(
            target: "lnsdk::listener",
            payment_hash = %payment.payment_hash,
            value_msat = payment.value_msat,
            status = ?payment.status(),
            "payment update"
        );
        Ok(())
    }

    /// Forwarding, settlement or link failure event for any HTLC on the node.
    async fn on_htlc_event(&self, event: &routerrpc::HtlcEvent) -> Result<(), ListenerError> {
        debug!(
            target: "lnsdk::listener",
            incoming_channel_id = event.incoming_channel_id,
            outgoing_channel_id = event.outgoing_channel_id,
            event_type = ?event.event_type(),
            "htlc event"
        );
        Ok(())
    }

    /// Invoice update from the global invoice feed or a single-invoice feed.
    async fn on_invoice(&self, invoice: &lnrpc::Invoice) -> Result<(), ListenerError> {
        debug!(
            target: "lnsdk::listener",
            r_hash = %hex::encode(&invoice.r_hash),
            value_msat = invoice.value_msat,
            payment_addr = %hex::encode(&invoice.payment_addr),
            state = ?invoice.state(),
            is_keysend = invoice.is_keysend,
            "invoice update"
        );
        Ok(())
    }

    /// A feed reached a terminal state. Called once per feed, after its last event.
    async fn on_feed_closed(&self, status: &FeedStatus) {
        debug!(
            target: "lnsdk::listener",
            feed = %status.id,
            kind = %status.kind,
            state = ?status.state,
            "feed closed"
        );
    }
}

/// Baseline listener: logs every event and leaves forwards to the default action.
#[derive(Clone, Copy, Debug, Default)]
pub struct LoggingListener;

impl Listener for LoggingListener {}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> CircuitKey {
        CircuitKey {
            chan_id: 42,
            htlc_id: 7,
        }
    }

    #[test]
    fn resume_decision_carries_circuit_key() {
        let resp = ForwardDecision {
            key: key(),
            action: ForwardAction::Resume,
        }
        .into_response();
        assert_eq!(resp.action(), routerrpc::ResolveHoldForwardAction::Resume);
        let wire_key = resp.incoming_circuit_key.expect("key");
        assert_eq!((wire_key.chan_id, wire_key.htlc_id), (42, 7));
        assert!(resp.preimage.is_empty());
    }

    #[test]
    fn reject_maps_to_fail() {
        let resp = ForwardDecision {
            key: key(),
            action: ForwardAction::Reject,
        }
        .into_response();
        assert_eq!(resp.action(), routerrpc::ResolveHoldForwardAction::Fail);
    }

    #[test]
    fn settle_includes_preimage() {
        let resp = ForwardDecision {
            key: key(),
            action: ForwardAction::Settle {
                preimage: vec![9; 32],
            },
        }
        .into_response();
        assert_eq!(resp.action(), routerrpc::ResolveHoldForwardAction::Settle);
        assert_eq!(resp.preimage, vec![9; 32]);
    }

    #[tokio::test]
    async fn baseline_listener_defers_interception() {
        let forward = routerrpc::ForwardHtlcInterceptRequest {
            incoming_circuit_key: Some(key().into()),
            ..Default::default()
        };
        let decision = LoggingListener
            .on_htlc_intercept(&forward)
            .await
            .expect("baseline never fails");
        assert_eq!(decision, None);
    }
}
