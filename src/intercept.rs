//! HTLC interception: one decision per held forward, keyed by its incoming circuit.

use std::collections::{HashSet, VecDeque};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::{
    listener::{CircuitKey, ForwardAction, ForwardDecision, Listener},
    proto::routerrpc,
};

/// Buffer between the decision sender and the outbound gRPC stream.
pub(crate) const DECISION_BUFFER: usize = 64;
/// Decided keys remembered for duplicate detection; the oldest are forgotten first.
const LEDGER_CAPACITY: usize = 65_536;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InterceptError {
    /// A decision for this forward was already sent. lnd treats a second one as a
    /// protocol violation, so it is never forwarded.
    #[error("forward {0:?} was already decided")]
    AlreadyDecided(CircuitKey),
    /// The interceptor stream is gone; the forward stays undecided and lnd will fail it.
    #[error("interceptor stream closed before deciding {0:?}")]
    StreamClosed(CircuitKey),
}

#[derive(Default)]
struct Ledger {
    decided: HashSet<CircuitKey>,
    order: VecDeque<CircuitKey>,
}

impl Ledger {
    fn record(&mut self, key: CircuitKey) -> bool {
        if !self.decided.insert(key) {
            return false;
        }
        self.order.push_back(key);
        if self.order.len() > LEDGER_CAPACITY {
            if let Some(oldest) = self.order.pop_front() {
                self.decided.remove(&oldest);
            }
        }
        true
    }
}

/// Outbound half of the interceptor stream. Sends at most one decision per circuit key.
pub struct DecisionSender {
    tx: mpsc::Sender<routerrpc::ForwardHtlcInterceptResponse>,
    ledger: Mutex<Ledger>,
}

impl DecisionSender {
    pub(crate) fn new(tx: mpsc::Sender<routerrpc::ForwardHtlcInterceptResponse>) -> Self {
        Self {
            tx,
            ledger: Mutex::default(),
        }
    }

    /// Queue `decision` for lnd.
    ///
    /// # Errors
    /// [`InterceptError::AlreadyDecided`] if the key was decided before (nothing is sent),
    /// [`InterceptError::StreamClosed`] if the stream no longer accepts messages.
    pub async fn send(&self, decision: ForwardDecision) -> Result<(), InterceptError> {
        let key = decision.key;
        if !self.ledger.lock().record(key) {
            return Err(InterceptError::AlreadyDecided(key));
        }
        self.tx
            .send(decision.into_response())
            .await
            .map_err(|_| InterceptError::StreamClosed(key))
    }

    /// Whether a decision for `key` has been sent.
    #[must_use]
    pub fn is_decided(&self, key: &CircuitKey) -> bool {
        self.ledger.lock().decided.contains(key)
    }
}

/// Ask the listener about one held forward and send exactly one decision for it.
///
/// `Ok(None)` and listener errors resolve to `default_action`. Forwards without a circuit
/// key cannot be answered and are dropped.
pub(crate) async fn resolve(
    listener: &dyn Listener,
    decisions: &DecisionSender,
    default_action: &ForwardAction,
    forward: routerrpc::ForwardHtlcInterceptRequest,
) {
    let Some(key) = forward.incoming_circuit_key.as_ref().map(CircuitKey::from) else {
        warn!(
            target: "lnsdk::intercept",
            payment_hash = %hex::encode(&forward.payment_hash),
            "intercepted forward without circuit key; leaving undecided"
        );
        return;
    };

    let action = match listener.on_htlc_intercept(&forward).await {
        Ok(Some(action)) => action,
        Ok(None) => {
            debug!(target: "lnsdk::intercept", ?key, action = ?default_action, "listener deferred; applying default");
            default_action.clone()
        }
        Err(err) => {
            warn!(target: "lnsdk::intercept", ?key, error = %err, action = ?default_action, "listener failed; applying default");
            default_action.clone()
        }
    };

    debug!(target: "lnsdk::intercept", ?key, ?action, "sending forward decision");
    if let Err(err) = decisions.send(ForwardDecision { key, action }).await {
        warn!(target: "lnsdk::intercept", ?key, error = %err, "forward decision not delivered");
    }
}
