use std::{error::Error, fmt};

use tonic::Status;

use crate::{feed::FeedId, transport::TransportError};

type BoxError = Box<dyn Error + Send + Sync>;

/// Session start-up steps, in execution order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StartStep {
    LoadCredentials,
    OpenChannel,
    BuildClients,
    SubscribeInvoices,
    SubscribeHtlcEvents,
    LoadChannelSnapshot,
    SetupHtlcInterceptor,
}

impl fmt::Display for StartStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StartStep::LoadCredentials => "load credentials",
            StartStep::OpenChannel => "open channel",
            StartStep::BuildClients => "build clients",
            StartStep::SubscribeInvoices => "subscribe invoices",
            StartStep::SubscribeHtlcEvents => "subscribe htlc events",
            StartStep::LoadChannelSnapshot => "load channel snapshot",
            StartStep::SetupHtlcInterceptor => "setup htlc interceptor",
        };
        f.write_str(name)
    }
}

/// First start-up step that failed, with its cause.
#[derive(Debug, thiserror::Error)]
#[error("failed to {step}")]
pub struct StartError {
    pub step: StartStep,
    #[source]
    pub source: BoxError,
}

impl StartError {
    pub(crate) fn new<E>(step: StartStep, source: E) -> Self
    where
        E: Into<BoxError>,
    {
        Self {
            step,
            source: source.into(),
        }
    }
}

/// Errors from session operations other than start-up.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("an htlc interceptor is already open ({0})")]
    InterceptorAlreadyOpen(FeedId),
    #[error(transparent)]
    Rpc(#[from] Box<Status>),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl From<Status> for SessionError {
    fn from(status: Status) -> Self {
        Self::Rpc(Box::new(status))
    }
}

/// Result alias that defaults to [`SessionError`].
pub type Result<T, E = SessionError> = std::result::Result<T, E>;

/// Synchronous failure submitting a payment. Failures reported later on the payment
/// feed are delivered to the listener instead.
#[derive(Debug, thiserror::Error)]
pub enum PaymentError {
    #[error("payment submission failed")]
    Submit(#[source] Box<Status>),
    #[error("amount of {0} msat is out of range")]
    AmountOutOfRange(u64),
}

impl From<Status> for PaymentError {
    fn from(status: Status) -> Self {
        Self::Submit(Box::new(status))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum InvoiceError {
    #[error("failed to add hold invoice")]
    AddHoldInvoice(#[source] Box<Status>),
    #[error("failed to subscribe to invoice {}", hex::encode(.r_hash))]
    Subscribe {
        r_hash: Vec<u8>,
        #[source]
        source: Box<Status>,
    },
    #[error("failed to cancel invoice {}", hex::encode(.payment_hash))]
    Cancel {
        payment_hash: Vec<u8>,
        #[source]
        source: Box<Status>,
    },
    #[error("failed to settle invoice")]
    Settle(#[source] Box<Status>),
    #[error("failed to list channels")]
    ListChannels(#[source] Box<Status>),
    #[error("amount of {0} msat is out of range")]
    AmountOutOfRange(u64),
}

/// Snapshot lookup miss.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("can't find a channel with channel ID of {chan_id}")]
pub struct NotFoundError {
    pub chan_id: u64,
}
