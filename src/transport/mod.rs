use std::{borrow::Cow, error::Error, time::Duration};

use async_trait::async_trait;

use crate::{credentials::CredentialError, node::NodeRpc};

type BoxError = Box<dyn Error + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connecting to {addr} timed out after {timeout:?}")]
    Timeout { addr: String, timeout: Duration },
    #[error(transparent)]
    Credentials(#[from] CredentialError),
    #[error("{context}")]
    Connection {
        context: Cow<'static, str>,
        #[source]
        source: Option<BoxError>,
    },
}

impl TransportError {
    /// Build a connection error with optional context and source.
    pub fn connection<S, E>(context: S, source: E) -> Self
    where
        S: Into<Cow<'static, str>>,
        E: Error + Send + Sync + 'static,
    {
        Self::Connection {
            context: context.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Build a connection error that only has context (no underlying source).
    pub fn connection_message<S>(context: S) -> Self
    where
        S: Into<Cow<'static, str>>,
    {
        Self::Connection {
            context: context.into(),
            source: None,
        }
    }
}

/// Channel factory: dials the daemon and binds the RPC clients to the resulting channel.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Handle of the multiplexed channel produced by [`connect`](Self::connect).
    type Svc: Send + 'static;
    /// RPC surface built on top of the channel.
    type Node: NodeRpc;

    /// Establish the channel. Implementations must bound the handshake with a deadline.
    async fn connect(&mut self) -> Result<Self::Svc, TransportError>;

    /// Build the service clients bound to `svc`, capping inbound messages at `max_message_size`.
    fn node(&self, svc: Self::Svc, max_message_size: usize) -> Result<Self::Node, TransportError>;

    /// Release the channel. Streams still reading from it end.
    async fn disconnect(&mut self) -> Result<(), TransportError>;

    /// Optional per-request metadata headers (key, value) to attach.
    fn metadata(&self) -> Vec<(String, String)> {
        Vec::new()
    }
}

#[cfg(feature = "transport-direct")]
pub mod direct;
