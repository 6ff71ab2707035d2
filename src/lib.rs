#![deny(unsafe_code)]

//! Long-lived lnd client sessions with concurrent event feeds.
//!
//! A [`Session`] dials lnd over an authenticated gRPC channel, then keeps several
//! server-pushed streams open at once (invoices, HTLC events, the HTLC interceptor,
//! per-invoice and per-payment updates) and delivers every message to one [`Listener`].
//! Each feed runs in its own task; messages within a feed are delivered in order.
//! Payments and hold invoices are submitted through the same session while feeds run.
//!
//! Features
//! - `transport-direct` (default): direct TLS gRPC via tonic
//!
//! Protos
//! - `build.rs` compiles the `lnrpc`, `routerrpc` and `invoicesrpc` definitions under
//!   `protos/lnd/<tag>/`. Set `LND_TAG` to pick a tag other than the newest.
//!
//! Example
//! ```no_run
//! use std::sync::Arc;
//! use lnsdk::{LoggingListener, Session, SessionConfig};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = SessionConfig {
//!     lnd_dir: "~/.lnd".into(),
//!     ..SessionConfig::default()
//! };
//! let session = Session::connect(Arc::new(LoggingListener), config).await?;
//! println!("{}", session.lookup_counterparty_by_channel(42)?);
//! session.cleanup().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod credentials;
pub mod error;
pub mod feed;
pub mod intercept;
pub mod listener;
pub mod node;
pub mod payment;
pub mod proto;
pub mod session;
pub mod snapshot;
pub mod transport;

pub use config::{Network, SessionConfig, SnapshotPolicy};
pub use credentials::{CredentialError, LndCredentials};
pub use error::{
    InvoiceError, NotFoundError, PaymentError, Result, SessionError, StartError, StartStep,
};
pub use feed::{FeedId, FeedKind, FeedState, FeedStatus, StreamError};
pub use intercept::{DecisionSender, InterceptError};
pub use listener::{
    CircuitKey, ForwardAction, ForwardDecision, Listener, ListenerError, LoggingListener,
};
pub use node::{FeedStream, LndNode, NodeRpc};
pub use session::Session;
pub use snapshot::{ChannelEntry, ChannelSnapshot};
