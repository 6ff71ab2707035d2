//! The slice of lnd's RPC surface the session drives, and its tonic implementation.

use std::future::Future;

use async_trait::async_trait;
use futures_util::{
    stream::{self, BoxStream},
    StreamExt,
};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{
    metadata::{AsciiMetadataKey, AsciiMetadataValue},
    service::{interceptor::InterceptedService, Interceptor as TonicInterceptor},
    transport::Channel,
    Status,
};

use crate::{
    proto::{
        invoicesrpc::{self, invoices_client::InvoicesClient},
        lnrpc::{self, lightning_client::LightningClient},
        routerrpc::{self, router_client::RouterClient},
    },
    transport::TransportError,
};

/// Server-pushed stream of daemon messages.
pub type FeedStream<T> = BoxStream<'static, Result<T, Status>>;

/// Daemon calls used by [`crate::Session`].
///
/// A stream-opening call may resolve before the daemon has answered; a refusal then
/// arrives as the stream's first item.
///
/// [`LndNode`] talks to a real lnd; tests substitute an in-memory daemon.
#[async_trait]
pub trait NodeRpc: Send + Sync + 'static {
    async fn get_info(&self) -> Result<lnrpc::GetInfoResponse, Status>;

    async fn list_channels(&self) -> Result<Vec<lnrpc::Channel>, Status>;

    async fn subscribe_invoices(&self) -> Result<FeedStream<lnrpc::Invoice>, Status>;

    async fn subscribe_htlc_events(&self) -> Result<FeedStream<routerrpc::HtlcEvent>, Status>;

    async fn subscribe_single_invoice(
        &self,
        r_hash: Vec<u8>,
    ) -> Result<FeedStream<lnrpc::Invoice>, Status>;

    /// Open the interceptor stream. Messages sent on `decisions` flow to lnd.
    async fn htlc_interceptor(
        &self,
        decisions: mpsc::Receiver<routerrpc::ForwardHtlcInterceptResponse>,
    ) -> Result<FeedStream<routerrpc::ForwardHtlcInterceptRequest>, Status>;

    async fn send_payment(
        &self,
        request: routerrpc::SendPaymentRequest,
    ) -> Result<FeedStream<lnrpc::Payment>, Status>;

    async fn add_hold_invoice(
        &self,
        request: invoicesrpc::AddHoldInvoiceRequest,
    ) -> Result<invoicesrpc::AddHoldInvoiceResp, Status>;

    async fn cancel_invoice(&self, payment_hash: Vec<u8>) -> Result<(), Status>;

    async fn settle_invoice(&self, preimage: Vec<u8>) -> Result<(), Status>;
}

/// Attaches the transport's auth metadata (the hex macaroon) to every request.
#[derive(Clone, Debug)]
pub struct MacaroonInterceptor {
    md: Vec<(AsciiMetadataKey, AsciiMetadataValue)>,
}

impl MacaroonInterceptor {
    /// Validate metadata pairs up front so per-request insertion cannot fail.
    ///
    /// # Errors
    /// Returns [`TransportError`] if a key or value is not valid ASCII metadata.
    pub fn new(md: &[(String, String)]) -> Result<Self, TransportError> {
        let md = md
            .iter()
            .map(|(k, v)| {
                let key = AsciiMetadataKey::from_bytes(k.as_bytes())
                    .map_err(|e| TransportError::connection("invalid metadata key", e))?;
                let val = AsciiMetadataValue::try_from(v.as_str())
                    .map_err(|e| TransportError::connection("invalid metadata value", e))?;
                Ok::<_, TransportError>((key, val))
            })
            .collect::<Result<Vec<_>, TransportError>>()?;
        Ok(Self { md })
    }
}

impl TonicInterceptor for MacaroonInterceptor {
    fn call(&mut self, mut req: tonic::Request<()>) -> Result<tonic::Request<()>, Status> {
        for (k, v) in &self.md {
            req.metadata_mut().insert(k.clone(), v.clone());
        }
        Ok(req)
    }
}

type LndService = InterceptedService<Channel, MacaroonInterceptor>;

/// Issue a server-streaming call when the returned stream is first polled.
///
/// lnd sends response headers together with the first message of a notification
/// stream, so awaiting the call itself blocks until the first event.
fn deferred<T, F>(call: F) -> FeedStream<T>
where
    T: Send + 'static,
    F: Future<Output = Result<tonic::Response<tonic::Streaming<T>>, Status>> + Send + 'static,
{
    stream::once(call)
        .map(|res| match res {
            Ok(resp) => resp.into_inner().boxed(),
            Err(status) => stream::iter([Err(status)]).boxed(),
        })
        .flatten()
        .boxed()
}

/// The three lnd service clients sharing one multiplexed channel.
#[derive(Clone)]
pub struct LndNode {
    lightning: LightningClient<LndService>,
    router: RouterClient<LndService>,
    invoices: InvoicesClient<LndService>,
}

impl LndNode {
    /// Bind the lightning, router and invoices clients to `channel`.
    #[must_use]
    pub fn new(channel: Channel, interceptor: MacaroonInterceptor, max_message_size: usize) -> Self {
        Self {
            lightning: LightningClient::with_interceptor(channel.clone(), interceptor.clone())
                .max_decoding_message_size(max_message_size),
            router: RouterClient::with_interceptor(channel.clone(), interceptor.clone())
                .max_decoding_message_size(max_message_size),
            invoices: InvoicesClient::with_interceptor(channel, interceptor)
                .max_decoding_message_size(max_message_size),
        }
    }

    /// Raw `lnrpc.Lightning` client for calls outside [`NodeRpc`].
    #[must_use]
    pub fn lightning(&self) -> LightningClient<LndService> {
        self.lightning.clone()
    }

    /// Raw `routerrpc.Router` client.
    #[must_use]
    pub fn router(&self) -> RouterClient<LndService> {
        self.router.clone()
    }

    /// Raw `invoicesrpc.Invoices` client.
    #[must_use]
    pub fn invoices(&self) -> InvoicesClient<LndService> {
        self.invoices.clone()
    }
}

#[async_trait]
impl NodeRpc for LndNode {
    async fn get_info(&self) -> Result<lnrpc::GetInfoResponse, Status> {
        let res = self
            .lightning
            .clone()
            .get_info(lnrpc::GetInfoRequest {})
            .await?;
        Ok(res.into_inner())
    }

    async fn list_channels(&self) -> Result<Vec<lnrpc::Channel>, Status> {
        let res = self
            .lightning
            .clone()
            .list_channels(lnrpc::ListChannelsRequest::default())
            .await?;
        Ok(res.into_inner().channels)
    }

    async fn subscribe_invoices(&self) -> Result<FeedStream<lnrpc::Invoice>, Status> {
        let mut client = self.lightning.clone();
        Ok(deferred(async move {
            client
                .subscribe_invoices(lnrpc::InvoiceSubscription::default())
                .await
        }))
    }

    async fn subscribe_htlc_events(&self) -> Result<FeedStream<routerrpc::HtlcEvent>, Status> {
        let mut client = self.router.clone();
        Ok(deferred(async move {
            client
                .subscribe_htlc_events(routerrpc::SubscribeHtlcEventsRequest {})
                .await
        }))
    }

    async fn subscribe_single_invoice(
        &self,
        r_hash: Vec<u8>,
    ) -> Result<FeedStream<lnrpc::Invoice>, Status> {
        let mut client = self.invoices.clone();
        Ok(deferred(async move {
            client
                .subscribe_single_invoice(invoicesrpc::SubscribeSingleInvoiceRequest { r_hash })
                .await
        }))
    }

    async fn htlc_interceptor(
        &self,
        decisions: mpsc::Receiver<routerrpc::ForwardHtlcInterceptResponse>,
    ) -> Result<FeedStream<routerrpc::ForwardHtlcInterceptRequest>, Status> {
        let mut client = self.router.clone();
        Ok(deferred(async move {
            client
                .htlc_interceptor(ReceiverStream::new(decisions))
                .await
        }))
    }

    // Awaited eagerly: lnd answers with the initial payment state, and submission
    // errors must surface to the caller.
    async fn send_payment(
        &self,
        request: routerrpc::SendPaymentRequest,
    ) -> Result<FeedStream<lnrpc::Payment>, Status> {
        let res = self.router.clone().send_payment_v2(request).await?;
        Ok(res.into_inner().boxed())
    }

    async fn add_hold_invoice(
        &self,
        request: invoicesrpc::AddHoldInvoiceRequest,
    ) -> Result<invoicesrpc::AddHoldInvoiceResp, Status> {
        let res = self.invoices.clone().add_hold_invoice(request).await?;
        Ok(res.into_inner())
    }

    async fn cancel_invoice(&self, payment_hash: Vec<u8>) -> Result<(), Status> {
        self.invoices
            .clone()
            .cancel_invoice(invoicesrpc::CancelInvoiceMsg { payment_hash })
            .await?;
        Ok(())
    }

    async fn settle_invoice(&self, preimage: Vec<u8>) -> Result<(), Status> {
        self.invoices
            .clone()
            .settle_invoice(invoicesrpc::SettleInvoiceMsg { preimage })
            .await?;
        Ok(())
    }
}
