#![allow(dead_code)]

use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use futures_util::StreamExt;
use lnsdk::{
    proto::{invoicesrpc, lnrpc, routerrpc},
    transport::{Transport, TransportError},
    CircuitKey, FeedStatus, FeedStream, ForwardAction, Listener, ListenerError, NodeRpc,
};
use parking_lot::Mutex;
use tokio::{sync::mpsc, time};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tonic::Status;

pub const PEER_42: &str = "03ab4b10e0d1fd1c9b6f8a3cb7c1a9b6cb21d1f7c8a9d2e3f40516273849aabbcc";

type Sender<T> = mpsc::UnboundedSender<Result<T, Status>>;

/// Daemon calls whose failure a test can force.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Call {
    Connect,
    GetInfo,
    ListChannels,
    SubscribeInvoices,
    SubscribeHtlcEvents,
    SubscribeSingleInvoice,
    HtlcInterceptor,
    SendPayment,
    AddHoldInvoice,
    CancelInvoice,
    SettleInvoice,
}

pub struct InterceptorStream {
    pub requests: Sender<routerrpc::ForwardHtlcInterceptRequest>,
    pub decisions: mpsc::Receiver<routerrpc::ForwardHtlcInterceptResponse>,
}

/// In-memory lnd. Every opened stream stays open until the test pushes on or drops its sender.
#[derive(Default)]
pub struct Daemon {
    failing: Mutex<HashSet<Call>>,
    stalled: Mutex<HashSet<Call>>,
    pub channels: Mutex<Vec<lnrpc::Channel>>,
    pub invoice_feeds: Mutex<Vec<Sender<lnrpc::Invoice>>>,
    pub htlc_feeds: Mutex<Vec<Sender<routerrpc::HtlcEvent>>>,
    pub single_invoice_feeds: Mutex<Vec<(Vec<u8>, Sender<lnrpc::Invoice>)>>,
    pub payment_feeds: Mutex<Vec<(routerrpc::SendPaymentRequest, Sender<lnrpc::Payment>)>>,
    pub interceptors: Mutex<Vec<InterceptorStream>>,
    pub hold_invoices: Mutex<Vec<invoicesrpc::AddHoldInvoiceRequest>>,
    pub cancelled: Mutex<Vec<Vec<u8>>>,
    pub settled: Mutex<Vec<Vec<u8>>>,
    pub connected: AtomicBool,
    pub disconnects: AtomicUsize,
}

impl Daemon {
    pub fn with_channels(channels: Vec<lnrpc::Channel>) -> Arc<Self> {
        let daemon = Self::default();
        *daemon.channels.lock() = channels;
        Arc::new(daemon)
    }

    pub fn fail(&self, call: Call) {
        self.failing.lock().insert(call);
    }

    pub fn heal(&self, call: Call) {
        self.failing.lock().remove(&call);
    }

    /// Make `call` never answer, like a daemon that accepted the request and went quiet.
    pub fn stall(&self, call: Call) {
        self.stalled.lock().insert(call);
    }

    async fn answer(&self, call: Call) -> Result<(), Status> {
        if self.stalled.lock().contains(&call) {
            std::future::pending::<()>().await;
        }
        self.check(call)
    }

    fn check(&self, call: Call) -> Result<(), Status> {
        if self.failing.lock().contains(&call) {
            return Err(Status::unavailable(format!("{call:?} forced to fail")));
        }
        Ok(())
    }

    pub fn push_invoice(&self, invoice: lnrpc::Invoice) {
        for tx in self.invoice_feeds.lock().iter() {
            let _ = tx.send(Ok(invoice.clone()));
        }
    }

    pub fn push_htlc_event(&self, event: routerrpc::HtlcEvent) {
        for tx in self.htlc_feeds.lock().iter() {
            let _ = tx.send(Ok(event.clone()));
        }
    }

    /// Hold a forward on the most recently opened interceptor.
    pub fn hold_forward(&self, key: CircuitKey) {
        let interceptors = self.interceptors.lock();
        let stream = interceptors.last().expect("interceptor open");
        let _ = stream.requests.send(Ok(forward(key)));
    }

    /// Take the decision channel of the most recently opened interceptor.
    pub fn take_decisions(
        &self,
    ) -> mpsc::Receiver<routerrpc::ForwardHtlcInterceptResponse> {
        let mut interceptors = self.interceptors.lock();
        let stream = interceptors.last_mut().expect("interceptor open");
        let (_, placeholder) = mpsc::channel(1);
        std::mem::replace(&mut stream.decisions, placeholder)
    }

    pub fn single_invoice_hashes(&self) -> Vec<Vec<u8>> {
        self.single_invoice_feeds
            .lock()
            .iter()
            .map(|(hash, _)| hash.clone())
            .collect()
    }
}

fn open<T: Send + 'static>() -> (Sender<T>, FeedStream<T>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (tx, UnboundedReceiverStream::new(rx).boxed())
}

pub struct MockNode {
    daemon: Arc<Daemon>,
}

#[async_trait]
impl NodeRpc for MockNode {
    async fn get_info(&self) -> Result<lnrpc::GetInfoResponse, Status> {
        self.daemon.answer(Call::GetInfo).await?;
        Ok(lnrpc::GetInfoResponse {
            identity_pubkey: "02mocknode".into(),
            alias: "mock".into(),
            synced_to_chain: true,
            ..Default::default()
        })
    }

    async fn list_channels(&self) -> Result<Vec<lnrpc::Channel>, Status> {
        self.daemon.answer(Call::ListChannels).await?;
        Ok(self.daemon.channels.lock().clone())
    }

    async fn subscribe_invoices(&self) -> Result<FeedStream<lnrpc::Invoice>, Status> {
        self.daemon.answer(Call::SubscribeInvoices).await?;
        let (tx, stream) = open();
        self.daemon.invoice_feeds.lock().push(tx);
        Ok(stream)
    }

    async fn subscribe_htlc_events(&self) -> Result<FeedStream<routerrpc::HtlcEvent>, Status> {
        self.daemon.answer(Call::SubscribeHtlcEvents).await?;
        let (tx, stream) = open();
        self.daemon.htlc_feeds.lock().push(tx);
        Ok(stream)
    }

    async fn subscribe_single_invoice(
        &self,
        r_hash: Vec<u8>,
    ) -> Result<FeedStream<lnrpc::Invoice>, Status> {
        self.daemon.answer(Call::SubscribeSingleInvoice).await?;
        let (tx, stream) = open();
        self.daemon.single_invoice_feeds.lock().push((r_hash, tx));
        Ok(stream)
    }

    async fn htlc_interceptor(
        &self,
        decisions: mpsc::Receiver<routerrpc::ForwardHtlcInterceptResponse>,
    ) -> Result<FeedStream<routerrpc::ForwardHtlcInterceptRequest>, Status> {
        self.daemon.answer(Call::HtlcInterceptor).await?;
        let (requests, stream) = open();
        self.daemon
            .interceptors
            .lock()
            .push(InterceptorStream { requests, decisions });
        Ok(stream)
    }

    async fn send_payment(
        &self,
        request: routerrpc::SendPaymentRequest,
    ) -> Result<FeedStream<lnrpc::Payment>, Status> {
        self.daemon.answer(Call::SendPayment).await?;
        let (tx, stream) = open();
        self.daemon.payment_feeds.lock().push((request, tx));
        Ok(stream)
    }

    async fn add_hold_invoice(
        &self,
        request: invoicesrpc::AddHoldInvoiceRequest,
    ) -> Result<invoicesrpc::AddHoldInvoiceResp, Status> {
        self.daemon.answer(Call::AddHoldInvoice).await?;
        let payment_request = format!("lnbcrt{}n1p{}", request.value_msat, hex::encode(&request.hash));
        self.daemon.hold_invoices.lock().push(request);
        Ok(invoicesrpc::AddHoldInvoiceResp {
            payment_request,
            add_index: 1,
            payment_addr: vec![0xaa; 32],
        })
    }

    async fn cancel_invoice(&self, payment_hash: Vec<u8>) -> Result<(), Status> {
        self.daemon.answer(Call::CancelInvoice).await?;
        self.daemon.cancelled.lock().push(payment_hash);
        Ok(())
    }

    async fn settle_invoice(&self, preimage: Vec<u8>) -> Result<(), Status> {
        self.daemon.answer(Call::SettleInvoice).await?;
        self.daemon.settled.lock().push(preimage);
        Ok(())
    }
}

pub struct MockTransport {
    daemon: Arc<Daemon>,
}

impl MockTransport {
    pub fn new(daemon: &Arc<Daemon>) -> Self {
        Self {
            daemon: daemon.clone(),
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    type Svc = ();
    type Node = MockNode;

    async fn connect(&mut self) -> Result<Self::Svc, TransportError> {
        if self.daemon.check(Call::Connect).is_err() {
            return Err(TransportError::connection_message("connection refused"));
        }
        self.daemon.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn node(&self, _svc: Self::Svc, _max_message_size: usize) -> Result<Self::Node, TransportError> {
        Ok(MockNode {
            daemon: self.daemon.clone(),
        })
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        self.daemon.connected.store(false, Ordering::SeqCst);
        self.daemon.disconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Listener that records everything it sees.
#[derive(Default)]
pub struct Recorder {
    pub invoices: Mutex<Vec<lnrpc::Invoice>>,
    pub htlc_events: Mutex<Vec<routerrpc::HtlcEvent>>,
    pub payments: Mutex<Vec<lnrpc::Payment>>,
    pub intercepted: Mutex<Vec<CircuitKey>>,
    pub closed: Mutex<Vec<FeedStatus>>,
    /// Decision returned for every intercepted forward; `None` defers to the session default.
    pub decision: Option<ForwardAction>,
    /// Make every data callback return an error after recording.
    pub fail_callbacks: bool,
}

impl Recorder {
    pub fn deciding(action: ForwardAction) -> Arc<Self> {
        Arc::new(Self {
            decision: Some(action),
            ..Self::default()
        })
    }

    fn outcome(&self) -> Result<(), ListenerError> {
        if self.fail_callbacks {
            return Err("listener rejected event".into());
        }
        Ok(())
    }
}

#[async_trait]
impl Listener for Recorder {
    async fn on_htlc_intercept(
        &self,
        forward: &routerrpc::ForwardHtlcInterceptRequest,
    ) -> Result<Option<ForwardAction>, ListenerError> {
        if let Some(key) = &forward.incoming_circuit_key {
            self.intercepted.lock().push(CircuitKey::from(key));
        }
        Ok(self.decision.clone())
    }

    async fn on_payment(&self, payment: &lnrpc::Payment) -> Result<(), ListenerError> {
        self.payments.lock().push(payment.clone());
        self.outcome()
    }

    async fn on_htlc_event(&self, event: &routerrpc::HtlcEvent) -> Result<(), ListenerError> {
        self.htlc_events.lock().push(event.clone());
        self.outcome()
    }

    async fn on_invoice(&self, invoice: &lnrpc::Invoice) -> Result<(), ListenerError> {
        self.invoices.lock().push(invoice.clone());
        self.outcome()
    }

    async fn on_feed_closed(&self, status: &FeedStatus) {
        self.closed.lock().push(status.clone());
    }
}

pub fn channel(chan_id: u64, remote_pubkey: &str) -> lnrpc::Channel {
    lnrpc::Channel {
        chan_id,
        remote_pubkey: remote_pubkey.to_string(),
        active: true,
        ..Default::default()
    }
}

pub fn forward(key: CircuitKey) -> routerrpc::ForwardHtlcInterceptRequest {
    routerrpc::ForwardHtlcInterceptRequest {
        incoming_circuit_key: Some(key.into()),
        incoming_amount_msat: 1_001_000,
        outgoing_amount_msat: 1_000_000,
        payment_hash: vec![0x11; 32],
        ..Default::default()
    }
}

/// Poll `cond` until it holds, failing the test after two seconds.
pub async fn eventually(what: &str, mut cond: impl FnMut() -> bool) {
    let waited = time::timeout(Duration::from_secs(2), async {
        while !cond() {
            time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {what}");
}
