//! The long-lived session: one authenticated channel, many concurrent feeds.

use std::{collections::HashMap, future::Future, sync::Arc, time::Duration};

use parking_lot::RwLock;
use tokio::{
    sync::{mpsc, Mutex as AsyncMutex},
    time::{self, MissedTickBehavior},
};
use tonic::Status;
use tracing::{debug, info, trace, warn};

use crate::{
    config::{SessionConfig, SnapshotPolicy},
    error::{InvoiceError, NotFoundError, PaymentError, Result, SessionError, StartError, StartStep},
    feed::{FeedId, FeedKind, FeedRegistry, FeedStatus},
    intercept::{self, DecisionSender, DECISION_BUFFER},
    listener::{Listener, ListenerError},
    node::{FeedStream, NodeRpc},
    payment::{self, Preimage},
    proto::{invoicesrpc, lnrpc, routerrpc},
    snapshot::ChannelSnapshot,
    transport::Transport,
};

#[cfg(feature = "transport-direct")]
use crate::transport::direct::DirectGrpc;

type SharedSnapshot = Arc<RwLock<Arc<ChannelSnapshot>>>;

fn report(what: &'static str, res: std::result::Result<(), ListenerError>) {
    if let Err(err) = res {
        warn!(target: "lnsdk::dispatch", callback = what, error = %err, "listener returned an error");
    }
}

/// Await an RPC for at most `limit`; expiry becomes `DEADLINE_EXCEEDED`.
async fn deadline<T, F>(limit: Duration, rpc: &'static str, call: F) -> std::result::Result<T, Status>
where
    F: Future<Output = std::result::Result<T, Status>>,
{
    match time::timeout(limit, call).await {
        Ok(res) => res,
        Err(_) => {
            warn!(target: "lnsdk::session", rpc, timeout = ?limit, "rpc deadline exceeded");
            Err(Status::deadline_exceeded(format!(
                "{rpc} did not answer within {limit:?}"
            )))
        }
    }
}

/// Root object tying a transport, its RPC clients, the listener and every open feed together.
///
/// Created with [`Session::start`] (or [`Session::connect`] for a direct lnd connection) and
/// torn down with [`Session::cleanup`]. Feeds run on the ambient tokio runtime.
pub struct Session<T: Transport> {
    transport: T,
    node: Arc<T::Node>,
    config: SessionConfig,
    snapshot: SharedSnapshot,
    feeds: FeedRegistry,
    interceptor: AsyncMutex<Option<FeedId>>,
}

#[cfg(feature = "transport-direct")]
impl Session<DirectGrpc> {
    /// Load credentials from `config.lnd_dir` and start a session over direct TLS gRPC.
    ///
    /// # Errors
    /// [`StartError`] naming the first step that failed, starting with credential loading.
    pub async fn connect(
        listener: Arc<dyn Listener>,
        config: SessionConfig,
    ) -> Result<Self, StartError> {
        let transport = DirectGrpc::from_config(&config)
            .await
            .map_err(|e| StartError::new(StartStep::LoadCredentials, e))?;
        Self::start(listener, transport, config).await
    }
}

impl<T: Transport> Session<T> {
    /// Open the channel, subscribe to invoices and HTLC events, load the channel snapshot
    /// and attach the HTLC interceptor, in that order.
    ///
    /// Each RPC step is bounded by [`SessionConfig::rpc_timeout`], the dial by
    /// [`SessionConfig::connect_timeout`].
    ///
    /// The first failing step aborts start-up. Feeds opened before it are cancelled and
    /// their tasks joined before the error is returned.
    ///
    /// # Errors
    /// [`StartError`] carrying the failed [`StartStep`] and its cause.
    pub async fn start(
        listener: Arc<dyn Listener>,
        mut transport: T,
        config: SessionConfig,
    ) -> Result<Self, StartError> {
        info!(target: "lnsdk::session", endpoint = %config.endpoint(), network = %config.network, "starting session");

        let svc = transport
            .connect()
            .await
            .map_err(|e| StartError::new(StartStep::OpenChannel, e))?;
        let node = match transport.node(svc, config.max_message_size) {
            Ok(node) => Arc::new(node),
            Err(err) => {
                if let Err(e) = transport.disconnect().await {
                    warn!(target: "lnsdk::session", error = %e, "disconnect after failed start");
                }
                return Err(StartError::new(StartStep::BuildClients, err));
            }
        };

        let session = Self {
            transport,
            node,
            snapshot: Arc::default(),
            feeds: FeedRegistry::new(listener, config.retained_closed_feeds),
            config,
            interceptor: AsyncMutex::new(None),
        };

        match session.bring_up().await {
            Ok(()) => {
                info!(target: "lnsdk::session", feeds = session.feeds.statuses().len(), "session started");
                Ok(session)
            }
            Err(err) => {
                warn!(target: "lnsdk::session", step = %err.step, error = %err.source, "session start failed; rolling back");
                if let Err(e) = session.cleanup().await {
                    warn!(target: "lnsdk::session", error = %e, "rollback did not disconnect cleanly");
                }
                Err(err)
            }
        }
    }

    async fn bring_up(&self) -> Result<(), StartError> {
        self.subscribe_invoices()
            .await
            .map_err(|e| StartError::new(StartStep::SubscribeInvoices, e))?;
        self.subscribe_htlc_events()
            .await
            .map_err(|e| StartError::new(StartStep::SubscribeHtlcEvents, e))?;
        let channels = self
            .refresh_channel_snapshot()
            .await
            .map_err(|e| StartError::new(StartStep::LoadChannelSnapshot, e))?;
        debug!(target: "lnsdk::session", channels, "channel snapshot loaded");
        if let SnapshotPolicy::Periodic { every } = self.config.snapshot_policy {
            self.spawn_snapshot_refresher(every);
        }
        self.attach_interceptor()
            .await
            .map_err(|e| StartError::new(StartStep::SetupHtlcInterceptor, e))?;
        Ok(())
    }

    /// Stop every feed and release the transport.
    ///
    /// Shutdown is signalled first so feeds blocked on a receive return immediately, then
    /// the transport is disconnected and all tasks are joined. Tasks still running after
    /// `shutdown_timeout` are aborted.
    ///
    /// # Errors
    /// The transport's disconnect error, reported after every task has been joined.
    pub async fn cleanup(mut self) -> Result<()> {
        info!(target: "lnsdk::session", "cleaning up session");
        self.feeds.signal_shutdown();
        self.interceptor.get_mut().take();
        let disconnected = self.transport.disconnect().await;
        self.feeds.shutdown(self.config.shutdown_timeout).await;
        disconnected?;
        info!(target: "lnsdk::session", "session closed");
        Ok(())
    }

    /// Subscribe to every invoice added or settled on the node. Updates go to
    /// [`Listener::on_invoice`].
    ///
    /// # Errors
    /// [`SessionError::Rpc`] when lnd refuses the subscription or does not acknowledge it
    /// within [`SessionConfig::rpc_timeout`].
    pub async fn subscribe_invoices(&self) -> Result<FeedId> {
        let stream = self.rpc("SubscribeInvoices", self.node.subscribe_invoices()).await?;
        Ok(self.spawn_invoice_feed(FeedKind::Invoices, stream))
    }

    /// Subscribe to forwarding events for all HTLCs. Events go to [`Listener::on_htlc_event`].
    ///
    /// # Errors
    /// [`SessionError::Rpc`] when lnd refuses the subscription.
    pub async fn subscribe_htlc_events(&self) -> Result<FeedId> {
        let stream = self
            .rpc("SubscribeHtlcEvents", self.node.subscribe_htlc_events())
            .await?;
        let listener = self.feeds.listener().clone();
        Ok(self.feeds.spawn(FeedKind::HtlcEvents, stream, move |event: routerrpc::HtlcEvent| {
            let listener = listener.clone();
            async move { report("on_htlc_event", listener.on_htlc_event(&event).await) }
        }))
    }

    /// Follow one invoice by payment hash. Updates go to [`Listener::on_invoice`].
    ///
    /// # Errors
    /// [`SessionError::Rpc`] when lnd refuses the subscription.
    pub async fn subscribe_single_invoice(&self, r_hash: &[u8]) -> Result<FeedId> {
        Ok(self.open_single_invoice(r_hash).await?)
    }

    async fn open_single_invoice(&self, r_hash: &[u8]) -> std::result::Result<FeedId, Status> {
        let stream = self
            .rpc(
                "SubscribeSingleInvoice",
                self.node.subscribe_single_invoice(r_hash.to_vec()),
            )
            .await?;
        Ok(self.spawn_invoice_feed(
            FeedKind::SingleInvoice {
                r_hash: r_hash.to_vec(),
            },
            stream,
        ))
    }

    fn spawn_invoice_feed(&self, kind: FeedKind, stream: FeedStream<lnrpc::Invoice>) -> FeedId {
        let listener = self.feeds.listener().clone();
        self.feeds.spawn(kind, stream, move |invoice: lnrpc::Invoice| {
            let listener = listener.clone();
            async move { report("on_invoice", listener.on_invoice(&invoice).await) }
        })
    }

    /// Open the bidirectional HTLC interceptor.
    ///
    /// Every held forward is passed to [`Listener::on_htlc_intercept`] and answered with
    /// exactly one decision; forwards the listener does not decide get
    /// [`SessionConfig::default_forward_action`]. Only one interceptor may be open per
    /// session. Once it has terminated (see [`Session::feed_statuses`]) a new one may be
    /// attached.
    ///
    /// # Errors
    /// [`SessionError::InterceptorAlreadyOpen`] while the previous interceptor is open,
    /// [`SessionError::Rpc`] when lnd refuses the stream (for example when another
    /// client already intercepts).
    pub async fn attach_interceptor(&self) -> Result<FeedId> {
        let mut slot = self.interceptor.lock().await;
        if let Some(open) = (*slot).filter(|id| self.feeds.status(*id).is_some_and(|s| s.state.is_open())) {
            return Err(SessionError::InterceptorAlreadyOpen(open));
        }

        let (tx, rx) = mpsc::channel(DECISION_BUFFER);
        let stream = self.rpc("HtlcInterceptor", self.node.htlc_interceptor(rx)).await?;
        let decisions = Arc::new(DecisionSender::new(tx));
        let listener = self.feeds.listener().clone();
        let default_action = self.config.default_forward_action.clone();
        let id = self.feeds.spawn(
            FeedKind::Interceptor,
            stream,
            move |forward: routerrpc::ForwardHtlcInterceptRequest| {
                let listener = listener.clone();
                let decisions = decisions.clone();
                let default_action = default_action.clone();
                async move {
                    intercept::resolve(listener.as_ref(), &decisions, &default_action, forward).await;
                }
            },
        );
        *slot = Some(id);
        Ok(id)
    }

    /// Re-list channels and replace the snapshot used by
    /// [`lookup_counterparty_by_channel`](Self::lookup_counterparty_by_channel).
    /// Returns the number of channels in the new snapshot.
    ///
    /// # Errors
    /// [`SessionError::Rpc`] when `ListChannels` fails; the previous snapshot is kept.
    pub async fn refresh_channel_snapshot(&self) -> Result<usize> {
        let channels = self.rpc("ListChannels", self.node.list_channels()).await?;
        let snapshot = ChannelSnapshot::from_channels(&channels);
        let len = snapshot.len();
        *self.snapshot.write() = Arc::new(snapshot);
        trace!(target: "lnsdk::session", channels = len, "channel snapshot replaced");
        Ok(len)
    }

    fn spawn_snapshot_refresher(&self, every: Duration) {
        if every.is_zero() {
            warn!(target: "lnsdk::session", "periodic snapshot interval is zero; refresher disabled");
            return;
        }
        let node = self.node.clone();
        let snapshot = self.snapshot.clone();
        let limit = self.config.rpc_timeout;
        let mut shutdown = self.feeds.shutdown_signal();
        self.feeds.spawn_task(async move {
            let mut ticker = time::interval_at(time::Instant::now() + every, every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => {}
                }
                match deadline(limit, "ListChannels", node.list_channels()).await {
                    Ok(channels) => {
                        *snapshot.write() = Arc::new(ChannelSnapshot::from_channels(&channels));
                        trace!(target: "lnsdk::session", channels = channels.len(), "channel snapshot refreshed");
                    }
                    Err(status) => {
                        warn!(target: "lnsdk::session", error = %status, "channel snapshot refresh failed; keeping previous");
                    }
                }
            }
            debug!(target: "lnsdk::session", "snapshot refresher stopped");
        });
    }

    /// The current channel snapshot.
    #[must_use]
    pub fn channel_snapshot(&self) -> Arc<ChannelSnapshot> {
        self.snapshot.read().clone()
    }

    /// Remote node identity of `chan_id` according to the channel snapshot.
    ///
    /// # Errors
    /// [`NotFoundError`] when the channel is not in the snapshot, including channels
    /// opened after it was taken.
    pub fn lookup_counterparty_by_channel(&self, chan_id: u64) -> Result<String, NotFoundError> {
        self.snapshot
            .read()
            .counterparty(chan_id)
            .map(str::to_string)
    }

    /// Send a 1000 msat key-send payment to `destination` with a fresh random preimage.
    ///
    /// `custom_records` travel in the onion next to the preimage record. With
    /// `outgoing_chan_id` set the first hop is pinned to that channel. Payment updates are
    /// delivered to [`Listener::on_payment`] from a new payment feed, whose id is returned.
    /// Once the payment settles or fails the feed's status row is kept only until
    /// [`SessionConfig::retained_closed_feeds`] later feeds have terminated, so callers
    /// polling [`feed_status`](Self::feed_status) should do so promptly.
    ///
    /// # Errors
    /// [`PaymentError::Submit`] when lnd rejects the request. No feed is opened then.
    pub async fn send_keysend_payment(
        &self,
        destination: &[u8],
        custom_records: HashMap<u64, Vec<u8>>,
        outgoing_chan_id: Option<u64>,
    ) -> Result<FeedId, PaymentError> {
        let preimage = Preimage::random();
        let request =
            payment::keysend_request(destination, custom_records, outgoing_chan_id, &preimage);
        self.submit_payment(request).await
    }

    /// Pay `amount_msat` to `destination` locked to `payment_hash`, as when paying a hold
    /// invoice whose hash and payment address are known.
    ///
    /// # Errors
    /// [`PaymentError::AmountOutOfRange`] or [`PaymentError::Submit`]. No feed is opened then.
    pub async fn send_hash_payment(
        &self,
        destination: &[u8],
        outgoing_chan_id: Option<u64>,
        payment_hash: &[u8],
        payment_addr: &[u8],
        amount_msat: u64,
    ) -> Result<FeedId, PaymentError> {
        let request = payment::hash_payment_request(
            destination,
            outgoing_chan_id,
            payment_hash,
            payment_addr,
            amount_msat,
        )?;
        self.submit_payment(request).await
    }

    async fn submit_payment(
        &self,
        request: routerrpc::SendPaymentRequest,
    ) -> Result<FeedId, PaymentError> {
        let payment_hash = request.payment_hash.clone();
        debug!(
            target: "lnsdk::payment",
            payment_hash = %hex::encode(&payment_hash),
            dest = %hex::encode(&request.dest),
            amt_msat = request.amt_msat,
            "submitting payment"
        );
        let stream = match self.rpc("SendPaymentV2", self.node.send_payment(request)).await {
            Ok(stream) => stream,
            Err(status) => {
                warn!(target: "lnsdk::payment", payment_hash = %hex::encode(&payment_hash), error = %status, "payment submission failed");
                return Err(status.into());
            }
        };
        let listener = self.feeds.listener().clone();
        Ok(self.feeds.spawn(
            FeedKind::Payment { payment_hash },
            stream,
            move |update: lnrpc::Payment| {
                let listener = listener.clone();
                async move { report("on_payment", listener.on_payment(&update).await) }
            },
        ))
    }

    /// Create a hold invoice for `hash` worth `amount_msat` and follow it with a
    /// single-invoice feed. Returns the encoded payment request.
    ///
    /// # Errors
    /// [`InvoiceError::AddHoldInvoice`] when lnd refuses the invoice,
    /// [`InvoiceError::Subscribe`] when the follow-up subscription fails.
    pub async fn create_hold_invoice(
        &self,
        hash: &[u8],
        amount_msat: u64,
    ) -> Result<Vec<u8>, InvoiceError> {
        let value_msat =
            i64::try_from(amount_msat).map_err(|_| InvoiceError::AmountOutOfRange(amount_msat))?;
        let request = invoicesrpc::AddHoldInvoiceRequest {
            hash: hash.to_vec(),
            value_msat,
            ..Default::default()
        };
        let resp = self
            .rpc("AddHoldInvoice", self.node.add_hold_invoice(request))
            .await
            .map_err(|status| InvoiceError::AddHoldInvoice(Box::new(status)))?;
        debug!(target: "lnsdk::session", hash = %hex::encode(hash), amount_msat, "hold invoice added");
        self.open_single_invoice(hash)
            .await
            .map_err(|status| InvoiceError::Subscribe {
                r_hash: hash.to_vec(),
                source: Box::new(status),
            })?;
        Ok(resp.payment_request.into_bytes())
    }

    /// Cancel the invoice with `payment_hash`, releasing any HTLC held for it.
    ///
    /// # Errors
    /// [`InvoiceError::Cancel`] when lnd refuses.
    pub async fn cancel_invoice(&self, payment_hash: &[u8]) -> Result<(), InvoiceError> {
        self.rpc("CancelInvoice", self.node.cancel_invoice(payment_hash.to_vec()))
            .await
            .map_err(|status| InvoiceError::Cancel {
                payment_hash: payment_hash.to_vec(),
                source: Box::new(status),
            })
    }

    /// Settle a hold invoice by revealing its preimage.
    ///
    /// # Errors
    /// [`InvoiceError::Settle`] when lnd refuses.
    pub async fn settle_invoice(&self, preimage: &[u8]) -> Result<(), InvoiceError> {
        self.rpc("SettleInvoice", self.node.settle_invoice(preimage.to_vec()))
            .await
            .map_err(|status| InvoiceError::Settle(Box::new(status)))
    }

    /// Cancel the invoices behind every incoming HTLC still pending on any channel.
    ///
    /// Clears hold invoices whose matching outgoing leg never happened. Returns the
    /// hash locks that were cancelled, in channel order.
    ///
    /// # Errors
    /// [`InvoiceError::ListChannels`], or the first [`InvoiceError::Cancel`]. Hashes
    /// before the failing one stay cancelled.
    pub async fn cancel_incoming_pending_holds(&self) -> Result<Vec<Vec<u8>>, InvoiceError> {
        let channels = self
            .rpc("ListChannels", self.node.list_channels())
            .await
            .map_err(|status| InvoiceError::ListChannels(Box::new(status)))?;
        let hashes: Vec<Vec<u8>> = channels
            .iter()
            .flat_map(|c| c.pending_htlcs.iter())
            .filter(|htlc| htlc.incoming)
            .map(|htlc| htlc.hash_lock.clone())
            .collect();
        for hash in &hashes {
            info!(target: "lnsdk::session", hash = %hex::encode(hash), "cancelling one-sided hold invoice");
            self.cancel_invoice(hash).await?;
        }
        Ok(hashes)
    }

    /// `GetInfo` passthrough.
    ///
    /// # Errors
    /// [`SessionError::Rpc`] on RPC failure.
    pub async fn get_info(&self) -> Result<lnrpc::GetInfoResponse> {
        Ok(self.rpc("GetInfo", self.node.get_info()).await?)
    }

    async fn rpc<R, F>(&self, name: &'static str, call: F) -> std::result::Result<R, Status>
    where
        F: Future<Output = std::result::Result<R, Status>>,
    {
        deadline(self.config.rpc_timeout, name, call).await
    }

    /// Every feed opened by this session with its current state, in opening order.
    ///
    /// Terminated feeds stay listed until [`forget_closed_feeds`](Self::forget_closed_feeds)
    /// or until more than [`SessionConfig::retained_closed_feeds`] have terminated.
    #[must_use]
    pub fn feed_statuses(&self) -> Vec<FeedStatus> {
        self.feeds.statuses()
    }

    #[must_use]
    pub fn feed_status(&self, id: FeedId) -> Option<FeedStatus> {
        self.feeds.status(id)
    }

    /// Feeds that are still open.
    #[must_use]
    pub fn active_feeds(&self) -> Vec<FeedStatus> {
        self.feeds
            .statuses()
            .into_iter()
            .filter(|s| s.state.is_open())
            .collect()
    }

    /// Drop terminated feeds from the status table. Returns how many were removed.
    pub fn forget_closed_feeds(&self) -> usize {
        self.feeds.forget_closed()
    }

    /// Dispatch tasks (feeds and the snapshot refresher) that have not finished.
    #[must_use]
    pub fn running_tasks(&self) -> usize {
        self.feeds.running_tasks()
    }

    /// The RPC surface, for calls the session does not wrap.
    #[must_use]
    pub fn node(&self) -> &T::Node {
        &self.node
    }

    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    #[must_use]
    pub fn listener(&self) -> &Arc<dyn Listener> {
        self.feeds.listener()
    }
}
