//! Receive loops for server-pushed streams and the registry that tracks them.
//!
//! Every open stream runs in its own task. A task reads one message, awaits the
//! handler for it, then reads the next; it stops when the peer closes the stream,
//! the stream errors, or the session signals shutdown. The terminal state is written
//! to the shared status table and reported through [`Listener::on_feed_closed`].
//! Terminated rows are kept up to a fixed count, longest-closed dropped first.

use std::{
    collections::{BTreeMap, VecDeque},
    fmt,
    future::Future,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use futures_util::StreamExt;
use parking_lot::Mutex;
use tokio::{sync::watch, task::JoinHandle, time};
use tracing::{debug, trace, warn};

use crate::{listener::Listener, node::FeedStream};

/// Identifier of a feed within one session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FeedId(u64);

impl fmt::Display for FeedId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "feed-{}", self.0)
    }
}

/// What a feed carries.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FeedKind {
    /// Every invoice added or settled on the node.
    Invoices,
    /// Forward/settle/fail events for all HTLCs.
    HtlcEvents,
    /// Updates for one invoice, keyed by its payment hash.
    SingleInvoice { r_hash: Vec<u8> },
    /// Bidirectional HTLC interception stream.
    Interceptor,
    /// Status updates of one outgoing payment.
    Payment { payment_hash: Vec<u8> },
}

impl FeedKind {
    /// Whether the feed also carries outbound messages.
    #[must_use]
    pub fn is_bidirectional(&self) -> bool {
        matches!(self, FeedKind::Interceptor)
    }
}

impl fmt::Display for FeedKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FeedKind::Invoices => write!(f, "invoices"),
            FeedKind::HtlcEvents => write!(f, "htlc-events"),
            FeedKind::SingleInvoice { r_hash } => {
                write!(f, "single-invoice({})", hex::encode(r_hash))
            }
            FeedKind::Interceptor => write!(f, "htlc-interceptor"),
            FeedKind::Payment { payment_hash } => {
                write!(f, "payment({})", hex::encode(payment_hash))
            }
        }
    }
}

/// Failure that ended a feed.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("stream failed ({code:?}): {message}")]
pub struct StreamError {
    pub code: tonic::Code,
    pub message: String,
}

impl From<tonic::Status> for StreamError {
    fn from(status: tonic::Status) -> Self {
        Self {
            code: status.code(),
            message: status.message().to_string(),
        }
    }
}

/// Lifecycle state of a feed. Only the feed's own task moves it out of `Open`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum FeedState {
    #[default]
    Open,
    /// The daemon ended the stream cleanly.
    ClosedByPeer,
    /// The stream returned an error.
    Failed(StreamError),
    /// The session shut down.
    Cancelled,
}

impl FeedState {
    #[must_use]
    pub fn is_open(&self) -> bool {
        matches!(self, FeedState::Open)
    }
}

/// Snapshot of one row of the status table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FeedStatus {
    pub id: FeedId,
    pub kind: FeedKind,
    pub state: FeedState,
}

/// Status rows plus the order in which feeds terminated.
#[derive(Default)]
struct StatusTable {
    rows: BTreeMap<FeedId, FeedStatus>,
    closed: VecDeque<FeedId>,
}

impl StatusTable {
    /// Record the terminal state of `id`, then drop the longest-closed rows beyond `retain`.
    fn close(&mut self, id: FeedId, kind: FeedKind, state: FeedState, retain: usize) -> FeedStatus {
        let status = FeedStatus { id, kind, state };
        self.rows.insert(id, status.clone());
        self.closed.push_back(id);
        while self.closed.len() > retain {
            if let Some(old) = self.closed.pop_front() {
                self.rows.remove(&old);
            }
        }
        status
    }
}

/// Owns the shutdown signal, the dispatch task handles and the feed status table.
pub(crate) struct FeedRegistry {
    listener: Arc<dyn Listener>,
    next_id: AtomicU64,
    statuses: Arc<Mutex<StatusTable>>,
    retain_closed: usize,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown: watch::Sender<bool>,
}

impl FeedRegistry {
    /// `retain_closed` bounds how many terminated rows stay in the status table.
    pub(crate) fn new(listener: Arc<dyn Listener>, retain_closed: usize) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            listener,
            next_id: AtomicU64::new(1),
            statuses: Arc::default(),
            retain_closed,
            tasks: Mutex::default(),
            shutdown,
        }
    }

    pub(crate) fn listener(&self) -> &Arc<dyn Listener> {
        &self.listener
    }

    pub(crate) fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Register a feed and spawn its receive loop. `handle` is awaited for every message.
    pub(crate) fn spawn<T, F, Fut>(&self, kind: FeedKind, stream: FeedStream<T>, handle: F) -> FeedId
    where
        T: Send + 'static,
        F: FnMut(T) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let id = FeedId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.statuses.lock().rows.insert(
            id,
            FeedStatus {
                id,
                kind: kind.clone(),
                state: FeedState::Open,
            },
        );

        let shutdown = self.shutdown.subscribe();
        let statuses = self.statuses.clone();
        let listener = self.listener.clone();
        let retain = self.retain_closed;
        debug!(target: "lnsdk::dispatch", feed = %id, %kind, "feed opened");
        let task = tokio::spawn(async move {
            let state = drive(stream, shutdown, handle).await;
            match &state {
                FeedState::Failed(err) => {
                    warn!(target: "lnsdk::dispatch", feed = %id, %kind, error = %err, "feed failed");
                }
                other => {
                    debug!(target: "lnsdk::dispatch", feed = %id, %kind, state = ?other, "feed stopped");
                }
            }
            let status = statuses.lock().close(id, kind, state, retain);
            listener.on_feed_closed(&status).await;
        });
        self.track(task);
        id
    }

    /// Spawn an auxiliary task that is joined on shutdown but has no status row.
    pub(crate) fn spawn_task<Fut>(&self, fut: Fut)
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.track(tokio::spawn(fut));
    }

    fn track(&self, task: JoinHandle<()>) {
        let mut tasks = self.tasks.lock();
        tasks.retain(|t| !t.is_finished());
        tasks.push(task);
    }

    pub(crate) fn status(&self, id: FeedId) -> Option<FeedStatus> {
        self.statuses.lock().rows.get(&id).cloned()
    }

    pub(crate) fn statuses(&self) -> Vec<FeedStatus> {
        self.statuses.lock().rows.values().cloned().collect()
    }

    /// Drop rows of feeds that are no longer open.
    pub(crate) fn forget_closed(&self) -> usize {
        let mut table = self.statuses.lock();
        let before = table.rows.len();
        table.rows.retain(|_, s| s.state.is_open());
        table.closed.clear();
        before - table.rows.len()
    }

    /// Number of spawned tasks that have not finished yet.
    pub(crate) fn running_tasks(&self) -> usize {
        self.tasks.lock().iter().filter(|t| !t.is_finished()).count()
    }

    /// Tell every task to stop at its next receive. Does not wait.
    pub(crate) fn signal_shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    /// Signal shutdown to every task and wait for them, aborting stragglers after `grace`.
    pub(crate) async fn shutdown(&self, grace: Duration) {
        self.signal_shutdown();
        let tasks = std::mem::take(&mut *self.tasks.lock());
        let deadline = time::Instant::now() + grace;
        let mut aborted = 0usize;
        for mut task in tasks {
            if time::timeout_at(deadline, &mut task).await.is_err() {
                task.abort();
                aborted += 1;
            }
        }
        if aborted > 0 {
            warn!(target: "lnsdk::dispatch", aborted, "dispatch tasks did not stop in time");
        } else {
            debug!(target: "lnsdk::dispatch", "all dispatch tasks stopped");
        }
    }
}

impl Drop for FeedRegistry {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}

/// Pump `stream` into `handle` until it ends, fails or shutdown is signalled.
pub(crate) async fn drive<T, F, Fut>(
    mut stream: FeedStream<T>,
    mut shutdown: watch::Receiver<bool>,
    mut handle: F,
) -> FeedState
where
    F: FnMut(T) -> Fut,
    Fut: Future<Output = ()>,
{
    loop {
        if *shutdown.borrow() {
            return FeedState::Cancelled;
        }
        let next = tokio::select! {
            biased;
            _ = shutdown.changed() => return FeedState::Cancelled,
            next = stream.next() => next,
        };
        match next {
            Some(Ok(msg)) => {
                trace!(target: "lnsdk::dispatch", "message received");
                handle(msg).await;
            }
            Some(Err(status)) => return FeedState::Failed(status.into()),
            None => return FeedState::ClosedByPeer,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener::LoggingListener;
    use tokio::sync::mpsc;
    use tokio_stream::wrappers::UnboundedReceiverStream;

    fn channel_stream<T: Send + 'static>() -> (
        mpsc::UnboundedSender<Result<T, tonic::Status>>,
        FeedStream<T>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, UnboundedReceiverStream::new(rx).boxed())
    }

    #[tokio::test]
    async fn drive_delivers_in_order_and_reports_peer_close() {
        let (tx, stream) = channel_stream::<u32>();
        for n in 0..50 {
            tx.send(Ok(n)).unwrap();
        }
        drop(tx);
        let (_keep, shutdown) = watch::channel(false);
        let mut seen = Vec::new();
        let state = drive(stream, shutdown, |n| {
            seen.push(n);
            async {}
        })
        .await;
        assert_eq!(state, FeedState::ClosedByPeer);
        assert_eq!(seen, (0..50).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn drive_stops_on_stream_error() {
        let (tx, stream) = channel_stream::<u32>();
        tx.send(Ok(1)).unwrap();
        tx.send(Err(tonic::Status::unavailable("lnd went away")))
            .unwrap();
        tx.send(Ok(2)).unwrap();
        let (_keep, shutdown) = watch::channel(false);
        let mut seen = Vec::new();
        let state = drive(stream, shutdown, |n| {
            seen.push(n);
            async {}
        })
        .await;
        assert_eq!(seen, vec![1]);
        match state {
            FeedState::Failed(err) => {
                assert_eq!(err.code, tonic::Code::Unavailable);
                assert_eq!(err.message, "lnd went away");
            }
            other => panic!("unexpected state {other:?}"),
        }
    }

    #[tokio::test]
    async fn registry_shutdown_cancels_blocked_feeds() {
        let registry = FeedRegistry::new(Arc::new(LoggingListener), 16);
        let mut senders = Vec::new();
        let mut ids = Vec::new();
        for _ in 0..4 {
            let (tx, stream) = channel_stream::<u32>();
            senders.push(tx);
            ids.push(registry.spawn(FeedKind::Invoices, stream, |_| async {}));
        }
        assert_eq!(registry.running_tasks(), 4);

        time::timeout(
            Duration::from_secs(2),
            registry.shutdown(Duration::from_secs(1)),
        )
        .await
        .expect("shutdown is bounded");

        assert_eq!(registry.running_tasks(), 0);
        for id in ids {
            assert_eq!(registry.status(id).unwrap().state, FeedState::Cancelled);
        }
    }

    #[tokio::test]
    async fn forget_closed_keeps_open_rows() {
        let registry = FeedRegistry::new(Arc::new(LoggingListener), 16);
        let (open_tx, open) = channel_stream::<u32>();
        let (closed_tx, closed) = channel_stream::<u32>();
        let open_id = registry.spawn(FeedKind::HtlcEvents, open, |_| async {});
        let closed_id = registry.spawn(FeedKind::Invoices, closed, |_| async {});
        drop(closed_tx);

        time::timeout(Duration::from_secs(1), async {
            while registry.status(closed_id).unwrap().state.is_open() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("closed feed settles");

        assert_eq!(registry.forget_closed(), 1);
        assert!(registry.status(closed_id).is_none());
        assert!(registry.status(open_id).is_some());
        drop(open_tx);
    }

    #[tokio::test]
    async fn closed_rows_beyond_retention_are_dropped_oldest_first() {
        let registry = FeedRegistry::new(Arc::new(LoggingListener), 2);
        let (open_tx, open) = channel_stream::<u32>();
        let open_id = registry.spawn(FeedKind::Invoices, open, |_| async {});

        let mut payments = Vec::new();
        for n in 0..5u8 {
            let (tx, stream) = channel_stream::<u32>();
            let kind = FeedKind::Payment {
                payment_hash: vec![n],
            };
            payments.push(registry.spawn(kind, stream, |_| async {}));
            drop(tx);
            time::timeout(Duration::from_secs(1), async {
                while registry.running_tasks() > 1 {
                    tokio::task::yield_now().await;
                }
            })
            .await
            .expect("payment feed settles");
        }

        let ids: Vec<FeedId> = registry.statuses().into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![open_id, payments[3], payments[4]]);
        assert!(registry.status(open_id).unwrap().state.is_open());
        assert_eq!(
            registry.status(payments[4]).unwrap().state,
            FeedState::ClosedByPeer
        );
        drop(open_tx);
    }

    #[test]
    fn kind_display_includes_hash() {
        let kind = FeedKind::SingleInvoice {
            r_hash: vec![0xab, 0xcd],
        };
        assert_eq!(kind.to_string(), "single-invoice(abcd)");
        assert!(!kind.is_bidirectional());
        assert!(FeedKind::Interceptor.is_bidirectional());
    }
}
