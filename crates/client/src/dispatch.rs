//! Inbound delivery: one dispatcher task routes transport deliveries, a fixed
//! pool of workers runs subscription handlers.
//!
//! Every subscription is pinned to one worker (`sid % pool`), which keeps its
//! messages in receipt order. Replies to requests never reach a worker: the
//! dispatcher resolves them directly, so a handler blocked on a request can
//! still get its answer.

use std::fmt::{self, Debug};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use courier_transport::{Delivery, SubscriptionId};
use dashmap::DashMap;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use crate::{Message, MessageHandler};

tokio::task_local! {
    static IN_DELIVERY: ();
}

/// Whether the current task is a delivery worker running a handler.
pub(crate) fn in_delivery() -> bool {
    IN_DELIVERY.try_with(|_| ()).is_ok()
}

/// Shared state of one subscription.
pub(crate) struct SubscriptionState {
    pub sid: SubscriptionId,
    pub subject: String,
    pub queue_group: Option<String>,
    handler: Arc<dyn MessageHandler>,
    open: AtomicBool,
    delivered: AtomicU64,
}

impl SubscriptionState {
    pub fn new(
        sid: SubscriptionId,
        subject: &str,
        queue_group: Option<&str>,
        handler: Arc<dyn MessageHandler>,
    ) -> Self {
        Self {
            sid,
            subject: subject.to_string(),
            queue_group: queue_group.map(ToString::to_string),
            handler,
            open: AtomicBool::new(true),
            delivered: AtomicU64::new(0),
        }
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Closes the subscription, returning whether it was open.
    pub fn close(&self) -> bool {
        self.open.swap(false, Ordering::AcqRel)
    }

    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }
}

impl Debug for SubscriptionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionState")
            .field("sid", &self.sid)
            .field("subject", &self.subject)
            .field("queue_group", &self.queue_group)
            .field("open", &self.is_open())
            .field("delivered", &self.delivered())
            .finish_non_exhaustive()
    }
}

/// Where deliveries for a subscription id go.
#[derive(Debug)]
pub(crate) enum Route {
    /// A handler-backed subscription.
    Subscription(Arc<SubscriptionState>),
    /// A request inbox; removed after the first delivery.
    Reply(oneshot::Sender<Message>),
}

#[derive(Debug)]
enum Job {
    Deliver(Arc<SubscriptionState>, Message),
    Barrier(oneshot::Sender<()>),
}

#[derive(Debug)]
enum Control {
    Barrier(oneshot::Sender<Vec<oneshot::Receiver<()>>>),
}

type Routes = Arc<DashMap<SubscriptionId, Route>>;

#[derive(Debug)]
pub(crate) struct Dispatcher {
    routes: Routes,
    control: mpsc::UnboundedSender<Control>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    cancel: CancellationToken,
    pool_size: usize,
}

impl Dispatcher {
    /// Spawns the dispatcher and `pool_size` workers.
    pub fn start(pool_size: usize, deliveries: mpsc::UnboundedReceiver<Delivery>) -> Self {
        let pool_size = pool_size.max(1);
        let routes: Routes = Arc::new(DashMap::new());
        let cancel = CancellationToken::new();
        let (control, control_rx) = mpsc::unbounded_channel();

        let mut tasks = Vec::with_capacity(pool_size + 1);
        let mut workers = Vec::with_capacity(pool_size);
        for index in 0..pool_size {
            let (tx, rx) = mpsc::unbounded_channel();
            workers.push(tx);
            tasks.push(tokio::spawn(work(index, rx, cancel.clone())));
        }
        tasks.push(tokio::spawn(dispatch(
            Arc::clone(&routes),
            workers,
            deliveries,
            control_rx,
            cancel.clone(),
        )));

        debug!(pool_size, "delivery pool started");
        Self {
            routes,
            control,
            tasks: Mutex::new(tasks),
            cancel,
            pool_size,
        }
    }

    pub const fn pool_size(&self) -> usize {
        self.pool_size
    }

    pub fn register(&self, sid: SubscriptionId, route: Route) {
        self.routes.insert(sid, route);
    }

    pub fn remove(&self, sid: SubscriptionId) {
        self.routes.remove(&sid);
    }

    /// Ids of the handler-backed subscriptions.
    pub fn subscription_ids(&self) -> Vec<SubscriptionId> {
        self.routes
            .iter()
            .filter(|route| matches!(route.value(), Route::Subscription(_)))
            .map(|route| *route.key())
            .collect()
    }

    /// Waits until every delivery received so far has been handled.
    pub async fn barrier(&self) {
        let (tx, rx) = oneshot::channel();
        if self.control.send(Control::Barrier(tx)).is_err() {
            return;
        }
        if let Ok(receivers) = rx.await {
            for receiver in receivers {
                let _ = receiver.await;
            }
        }
    }

    /// Closes every route and stops the tasks, waiting up to `grace` for
    /// handlers that are mid-call.
    pub async fn shutdown(&self, grace: Duration) {
        let sids: Vec<SubscriptionId> = self.routes.iter().map(|r| *r.key()).collect();
        for sid in sids {
            if let Some((_, Route::Subscription(state))) = self.routes.remove(&sid) {
                state.close();
            }
        }
        self.cancel.cancel();

        let tasks = std::mem::take(&mut *self.tasks.lock());
        // A handler closing its own connection must not wait for itself.
        if in_delivery() {
            debug!("shutdown requested from a handler, not joining workers");
            return;
        }
        let joined = tokio::time::timeout(grace, futures::future::join_all(tasks)).await;
        if joined.is_err() {
            warn!(?grace, "delivery workers still busy after grace period");
        }
    }

    /// Stops the tasks without waiting.
    pub fn abort(&self) {
        self.cancel.cancel();
    }
}

async fn dispatch(
    routes: Routes,
    workers: Vec<mpsc::UnboundedSender<Job>>,
    mut deliveries: mpsc::UnboundedReceiver<Delivery>,
    mut control: mpsc::UnboundedReceiver<Control>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            delivery = deliveries.recv() => match delivery {
                Some(delivery) => route(&routes, &workers, delivery),
                None => break,
            },
            Some(Control::Barrier(reply)) = control.recv() => {
                let receivers = workers
                    .iter()
                    .filter_map(|worker| {
                        let (tx, rx) = oneshot::channel();
                        worker.send(Job::Barrier(tx)).ok().map(|()| rx)
                    })
                    .collect();
                let _ = reply.send(receivers);
            }
        }
    }
    trace!("dispatcher stopped");
}

fn route(routes: &Routes, workers: &[mpsc::UnboundedSender<Job>], delivery: Delivery) {
    let sid = delivery.sid;
    let message = Message::from(delivery.message);

    if let Some((_, Route::Reply(reply))) =
        routes.remove_if(&sid, |_, route| matches!(route, Route::Reply(_)))
    {
        let _ = reply.send(message);
        return;
    }

    let state = match routes.get(&sid).as_deref() {
        Some(Route::Subscription(state)) => Arc::clone(state),
        _ => {
            trace!(sid, subject = %message.subject, "no route for delivery");
            return;
        }
    };
    if !state.is_open() {
        return;
    }

    state.delivered.fetch_add(1, Ordering::Relaxed);
    let index = usize::try_from(sid).unwrap_or_default() % workers.len();
    if workers[index].send(Job::Deliver(state, message)).is_err() {
        warn!(sid, index, "delivery worker gone");
    }
}

async fn work(index: usize, mut jobs: mpsc::UnboundedReceiver<Job>, cancel: CancellationToken) {
    loop {
        let job = tokio::select! {
            () = cancel.cancelled() => break,
            job = jobs.recv() => match job {
                Some(job) => job,
                None => break,
            },
        };

        match job {
            Job::Deliver(state, message) => {
                if !state.is_open() {
                    continue;
                }
                let handling = IN_DELIVERY.scope((), state.handler.handle(message));
                if AssertUnwindSafe(handling).catch_unwind().await.is_err() {
                    error!(sid = state.sid, subject = %state.subject, "message handler panicked");
                }
            }
            Job::Barrier(done) => {
                let _ = done.send(());
            }
        }
    }
    trace!(index, "delivery worker stopped");
}
