use std::time::Duration;

use crate::queue::{Message, QueueError, QueueHandle, QueueService, Transaction};
use crate::sync::*;
use crate::tracker::{InFlightGuard, InFlightTracker};
use tracing::{debug, error, warn};

/// How long [`close`] sleeps between in-flight drain checks.
///
/// [`close`]: ConsumerPool::close
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// The completion signal supplied by the pool's owner, invoked exactly once per
/// successfully delivered message. Must be safe to call concurrently from many tasks.
pub type CompletionSignal = std::sync::Arc<dyn Fn() + Send + Sync>;

/// How a single receive is wrapped transactionally. Chosen at pool construction and
/// shared read-only by every handle in the pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransactionPolicy {
    /// An explicit transaction scope around the receive. Commit happens by completing
    /// the scope; any other exit path aborts it implicitly.
    Scoped,
    /// A transaction object begun explicitly before the receive, committed after
    /// successful handling and aborted explicitly on failure.
    Native,
    /// No transaction. Fastest, but a message received right before a failure is lost.
    None,
}

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("this consumer pool is already open")]
    AlreadyOpen,
    #[error("this consumer pool is not open")]
    NotOpen,
    #[error("queue address cannot be empty")]
    EmptyAddress,
    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// A pool of receive-mode queue handles draining one address concurrently.
///
/// Each handle runs its own asynchronous peek/receive cycle on a dedicated task,
/// wrapping every receive according to the pool's [`TransactionPolicy`] and invoking the
/// owner's completion signal once per delivered message. A shared [`InFlightTracker`]
/// counts signal invocations currently running so [`close`] can drain to zero before it
/// returns.
///
/// Constructing a pool creates the target queue (durable) if it does not exist yet and
/// purges whatever it holds, so every stress run starts from an empty queue.
///
/// `open` and `close` must not be called concurrently with each other; steady-state
/// consumption is fully concurrent.
///
/// [`close`]: Self::close
pub struct ConsumerPool {
    service: QueueService,
    address: String,
    count: usize,
    policy: TransactionPolicy,
    handles: Vec<QueueHandle>,
    tasks: Vec<tokio::task::JoinHandle<()>>,
    tracker: std::sync::Arc<InFlightTracker>,
    closing: std::sync::Arc<sync::atomic::AtomicBool>,
    signal: CompletionSignal,
    is_open: bool,
}

#[cfg(test)]
impl std::fmt::Debug for ConsumerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerPool")
            .field("address", &self.address)
            .field("count", &self.count)
            .field("policy", &self.policy)
            .field("is_open", &self.is_open)
            .finish()
    }
}

impl ConsumerPool {
    /// Creates a pool of `count` receive handles over the queue at `address`.
    ///
    /// Fails with [`PoolError::EmptyAddress`] before any handle is created if the
    /// address is empty. A `count` of zero is treated as one.
    pub fn new(
        service: &QueueService,
        address: &str,
        count: usize,
        policy: TransactionPolicy,
        signal: impl Fn() + Send + Sync + 'static,
    ) -> Result<Self, PoolError> {
        if address.is_empty() {
            return Err(PoolError::EmptyAddress);
        }
        let count = count.max(1);

        if !service.exists(address) {
            service.create_if_missing(address);
        }
        let handles = Self::open_handles(service, address, count)?;
        if let Some(handle) = handles.first() {
            handle.purge();
        }

        Ok(Self {
            service: service.clone(),
            address: address.to_string(),
            count,
            policy,
            handles,
            tasks: Vec::new(),
            tracker: std::sync::Arc::new(InFlightTracker::new()),
            closing: std::sync::Arc::new(sync::atomic::AtomicBool::new(false)),
            signal: std::sync::Arc::new(signal),
            is_open: false,
        })
    }

    fn open_handles(
        service: &QueueService,
        address: &str,
        count: usize,
    ) -> Result<Vec<QueueHandle>, QueueError> {
        (0..count).map(|_| service.receiver(address)).collect()
    }

    /// Starts consumption: registers every handle for notifications by spawning its
    /// receive cycle, which issues the handle's first peek.
    ///
    /// Fails with [`PoolError::AlreadyOpen`] if the pool is already open, leaving its
    /// state untouched.
    #[cfg_attr(test, tracing::instrument(skip(self), fields(address = %self.address)))]
    pub fn open(&mut self) -> Result<(), PoolError> {
        if self.is_open {
            return Err(PoolError::AlreadyOpen);
        }

        // A previous close left the connections closed; open fresh ones.
        if self.handles.iter().any(|handle| handle.is_closed()) {
            self.handles = Self::open_handles(&self.service, &self.address, self.count)?;
        }

        self.closing.store(false, sync::atomic::Ordering::Release);
        for handle in &self.handles {
            self.tasks.push(tokio::spawn(cycle(
                handle.clone(),
                self.policy,
                std::sync::Arc::clone(&self.tracker),
                std::sync::Arc::clone(&self.closing),
                std::sync::Arc::clone(&self.signal),
            )));
        }
        self.is_open = true;

        debug!(handles = self.count, policy = ?self.policy, "Consumer pool open");
        Ok(())
    }

    /// Stops consumption and drains: sets the closing flag, closes every handle
    /// (releasing the underlying connection and failing any pending peek), then polls
    /// the in-flight tracker at a fixed interval until it reads zero and joins the cycle
    /// tasks. No completion signal is mid-flight once this returns.
    ///
    /// There is no timeout; in-flight deliveries always run to completion. Closing a
    /// pool that is not open fails with [`PoolError::NotOpen`].
    #[cfg_attr(test, tracing::instrument(skip(self), fields(address = %self.address)))]
    pub async fn close(&mut self) -> Result<(), PoolError> {
        if !self.is_open {
            return Err(PoolError::NotOpen);
        }

        warn!(address = %self.address, "Closing consumer pool");
        self.closing.store(true, sync::atomic::Ordering::Release);
        for handle in &self.handles {
            handle.close();
        }

        while self.tracker.read() > 0 {
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        }
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }

        self.closing.store(false, sync::atomic::Ordering::Release);
        self.is_open = false;

        debug!("Consumer pool closed");
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.is_open
    }

    /// The number of completion signals currently executing.
    pub fn in_flight(&self) -> i64 {
        self.tracker.read()
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn policy(&self) -> TransactionPolicy {
        self.policy
    }

    pub fn handle_count(&self) -> usize {
        self.handles.len()
    }
}

/// One handle's receive cycle: peek, receive under the pool's policy, re-arm.
///
/// The peek is re-armed after every outcome, success and failure alike, because a
/// notification only fires once per request; stopping on an error would silently end
/// consumption on this handle. The cycle only winds down once the pool is closing or the
/// handle reports closed.
async fn cycle(
    handle: QueueHandle,
    policy: TransactionPolicy,
    tracker: std::sync::Arc<InFlightTracker>,
    closing: std::sync::Arc<sync::atomic::AtomicBool>,
    signal: CompletionSignal,
) {
    while !closing.load(sync::atomic::Ordering::Acquire) {
        if handle.peek().await.is_err() {
            break;
        }
        match policy {
            TransactionPolicy::Scoped => cycle_scoped(&handle, &tracker, &signal),
            TransactionPolicy::Native => cycle_native(&handle, &tracker, &signal),
            TransactionPolicy::None => cycle_direct(&handle, &tracker, &signal),
        }
    }
    debug!(address = %handle.address(), "Receive cycle wound down");
}

/// If the handle closes after the transaction begins but before the receive, the receive
/// fails and the abort leaves the message in the queue to be processed next time.
fn cycle_native(handle: &QueueHandle, tracker: &InFlightTracker, signal: &CompletionSignal) {
    let mut transaction = handle.transaction();
    match handle.receive(&mut transaction) {
        Ok(()) => {
            deliver(expect_received(&transaction), tracker, signal);
            transaction.commit();
        }
        Err(err) => {
            transaction.abort();
            error!(%err, "Transactional receive failed");
        }
    }
}

/// Same close-race behavior as the native cycle, but the scope aborts when it goes out
/// of scope uncompleted, so the failure arm only has to log.
fn cycle_scoped(handle: &QueueHandle, tracker: &InFlightTracker, signal: &CompletionSignal) {
    let mut scope = handle.transaction();
    match handle.receive(&mut scope) {
        Ok(()) => {
            deliver(expect_received(&scope), tracker, signal);
            scope.commit();
        }
        Err(err) => error!(%err, "Transactional receive failed"),
    }
}

fn cycle_direct(handle: &QueueHandle, tracker: &InFlightTracker, signal: &CompletionSignal) {
    match handle.receive_direct() {
        Ok(message) => deliver(&message, tracker, signal),
        Err(err) => error!(%err, "Receive failed"),
    }
}

/// A successful transactional receive must leave a message in its transaction; anything
/// else is a programming error, not a recoverable condition.
fn expect_received(transaction: &Transaction) -> &Message {
    transaction.message().expect("a successful receive left no message in its transaction")
}

fn deliver(message: &Message, tracker: &InFlightTracker, signal: &CompletionSignal) {
    debug!(label = %message.label, "Delivering message");
    tracker.increment();
    // Decrements on drop, so the tracker is balanced even if the signal panics.
    let _guard = InFlightGuard(tracker);
    let signal = signal.as_ref();
    signal();
}
