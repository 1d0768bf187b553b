use std::collections::{HashMap, VecDeque};

use crate::sync::*;
use tracing::debug;

/// A single unit of queue traffic.
///
/// Messages are transient: they are owned by whichever receive call produced them and are
/// discarded once the consumer is done with them. The `label` carries the producer's global
/// sequence number as free text, `body` and `extension` are opaque payloads and `recoverable`
/// is a durability hint to the queue service.
#[derive(Clone, PartialEq, Eq)]
pub struct Message {
    pub label: String,
    pub body: Vec<u8>,
    pub extension: Vec<u8>,
    pub recoverable: bool,
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Message")
            .field("label", &self.label)
            .field("body", &self.body.len())
            .field("extension", &self.extension.len())
            .field("recoverable", &self.recoverable)
            .finish()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("no queue exists at address `{0}`")]
    UnknownAddress(String),
    #[error("this queue handle has been closed")]
    HandleClosed,
    #[error("no message was available to receive")]
    Empty,
}

/// An in-process queue service: a registry of named, durable FIFO queues.
///
/// The service is the persistence layer of the harness. It hands out [send] and [receive]
/// handles over its queues; all handles opened against the same address share the same
/// underlying store.
///
/// [send]: SendHandle
/// [receive]: QueueHandle
#[derive(Clone)]
pub struct QueueService {
    queues: sync::Arc<sync::Mutex<HashMap<String, sync::Arc<QueueStore>>>>,
}

impl Default for QueueService {
    fn default() -> Self {
        Self::new()
    }
}

impl QueueService {
    pub fn new() -> Self {
        Self { queues: sync::Arc::new(sync::Mutex::new(HashMap::new())) }
    }

    pub fn exists(&self, address: &str) -> bool {
        self.queues.lock().unwrap().contains_key(address)
    }

    /// Creates a durable queue at `address` if none exists yet. Idempotent.
    #[cfg_attr(test, tracing::instrument(skip(self)))]
    pub fn create_if_missing(&self, address: &str) {
        let mut queues = self.queues.lock().unwrap();
        queues
            .entry(address.to_string())
            .or_insert_with(|| sync::Arc::new(QueueStore::new(address.to_string(), true)));
    }

    /// Opens a send-mode handle over the queue at `address`.
    pub fn sender(&self, address: &str) -> Result<SendHandle, QueueError> {
        Ok(SendHandle { store: self.store(address)? })
    }

    /// Opens a receive-mode handle over the queue at `address`. Each handle owns its own
    /// closed flag, so closing one handle does not affect the others.
    pub fn receiver(&self, address: &str) -> Result<QueueHandle, QueueError> {
        Ok(QueueHandle {
            store: self.store(address)?,
            closed: sync::Arc::new(sync::atomic::AtomicBool::new(false)),
        })
    }

    fn store(&self, address: &str) -> Result<sync::Arc<QueueStore>, QueueError> {
        self.queues
            .lock()
            .unwrap()
            .get(address)
            .cloned()
            .ok_or_else(|| QueueError::UnknownAddress(address.to_string()))
    }
}

/// The shared state behind every handle opened against one address.
pub(crate) struct QueueStore {
    address: String,
    #[allow(dead_code)]
    durable: bool,
    messages: sync::Mutex<VecDeque<Message>>,
    waker: Notify,
}

impl QueueStore {
    fn new(address: String, durable: bool) -> Self {
        Self { address, durable, messages: sync::Mutex::new(VecDeque::new()), waker: Notify::new() }
    }

    fn push_back(&self, message: Message) {
        self.messages.lock().unwrap().push_back(message);
        self.waker.notify_one();
    }

    fn push_front(&self, message: Message) {
        self.messages.lock().unwrap().push_front(message);
        self.waker.notify_one();
    }

    fn pop(&self) -> Option<Message> {
        let mut messages = self.messages.lock().unwrap();
        let message = messages.pop_front();
        // Pass the wakeup on so concurrent peekers are not left waiting on a
        // non-empty queue.
        if !messages.is_empty() {
            self.waker.notify_one();
        }
        message
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.messages.lock().unwrap().len()
    }

    fn is_empty(&self) -> bool {
        self.messages.lock().unwrap().is_empty()
    }

    fn purge(&self) {
        self.messages.lock().unwrap().clear();
    }
}

/// A send-mode connection to a named queue.
#[derive(Clone)]
pub struct SendHandle {
    store: sync::Arc<QueueStore>,
}

#[cfg(test)]
impl std::fmt::Debug for SendHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SendHandle").field("address", &self.store.address).finish()
    }
}

impl SendHandle {
    pub fn address(&self) -> &str {
        &self.store.address
    }

    /// Appends a message to the queue, waking one pending [`peek`].
    ///
    /// [`peek`]: QueueHandle::peek
    #[cfg_attr(test, tracing::instrument(skip_all, fields(label = %message.label)))]
    pub fn send(&self, message: Message) {
        self.store.push_back(message);
    }
}

/// A receive-mode connection to a named queue.
///
/// A handle owns its own asynchronous peek cycle: [`peek`] resolves once a message is
/// available, after which the consumer runs exactly one receive attempt and re-arms the
/// peek. Clones share the same closed flag, which lets an owner keep one copy around to
/// [`close`] the connection while a worker drives the cycle on another.
///
/// [`peek`]: Self::peek
/// [`close`]: Self::close
#[derive(Clone)]
pub struct QueueHandle {
    store: sync::Arc<QueueStore>,
    closed: sync::Arc<sync::atomic::AtomicBool>,
}

#[cfg(test)]
impl std::fmt::Debug for QueueHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueHandle")
            .field("address", &self.store.address)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl QueueHandle {
    pub fn address(&self) -> &str {
        &self.store.address
    }

    /// Waits until a message is available to receive on this handle.
    ///
    /// This is the peek-completion notification: it does not remove anything from the
    /// queue and several handles may be notified for the same message, in which case all
    /// but one of their receive attempts will fail with [`QueueError::Empty`].
    ///
    /// Fails with [`QueueError::HandleClosed`] once the handle has been closed, including
    /// when the close happens mid-wait.
    #[cfg_attr(test, tracing::instrument(skip(self)))]
    pub async fn peek(&self) -> Result<(), QueueError> {
        loop {
            let notified = self.store.waker.notified();
            tokio::pin!(notified);
            // Register for the wakeup before checking state, otherwise a send or close
            // landing between the check and the await would be lost.
            notified.as_mut().enable();

            if self.is_closed() {
                return Err(QueueError::HandleClosed);
            }
            if !self.store.is_empty() {
                debug!(address = %self.store.address, "Peek completed");
                return Ok(());
            }

            notified.await;
        }
    }

    /// Begins an explicit transaction context against this handle's queue.
    pub fn transaction(&self) -> Transaction {
        Transaction { store: sync::Arc::clone(&self.store), message: None }
    }

    /// Receives one message into `transaction`.
    ///
    /// If the handle was closed after the transaction began, this fails and the
    /// transaction holds nothing, so the message stays in the queue for a future cycle.
    /// That window is what gives the consumer its at-least-once guarantee across a close.
    #[cfg_attr(test, tracing::instrument(skip_all))]
    pub fn receive(&self, transaction: &mut Transaction) -> Result<(), QueueError> {
        if self.is_closed() {
            return Err(QueueError::HandleClosed);
        }
        let message = self.store.pop().ok_or(QueueError::Empty)?;
        debug!(label = %message.label, "Received message transactionally");
        transaction.attach(message);
        Ok(())
    }

    /// Receives one message with no transactional protection. The message is gone the
    /// moment this returns, whatever happens to it afterwards.
    #[cfg_attr(test, tracing::instrument(skip(self)))]
    pub fn receive_direct(&self) -> Result<Message, QueueError> {
        if self.is_closed() {
            return Err(QueueError::HandleClosed);
        }
        let message = self.store.pop().ok_or(QueueError::Empty)?;
        debug!(label = %message.label, "Received message directly");
        Ok(message)
    }

    /// Discards every message currently in the queue.
    pub fn purge(&self) {
        self.store.purge();
    }

    /// Closes the connection, failing any pending or future [`peek`] and [`receive`] on
    /// this handle and its clones. Messages already held by an uncommitted transaction
    /// are returned to the queue when that transaction is dropped.
    ///
    /// [`peek`]: Self::peek
    /// [`receive`]: Self::receive
    #[cfg_attr(test, tracing::instrument(skip(self)))]
    pub fn close(&self) {
        self.closed.store(true, sync::atomic::Ordering::Release);
        self.store.waker.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(sync::atomic::Ordering::Acquire)
    }

    #[cfg(test)]
    pub(crate) fn queued(&self) -> usize {
        self.store.len()
    }
}

/// An explicit transaction context over a single receive.
///
/// Holds at most one in-flight message. [`commit`] consumes the message for good; on any
/// other exit path, explicit [`abort`] included, the message is returned to the head of
/// its queue so the next cycle sees it first. This makes abort-on-exit the default and
/// commit the one action that has to be taken deliberately.
///
/// [`commit`]: Self::commit
/// [`abort`]: Self::abort
#[must_use]
pub struct Transaction {
    store: sync::Arc<QueueStore>,
    message: Option<Message>,
}

impl Transaction {
    fn attach(&mut self, message: Message) {
        debug_assert!(self.message.is_none(), "a transaction can hold at most one message");
        self.message = Some(message);
    }

    /// The message received under this transaction, if any.
    pub fn message(&self) -> Option<&Message> {
        self.message.as_ref()
    }

    /// Commits the transaction: the received message is permanently removed from the
    /// queue.
    #[cfg_attr(test, tracing::instrument(skip_all))]
    pub fn commit(mut self) {
        if let Some(message) = self.message.take() {
            debug!(label = %message.label, "Committed");
        }
    }

    /// Aborts the transaction, undoing the receive. Equivalent to dropping it.
    pub fn abort(self) {}
}

impl Drop for Transaction {
    fn drop(&mut self) {
        // Not committed: undo the receive so the message is processed next time.
        if let Some(message) = self.message.take() {
            debug!(label = %message.label, "Aborted, returning message to the queue");
            self.store.push_front(message);
        }
    }
}

#[cfg(test)]
impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction").field("message", &self.message).finish()
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod test {
    use super::*;
    use crate::test_utils::*;
    use tokio_test::assert_ok;

    pub(crate) fn message(label: &str) -> Message {
        Message {
            label: label.to_string(),
            body: vec![0; 16],
            extension: vec![0; 16],
            recoverable: true,
        }
    }

    fn queue_pair(address: &str) -> (SendHandle, QueueHandle) {
        let service = QueueService::new();
        service.create_if_missing(address);
        (service.sender(address).unwrap(), service.receiver(address).unwrap())
    }

    #[rstest::rstest]
    fn create_is_idempotent(#[allow(unused)] log_stdout: ()) {
        let service = QueueService::new();
        assert!(!service.exists("stress"));

        service.create_if_missing("stress");
        assert!(service.exists("stress"));

        service.sender("stress").unwrap().send(message("1"));
        service.create_if_missing("stress");
        assert_eq!(service.receiver("stress").unwrap().queued(), 1);
    }

    #[rstest::rstest]
    fn unknown_address(#[allow(unused)] log_stdout: ()) {
        let service = QueueService::new();
        assert_matches::assert_matches!(service.sender("nope"), Err(QueueError::UnknownAddress(a)) => {
            assert_eq!(a, "nope")
        });
        assert_matches::assert_matches!(service.receiver("nope"), Err(QueueError::UnknownAddress(_)));
    }

    #[rstest::rstest]
    fn receive_commit_removes(#[allow(unused)] log_stdout: ()) {
        let (sx, rx) = queue_pair("stress");
        sx.send(message("1"));
        sx.send(message("2"));

        let mut transaction = rx.transaction();
        rx.receive(&mut transaction).unwrap();
        assert_eq!(transaction.message().unwrap().label, "1");
        transaction.commit();

        assert_eq!(rx.queued(), 1);
        let mut transaction = rx.transaction();
        rx.receive(&mut transaction).unwrap();
        assert_eq!(transaction.message().unwrap().label, "2");
        transaction.commit();
        assert_eq!(rx.queued(), 0);
    }

    #[rstest::rstest]
    fn abort_returns_message_to_the_head(#[allow(unused)] log_stdout: ()) {
        let (sx, rx) = queue_pair("stress");
        sx.send(message("1"));
        sx.send(message("2"));

        let mut transaction = rx.transaction();
        rx.receive(&mut transaction).unwrap();
        transaction.abort();

        // The aborted message is seen again before anything sent after it.
        let mut transaction = rx.transaction();
        rx.receive(&mut transaction).unwrap();
        assert_eq!(transaction.message().unwrap().label, "1");
        transaction.commit();
    }

    #[rstest::rstest]
    fn drop_without_commit_aborts(#[allow(unused)] log_stdout: ()) {
        let (sx, rx) = queue_pair("stress");
        sx.send(message("1"));

        let mut transaction = rx.transaction();
        rx.receive(&mut transaction).unwrap();
        assert_eq!(rx.queued(), 0);
        drop(transaction);

        assert_eq!(rx.queued(), 1);
    }

    #[rstest::rstest]
    fn empty_receive_fails(#[allow(unused)] log_stdout: ()) {
        let (_sx, rx) = queue_pair("stress");
        let mut transaction = rx.transaction();
        assert_matches::assert_matches!(rx.receive(&mut transaction), Err(QueueError::Empty));
        assert!(transaction.message().is_none());
    }

    /// The close race from the consumer cycle: the handle is closed after the
    /// transaction begins but before the receive. The receive fails, the abort leaves the
    /// message in the queue and a later handle on the same address gets it exactly once.
    #[rstest::rstest]
    fn close_between_begin_and_receive_is_at_least_once(#[allow(unused)] log_stdout: ()) {
        let service = QueueService::new();
        service.create_if_missing("stress");
        let sx = service.sender("stress").unwrap();
        let rx = service.receiver("stress").unwrap();
        sx.send(message("1"));

        let mut transaction = rx.transaction();
        rx.close();
        assert_matches::assert_matches!(rx.receive(&mut transaction), Err(QueueError::HandleClosed));
        transaction.abort();

        // A fresh handle over the same address receives the message exactly once.
        let rx = service.receiver("stress").unwrap();
        let mut transaction = rx.transaction();
        rx.receive(&mut transaction).unwrap();
        assert_eq!(transaction.message().unwrap().label, "1");
        transaction.commit();
        assert_matches::assert_matches!(rx.receive(&mut rx.transaction()), Err(QueueError::Empty));
    }

    /// Expected behavior, not a bug: with no transaction there is nothing to undo, so a
    /// failure after the receive loses the message.
    #[rstest::rstest]
    fn direct_receive_loses_the_message_on_failure(#[allow(unused)] log_stdout: ()) {
        let (sx, rx) = queue_pair("stress");
        sx.send(message("1"));

        let message = rx.receive_direct().unwrap();
        drop(message); // the consumer "crashed" before handling it

        assert_eq!(rx.queued(), 0);
    }

    #[rstest::rstest]
    fn purge_discards_everything(#[allow(unused)] log_stdout: ()) {
        let (sx, rx) = queue_pair("stress");
        for i in 0..4 {
            sx.send(message(&i.to_string()));
        }
        rx.purge();
        assert_eq!(rx.queued(), 0);
    }

    #[rstest::rstest]
    #[tokio::test]
    async fn peek_wakes_on_send(#[allow(unused)] log_stdout: ()) {
        let (sx, rx) = queue_pair("stress");

        let waiter = tokio::spawn(async move {
            rx.peek().await.unwrap();
            rx.receive_direct().unwrap()
        });

        // Give the peek a chance to park before the send.
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        sx.send(message("1"));

        let received = tokio::time::timeout(std::time::Duration::from_secs(5), waiter)
            .await
            .expect("peek never completed")
            .unwrap();
        assert_eq!(received.label, "1");
    }

    #[rstest::rstest]
    #[tokio::test]
    async fn peek_fails_on_close(#[allow(unused)] log_stdout: ()) {
        let (_sx, rx) = queue_pair("stress");
        let rx_waiter = rx.clone();

        let waiter = tokio::spawn(async move { rx_waiter.peek().await });

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        rx.close();

        let outcome = tokio::time::timeout(std::time::Duration::from_secs(5), waiter)
            .await
            .expect("peek never completed")
            .unwrap();
        assert_matches::assert_matches!(outcome, Err(QueueError::HandleClosed));
    }

    #[rstest::rstest]
    #[tokio::test]
    async fn peek_resolves_immediately_when_nonempty(#[allow(unused)] log_stdout: ()) {
        let (sx, rx) = queue_pair("stress");
        sx.send(message("1"));
        tokio_test::assert_ok!(rx.peek().await);
    }
}

/// Property: for any interleaving of commits and aborts, no message is lost and no
/// message is delivered twice. Run with `cargo test --features proptest`.
#[cfg(all(test, feature = "proptest", not(feature = "loom")))]
mod prop {
    use super::*;

    proptest::proptest! {
        #[test]
        fn commit_abort_conserves_messages(commits in proptest::collection::vec(proptest::bool::ANY, 1..64)) {
            let service = QueueService::new();
            service.create_if_missing("stress");
            let sx = service.sender("stress").unwrap();
            let rx = service.receiver("stress").unwrap();

            for i in 0..commits.len() {
                sx.send(super::test::message(&i.to_string()));
            }

            let mut committed = Vec::new();
            for commit in &commits {
                let mut transaction = rx.transaction();
                rx.receive(&mut transaction).unwrap();
                if *commit {
                    committed.push(transaction.message().unwrap().label.clone());
                    transaction.commit();
                } else {
                    // Aborted messages rotate back to the head; skip past on the next
                    // pass by committing unconditionally below.
                    transaction.abort();
                }
            }

            // Drain whatever was aborted back into the queue.
            let mut remaining = Vec::new();
            loop {
                let mut transaction = rx.transaction();
                match rx.receive(&mut transaction) {
                    Ok(()) => {
                        remaining.push(transaction.message().unwrap().label.clone());
                        transaction.commit();
                    }
                    Err(QueueError::Empty) => break,
                    Err(other) => panic!("unexpected receive failure: {other}"),
                }
            }

            let mut seen = committed;
            seen.extend(remaining);
            seen.sort_by_key(|label| label.parse::<usize>().unwrap());
            let expected = (0..commits.len()).map(|i| i.to_string()).collect::<Vec<_>>();
            proptest::prop_assert_eq!(seen, expected);
        }
    }
}
