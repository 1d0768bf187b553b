//! `mq-stress` measures the sustained throughput of a transactional message-queue consumer
//! under concurrent load. Its core is a [`ConsumerPool`]: a set of independent receive
//! handles over one queue address, each driving its own asynchronous peek/receive cycle
//! under one of three transactional delivery policies, with an atomic in-flight counter as
//! the shutdown drain barrier.
//!
//! # Usage
//!
//! A pool is wired to its producer through a single [`CountdownLatch`]: the pool's
//! completion signal counts the latch down once per delivered message, and the
//! [`LoadGenerator`] waits on it after fanning out each batch. Neither side holds a
//! reference to the other.
//!
//! ```rust
//! use mq_stress::{ConsumerPool, CountdownLatch, LoadGenerator, QueueService, TransactionPolicy};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let service = QueueService::new();
//!
//!     let latch = Arc::new(CountdownLatch::new(0));
//!     let signal = Arc::clone(&latch);
//!     let mut pool = ConsumerPool::new(&service, "stress", 4, TransactionPolicy::Native, move || {
//!         signal.count_down();
//!     })
//!     .unwrap();
//!     pool.open().unwrap();
//!
//!     let generator = LoadGenerator::new(service.sender("stress").unwrap(), 100, 8);
//!     generator.run(&latch, Some(1)).await;
//!
//!     pool.close().await.unwrap();
//!     assert_eq!(pool.in_flight(), 0);
//! }
//! ```
//!
//! # Delivery policies
//!
//! Every receive is wrapped according to the pool's [`TransactionPolicy`]:
//!
//! 1. [`Scoped`]: an explicit transaction scope is opened around the receive and completed
//!    after successful handling. Any other exit path aborts the scope implicitly, putting
//!    the message back at the head of its queue.
//!
//! 2. [`Native`]: a transaction object is begun before the receive, committed after
//!    handling and aborted explicitly on failure.
//!
//! 3. [`None`]: the message is received directly. Fastest, but a failure between receive
//!    and handling loses the message.
//!
//! Under `Scoped` and `Native` the pool is at-least-once: a message is either committed
//! exactly once or returned to the queue for a future cycle. This holds across the close
//! race too — if a handle is closed after its transaction begins but before the receive,
//! the receive fails, the transaction aborts and the message is delivered next time the
//! address is consumed.
//!
//! # Shutdown
//!
//! [`close`] stops every handle from re-arming its peek, releases the underlying
//! connections, then blocks until the [`InFlightTracker`] drains to zero, so no completion
//! signal is still running when it returns. There is no timeout and no cancellation of
//! in-flight deliveries; cancellation is purely "stop re-arming further peeks".
//!
//! # Testing
//!
//! Lifecycle, pairing and close-race contracts are covered by `#[cfg(test)]` modules next
//! to each component, parametrized over policies and handle counts with `rstest`. The
//! tracker's pairing invariant is additionally model checked with `loom`
//! (`cargo test --release --features loom`) and the store's commit/abort conservation is
//! property tested with `proptest` (`cargo test --features proptest`).
//!
//! # Known limitations
//!
//! The queue service is in-process and keeps its messages in memory; the `recoverable`
//! flag on [`Message`] is carried as a durability hint but nothing is persisted across a
//! process restart. Concurrent calls to `open`/`close` on the same pool are not guarded
//! beyond the lifecycle errors; the caller is expected to serialize them.
//!
//! [`Scoped`]: TransactionPolicy::Scoped
//! [`Native`]: TransactionPolicy::Native
//! [`None`]: TransactionPolicy::None
//! [`close`]: ConsumerPool::close

mod load;
mod pool;
mod queue;
mod sync;
mod tracker;

pub use load::{CountdownLatch, LoadGenerator, Throughput};
pub use pool::{CompletionSignal, ConsumerPool, PoolError, TransactionPolicy};
pub use queue::{Message, QueueError, QueueHandle, QueueService, SendHandle, Transaction};
pub use tracker::InFlightTracker;
