use std::time::{Duration, Instant};

use crate::queue::{Message, SendHandle};
use crate::sync::*;
use futures::StreamExt;
use tracing::debug;

/// Fixed size of the opaque `body` and `extension` payloads on every generated message.
const PAYLOAD_BYTES: usize = 1024;

/// A counting signal the producer waits on after dispatching a batch.
///
/// This is the only coupling between producer and consumer: the consumer pool's owner
/// wires the pool's completion signal to [`count_down`] and the generator [`wait`]s for
/// the count to drain. `count_down` is safe to call concurrently from any number of
/// tasks, and counting below zero (a duplicate at-least-once delivery) keeps the latch
/// released rather than wedging it.
///
/// [`count_down`]: Self::count_down
/// [`wait`]: Self::wait
pub struct CountdownLatch {
    count: sync::atomic::AtomicI64,
    waker: Notify,
}

impl CountdownLatch {
    pub fn new(count: usize) -> Self {
        Self { count: sync::atomic::AtomicI64::new(count as i64), waker: Notify::new() }
    }

    /// Re-arms the latch for the next batch. Must not race [`wait`]; the producer only
    /// resets between batches, after the previous wait has returned.
    ///
    /// [`wait`]: Self::wait
    pub fn reset(&self, count: usize) {
        self.count.store(count as i64, sync::atomic::Ordering::Release);
    }

    pub fn count_down(&self) {
        let previous = self.count.fetch_sub(1, sync::atomic::Ordering::AcqRel);
        if previous <= 1 {
            self.waker.notify_waiters();
        }
    }

    pub fn remaining(&self) -> i64 {
        self.count.load(sync::atomic::Ordering::Acquire)
    }

    /// Resolves once the count has drained to zero (or below).
    pub async fn wait(&self) {
        loop {
            let notified = self.waker.notified();
            tokio::pin!(notified);
            // Register before the check so a final count_down landing in between is not
            // lost.
            notified.as_mut().enable();

            if self.remaining() <= 0 {
                return;
            }

            notified.await;
        }
    }
}

/// One reporting line, emitted once per producer batch.
#[derive(Debug, Clone, Copy)]
pub struct Throughput {
    /// Messages per second over this batch's window.
    pub batch: f64,
    /// Total messages over total elapsed time.
    pub cumulative: f64,
    /// Messages sent since the run started.
    pub total: u64,
    pub elapsed: Duration,
}

impl std::fmt::Display for Throughput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:.0}msg/s ~{:.0} +{} {:.1}s",
            self.batch,
            self.cumulative,
            self.total,
            self.elapsed.as_secs_f64()
        )
    }
}

/// Produces fixed-size batches of messages against one queue address.
///
/// Each send carries a monotonically increasing global sequence number as its label and
/// fixed-size opaque payloads. Batches are dispatched with a bounded-parallelism
/// fan-out; after dispatching, [`run`] waits on the [`CountdownLatch`] until the
/// consumer pool has signaled once per message, then emits a [`Throughput`] line.
///
/// [`run`]: Self::run
pub struct LoadGenerator {
    sender: SendHandle,
    batch_size: usize,
    parallelism: usize,
    sequence: sync::atomic::AtomicU64,
    body: Vec<u8>,
    extension: Vec<u8>,
}

impl LoadGenerator {
    pub fn new(sender: SendHandle, batch_size: usize, parallelism: usize) -> Self {
        Self {
            sender,
            batch_size: batch_size.max(1),
            parallelism: parallelism.max(1),
            sequence: sync::atomic::AtomicU64::new(0),
            body: vec![0; PAYLOAD_BYTES],
            extension: vec![0; PAYLOAD_BYTES],
        }
    }

    /// Fans out one batch of sends, at most `parallelism` at a time.
    #[cfg_attr(test, tracing::instrument(skip(self)))]
    pub async fn dispatch(&self) {
        futures::stream::iter(0..self.batch_size)
            .for_each_concurrent(self.parallelism, |_| async {
                let sequence = self.sequence.fetch_add(1, sync::atomic::Ordering::AcqRel) + 1;
                self.sender.send(Message {
                    label: sequence.to_string(),
                    body: self.body.clone(),
                    extension: self.extension.clone(),
                    recoverable: true,
                });
            })
            .await;
        debug!(batch = self.batch_size, total = self.total(), "Batch dispatched");
    }

    /// Messages sent since this generator was created.
    pub fn total(&self) -> u64 {
        self.sequence.load(sync::atomic::Ordering::Acquire)
    }

    /// Drives batches through the queue, waiting for the latch to drain after each one
    /// and printing the throughput line. Runs forever when `rounds` is `None`.
    pub async fn run(&self, latch: &CountdownLatch, rounds: Option<u64>) {
        let start = Instant::now();
        let mut round = 0;

        loop {
            latch.reset(self.batch_size);
            let batch_start = Instant::now();

            self.dispatch().await;
            latch.wait().await;

            let elapsed = start.elapsed();
            let report = Throughput {
                batch: self.batch_size as f64 / batch_start.elapsed().as_secs_f64(),
                cumulative: self.total() as f64 / elapsed.as_secs_f64(),
                total: self.total(),
                elapsed,
            };
            println!("{report}");

            round += 1;
            if rounds.is_some_and(|rounds| round >= rounds) {
                break;
            }
        }
    }
}
