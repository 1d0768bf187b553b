use mq_stress::{ConsumerPool, CountdownLatch, LoadGenerator, QueueService, TransactionPolicy};
use std::sync::Arc;

const ADDRESS: &str = "stress";
const HANDLES: usize = 4;
const BATCH_SIZE: usize = 1000;
// Swap the policy here to compare transactional overheads.
const POLICY: TransactionPolicy = TransactionPolicy::Native;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let service = QueueService::new();

    let latch = Arc::new(CountdownLatch::new(0));
    let signal = Arc::clone(&latch);
    let mut pool = ConsumerPool::new(&service, ADDRESS, HANDLES, POLICY, move || {
        signal.count_down();
    })
    .expect("failed to construct the consumer pool");
    pool.open().expect("failed to open the consumer pool");

    let parallelism = std::thread::available_parallelism().map(|n| n.get() * 2).unwrap_or(8);
    let sender = service.sender(ADDRESS).expect("the pool created the queue");

    // One line per batch: instantaneous msg/s, cumulative average, running total, elapsed.
    LoadGenerator::new(sender, BATCH_SIZE, parallelism).run(&latch, None).await;
}
