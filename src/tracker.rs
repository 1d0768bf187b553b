use crate::sync::*;

/// A process-wide atomic count of completion-callback executions currently running.
///
/// Shared by every handle in a [`ConsumerPool`] and used as the shutdown drain barrier:
/// [`close`] does not return while this reads above zero. Increments and decrements are
/// paired around exactly one completion-signal invocation, so the count can never be
/// observed negative. Lock-free, never blocks.
///
/// [`ConsumerPool`]: crate::pool::ConsumerPool
/// [`close`]: crate::pool::ConsumerPool::close
pub struct InFlightTracker {
    count: sync::atomic::AtomicI64,
}

impl Default for InFlightTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl InFlightTracker {
    pub fn new() -> Self {
        Self { count: sync::atomic::AtomicI64::new(0) }
    }

    pub fn increment(&self) {
        self.count.fetch_add(1, sync::atomic::Ordering::AcqRel);
    }

    pub fn decrement(&self) {
        let previous = self.count.fetch_sub(1, sync::atomic::Ordering::AcqRel);
        debug_assert!(previous > 0, "in-flight count underflow");
    }

    pub fn read(&self) -> i64 {
        self.count.load(sync::atomic::Ordering::Acquire)
    }
}

impl std::fmt::Debug for InFlightTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InFlightTracker").field("count", &self.read()).finish()
    }
}

/// Decrements the tracker when dropped.
///
/// Taken right after the increment so the decrement runs on every exit path out of the
/// completion signal, panics included.
pub(crate) struct InFlightGuard<'a>(pub(crate) &'a InFlightTracker);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.decrement();
    }
}


/// Exhaustive interleaving check of the pairing invariant. Run with
/// `cargo test --release --features loom`.
#[cfg(all(test, feature = "loom"))]
mod model {
    use super::*;

    #[test]
    fn pairing_never_goes_negative() {
        loom::model(|| {
            let tracker = loom::sync::Arc::new(InFlightTracker::new());

            let threads = (0..2)
                .map(|_| {
                    let tracker = loom::sync::Arc::clone(&tracker);
                    loom::thread::spawn(move || {
                        tracker.increment();
                        assert!(tracker.read() > 0);
                        tracker.decrement();
                    })
                })
                .collect::<Vec<_>>();

            for thread in threads {
                thread.join().unwrap();
            }
            assert_eq!(tracker.read(), 0);
        });
    }
}
