use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Condvar, Mutex};

/// Monotonic generation counter pair tying CPU-side submits to
/// GPU-side completion.
///
/// `current` is the generation most recently handed to the
/// submission pipeline and is only ever incremented by the
/// producer thread; `completed` trails it and is only ever
/// advanced by the fence worker once the matching driver fence
/// has signalled. `completed <= current` holds at all times.
pub struct FenceCounter {
    current: AtomicU64,
    completed: AtomicU64,
    state: Mutex<()>,
    signal: Condvar,
}

impl FenceCounter {
    pub fn new() -> Self {
        Self {
            current: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            state: Mutex::new(()),
            signal: Condvar::new(),
        }
    }

    /// Claim the next generation. Producer thread only.
    pub fn next(&self) -> u64 {
        self.current.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn current(&self) -> u64 {
        self.current.load(Ordering::Acquire)
    }

    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Acquire)
    }

    /// Advance `completed` to `counter` if it is not already
    /// past it, and wake every blocked waiter. Single writer;
    /// the lock only orders the store against concurrent
    /// waiters so no notification is lost.
    pub fn advance_completed(&self, counter: u64) {
        let _held = self.state.lock();
        if counter > self.completed.load(Ordering::Relaxed) {
            self.completed.store(counter, Ordering::Release);
        }
        self.signal.notify_all();
    }

    /// Block until `completed >= counter`.
    pub fn wait_completed(&self, counter: u64) {
        if self.completed() >= counter {
            return;
        }

        let mut held = self.state.lock();
        while self.completed.load(Ordering::Acquire) < counter {
            self.signal.wait(&mut held);
        }
    }
}

impl Default for FenceCounter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{sync::Arc, thread, time::Duration};

    #[test]
    fn generations_are_strictly_increasing() {
        let fence = FenceCounter::new();
        assert_eq!(fence.next(), 1);
        assert_eq!(fence.next(), 2);
        assert_eq!(fence.next(), 3);
        assert_eq!(fence.current(), 3);
        assert_eq!(fence.completed(), 0);
    }

    #[test]
    fn completed_never_goes_backwards() {
        let fence = FenceCounter::new();
        fence.advance_completed(5);
        fence.advance_completed(3);
        assert_eq!(fence.completed(), 5);
        fence.advance_completed(8);
        assert_eq!(fence.completed(), 8);
    }

    #[test]
    fn wait_blocks_until_the_generation_completes() {
        let fence = Arc::new(FenceCounter::new());
        let target = fence.next();

        let waiter = {
            let fence = fence.clone();
            thread::spawn(move || {
                fence.wait_completed(target);
                fence.completed()
            })
        };

        // Give the waiter a moment to block, then release it.
        thread::sleep(Duration::from_millis(10));
        fence.advance_completed(target);

        assert!(waiter.join().unwrap() >= target);
    }

    #[test]
    fn wait_on_an_already_completed_generation_returns_immediately() {
        let fence = FenceCounter::new();
        let counter = fence.next();
        fence.advance_completed(counter);
        fence.wait_completed(counter);
    }
}
