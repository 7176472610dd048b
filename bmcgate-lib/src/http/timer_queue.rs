use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::debug;

/// Coarse per-iteration timeout.  Connections build longer deadlines by
/// re-arming from inside the callback.
pub const TIMER_QUEUE_TIMEOUT: Duration = Duration::from_secs(5);

/// Tick granularity for [`TimerQueue::process`].
pub const TIMER_QUEUE_TICK: Duration = Duration::from_secs(1);

const MAX_SIZE: usize = 100;

/// Deadline iterations granted to authenticated connections (60 s) and
/// anonymous connections (15 s).
pub const LOGGED_IN_ATTEMPTS: usize = 60 / TIMER_QUEUE_TIMEOUT.as_secs() as usize;
pub const LOGGED_OUT_ATTEMPTS: usize = 15 / TIMER_QUEUE_TIMEOUT.as_secs() as usize;

type Callback = Box<dyn FnOnce() + Send>;

/// Fixed-tick timer queue used to evict slow connections.
///
/// Entries form an append-only ring; `cancel` tombstones in place so
/// handles issued earlier keep resolving to the right slot.  The handle
/// is the ring base (`step`) plus the entry's offset at insertion.
pub struct TimerQueue {
    dq: VecDeque<(Instant, Option<Callback>)>,
    step: u64,
}

impl Default for TimerQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl TimerQueue {
    pub fn new() -> Self {
        Self { dq: VecDeque::with_capacity(MAX_SIZE), step: 0 }
    }

    /// Schedule `f` for roughly [`TIMER_QUEUE_TIMEOUT`] from now.
    /// Returns `None` when the ring is full; a connection that cannot
    /// get a timer must close, since nothing would evict it.
    pub fn add(&mut self, f: Callback) -> Option<u64> {
        if self.dq.len() == MAX_SIZE {
            return None;
        }
        self.dq.push_back((Instant::now(), Some(f)));
        let handle = self.step + self.dq.len() as u64 - 1;
        debug!(handle, "timer added");
        Some(handle)
    }

    /// Tombstone the entry behind `handle`.  Leading tombstones are
    /// popped immediately so the ring never fills with dead slots.
    pub fn cancel(&mut self, handle: u64) {
        if let Some(index) = handle.checked_sub(self.step) {
            if let Some(entry) = self.dq.get_mut(index as usize) {
                entry.1 = None;
            }
        }
        while matches!(self.dq.front(), Some((_, None))) {
            self.dq.pop_front();
            self.step += 1;
        }
    }

    /// Run every expired front entry; called once per tick.  Stops at
    /// the first live entry that has not yet aged past the coarse
    /// timeout.
    pub fn process(&mut self) {
        for callback in self.take_expired() {
            callback();
        }
    }

    /// Pop expired front entries and hand their callbacks back without
    /// invoking them, so a caller holding a lock around the queue can
    /// run them after releasing it (callbacks re-arm through the same
    /// queue).
    pub fn take_expired(&mut self) -> Vec<Callback> {
        let now = Instant::now();
        let mut expired = Vec::new();
        while let Some((enqueued, callback)) = self.dq.front_mut() {
            if callback.is_some() {
                if now.duration_since(*enqueued) < TIMER_QUEUE_TIMEOUT {
                    break;
                }
                debug!(step = self.step, "timer fired");
                if let Some(callback) = callback.take() {
                    expired.push(callback);
                }
            }
            self.dq.pop_front();
            self.step += 1;
        }
        expired
    }

    pub fn len(&self) -> usize {
        self.dq.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dq.is_empty()
    }
}

/// Handle shared between the ticker task and every connection.
#[derive(Clone)]
pub struct SharedTimerQueue(Arc<Mutex<TimerQueue>>);

impl Default for SharedTimerQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl SharedTimerQueue {
    pub fn new() -> Self {
        Self(Arc::new(Mutex::new(TimerQueue::new())))
    }

    pub fn add(&self, f: Callback) -> Option<u64> {
        self.lock().add(f)
    }

    pub fn cancel(&self, handle: u64) {
        self.lock().cancel(handle);
    }

    pub fn process(&self) {
        // run callbacks outside the lock: expiry handlers re-arm
        // through this same queue
        let expired = self.lock().take_expired();
        for callback in expired {
            callback();
        }
    }

    /// Drive `process()` on the fixed tick until the handle is dropped.
    pub fn spawn_ticker(&self) -> tokio::task::JoinHandle<()> {
        let queue = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(TIMER_QUEUE_TICK);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                queue.process();
            }
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TimerQueue> {
        match self.0.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn add_fails_when_full() {
        let mut queue = TimerQueue::new();
        for i in 0..MAX_SIZE {
            assert!(queue.add(Box::new(|| {})).is_some(), "add {i}");
        }
        assert!(queue.add(Box::new(|| {})).is_none());
    }

    #[test]
    fn cancel_front_drains_tombstones() {
        let mut queue = TimerQueue::new();
        let first = queue.add(Box::new(|| {})).unwrap();
        let second = queue.add(Box::new(|| {})).unwrap();
        queue.cancel(first);
        assert_eq!(queue.len(), 1);
        queue.cancel(second);
        assert!(queue.is_empty());
    }

    #[test]
    fn cancel_middle_keeps_slot_until_front_drains() {
        let mut queue = TimerQueue::new();
        let first = queue.add(Box::new(|| {})).unwrap();
        let second = queue.add(Box::new(|| {})).unwrap();
        let third = queue.add(Box::new(|| {})).unwrap();
        queue.cancel(second);
        // tombstone retained behind a live front entry
        assert_eq!(queue.len(), 3);
        queue.cancel(first);
        // front pop drains through the tombstoned second entry
        assert_eq!(queue.len(), 1);
        queue.cancel(third);
        assert!(queue.is_empty());
    }

    #[test]
    fn handles_stay_stable_across_pops() {
        let mut queue = TimerQueue::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let first = queue.add(Box::new(|| {})).unwrap();
        let fired2 = Arc::clone(&fired);
        let second = queue.add(Box::new(move || {
            fired2.fetch_add(1, Ordering::SeqCst);
        })).unwrap();
        queue.cancel(first);
        assert_eq!(second, first + 1);
        // second's handle still resolves after the ring base moved
        queue.cancel(second);
        queue.process();
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn process_skips_fresh_entries() {
        let mut queue = TimerQueue::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = Arc::clone(&fired);
        queue.add(Box::new(move || {
            fired2.fetch_add(1, Ordering::SeqCst);
        })).unwrap();
        queue.process();
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(queue.len(), 1);
    }
}
