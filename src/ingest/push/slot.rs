use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Single-slot, latest-wins hand-off between a producer thread and a consumer.
///
/// `put` unconditionally replaces any value the consumer has not taken yet;
/// `take_timeout` waits for a value to be ready, removes it and thereby clears
/// readiness. There is never more than one value buffered.
#[derive(Debug)]
pub struct LatestSlot<T> {
    value: Mutex<Option<T>>,
    ready: Condvar,
    published: AtomicU64,
    overwritten: AtomicU64,
}

impl<T> Default for LatestSlot<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> LatestSlot<T> {
    pub fn new() -> Self {
        Self {
            value: Mutex::new(None),
            ready: Condvar::new(),
            published: AtomicU64::new(0),
            overwritten: AtomicU64::new(0),
        }
    }

    pub fn put(&self, value: T) {
        let mut slot = self.lock();
        if slot.replace(value).is_some() {
            self.overwritten.fetch_add(1, Ordering::Relaxed);
        }
        self.published.fetch_add(1, Ordering::Release);
        drop(slot);
        self.ready.notify_all();
    }

    /// Wait up to `timeout` for a value. `None` on timeout.
    pub fn take_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.lock();
        loop {
            if let Some(value) = slot.take() {
                return Some(value);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            slot = match self.ready.wait_timeout(slot, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    pub fn try_take(&self) -> Option<T> {
        self.lock().take()
    }

    pub fn is_ready(&self) -> bool {
        self.lock().is_some()
    }

    /// Values ever put into the slot.
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Acquire)
    }

    /// Values replaced before the consumer took them.
    pub fn overwritten(&self) -> u64 {
        self.overwritten.load(Ordering::Relaxed)
    }

    fn lock(&self) -> MutexGuard<'_, Option<T>> {
        match self.value.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn latest_value_wins() {
        let slot = LatestSlot::new();
        slot.put(1);
        slot.put(2);
        slot.put(3);
        assert_eq!(slot.take_timeout(Duration::from_millis(10)), Some(3));
        assert_eq!(slot.overwritten(), 2);
        assert_eq!(slot.published(), 3);
    }

    #[test]
    fn take_clears_readiness() {
        let slot = LatestSlot::new();
        slot.put("frame");
        assert!(slot.is_ready());
        assert_eq!(slot.try_take(), Some("frame"));
        assert!(!slot.is_ready());
        assert_eq!(slot.take_timeout(Duration::from_millis(20)), None);
    }

    #[test]
    fn waiting_consumer_is_woken_by_producer() {
        let slot = Arc::new(LatestSlot::new());
        let producer = slot.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            producer.put(42u32);
        });
        assert_eq!(slot.take_timeout(Duration::from_secs(5)), Some(42));
        handle.join().expect("producer");
    }
}
