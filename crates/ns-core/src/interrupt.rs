//! Interrupt-style pin sources (§5): shared counters updated from an
//! ISR-equivalent context (anemometer, rain bucket). These counters are
//! the only shared mutable state outside the loop; they use plain
//! load/store on a naturally aligned integer plus a debounce interval to
//! suppress bouncing.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

pub struct DebouncedCounter {
    count: AtomicU32,
    debounce: Duration,
    last_tick: Mutex<Option<Instant>>,
}

impl DebouncedCounter {
    pub fn new(debounce: Duration) -> Self {
        DebouncedCounter {
            count: AtomicU32::new(0),
            debounce,
            last_tick: Mutex::new(None),
        }
    }

    /// Called from the interrupt/callback context. Returns `true` if the
    /// tick was accepted (outside the debounce window) and the counter
    /// was incremented.
    pub fn tick(&self) -> bool {
        let now = Instant::now();
        let mut last = self.last_tick.lock().unwrap();
        if let Some(prev) = *last {
            if now.duration_since(prev) < self.debounce {
                return false;
            }
        }
        *last = Some(now);
        self.count.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Read and zero the counter — called once per reconciliation cycle
    /// by the read handler for the corresponding pin.
    pub fn take(&self) -> u32 {
        self.count.swap(0, Ordering::Relaxed)
    }
}
