//! Manually advanced environment for unit tests.

use std::{
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use concord_core::Environment;

/// Clock that only moves when told to; ids come from a counter.
#[derive(Clone)]
pub(crate) struct ManualEnv {
    base: Instant,
    offset_ms: Arc<AtomicU64>,
    next_random: Arc<AtomicU64>,
}

impl ManualEnv {
    pub(crate) fn new() -> Self {
        Self {
            base: Instant::now(),
            offset_ms: Arc::new(AtomicU64::new(0)),
            next_random: Arc::new(AtomicU64::new(1)),
        }
    }

    pub(crate) fn advance(&self, by: Duration) {
        self.offset_ms.fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }

    /// Make the next `random_u64` calls start from `value`.
    pub(crate) fn set_next_random(&self, value: u64) {
        self.next_random.store(value, Ordering::SeqCst);
    }
}

impl Environment for ManualEnv {
    type Instant = Instant;

    fn now(&self) -> Self::Instant {
        self.base + Duration::from_millis(self.offset_ms.load(Ordering::SeqCst))
    }

    fn wall_clock_millis(&self) -> u64 {
        1_700_000_000_000 + self.offset_ms.load(Ordering::SeqCst)
    }

    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + Send {
        tokio::time::sleep(duration)
    }

    fn random_bytes(&self, buffer: &mut [u8]) {
        let value = self.next_random.fetch_add(1, Ordering::SeqCst).to_be_bytes();
        for (i, byte) in buffer.iter_mut().enumerate() {
            *byte = value[i % value.len()];
        }
    }
}
