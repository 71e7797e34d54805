// Time sources shared by the link, fetcher and orchestrator

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

pub type SharedClock = Arc<dyn Clock + Send + Sync>;

pub trait Clock {
    /// Milliseconds since an arbitrary fixed point; never goes backwards.
    fn monotonic_millis(&self) -> u64;

    /// Milliseconds since the Unix epoch, if the wall clock has been set.
    fn wall_millis(&self) -> Option<u64>;
}

pub struct SystemClock {
    start: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self { start: Instant::now() }
    }

    pub fn shared() -> SharedClock {
        Arc::new(Self::new())
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn monotonic_millis(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    fn wall_millis(&self) -> Option<u64> {
        let now = SystemTime::now().duration_since(UNIX_EPOCH).ok()?;
        // Before SNTP sync the RTC starts at 1970; treat that as unset
        if now.as_secs() < 1_600_000_000 {
            return None;
        }
        Some(now.as_millis() as u64)
    }
}

/// Hand-advanced clock for tests and the simulator.
#[derive(Default)]
pub struct ManualClock {
    now: AtomicU64,
    wall_offset: AtomicU64,
}

impl ManualClock {
    pub fn new(start_millis: u64) -> Arc<Self> {
        Arc::new(Self {
            now: AtomicU64::new(start_millis),
            wall_offset: AtomicU64::new(0),
        })
    }

    pub fn advance(&self, millis: u64) {
        self.now.fetch_add(millis, Ordering::SeqCst);
    }

    pub fn set(&self, millis: u64) {
        self.now.store(millis, Ordering::SeqCst);
    }

    /// Makes `wall_millis` report `epoch_millis` at the current monotonic time.
    pub fn set_wall(&self, epoch_millis: u64) {
        let now = self.now.load(Ordering::SeqCst);
        self.wall_offset
            .store(epoch_millis.saturating_sub(now), Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn monotonic_millis(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }

    fn wall_millis(&self) -> Option<u64> {
        match self.wall_offset.load(Ordering::SeqCst) {
            0 => None,
            offset => Some(offset + self.now.load(Ordering::SeqCst)),
        }
    }
}

/// Renders epoch milliseconds as `YYYY-MM-DDTHH:MM:SSZ`.
pub fn millis_to_isoformat(millis: Option<u64>) -> String {
    millis
        .and_then(|ms| chrono::DateTime::from_timestamp_millis(ms as i64))
        .map(|dt| dt.format("%Y-%m-%dT%H:%M:%SZ").to_string())
        .unwrap_or_default()
}
