// Frame-rate and uptime tracking for the telemetry beacon

use std::cell::Cell;

use log::info;

use crate::clock::SharedClock;

/// Metrics the update check reports alongside its request.
pub trait Diagnostics {
    fn uptime_secs(&self) -> u64;
    fn fps(&self) -> f32;
    /// Lowest free heap seen since boot, in bytes.
    fn min_free_memory(&self) -> u64;
}

const STATUS_INTERVAL_SECS: u64 = 10;

/// Exponential moving average of the render loop's frame rate.
pub struct FrameCounter {
    clock: SharedClock,
    version_dir: String,
    start: u64,
    last_tick: Cell<u64>,
    fps: Cell<f32>,
}

impl FrameCounter {
    pub fn new(clock: SharedClock, version_dir: &str) -> Self {
        let start = clock.monotonic_millis();
        Self {
            clock,
            version_dir: version_dir.to_string(),
            start,
            last_tick: Cell::new(start),
            fps: Cell::new(0.0),
        }
    }

    /// Call once per rendered frame.
    pub fn tick(&self) {
        let now = self.clock.monotonic_millis();
        let last = self.last_tick.get();
        let elapsed = now.saturating_sub(last);
        if elapsed > 0 {
            let last_fps = 1000.0 / elapsed as f32;
            self.fps.set(0.9 * self.fps.get() + 0.1 * last_fps);
        }
        let now_sec = now / 1000;
        if now_sec > last / 1000 && now_sec % STATUS_INTERVAL_SECS == 0 {
            info!(
                "Up {} s ({:.1} fps) on {}",
                self.uptime_secs(),
                self.fps.get(),
                self.version_dir
            );
        }
        self.last_tick.set(now);
    }
}

impl Diagnostics for FrameCounter {
    fn uptime_secs(&self) -> u64 {
        self.clock.monotonic_millis().saturating_sub(self.start) / 1000
    }

    fn fps(&self) -> f32 {
        self.fps.get()
    }

    fn min_free_memory(&self) -> u64 {
        min_free_heap()
    }
}

#[cfg(target_os = "espidf")]
fn min_free_heap() -> u64 {
    // SAFETY: read-only query of the heap allocator statistics
    unsafe { esp_idf_sys::esp_get_minimum_free_heap_size() as u64 }
}

#[cfg(not(target_os = "espidf"))]
fn min_free_heap() -> u64 {
    0
}
