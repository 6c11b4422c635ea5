use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, Instant},
};

use tokio::{task::JoinHandle, time::interval};

pub static METER: Meter = Meter::new();

/// Frame counters, reset on every read.
#[derive(Default)]
pub struct Meter {
    captured_frames: AtomicU64,
    processed_frames: AtomicU64,
    streamed_frames: AtomicU64,
}

impl Meter {
    pub const fn new() -> Meter {
        Meter {
            captured_frames: AtomicU64::new(0),
            processed_frames: AtomicU64::new(0),
            streamed_frames: AtomicU64::new(0),
        }
    }

    pub fn tick_captured(&self) {
        self.captured_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn tick_processed(&self) {
        self.processed_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn tick_streamed(&self) {
        self.streamed_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_reset_captured(&self) -> u64 {
        self.captured_frames.swap(0, Ordering::Relaxed)
    }

    pub fn get_reset_processed(&self) -> u64 {
        self.processed_frames.swap(0, Ordering::Relaxed)
    }

    pub fn get_reset_streamed(&self) -> u64 {
        self.streamed_frames.swap(0, Ordering::Relaxed)
    }
}

pub fn spawn_meter_logger() -> JoinHandle<()> {
    tokio::spawn(async {
        let mut log_interval = interval(Duration::from_secs(2));
        log_interval.tick().await;

        loop {
            let start = Instant::now();
            log_interval.tick().await;

            let elapsed = start.elapsed().as_secs_f32();
            let counts = [
                ("Captured", METER.get_reset_captured()),
                ("Processed", METER.get_reset_processed()),
                ("Streamed", METER.get_reset_streamed()),
            ];

            for (kind, frames) in counts {
                if frames > 0 {
                    log::info!("{kind} frames per second: {:.2}", frames as f32 / elapsed);
                }
            }
        }
    })
}

#[cfg(test)]
mod test {

    use super::*;

    #[test]
    fn test_counters_reset_on_read() {
        let meter = Meter::new();
        meter.tick_processed();
        meter.tick_processed();
        meter.tick_streamed();

        assert_eq!(meter.get_reset_processed(), 2);
        assert_eq!(meter.get_reset_processed(), 0);
        assert_eq!(meter.get_reset_streamed(), 1);
        assert_eq!(meter.get_reset_captured(), 0);
    }
}
