use std::time::{Duration, Instant};
use uuid::Uuid;

use super::events::{EventSink, TransferDirection, TransferProgressEvent};

/// Minimum time between two progress updates for the same transfer
pub const PROGRESS_UPDATE_INTERVAL: Duration = Duration::from_millis(150);

/// Snapshot of a transfer's progress
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransferProgress {
    pub bytes_written: u64,
    pub total_bytes: u64,
    pub elapsed: Duration,
}

impl TransferProgress {
    /// Percentage complete. An empty transfer counts as complete.
    pub fn percentage(&self) -> f64 {
        if self.total_bytes == 0 {
            return 100.0;
        }
        let pct = self.bytes_written as f64 * 100.0 / self.total_bytes as f64;
        pct.min(100.0)
    }

    /// Throughput in bytes per second, zero when no time has passed
    pub fn rate(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if self.total_bytes == 0 || secs <= 0.0 {
            return 0.0;
        }
        self.bytes_written as f64 / secs
    }
}

/// Human readable rate, KB/s below one MB/s and MB/s above
pub fn format_rate(bytes_per_sec: f64) -> String {
    let kb = bytes_per_sec / 1024.0;
    if kb > 1024.0 {
        format!("{:.2} MB/s", kb / 1024.0)
    } else {
        format!("{:.2} KB/s", kb)
    }
}

/// Tracks the bytes of one transfer and emits throttled progress events.
///
/// Owned by the task doing the copy; not shared between threads.
pub struct ProgressObserver {
    transfer_id: Uuid,
    filename: String,
    direction: TransferDirection,
    total: u64,
    written: u64,
    start_time: Instant,
    last_update: Option<Instant>,
    min_interval: Duration,
    completed: bool,
    events: EventSink,
}

impl ProgressObserver {
    pub fn new(
        filename: impl Into<String>,
        total: u64,
        direction: TransferDirection,
        events: EventSink,
    ) -> Self {
        Self {
            transfer_id: Uuid::new_v4(),
            filename: filename.into(),
            direction,
            total,
            written: 0,
            start_time: Instant::now(),
            last_update: None,
            min_interval: PROGRESS_UPDATE_INTERVAL,
            completed: false,
            events,
        }
    }

    /// Override the throttle interval
    pub fn with_interval(mut self, min_interval: Duration) -> Self {
        self.min_interval = min_interval;
        self
    }

    pub fn transfer_id(&self) -> Uuid {
        self.transfer_id
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    /// Record `chunk_len` more bytes. Emits an update unless one was sent
    /// within the throttle interval; the final update is always emitted.
    pub fn on_write(&mut self, chunk_len: usize) {
        self.written += chunk_len as u64;
        let now = Instant::now();
        let is_final = self.written >= self.total;

        if !is_final {
            if let Some(last) = self.last_update {
                if now.duration_since(last) < self.min_interval {
                    return;
                }
            }
        }

        self.last_update = Some(now);
        self.emit(now);
        if is_final {
            self.completed = true;
        }
    }

    /// Emit the terminal 100% update if `on_write` never produced it.
    /// Only an empty transfer reaches this without one.
    pub fn finish(&mut self) {
        if self.completed || self.written < self.total {
            return;
        }
        self.completed = true;
        self.emit(Instant::now());
    }

    pub fn snapshot(&self) -> TransferProgress {
        TransferProgress {
            bytes_written: self.written,
            total_bytes: self.total,
            elapsed: self.start_time.elapsed(),
        }
    }

    fn emit(&self, now: Instant) {
        let progress = TransferProgress {
            bytes_written: self.written,
            total_bytes: self.total,
            elapsed: now.duration_since(self.start_time),
        };
        let rate = progress.rate();
        self.events.progress(TransferProgressEvent {
            transfer_id: self.transfer_id,
            filename: self.filename.clone(),
            percent: progress.percentage(),
            rate,
            rate_text: format_rate(rate),
            direction: self.direction,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::networking::events::AppEvent;

    fn drain_percents(rx: &mut tokio::sync::mpsc::UnboundedReceiver<AppEvent>) -> Vec<f64> {
        let mut percents = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let AppEvent::TransferProgress(p) = event {
                percents.push(p.percent);
            }
        }
        percents
    }

    #[test]
    fn test_percentage_and_rate() {
        let progress = TransferProgress {
            bytes_written: 512,
            total_bytes: 2048,
            elapsed: Duration::from_secs(2),
        };
        assert_eq!(progress.percentage(), 25.0);
        assert_eq!(progress.rate(), 256.0);

        let empty = TransferProgress {
            bytes_written: 0,
            total_bytes: 0,
            elapsed: Duration::from_secs(1),
        };
        assert_eq!(empty.percentage(), 100.0);
        assert_eq!(empty.rate(), 0.0);

        let instant = TransferProgress {
            bytes_written: 10,
            total_bytes: 10,
            elapsed: Duration::ZERO,
        };
        assert_eq!(instant.rate(), 0.0);
    }

    #[test]
    fn test_format_rate_units() {
        assert_eq!(format_rate(512.0 * 1024.0), "512.00 KB/s");
        assert_eq!(format_rate(3.0 * 1024.0 * 1024.0), "3.00 MB/s");
    }

    #[test]
    fn test_progress_is_monotonic_and_ends_at_100() {
        let (events, mut rx) = EventSink::channel();
        let mut observer =
            ProgressObserver::new("data.bin", 1000, TransferDirection::Receiving, events)
                .with_interval(Duration::ZERO);

        for chunk in [1usize, 99, 250, 7, 343, 300] {
            observer.on_write(chunk);
        }

        let percents = drain_percents(&mut rx);
        assert_eq!(percents.len(), 6);
        assert!(percents.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(percents.last().copied(), Some(100.0));
    }

    #[test]
    fn test_throttle_never_drops_final_update() {
        let (events, mut rx) = EventSink::channel();
        let mut observer =
            ProgressObserver::new("data.bin", 100, TransferDirection::Sending, events)
                .with_interval(Duration::from_secs(3600));

        for _ in 0..10 {
            observer.on_write(10);
        }

        let percents = drain_percents(&mut rx);
        // First write always reports, the rest are throttled until the last
        assert_eq!(percents, vec![10.0, 100.0]);
    }

    #[test]
    fn test_finish_reports_empty_transfer_once() {
        let (events, mut rx) = EventSink::channel();
        let mut observer = ProgressObserver::new("empty", 0, TransferDirection::Receiving, events);
        observer.finish();
        observer.finish();

        let percents = drain_percents(&mut rx);
        assert_eq!(percents, vec![100.0]);
    }

    #[test]
    fn test_finish_does_not_report_incomplete_transfer() {
        let (events, mut rx) = EventSink::channel();
        let mut observer =
            ProgressObserver::new("partial", 50, TransferDirection::Receiving, events)
                .with_interval(Duration::from_secs(3600));
        observer.on_write(20);
        observer.finish();

        assert_eq!(drain_percents(&mut rx), vec![40.0]);
    }
}
