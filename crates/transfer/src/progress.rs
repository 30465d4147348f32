use std::time::{Duration, Instant};

/// A point-in-time view of an upload's progress.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferProgress {
    pub file_id: String,
    pub total_bytes: i64,
    /// Bytes acknowledged as durably persisted by the storage node.
    pub acked_bytes: i64,
    pub bytes_per_sec: f64,
    pub eta: Option<Duration>,
}

/// Tracks the acknowledged high-water mark for one upload.
///
/// Status records can repeat offsets across reconnects; the gauge only ever
/// moves forward. Owned by the resume controller, so no interior locking.
pub struct ProgressGauge {
    file_id: String,
    total_bytes: i64,
    acked_bytes: i64,
    speed: SpeedCalculator,
}

impl ProgressGauge {
    pub fn new(file_id: impl Into<String>, total_bytes: i64) -> Self {
        Self {
            file_id: file_id.into(),
            total_bytes,
            acked_bytes: 0,
            speed: SpeedCalculator::new(None, None),
        }
    }

    /// Records an acknowledged offset. Returns `true` if the high-water mark
    /// advanced.
    pub fn record_ack(&mut self, offset: i64) -> bool {
        if offset <= self.acked_bytes {
            return false;
        }
        self.speed.add_sample(offset - self.acked_bytes);
        self.acked_bytes = offset;
        true
    }

    /// Bytes acknowledged so far.
    pub fn acked(&self) -> i64 {
        self.acked_bytes
    }

    /// Returns `true` once the full file size is acknowledged.
    pub fn is_complete(&self) -> bool {
        self.acked_bytes >= self.total_bytes
    }

    /// Returns the current progress snapshot.
    pub fn snapshot(&self) -> TransferProgress {
        let bytes_per_sec = self.speed.bytes_per_second();
        TransferProgress {
            file_id: self.file_id.clone(),
            total_bytes: self.total_bytes,
            acked_bytes: self.acked_bytes,
            bytes_per_sec,
            eta: self.speed.eta(self.total_bytes - self.acked_bytes),
        }
    }
}

// ---------------------------------------------------------------------------
// SpeedCalculator
// ---------------------------------------------------------------------------

struct SpeedSample {
    bytes: i64,
    timestamp: Instant,
}

/// Calculates transfer speed using a sliding window of samples.
pub struct SpeedCalculator {
    samples: Vec<SpeedSample>,
    max_samples: usize,
    window_size: Duration,
}

impl SpeedCalculator {
    /// Creates a new calculator.
    ///
    /// - `window_size`: time window for speed calculation (default 5 s).
    /// - `max_samples`: maximum retained samples (default 100).
    pub fn new(window_size: Option<Duration>, max_samples: Option<usize>) -> Self {
        Self {
            samples: Vec::new(),
            max_samples: max_samples.unwrap_or(100),
            window_size: window_size.unwrap_or(Duration::from_secs(5)),
        }
    }

    /// Records a sample of `bytes` transferred at the current instant.
    pub fn add_sample(&mut self, bytes: i64) {
        let now = Instant::now();
        self.samples.push(SpeedSample {
            bytes,
            timestamp: now,
        });

        // Prune samples outside the window.
        let cutoff = now - self.window_size;
        self.samples.retain(|sample| sample.timestamp >= cutoff);

        if self.samples.len() > self.max_samples {
            let excess = self.samples.len() - self.max_samples;
            self.samples.drain(..excess);
        }
    }

    /// Returns the average speed in bytes/second within the window.
    ///
    /// Returns 0.0 if fewer than 2 samples.
    pub fn bytes_per_second(&self) -> f64 {
        if self.samples.len() < 2 {
            return 0.0;
        }

        let first = &self.samples[0];
        let last = &self.samples[self.samples.len() - 1];
        let elapsed = last.timestamp.duration_since(first.timestamp);
        if elapsed.is_zero() {
            return 0.0;
        }

        let total_bytes: i64 = self.samples.iter().map(|sample| sample.bytes).sum();
        total_bytes as f64 / elapsed.as_secs_f64()
    }

    /// Estimates time remaining to transfer `remaining_bytes`.
    ///
    /// Returns `None` if speed is zero.
    pub fn eta(&self, remaining_bytes: i64) -> Option<Duration> {
        let speed = self.bytes_per_second();
        if speed <= 0.0 {
            return None;
        }
        let secs = remaining_bytes.max(0) as f64 / speed;
        Some(Duration::from_secs_f64(secs))
    }

    /// Clears all recorded samples.
    pub fn reset(&mut self) {
        self.samples.clear();
    }
}
