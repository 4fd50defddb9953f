//! Motion-vector stream analysis.
//!
//! The encoder writes one batch of `(mbx + 1) * mby` records per frame.
//! Each record is `{dx: i8, dy: i8, sad: i16}`, little-endian, 4 bytes.
//! A batch counts as motion when more than `total_threshold` records move
//! further than `magnitude`; motion events are then throttled so at most
//! one is raised per throttle window.
//!
//! Every batch is scored, even while throttled. The throttle only gates
//! the event.

use std::io::{ErrorKind, Read};
use std::time::{Duration, Instant};

use thiserror::Error;

/// Size of one encoded record in bytes.
pub const RECORD_SIZE: usize = 4;

#[derive(Error, Debug)]
pub enum MotionError {
    #[error("motion stream closed")]
    Closed,
    #[error("motion stream read failed: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MotionConfig {
    /// Macroblock columns; the encoder emits one extra column per row.
    pub mbx: usize,
    /// Macroblock rows.
    pub mby: usize,
    /// Minimum vector length for a macroblock to count as moving.
    pub magnitude: u32,
    /// A batch is motion when strictly more records than this are moving.
    pub total_threshold: usize,
    /// Minimum time between two motion events.
    pub throttle: Duration,
}

impl MotionConfig {
    /// Records per batch.
    pub fn batch_len(&self) -> usize {
        (self.mbx + 1) * self.mby
    }
}

/// One macroblock's motion estimate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MotionVector {
    pub dx: i8,
    pub dy: i8,
    pub sad: i16,
}

impl MotionVector {
    pub fn from_le_bytes(bytes: [u8; RECORD_SIZE]) -> Self {
        Self {
            dx: bytes[0] as i8,
            dy: bytes[1] as i8,
            sad: i16::from_le_bytes([bytes[2], bytes[3]]),
        }
    }

    pub fn to_le_bytes(self) -> [u8; RECORD_SIZE] {
        let sad = self.sad.to_le_bytes();
        [self.dx as u8, self.dy as u8, sad[0], sad[1]]
    }

    /// `dx² + dy²`, compared against the squared magnitude threshold.
    pub fn magnitude_squared(&self) -> i64 {
        let dx = self.dx as i64;
        let dy = self.dy as i64;
        dx * dx + dy * dy
    }
}

/// Decode whole records from `bytes` into `out`, replacing its contents.
pub fn decode_batch(bytes: &[u8], out: &mut Vec<MotionVector>) {
    out.clear();
    out.extend(bytes.chunks_exact(RECORD_SIZE).map(|c| {
        MotionVector::from_le_bytes([c[0], c[1], c[2], c[3]])
    }));
}

/// Fill `scratch` from `reader` and decode it into `out`. A short read
/// means the producer went away and is reported as [`MotionError::Closed`].
pub fn read_batch<R: Read>(
    reader: &mut R,
    scratch: &mut [u8],
    out: &mut Vec<MotionVector>,
) -> Result<(), MotionError> {
    reader.read_exact(scratch).map_err(|e| match e.kind() {
        ErrorKind::UnexpectedEof => MotionError::Closed,
        _ => MotionError::Io(e),
    })?;
    decode_batch(scratch, out);
    Ok(())
}

/// Throttle state of an analyzer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotionState {
    /// No event raised yet, or the last throttle window has passed.
    Idle,
    /// An event was raised at `since`; further ones wait for the window.
    Throttled { since: Instant },
}

/// A batch that qualified as motion outside the throttle window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MotionEvent {
    /// Records above the magnitude threshold in the triggering batch.
    pub active: usize,
    pub at: Instant,
}

/// Totals reported when the stream ends.
#[derive(Debug)]
pub struct MotionSummary {
    pub batches: u64,
    pub events: u64,
    pub reason: MotionError,
}

/// Scores motion batches and decides when to raise events.
pub struct MotionAnalyzer {
    config: MotionConfig,
    threshold_sq: i64,
    state: MotionState,
}

impl MotionAnalyzer {
    pub fn new(config: MotionConfig) -> Self {
        let magnitude = config.magnitude as i64;
        Self {
            config,
            threshold_sq: magnitude * magnitude,
            state: MotionState::Idle,
        }
    }

    pub fn state(&self) -> MotionState {
        self.state
    }

    /// Number of records moving further than the magnitude threshold.
    pub fn active_count(&self, batch: &[MotionVector]) -> usize {
        batch
            .iter()
            .filter(|v| v.magnitude_squared() > self.threshold_sq)
            .count()
    }

    /// Feed one scored batch. Returns an event when `active` exceeds the
    /// total threshold and no event was raised within the throttle window.
    pub fn observe(&mut self, active: usize, now: Instant) -> Option<MotionEvent> {
        if let MotionState::Throttled { since } = self.state {
            if now.saturating_duration_since(since) > self.config.throttle {
                self.state = MotionState::Idle;
            }
        }

        if active <= self.config.total_threshold {
            return None;
        }

        match self.state {
            MotionState::Idle => {
                self.state = MotionState::Throttled { since: now };
                Some(MotionEvent { active, at: now })
            }
            MotionState::Throttled { .. } => None,
        }
    }

    /// Read and score batches until the stream closes or fails, handing
    /// each event to `on_event`.
    pub fn run<R: Read>(
        &mut self,
        mut reader: R,
        mut on_event: impl FnMut(MotionEvent),
    ) -> MotionSummary {
        let mut scratch = vec![0u8; self.config.batch_len() * RECORD_SIZE];
        let mut batch = Vec::with_capacity(self.config.batch_len());
        let mut batches = 0u64;
        let mut events = 0u64;

        tracing::info!(
            records = self.config.batch_len(),
            magnitude = self.config.magnitude,
            total = self.config.total_threshold,
            throttle = ?self.config.throttle,
            "motion analyzer started"
        );

        let reason = loop {
            if let Err(e) = read_batch(&mut reader, &mut scratch, &mut batch) {
                break e;
            }
            batches += 1;

            let active = self.active_count(&batch);
            tracing::trace!(active, "motion batch scored");

            if let Some(event) = self.observe(active, Instant::now()) {
                events += 1;
                tracing::debug!(active = event.active, "motion detected");
                on_event(event);
            }
        };

        tracing::info!(batches, events, reason = %reason, "motion analyzer finished");
        MotionSummary {
            batches,
            events,
            reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn config(throttle: Duration) -> MotionConfig {
        MotionConfig {
            mbx: 3,
            mby: 2,
            magnitude: 5,
            total_threshold: 2,
            throttle,
        }
    }

    fn still() -> MotionVector {
        MotionVector { dx: 1, dy: -1, sad: 100 }
    }

    fn moving() -> MotionVector {
        MotionVector { dx: 4, dy: -4, sad: 900 }
    }

    /// A full batch with exactly `k` moving records.
    fn batch(cfg: &MotionConfig, k: usize) -> Vec<MotionVector> {
        (0..cfg.batch_len())
            .map(|i| if i < k { moving() } else { still() })
            .collect()
    }

    fn encode(batches: &[Vec<MotionVector>]) -> Vec<u8> {
        batches
            .iter()
            .flatten()
            .flat_map(|v| v.to_le_bytes())
            .collect()
    }

    #[test]
    fn test_batch_len_includes_extra_column() {
        assert_eq!(config(Duration::ZERO).batch_len(), 8);
        let default_camera = MotionConfig { mbx: 42, mby: 24, ..config(Duration::ZERO) };
        assert_eq!(default_camera.batch_len(), 1032);
    }

    #[test]
    fn test_record_wire_format() {
        let v = MotionVector::from_le_bytes([0xFE, 0x03, 0x34, 0x12]);
        assert_eq!(v, MotionVector { dx: -2, dy: 3, sad: 0x1234 });
        let v = MotionVector::from_le_bytes([0x80, 0x7F, 0xFF, 0xFF]);
        assert_eq!(v, MotionVector { dx: -128, dy: 127, sad: -1 });
    }

    #[test]
    fn test_decode_batch_ignores_trailing_partial_record() {
        let mut out = vec![still()];
        decode_batch(&[1, 2, 0, 0, 3, 4, 0, 0, 9], &mut out);
        assert_eq!(out.len(), 2);
        assert_eq!(out[1].dx, 3);
    }

    #[test]
    fn test_magnitude_is_strictly_greater() {
        let analyzer = MotionAnalyzer::new(config(Duration::ZERO));
        let on_edge = MotionVector { dx: 3, dy: 4, sad: 0 }; // exactly 5
        let over = MotionVector { dx: 4, dy: 4, sad: 0 };
        let extreme = MotionVector { dx: -128, dy: -128, sad: 0 };
        assert_eq!(analyzer.active_count(&[on_edge, over, extreme, still()]), 2);
    }

    #[test]
    fn test_active_count_exactly_k() {
        let cfg = config(Duration::ZERO);
        let analyzer = MotionAnalyzer::new(cfg);
        for k in 0..=cfg.batch_len() {
            assert_eq!(analyzer.active_count(&batch(&cfg, k)), k);
        }
    }

    #[test]
    fn test_fires_only_above_total_threshold() {
        let mut analyzer = MotionAnalyzer::new(config(Duration::from_secs(60)));
        let now = Instant::now();
        assert_eq!(analyzer.observe(2, now), None);
        assert_eq!(analyzer.state(), MotionState::Idle);
        assert_eq!(analyzer.observe(3, now), Some(MotionEvent { active: 3, at: now }));
        assert_eq!(analyzer.state(), MotionState::Throttled { since: now });
    }

    #[test]
    fn test_throttle_window() {
        let throttle = Duration::from_secs(60);
        let mut analyzer = MotionAnalyzer::new(config(throttle));
        let t0 = Instant::now();

        assert!(analyzer.observe(8, t0).is_some());
        assert!(analyzer.observe(8, t0 + Duration::from_secs(1)).is_none());
        assert!(analyzer.observe(8, t0 + throttle).is_none());
        // The window has to be exceeded, not just reached.
        let later = t0 + throttle + Duration::from_millis(1);
        assert_eq!(analyzer.observe(8, later).map(|e| e.at), Some(later));
        assert!(analyzer.observe(8, later + Duration::from_secs(30)).is_none());
    }

    #[test]
    fn test_one_event_per_window_under_storm() {
        let throttle = Duration::from_secs(10);
        let mut analyzer = MotionAnalyzer::new(config(throttle));
        let t0 = Instant::now();
        // One qualifying batch every 100ms for 35 seconds.
        let fired: Vec<Duration> = (0..350)
            .map(|i| t0 + Duration::from_millis(i * 100))
            .filter_map(|t| analyzer.observe(5, t))
            .map(|e| e.at - t0)
            .collect();
        assert_eq!(
            fired,
            vec![
                Duration::ZERO,
                Duration::from_millis(10_100),
                Duration::from_millis(20_200),
                Duration::from_millis(30_300),
            ]
        );
    }

    #[test]
    fn test_quiet_batches_leave_throttle_running() {
        let throttle = Duration::from_secs(5);
        let mut analyzer = MotionAnalyzer::new(config(throttle));
        let t0 = Instant::now();
        assert!(analyzer.observe(3, t0).is_some());
        assert!(analyzer.observe(0, t0 + Duration::from_secs(6)).is_none());
        assert_eq!(analyzer.state(), MotionState::Idle);
        assert!(analyzer.observe(3, t0 + Duration::from_secs(7)).is_some());
    }

    #[test]
    fn test_run_scores_every_batch_and_throttles_events() {
        let cfg = config(Duration::from_secs(3600));
        let stream = encode(&[
            batch(&cfg, 1),
            batch(&cfg, 3),
            batch(&cfg, 8),
            batch(&cfg, 0),
            batch(&cfg, 4),
        ]);

        let mut analyzer = MotionAnalyzer::new(cfg);
        let mut events = Vec::new();
        let summary = analyzer.run(Cursor::new(stream), |e| events.push(e.active));

        assert_eq!(summary.batches, 5);
        assert_eq!(summary.events, 1);
        assert!(matches!(summary.reason, MotionError::Closed));
        assert_eq!(events, vec![3]);
    }

    #[test]
    fn test_run_stops_on_short_read() {
        let cfg = config(Duration::ZERO);
        let mut stream = encode(&[batch(&cfg, 8)]);
        stream.extend_from_slice(&[1, 2, 3]);

        let mut analyzer = MotionAnalyzer::new(cfg);
        let mut events = 0;
        let summary = analyzer.run(Cursor::new(stream), |_| events += 1);
        assert_eq!(summary.batches, 1);
        assert_eq!(events, 1);
        assert!(matches!(summary.reason, MotionError::Closed));
    }

    #[test]
    fn test_run_reports_io_error() {
        struct Broken;
        impl Read for Broken {
            fn read(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
                Err(std::io::Error::new(ErrorKind::BrokenPipe, "gone"))
            }
        }

        let summary = MotionAnalyzer::new(config(Duration::ZERO)).run(Broken, |_| {});
        assert_eq!(summary.batches, 0);
        assert!(matches!(summary.reason, MotionError::Io(_)));
    }
}
