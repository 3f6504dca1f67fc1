//! Fixed-interval frame pacing
//!
//! Best-effort cadence: after a frame is presented the pacer sleeps for
//! whatever is left of the interval, measured from the start of that frame.
//! Sleeping is coarse (`thread::sleep`), so frames can land late; late frames
//! are counted as missed but never made up for.
//!
//! ```no_run
//! use std::time::Duration;
//! use swiftpane::pacing::FramePacer;
//!
//! let mut pacer = FramePacer::new(Duration::from_millis(16));
//! for _ in 0..300 {
//!     pacer.begin_frame();
//!     // render + present
//!     pacer.end_frame();
//!     pacer.wait_for_next_frame();
//! }
//! ```

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use log::{debug, warn};
use serde::Serialize;

/// Frame times kept for the rolling statistics
const FRAME_HISTORY_SIZE: usize = 120;

/// A frame slower than this multiple of the interval missed its deadline
const MISSED_FRAME_THRESHOLD: f64 = 1.5;

#[derive(Debug, Clone, Serialize)]
pub struct FrameStats {
    pub avg_frame_time: Duration,
    pub min_frame_time: Duration,
    pub max_frame_time: Duration,
    /// Standard deviation of frame work time
    pub frame_time_jitter: Duration,
    pub missed_frames: u64,
    pub total_frames: u64,
}

impl Default for FrameStats {
    fn default() -> Self {
        Self {
            avg_frame_time: Duration::ZERO,
            min_frame_time: Duration::ZERO,
            max_frame_time: Duration::ZERO,
            frame_time_jitter: Duration::ZERO,
            missed_frames: 0,
            total_frames: 0,
        }
    }
}

pub struct FramePacer {
    interval: Duration,
    history: VecDeque<Duration>,
    frame_start: Option<Instant>,
    stats: FrameStats,
}

impl FramePacer {
    /// `Duration::ZERO` disables pacing entirely.
    pub fn new(interval: Duration) -> Self {
        debug!("Frame pacer interval {:?}", interval);
        Self {
            interval,
            history: VecDeque::with_capacity(FRAME_HISTORY_SIZE),
            frame_start: None,
            stats: FrameStats::default(),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn begin_frame(&mut self) {
        self.frame_start = Some(Instant::now());
    }

    /// Records the work time of the current frame.
    pub fn end_frame(&mut self) {
        let Some(start) = self.frame_start else {
            warn!("end_frame called without begin_frame");
            return;
        };
        let duration = start.elapsed();

        if !self.interval.is_zero()
            && duration.as_secs_f64() > self.interval.as_secs_f64() * MISSED_FRAME_THRESHOLD
        {
            self.stats.missed_frames += 1;
            debug!(
                "Frame missed deadline: {:?} (interval {:?})",
                duration, self.interval
            );
        }

        self.history.push_back(duration);
        if self.history.len() > FRAME_HISTORY_SIZE {
            self.history.pop_front();
        }
        self.stats.total_frames += 1;
        self.update_stats();
    }

    /// Time left of the current interval, zero once it has elapsed.
    pub fn residual(&self) -> Duration {
        match self.frame_start {
            Some(start) => self.interval.saturating_sub(start.elapsed()),
            None => self.interval,
        }
    }

    /// Sleeps out the remainder of the interval.
    pub fn wait_for_next_frame(&mut self) {
        let residual = self.residual();
        if !residual.is_zero() {
            std::thread::sleep(residual);
        }
        self.frame_start = None;
    }

    pub fn stats(&self) -> &FrameStats {
        &self.stats
    }

    fn update_stats(&mut self) {
        if self.history.is_empty() {
            return;
        }
        let total: Duration = self.history.iter().sum();
        let avg = total / self.history.len() as u32;
        self.stats.avg_frame_time = avg;
        self.stats.min_frame_time = self.history.iter().min().copied().unwrap_or_default();
        self.stats.max_frame_time = self.history.iter().max().copied().unwrap_or_default();

        let variance = self
            .history
            .iter()
            .map(|d| {
                let diff = d.as_secs_f64() - avg.as_secs_f64();
                diff * diff
            })
            .sum::<f64>()
            / self.history.len() as f64;
        self.stats.frame_time_jitter = Duration::from_secs_f64(variance.sqrt());
    }
}
