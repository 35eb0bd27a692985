//! Frame pacing driven by `wl_surface.frame` callbacks
//!
//! The compositor signals through a one-shot frame-done callback when it is a
//! good time to draw the next frame. The pacer keeps at most one callback in
//! flight per surface and re-arms it from the done handler, so redraws run at
//! the compositor's present rate no matter how often the dispatch loop wakes up
//! for input or configure events.
//!
//! ```text
//!   arm ──► commit ──► ... ──► done ──► (shutdown? stop) ──► arm ──► redraw+commit
//! ```
//!
//! On shutdown the pacer simply stops re-arming. A callback already in flight
//! is allowed to arrive and is discarded.

use crate::error::TransportError;
use crate::protocol::{Display, ObjectId};
use log::{debug, trace, warn};
use std::collections::VecDeque;
use std::time::Duration;

/// Maximum number of frame intervals kept for statistics
const FRAME_HISTORY_SIZE: usize = 120;

/// Statistics over recent frame-done intervals
#[derive(Debug, Clone, PartialEq)]
pub struct FrameStats {
    /// Average time between consecutive frame-done callbacks
    pub avg_interval: Duration,
    pub min_interval: Duration,
    pub max_interval: Duration,
    /// Standard deviation of the intervals
    pub jitter: Duration,
    /// Frames per second derived from the average interval
    pub current_fps: f32,
    /// Total frame-done callbacks consumed
    pub total_frames: u64,
}

impl Default for FrameStats {
    fn default() -> Self {
        Self {
            avg_interval: Duration::ZERO,
            min_interval: Duration::ZERO,
            max_interval: Duration::ZERO,
            jitter: Duration::ZERO,
            current_fps: 0.0,
            total_frames: 0,
        }
    }
}

/// What the owner should do after a frame-done callback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameAction {
    /// The callback was not ours
    Ignored,
    /// Shutdown was requested; the loop stops here
    Stopped,
    /// Re-arm and draw the next frame
    Redraw,
}

/// Frame callback bookkeeping for one surface
#[derive(Debug, Default)]
pub struct FramePacer {
    /// Callback in flight, if any
    pending: Option<ObjectId>,
    /// Timestamp (ms) of the previous done event
    last_done: Option<u32>,
    intervals: VecDeque<Duration>,
    stats: FrameStats,
    stopped: bool,
}

impl FramePacer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a callback is in flight
    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Request a frame callback unless one is already in flight or the pacer
    /// stopped. Must be called before the commit it should be tied to.
    pub fn arm(&mut self, display: &mut dyn Display, surface: ObjectId) -> Result<(), TransportError> {
        if self.pending.is_some() || self.stopped {
            return Ok(());
        }
        let callback = display.frame(surface)?;
        trace!("Armed frame callback {} on surface {}", callback, surface);
        self.pending = Some(callback);
        Ok(())
    }

    /// Consume a frame-done event. The callback object is dropped in every case.
    pub fn on_done(
        &mut self,
        display: &mut dyn Display,
        callback: ObjectId,
        time: u32,
        shutting_down: bool,
    ) -> FrameAction {
        if self.pending != Some(callback) {
            return FrameAction::Ignored;
        }
        self.pending = None;
        display.destroy(callback);
        self.record(time);

        if shutting_down {
            if !self.stopped {
                debug!("⏹️ Frame loop stopped after {} frames", self.stats.total_frames);
            }
            self.stopped = true;
            return FrameAction::Stopped;
        }
        FrameAction::Redraw
    }

    /// Forget the in-flight callback during teardown. wl_callback has no
    /// destroy request; a late done event is discarded as [`FrameAction::Ignored`].
    pub fn cancel(&mut self, display: &mut dyn Display) {
        self.stopped = true;
        if let Some(callback) = self.pending.take() {
            display.destroy(callback);
        }
    }

    pub fn stats(&self) -> &FrameStats {
        &self.stats
    }

    fn record(&mut self, time: u32) {
        self.stats.total_frames += 1;

        if let Some(last) = self.last_done {
            let delta = time.wrapping_sub(last);
            // Timestamps jumping backwards by more than a minute are a clock reset
            if delta > 60_000 {
                warn!("Frame timestamp went from {} to {}, ignoring interval", last, time);
            } else {
                self.intervals.push_back(Duration::from_millis(delta as u64));
                if self.intervals.len() > FRAME_HISTORY_SIZE {
                    self.intervals.pop_front();
                }
                self.update_stats();
            }
        }
        self.last_done = Some(time);
    }

    fn update_stats(&mut self) {
        if self.intervals.is_empty() {
            return;
        }

        let total: Duration = self.intervals.iter().sum();
        self.stats.avg_interval = total / self.intervals.len() as u32;
        self.stats.min_interval = self.intervals.iter().copied().min().unwrap_or_default();
        self.stats.max_interval = self.intervals.iter().copied().max().unwrap_or_default();

        if self.stats.avg_interval > Duration::ZERO {
            self.stats.current_fps = 1.0 / self.stats.avg_interval.as_secs_f32();
        }

        let avg = self.stats.avg_interval.as_secs_f64();
        let variance = self
            .intervals
            .iter()
            .map(|d| {
                let diff = d.as_secs_f64() - avg;
                diff * diff
            })
            .sum::<f64>()
            / self.intervals.len() as f64;
        self.stats.jitter = Duration::from_secs_f64(variance.sqrt());
    }
}
