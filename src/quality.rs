//! Connection quality monitor.
//!
//! The video depacketizer reports every frame it sees and every frame
//! it fully assembles. Over rolling 3-second windows the monitor
//! derives a frame-loss percentage and emits OKAY/POOR transitions
//! with hysteresis: a single terrible window (≥ 30% loss) or two
//! consecutive bad ones (≥ 15%) flip to POOR, and only a clean window
//! (≤ 5%) flips back. Losses between the thresholds never change
//! state.
//!
//! It also accumulates the raw packet-loss counter drained by the
//! telemetry worker every report interval.

use std::time::{Duration, Instant};

/// Loss rate that flips to POOR from a single window.
const IMMEDIATE_POOR_LOSS_RATE: u32 = 30;
/// Loss rate that flips to POOR when sustained for two windows.
const CONSECUTIVE_POOR_LOSS_RATE: u32 = 15;
/// Loss rate at or below which the connection is OKAY again.
const OKAY_LOSS_RATE: u32 = 5;
/// Window length for loss-percentage sampling.
const STATUS_SAMPLE_PERIOD: Duration = Duration::from_millis(3000);

// ── ConnectionStatus ─────────────────────────────────────────────

/// Coarse connection quality reported to the listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Okay,
    Poor,
}

// ── QualityMonitor ───────────────────────────────────────────────

/// Rolling-window frame-loss tracker.
#[derive(Debug)]
pub struct QualityMonitor {
    last_good_frame: u32,
    last_seen_frame: u32,
    loss_count_since_last_report: u32,

    interval_good_frames: u32,
    interval_total_frames: u32,
    interval_start: Option<Instant>,
    last_interval_loss_percent: u32,
    last_status: ConnectionStatus,
}

impl QualityMonitor {
    pub fn new() -> Self {
        Self {
            last_good_frame: 0,
            last_seen_frame: 0,
            loss_count_since_last_report: 0,
            interval_good_frames: 0,
            interval_total_frames: 0,
            interval_start: None,
            last_interval_loss_percent: 0,
            last_status: ConnectionStatus::Okay,
        }
    }

    /// A frame was fully assembled by the depacketizer.
    pub fn received_complete_frame(&mut self, frame_index: u32) {
        self.last_good_frame = frame_index;
        self.interval_good_frames += 1;
    }

    /// A frame header was observed, complete or not.
    ///
    /// Returns a status transition when the window that just ended
    /// crossed a threshold.
    pub fn saw_frame(&mut self, frame_index: u32) -> Option<ConnectionStatus> {
        self.saw_frame_at(frame_index, Instant::now())
    }

    /// [`saw_frame`](Self::saw_frame) with an explicit timestamp.
    pub fn saw_frame_at(&mut self, frame_index: u32, now: Instant) -> Option<ConnectionStatus> {
        debug_assert!(
            !is_before16(frame_index, self.last_seen_frame),
            "frame {} regressed behind {}",
            frame_index,
            self.last_seen_frame,
        );

        let mut transition = None;

        let elapsed = self
            .interval_start
            .map_or(true, |t| now.duration_since(t) >= STATUS_SAMPLE_PERIOD);
        if elapsed {
            if self.interval_total_frames != 0 {
                let loss_percent =
                    100 - (self.interval_good_frames * 100) / self.interval_total_frames;

                // Two consecutive windows above the sustained rate, or
                // one above the immediate rate, demote to POOR.
                if self.last_status != ConnectionStatus::Poor
                    && (loss_percent >= IMMEDIATE_POOR_LOSS_RATE
                        || (loss_percent >= CONSECUTIVE_POOR_LOSS_RATE
                            && self.last_interval_loss_percent >= CONSECUTIVE_POOR_LOSS_RATE))
                {
                    self.last_status = ConnectionStatus::Poor;
                    transition = Some(ConnectionStatus::Poor);
                } else if loss_percent <= OKAY_LOSS_RATE
                    && self.last_status != ConnectionStatus::Okay
                {
                    self.last_status = ConnectionStatus::Okay;
                    transition = Some(ConnectionStatus::Okay);
                }

                self.last_interval_loss_percent = loss_percent;
            }

            self.interval_start = Some(now);
            self.interval_good_frames = 0;
            self.interval_total_frames = 0;
        }

        self.interval_total_frames += frame_index - self.last_seen_frame;
        self.last_seen_frame = frame_index;

        transition
    }

    /// Packets `last + 1 .. next` never arrived.
    pub fn add_lost_packets(&mut self, last_received: u32, next_received: u32) {
        self.loss_count_since_last_report += next_received
            .saturating_sub(last_received)
            .saturating_sub(1);
    }

    /// Drain the loss counter for one telemetry report.
    pub fn take_loss_count(&mut self) -> u32 {
        std::mem::take(&mut self.loss_count_since_last_report)
    }

    /// Index of the last fully assembled frame.
    pub fn last_good_frame(&self) -> u32 {
        self.last_good_frame
    }

    /// Index of the last frame observed at all.
    pub fn last_seen_frame(&self) -> u32 {
        self.last_seen_frame
    }
}

impl Default for QualityMonitor {
    fn default() -> Self {
        Self::new()
    }
}

/// `a` sorts before `b` in 16-bit serial-number space.
fn is_before16(a: u32, b: u32) -> bool {
    ((a as u16).wrapping_sub(b as u16) as i16) < 0
}

// ── Tests ────────────────────────────────────────────────────────
