//! Analog stick filtering
//!
//! Turns raw stick positions into joystick commands: a per-axis dead zone,
//! Y inverted so that pushing up drives forward, and at most one command
//! per throttle window. Returning to centre is sent straight away.
//!
//! On-screen drags go through [`DragTracker`] instead: the position is
//! sampled on a fixed tick and only sent when it moved.

use std::time::{Duration, Instant};

use crate::protocol::RobotCommand;

pub const DEAD_ZONE: f32 = 0.1;
pub const SEND_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
pub struct StickFilter {
    dead_zone: f32,
    interval: Duration,
    position: (f32, f32),
    last_sent: (f32, f32),
    last_sent_at: Option<Instant>,
}

impl StickFilter {
    pub fn new() -> Self {
        Self::with_params(DEAD_ZONE, SEND_INTERVAL)
    }

    pub fn with_params(dead_zone: f32, interval: Duration) -> Self {
        Self {
            dead_zone,
            interval,
            position: (0.0, 0.0),
            last_sent: (0.0, 0.0),
            last_sent_at: None,
        }
    }

    /// Filtered position, for display
    pub fn position(&self) -> (f32, f32) {
        self.position
    }

    /// Feed a raw reading; returns the command to send, if any
    pub fn update(&mut self, raw_x: f32, raw_y: f32, now: Instant) -> Option<RobotCommand> {
        let x = self.filter_axis(raw_x);
        let y = self.filter_axis(-raw_y);
        self.position = (x, y);

        let centred = x == 0.0 && y == 0.0;
        if centred && self.last_sent == (0.0, 0.0) {
            return None;
        }

        let throttled = self
            .last_sent_at
            .is_some_and(|at| now.saturating_duration_since(at) < self.interval);
        if !centred && throttled {
            return None;
        }

        self.last_sent = (x, y);
        self.last_sent_at = Some(now);
        Some(RobotCommand::joystick(x, y))
    }

    fn filter_axis(&self, raw: f32) -> f32 {
        let value = clamp_axis(raw);
        if value.abs() < self.dead_zone {
            0.0
        } else {
            value
        }
    }
}

impl Default for StickFilter {
    fn default() -> Self {
        Self::new()
    }
}

/// Touch drag position, polled once per [`SEND_INTERVAL`] tick
#[derive(Debug, Clone, Default)]
pub struct DragTracker {
    position: (f32, f32),
    last_sent: (f32, f32),
}

impl DragTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the knob position, Y up, both axes in `-1.0..=1.0`
    pub fn update(&mut self, x: f32, y: f32) {
        self.position = (clamp_axis(x), clamp_axis(y));
    }

    pub fn position(&self) -> (f32, f32) {
        self.position
    }

    /// Command for this tick, if the position moved since the last send
    pub fn poll(&mut self) -> Option<RobotCommand> {
        if self.position == self.last_sent {
            return None;
        }
        self.last_sent = self.position;
        Some(RobotCommand::joystick(self.position.0, self.position.1))
    }

    /// Back to centre with nothing sent
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

fn clamp_axis(value: f32) -> f32 {
    if value.is_finite() {
        value.clamp(-1.0, 1.0)
    } else {
        0.0
    }
}
