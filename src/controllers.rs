//! C7: Controllers — adaptive bitrate (AIMD), the downgrade-only camera
//! FPS governor, and the low-power idle clamp.
//!
//! Grounded in spirit on the periodic state-tick pattern in
//! `examples/other_examples/32661e93_mofeng-git-One-KVM__src-video-streamer.rs.rs`
//! (a `StreamerState`-driven periodic tick reacting to health signals):
//! a small tick function fed by a governor worker, not literal code, and
//! exercised as pure state machines so it can be unit-tested without a
//! real timer.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::command_bus::StreamConfigRequest;

/// AIMD bitrate controller.
pub struct BitrateController {
    min_bps: u32,
    max_bps: u32,
    step_bps: u32,
    inc_interval: Duration,
    change_min_interval: Duration,
    current_bps: u32,
    last_change: Option<Instant>,
    last_backpressure: Option<Instant>,
    recent_backpressure: VecDeque<Instant>,
}

impl BitrateController {
    pub fn new(min_bps: u32, max_bps: u32, step_bps: u32, inc_interval: Duration, change_min_interval: Duration, initial_bps: u32) -> Self {
        Self {
            min_bps,
            max_bps,
            step_bps,
            inc_interval,
            change_min_interval,
            current_bps: initial_bps.clamp(min_bps, max_bps),
            last_change: None,
            last_backpressure: None,
            recent_backpressure: VecDeque::new(),
        }
    }

    pub fn current(&self) -> u32 {
        self.current_bps
    }

    fn can_change(&self, now: Instant) -> bool {
        match self.last_change {
            Some(prev) => now.duration_since(prev) >= self.change_min_interval,
            None => true,
        }
    }

    /// Record a backpressure event. Returns `Some(new_bitrate)` if this
    /// pushed the controller into a multiplicative decrease.
    pub fn on_backpressure(&mut self, now: Instant) -> Option<u32> {
        self.last_backpressure = Some(now);
        self.recent_backpressure.push_back(now);
        while let Some(&front) = self.recent_backpressure.front() {
            if now.duration_since(front) > Duration::from_secs(10) {
                self.recent_backpressure.pop_front();
            } else {
                break;
            }
        }
        if self.recent_backpressure.len() >= 3 && self.can_change(now) {
            let reduced = ((self.current_bps as f64) * 0.7) as u32;
            let new_bps = reduced.max(self.min_bps);
            if new_bps != self.current_bps {
                self.current_bps = new_bps;
                self.last_change = Some(now);
                self.recent_backpressure.clear();
                return Some(new_bps);
            }
        }
        None
    }

    /// Governor tick: additive increase when the link has been quiet.
    /// Returns `Some(new_bitrate)` if it increased.
    pub fn tick(&mut self, now: Instant) -> Option<u32> {
        let quiet_enough = match self.last_backpressure {
            Some(prev) => now.duration_since(prev) >= Duration::from_secs(5),
            None => true,
        };
        let recently_pressured = self
            .recent_backpressure
            .back()
            .is_some_and(|&t| now.duration_since(t) < Duration::from_secs(3));
        if quiet_enough && !recently_pressured && self.can_change(now) && self.current_bps < self.max_bps {
            let new_bps = (self.current_bps + self.step_bps).min(self.max_bps);
            self.current_bps = new_bps;
            self.last_change = Some(now);
            return Some(new_bps);
        }
        None
    }
}

const FPS_LADDER: [u32; 3] = [30, 24, 15];

/// Downgrade-only camera FPS governor. Never auto-increases;
/// increases only happen via `reset_to_max`, called on a fresh
/// device-profile application.
pub struct FpsGovernor {
    rung: usize,
    grace_until: Option<Instant>,
    cooldown_until: Option<Instant>,
    min_bitrate_since: Option<Instant>,
    backpressure_events: VecDeque<Instant>,
}

impl FpsGovernor {
    pub fn new() -> Self {
        Self {
            rung: 0,
            grace_until: None,
            cooldown_until: None,
            min_bitrate_since: None,
            backpressure_events: VecDeque::new(),
        }
    }

    pub fn current_fps(&self) -> u32 {
        FPS_LADDER[self.rung]
    }

    pub fn reset_to_max(&mut self) {
        self.rung = 0;
        self.grace_until = None;
        self.cooldown_until = None;
        self.min_bitrate_since = None;
        self.backpressure_events.clear();
    }

    pub fn record_backpressure(&mut self, now: Instant) {
        self.backpressure_events.push_back(now);
        while let Some(&front) = self.backpressure_events.front() {
            if now.duration_since(front) > Duration::from_secs(10) {
                self.backpressure_events.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn note_at_min_bitrate(&mut self, now: Instant, at_min: bool) {
        if at_min {
            self.min_bitrate_since.get_or_insert(now);
        } else {
            self.min_bitrate_since = None;
        }
    }

    /// Evaluate whether to downgrade. `thermal_severe` covers the
    /// thermal-pressure precondition; the bitrate/backpressure
    /// precondition is derived from prior `note_at_min_bitrate`/
    /// `record_backpressure` calls.
    pub fn tick(&mut self, now: Instant, thermal_severe: bool) -> Option<u32> {
        if let Some(until) = self.grace_until {
            if now < until {
                return None;
            }
        }
        if let Some(until) = self.cooldown_until {
            if now < until {
                return None;
            }
        }
        if self.rung >= FPS_LADDER.len() - 1 {
            return None;
        }

        let sustained_backpressure = self.backpressure_events.len() >= 3
            && self
                .backpressure_events
                .back()
                .is_some_and(|&t| now.duration_since(t) <= Duration::from_secs(6))
            && self
                .backpressure_events
                .front()
                .is_some_and(|&t| now.duration_since(t) >= Duration::from_secs(10));

        let at_min_long_enough = self
            .min_bitrate_since
            .is_some_and(|t| now.duration_since(t) >= Duration::from_secs(10));

        if thermal_severe || (at_min_long_enough && sustained_backpressure) {
            self.rung += 1;
            self.grace_until = Some(now + Duration::from_secs(5));
            self.cooldown_until = Some(now + Duration::from_secs(30));
            self.backpressure_events.clear();
            return Some(self.current_fps());
        }
        None
    }
}

impl Default for FpsGovernor {
    fn default() -> Self {
        Self::new()
    }
}

/// Low-power idle clamp: entered when there are no
/// sessions, the UI is hidden, and nothing is recording.
pub struct LowPowerIdle {
    snapshot: Option<StreamConfigRequest>,
}

impl LowPowerIdle {
    pub fn new() -> Self {
        Self { snapshot: None }
    }

    pub fn is_active(&self) -> bool {
        self.snapshot.is_some()
    }

    pub fn should_enter(sessions: usize, ui_visible: bool, recording: bool) -> bool {
        sessions == 0 && !ui_visible && !recording
    }

    /// Enter idle mode, snapshotting `current` so `exit` can restore it.
    /// No-op (returns `None`) if already idle.
    pub fn enter(&mut self, current: StreamConfigRequest, bitrate_floor: u32) -> Option<StreamConfigRequest> {
        if self.snapshot.is_some() {
            return None;
        }
        self.snapshot = Some(current);
        Some(StreamConfigRequest {
            width: 480,
            height: 640,
            bitrate_bps: 900_000u32.max(bitrate_floor),
            fps: 15,
        })
    }

    pub fn exit(&mut self) -> Option<StreamConfigRequest> {
        self.snapshot.take()
    }
}

impl Default for LowPowerIdle {
    fn default() -> Self {
        Self::new()
    }
}
