//! C2: CommandBus — an unbounded FIFO queue with a single consumer
//! (the control worker in `server.rs`), carrying every command that
//! mutates encoder, camera, or recording state.
//!
//! This is the zero-deadlock discipline described in the design: no
//! socket-reader task, no encoder-drain task, and no accept task ever
//! holds the encoder's mutation lock directly. They all just post here.
//! Grounded in the single-writer-lock pattern around `webrtcbin`
//! mutations in `webrtc/client.rs`, generalized into an explicit actor
//! queue instead of an implicit mutex.

use tokio::sync::mpsc;
use tracing::warn;

/// Every command that can mutate encoder/camera/recording state, or
/// request a stream reconfiguration.
#[derive(Debug, Clone)]
pub enum StreamCommand {
    StartRecording,
    StopRecording,
    RequestKeyframe,
    AdjustBitrate(u32),
    ReconfigureStream(StreamConfigRequest),
    SwitchCamera,
    Zoom(f32),
    Backpressure,
    PressureClear,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StreamConfigRequest {
    pub width: u32,
    pub height: u32,
    pub bitrate_bps: u32,
    pub fps: u32,
}

impl StreamConfigRequest {
    /// Total order key used for arbitration: minimize the bandwidth
    /// footprint, tie-break by lower fps, then lower bitrate, then lower
    /// width (open question resolution, see `DESIGN.md`).
    fn order_key(&self) -> (u64, u32, u32, u32) {
        let footprint = self.width as u64 * self.height as u64 * self.bitrate_bps as u64;
        (footprint, self.fps, self.bitrate_bps, self.width)
    }
}

/// Pick the arbitration winner among all currently requested configs,
/// using the total order defined by `order_key`.
pub fn arbitrate(requests: &[StreamConfigRequest]) -> Option<StreamConfigRequest> {
    requests
        .iter()
        .copied()
        .min_by_key(|r| r.order_key())
}

pub type CommandReceiver = mpsc::UnboundedReceiver<StreamCommand>;

/// Producer handle. Freely cloneable; every session/controller gets one.
#[derive(Clone)]
pub struct CommandBus {
    tx: mpsc::UnboundedSender<StreamCommand>,
}

impl CommandBus {
    pub fn new() -> (Self, CommandReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Non-blocking post. Returns `false` only if the consumer has
    /// shut down and dropped the receiver.
    pub fn post(&self, cmd: StreamCommand) -> bool {
        if self.tx.send(cmd).is_err() {
            warn!("command bus post failed, receiver is closed");
            return false;
        }
        true
    }
}

/// Throttle helper: returns `true` if at least `min_interval` has elapsed
/// since `last`, and if so updates `last` to `now`. Used for keyframe
/// request and bitrate-change rate limiting.
pub fn throttle_elapsed(
    last: &mut Option<tokio::time::Instant>,
    now: tokio::time::Instant,
    min_interval: std::time::Duration,
) -> bool {
    match *last {
        Some(prev) if now.duration_since(prev) < min_interval => false,
        _ => {
            *last = Some(now);
            true
        }
    }
}
